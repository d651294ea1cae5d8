//! Trace and span identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::random()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::parse_str(s).map_err(|source| Error::InvalidId {
                    kind: $kind,
                    source,
                })?;
                Ok(Self::from_uuid(uuid))
            }
        }
    };
}

define_id!(
    /// Identifier shared by every span belonging to one logical request.
    TraceId,
    "trace"
);

define_id!(
    /// Identifier of a single span within a trace.
    SpanId,
    "span"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_id_parses_its_display_form() {
        let id = SpanId::random();
        let parsed = id.to_string().parse::<SpanId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn malformed_trace_id_reports_kind() {
        let err = "not-a-uuid".parse::<TraceId>().expect_err("should fail");
        assert!(matches!(err, Error::InvalidId { kind: "trace", .. }));
        assert!(err.to_string().starts_with("invalid trace id"));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TraceId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(SpanId::random(), SpanId::random());
    }
}
