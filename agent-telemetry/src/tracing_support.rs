//! Span recording with per-context parent tracking.
//!
//! Every execution context carries its own stack of active spans. Inside
//! [`TraceContext::scope`] the stack lives in a tokio task-local slot, so
//! concurrent requests running on the same worker thread never see each
//! other's spans. Outside a scope, each OS thread has its own stack.
//! [`Tracer::in_span`] always opens its own scope around the wrapped future.
//!
//! The span store itself is shared by all contexts and guarded by a single
//! lock, mirroring the other registries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_primitives::{SpanId, TraceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::futures::TaskLocalFuture;
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult, recover, validate_name};

tokio::task_local! {
    static TASK_CONTEXT: TraceContext;
}

thread_local! {
    static THREAD_CONTEXT: TraceContext = TraceContext::new();
}

static NEXT_TRACER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one execution context's active-span stacks.
///
/// Clones share the same stacks. Use [`fork`](Self::fork) to hand a copy to
/// a spawned task so its spans parent to the spawning span without the two
/// tasks interfering afterwards.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    // Keyed by tracer so independent tracers do not share a stack.
    stacks: Arc<Mutex<HashMap<u64, Vec<SpanId>>>>,
}

impl TraceContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the context of the caller: the enclosing task scope if any,
    /// otherwise the current thread's context.
    #[must_use]
    pub fn current() -> Self {
        TASK_CONTEXT
            .try_with(Clone::clone)
            .unwrap_or_else(|_| THREAD_CONTEXT.with(Clone::clone))
    }

    /// Creates an independent context starting from a copy of this one's stacks.
    #[must_use]
    pub fn fork(&self) -> Self {
        let stacks = recover(self.stacks.lock()).clone();
        Self {
            stacks: Arc::new(Mutex::new(stacks)),
        }
    }

    /// Runs `future` with this context installed as the task's context.
    pub fn scope<F>(self, future: F) -> TaskLocalFuture<TraceContext, F>
    where
        F: Future,
    {
        TASK_CONTEXT.scope(self, future)
    }

    /// Runs `future` in a fork of the caller's context, taken now.
    ///
    /// Wrap futures handed to `tokio::spawn` with this so their spans parent
    /// to the spawning span but stay isolated from other tasks on the same
    /// worker thread.
    pub fn instrument<F>(future: F) -> TaskLocalFuture<TraceContext, F>
    where
        F: Future,
    {
        Self::current().fork().scope(future)
    }

    /// Runs `f` synchronously with this context installed.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        TASK_CONTEXT.sync_scope(self, f)
    }

    fn push(&self, tracer: u64, span: SpanId) {
        recover(self.stacks.lock())
            .entry(tracer)
            .or_default()
            .push(span);
    }

    fn remove(&self, tracer: u64, span: SpanId) {
        let mut stacks = recover(self.stacks.lock());
        if let Some(stack) = stacks.get_mut(&tracer) {
            if let Some(pos) = stack.iter().rposition(|id| *id == span) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                stacks.remove(&tracer);
            }
        }
    }

    /// Returns the topmost span accepted by `is_open`, discarding any
    /// entries above it that were finished from another context.
    fn top_open(&self, tracer: u64, is_open: impl Fn(SpanId) -> bool) -> Option<SpanId> {
        let mut stacks = recover(self.stacks.lock());
        let stack = stacks.get_mut(&tracer)?;
        while let Some(top) = stack.last().copied() {
            if is_open(top) {
                return Some(top);
            }
            stack.pop();
        }
        stacks.remove(&tracer);
        None
    }
}

/// Scalar value attached to a span tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free-form text.
    Str(String),
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for TagValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Severity of a span log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose diagnostics.
    Trace,
    /// Debugging detail.
    Debug,
    /// Normal progress.
    #[default]
    Info,
    /// Recoverable problem.
    Warn,
    /// Failure.
    Error,
}

/// Timestamped log entry recorded on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLog {
    /// Wall-clock time the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Log message.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, TagValue>,
}

/// Owned copy of a span's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSnapshot {
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// Identifier of the span.
    pub span_id: SpanId,
    /// Parent span, `None` for roots.
    pub parent_span_id: Option<SpanId>,
    /// Operation name.
    pub operation_name: String,
    /// Tags.
    pub tags: BTreeMap<String, TagValue>,
    /// Log entries in recording order.
    pub logs: Vec<SpanLog>,
    /// Wall-clock start time.
    pub start_time: DateTime<Utc>,
    /// Wall-clock end time, `None` while open.
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed seconds, `None` while open.
    pub duration_secs: Option<f64>,
}

impl SpanSnapshot {
    /// Returns `true` once the span has been finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Aggregate counts over recorded spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingSummary {
    /// All recorded spans.
    pub total_spans: usize,
    /// Distinct trace ids.
    pub total_traces: usize,
    /// Spans with an end time.
    pub finished_spans: usize,
    /// Spans still open.
    pub active_spans: usize,
}

#[derive(Debug)]
struct SpanRecord {
    trace_id: TraceId,
    parent_span_id: Option<SpanId>,
    operation_name: String,
    tags: BTreeMap<String, TagValue>,
    logs: Vec<SpanLog>,
    start_time: DateTime<Utc>,
    started: Instant,
    end_time: Option<DateTime<Utc>>,
    duration: Option<Duration>,
}

impl SpanRecord {
    fn snapshot(&self, span_id: SpanId) -> SpanSnapshot {
        SpanSnapshot {
            trace_id: self.trace_id,
            span_id,
            parent_span_id: self.parent_span_id,
            operation_name: self.operation_name.clone(),
            tags: self.tags.clone(),
            logs: self.logs.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_secs: self.duration.map(|d| d.as_secs_f64()),
        }
    }

    fn ensure_open(&self, span_id: SpanId) -> TelemetryResult<()> {
        if self.end_time.is_some() {
            return Err(TelemetryError::invalid_state(format!(
                "span {span_id} ({}) is already finished",
                self.operation_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SpanStore {
    order: Vec<SpanId>,
    records: HashMap<SpanId, SpanRecord>,
}

impl SpanStore {
    fn is_open(&self, id: SpanId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|record| record.end_time.is_none())
    }

    fn record_mut(&mut self, id: SpanId) -> TelemetryResult<&mut SpanRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| TelemetryError::not_found("span", id.to_string()))
    }
}

struct TracerInner {
    id: u64,
    service_name: String,
    spans: Mutex<SpanStore>,
}

/// Records spans for one service.
///
/// Cloning is cheap; clones share the same store.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.inner.service_name)
            .field("spans", &recover(self.inner.spans.lock()).order.len())
            .finish()
    }
}

impl Tracer {
    /// Creates a tracer for `service_name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] when the name is empty.
    pub fn new(service_name: impl Into<String>) -> TelemetryResult<Self> {
        let service_name = service_name.into();
        validate_name("service", &service_name)?;
        Ok(Self {
            inner: Arc::new(TracerInner {
                id: NEXT_TRACER_ID.fetch_add(1, Ordering::Relaxed),
                service_name,
                spans: Mutex::new(SpanStore::default()),
            }),
        })
    }

    /// Returns the service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Starts configuring a span.
    #[must_use]
    pub fn span_builder(&self, operation: impl Into<String>) -> SpanBuilder<'_> {
        SpanBuilder {
            tracer: self,
            operation: operation.into(),
            tags: BTreeMap::new(),
            remote: None,
        }
    }

    /// Starts a span parented to the caller's active span and makes it active.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an empty operation name.
    pub fn start_span(&self, operation: &str) -> TelemetryResult<SpanHandle> {
        self.span_builder(operation).start()
    }

    /// Starts a span that finishes when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`start_span`](Self::start_span).
    pub fn enter(&self, operation: &str) -> TelemetryResult<SpanGuard> {
        self.span_builder(operation).enter()
    }

    /// Runs `f` inside a span that is finished on every exit path, including
    /// unwinding.
    ///
    /// # Errors
    ///
    /// Returns an error only when the span could not be started, in which
    /// case `f` is not run.
    pub fn span<R>(&self, operation: &str, f: impl FnOnce(&SpanHandle) -> R) -> TelemetryResult<R> {
        self.span_builder(operation).run(f)
    }

    /// Awaits `future` inside a span that is finished on completion or drop.
    ///
    /// # Errors
    ///
    /// Same as [`span`](Self::span).
    pub async fn in_span<F>(&self, operation: &str, future: F) -> TelemetryResult<F::Output>
    where
        F: Future,
    {
        self.span_builder(operation).run_async(future).await
    }

    /// Returns the caller's active span, if any.
    #[must_use]
    pub fn get_active_span(&self) -> Option<SpanHandle> {
        let store = recover(self.inner.spans.lock());
        let span_id = TraceContext::current().top_open(self.inner.id, |id| store.is_open(id))?;
        let trace_id = store.records.get(&span_id)?.trace_id;
        Some(self.handle(span_id, trace_id))
    }

    /// Finishes `span`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] if it was already finished.
    pub fn finish_span(&self, span: &SpanHandle) -> TelemetryResult<()> {
        span.finish()
    }

    /// Returns a copy of one span.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] for an unknown id.
    pub fn get_span(&self, span_id: SpanId) -> TelemetryResult<SpanSnapshot> {
        let store = recover(self.inner.spans.lock());
        store
            .records
            .get(&span_id)
            .map(|record| record.snapshot(span_id))
            .ok_or_else(|| TelemetryError::not_found("span", span_id.to_string()))
    }

    /// Returns copies of every span in `trace_id`, in start order.
    #[must_use]
    pub fn get_spans_by_trace_id(&self, trace_id: TraceId) -> Vec<SpanSnapshot> {
        self.collect(|record| record.trace_id == trace_id)
    }

    /// Returns copies of every recorded span, in start order.
    #[must_use]
    pub fn get_all_spans(&self) -> Vec<SpanSnapshot> {
        self.collect(|_| true)
    }

    /// Counts recorded spans and traces.
    #[must_use]
    pub fn summary(&self) -> TracingSummary {
        let store = recover(self.inner.spans.lock());
        let traces: BTreeSet<TraceId> = store.records.values().map(|r| r.trace_id).collect();
        let finished = store
            .records
            .values()
            .filter(|r| r.end_time.is_some())
            .count();
        TracingSummary {
            total_spans: store.records.len(),
            total_traces: traces.len(),
            finished_spans: finished,
            active_spans: store.records.len() - finished,
        }
    }

    fn collect(&self, keep: impl Fn(&SpanRecord) -> bool) -> Vec<SpanSnapshot> {
        let store = recover(self.inner.spans.lock());
        store
            .order
            .iter()
            .filter_map(|id| {
                let record = store.records.get(id)?;
                keep(record).then(|| record.snapshot(*id))
            })
            .collect()
    }

    fn handle(&self, span_id: SpanId, trace_id: TraceId) -> SpanHandle {
        SpanHandle {
            tracer: self.clone(),
            span_id,
            trace_id,
        }
    }

    fn with_open_record<R>(
        &self,
        span_id: SpanId,
        f: impl FnOnce(&mut SpanRecord) -> R,
    ) -> TelemetryResult<R> {
        let mut store = recover(self.inner.spans.lock());
        let record = store.record_mut(span_id)?;
        record.ensure_open(span_id)?;
        Ok(f(record))
    }
}

/// Configures a span before starting it.
#[derive(Debug)]
#[must_use = "a span builder does nothing until started"]
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    operation: String,
    tags: BTreeMap<String, TagValue>,
    remote: Option<(TraceId, Option<SpanId>)>,
}

impl SpanBuilder<'_> {
    /// Adds a tag recorded at start.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Continues a trace received from another process, parented to
    /// `parent`. Overrides the caller's active span.
    pub fn child_of(mut self, trace_id: TraceId, parent: SpanId) -> Self {
        self.remote = Some((trace_id, Some(parent)));
        self
    }

    /// Starts a root span inside an existing trace.
    pub fn in_trace(mut self, trace_id: TraceId) -> Self {
        self.remote = Some((trace_id, None));
        self
    }

    /// Starts the span and makes it the caller's active span.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an empty operation
    /// name or tag key.
    pub fn start(self) -> TelemetryResult<SpanHandle> {
        self.start_in(&TraceContext::current())
    }

    fn start_in(self, context: &TraceContext) -> TelemetryResult<SpanHandle> {
        validate_name("operation", &self.operation)?;
        if self.tags.keys().any(|k| k.trim().is_empty()) {
            return Err(TelemetryError::invalid_argument("tag key cannot be empty"));
        }

        let tracer = self.tracer;
        let span_id = SpanId::random();

        let (trace_id, parent_span_id) = {
            let mut store = recover(tracer.inner.spans.lock());
            let (trace_id, parent_span_id) = match self.remote {
                Some(remote) => remote,
                None => match context.top_open(tracer.inner.id, |id| store.is_open(id)) {
                    Some(parent) => {
                        let trace_id = store.records[&parent].trace_id;
                        (trace_id, Some(parent))
                    }
                    None => (TraceId::random(), None),
                },
            };
            store.order.push(span_id);
            store.records.insert(
                span_id,
                SpanRecord {
                    trace_id,
                    parent_span_id,
                    operation_name: self.operation.clone(),
                    tags: self.tags,
                    logs: Vec::new(),
                    start_time: Utc::now(),
                    started: Instant::now(),
                    end_time: None,
                    duration: None,
                },
            );
            (trace_id, parent_span_id)
        };
        context.push(tracer.inner.id, span_id);

        debug!(
            service = %tracer.inner.service_name,
            operation = %self.operation,
            %span_id,
            %trace_id,
            parent = ?parent_span_id,
            "span started"
        );
        Ok(tracer.handle(span_id, trace_id))
    }

    /// Starts the span wrapped in a guard that finishes it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn enter(self) -> TelemetryResult<SpanGuard> {
        Ok(SpanGuard {
            handle: self.start()?,
            finished: false,
        })
    }

    /// Runs `f` inside the span, finishing it on every exit path.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start); `f` is not run on error.
    pub fn run<R>(self, f: impl FnOnce(&SpanHandle) -> R) -> TelemetryResult<R> {
        let guard = self.enter()?;
        Ok(f(&guard))
    }

    /// Awaits `future` inside the span, finishing it on completion or drop.
    ///
    /// The future runs in a fork of the caller's context with the span on
    /// top, so spans it starts are parented to this one while other tasks
    /// polled on the same thread never see it.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start); `future` is not polled on error.
    pub async fn run_async<F>(self, future: F) -> TelemetryResult<F::Output>
    where
        F: Future,
    {
        let context = TraceContext::current().fork();
        let mut guard = SpanGuard {
            handle: self.start_in(&context)?,
            finished: false,
        };
        let output = context.clone().scope(future).await;
        guard.finished = true;
        // Finished through another handle inside `future` is fine here.
        let _ = guard.handle.finish_in(&context);
        Ok(output)
    }
}

/// Reference to a span owned by a [`Tracer`].
#[derive(Debug, Clone)]
pub struct SpanHandle {
    tracer: Tracer,
    span_id: SpanId,
    trace_id: TraceId,
}

impl SpanHandle {
    /// Returns the span id.
    #[must_use]
    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Returns the trace id.
    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Sets a tag.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the span is finished and
    /// [`TelemetryError::InvalidArgument`] for an empty key.
    pub fn add_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> TelemetryResult<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(TelemetryError::invalid_argument("tag key cannot be empty"));
        }
        let value = value.into();
        self.tracer.with_open_record(self.span_id, |record| {
            record.tags.insert(key, value);
        })
    }

    /// Appends a log entry.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the span is finished.
    pub fn add_log(&self, message: impl Into<String>, level: LogLevel) -> TelemetryResult<()> {
        self.add_log_with_fields(message, level, BTreeMap::new())
    }

    /// Appends a log entry carrying structured fields.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] once the span is finished.
    pub fn add_log_with_fields(
        &self,
        message: impl Into<String>,
        level: LogLevel,
        fields: BTreeMap<String, TagValue>,
    ) -> TelemetryResult<()> {
        let entry = SpanLog {
            timestamp: Utc::now(),
            message: message.into(),
            level,
            fields,
        };
        self.tracer
            .with_open_record(self.span_id, |record| record.logs.push(entry))
    }

    /// Marks the span finished and restores its parent as the active span
    /// of the calling context.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] if already finished.
    pub fn finish(&self) -> TelemetryResult<()> {
        self.finish_in(&TraceContext::current())
    }

    fn finish_in(&self, context: &TraceContext) -> TelemetryResult<()> {
        let duration = self.tracer.with_open_record(self.span_id, |record| {
            let duration = record.started.elapsed();
            record.end_time = Some(Utc::now());
            record.duration = Some(duration);
            duration
        })?;
        context.remove(self.tracer.inner.id, self.span_id);
        debug!(span_id = %self.span_id, trace_id = %self.trace_id, ?duration, "span finished");
        Ok(())
    }

    /// Returns `true` once the span is finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !recover(self.tracer.inner.spans.lock()).is_open(self.span_id)
    }

    /// Returns a copy of the span's current state.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] if the span is unknown to its tracer.
    pub fn snapshot(&self) -> TelemetryResult<SpanSnapshot> {
        self.tracer.get_span(self.span_id)
    }
}

/// Finishes its span when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard finishes the span immediately"]
pub struct SpanGuard {
    handle: SpanHandle,
    finished: bool,
}

impl SpanGuard {
    /// Finishes the span now.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidState`] if the span was finished
    /// through another handle.
    pub fn finish(mut self) -> TelemetryResult<()> {
        self.finished = true;
        self.handle.finish()
    }
}

impl Deref for SpanGuard {
    type Target = SpanHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Already finished through another handle is fine here.
            let _ = self.handle.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> Tracer {
        Tracer::new("test-service").unwrap()
    }

    #[test]
    fn nested_spans_restore_parent() {
        let tracer = tracer();
        let a = tracer.start_span("a").unwrap();
        let b = tracer.start_span("b").unwrap();

        assert_eq!(tracer.get_active_span().unwrap().span_id(), b.span_id());
        let b_snapshot = b.snapshot().unwrap();
        assert_eq!(b_snapshot.parent_span_id, Some(a.span_id()));
        assert_eq!(b_snapshot.trace_id, a.trace_id());

        b.finish().unwrap();
        assert_eq!(tracer.get_active_span().unwrap().span_id(), a.span_id());
        a.finish().unwrap();
        assert!(tracer.get_active_span().is_none());
    }

    #[test]
    fn out_of_order_finish_keeps_child_active() {
        let tracer = tracer();
        let a = tracer.start_span("a").unwrap();
        let b = tracer.start_span("b").unwrap();

        a.finish().unwrap();
        assert_eq!(tracer.get_active_span().unwrap().span_id(), b.span_id());
        b.finish().unwrap();
        assert!(tracer.get_active_span().is_none());
    }

    #[test]
    fn closed_span_rejects_mutation() {
        let tracer = tracer();
        let span = tracer.start_span("op").unwrap();
        span.add_tag("user", "alice").unwrap();
        span.add_log("started", LogLevel::Info).unwrap();
        span.finish().unwrap();

        let err = span.add_tag("late", true).expect_err("closed span");
        assert!(matches!(err, TelemetryError::InvalidState { .. }));
        assert!(span.add_log("late", LogLevel::Warn).is_err());
        assert!(span.finish().is_err());

        let snapshot = span.snapshot().unwrap();
        assert_eq!(snapshot.tags.get("user"), Some(&TagValue::from("alice")));
        assert_eq!(snapshot.logs.len(), 1);
        assert!(snapshot.duration_secs.is_some());
    }

    #[test]
    fn scoped_span_finishes_on_error() {
        let tracer = tracer();
        let result: Result<(), &str> = tracer
            .span("failing", |span| {
                span.add_tag("attempt", 1).unwrap();
                Err("boom")
            })
            .unwrap();
        assert!(result.is_err());

        let spans = tracer.get_all_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_finished());
        assert!(tracer.get_active_span().is_none());
    }

    #[test]
    fn scoped_span_finishes_on_panic() {
        let tracer = tracer();
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracer
                .span("panicking", |_| panic!("wrapped work failed"))
                .unwrap();
        }));
        assert!(caught.is_err());

        let spans = tracer.get_all_spans();
        assert!(spans[0].end_time.is_some());
        assert!(tracer.get_active_span().is_none());
    }

    #[test]
    fn builder_tags_and_remote_parent() {
        let tracer = tracer();
        let trace_id = TraceId::random();
        let parent = SpanId::random();
        let span = tracer
            .span_builder("rpc")
            .tag("peer", "relay")
            .tag("retries", 2)
            .child_of(trace_id, parent)
            .start()
            .unwrap();

        let snapshot = span.snapshot().unwrap();
        assert_eq!(snapshot.trace_id, trace_id);
        assert_eq!(snapshot.parent_span_id, Some(parent));
        assert_eq!(snapshot.tags.get("retries"), Some(&TagValue::Int(2)));
        assert_eq!(tracer.get_spans_by_trace_id(trace_id).len(), 1);
    }

    #[test]
    fn empty_operation_is_rejected() {
        let tracer = tracer();
        assert!(matches!(
            tracer.start_span(""),
            Err(TelemetryError::InvalidArgument { .. })
        ));
        assert!(tracer.get_all_spans().is_empty());
    }

    #[test]
    fn guard_finishes_on_drop() {
        let tracer = tracer();
        {
            let guard = tracer.enter("scoped").unwrap();
            guard.add_tag("k", 1.5).unwrap();
        }
        assert!(tracer.get_all_spans()[0].is_finished());
    }

    #[test]
    fn threads_have_separate_stacks() {
        let tracer = tracer();
        let root = tracer.start_span("main").unwrap();

        let other = tracer.clone();
        let child_parent = std::thread::spawn(move || {
            let span = other.start_span("worker").unwrap();
            let parent = span.snapshot().unwrap().parent_span_id;
            span.finish().unwrap();
            parent
        })
        .join()
        .unwrap();

        assert_eq!(child_parent, None);
        assert_eq!(tracer.get_active_span().unwrap().span_id(), root.span_id());
        root.finish().unwrap();
    }

    #[test]
    fn summary_counts_traces() {
        let tracer = tracer();
        let a = tracer.start_span("a").unwrap();
        let _b = tracer.start_span("b").unwrap();
        a.finish().unwrap();
        let other_root = tracer.span_builder("c").in_trace(TraceId::random()).start().unwrap();
        other_root.finish().unwrap();

        let summary = tracer.summary();
        assert_eq!(summary.total_spans, 3);
        assert_eq!(summary.total_traces, 2);
        assert_eq!(summary.finished_spans, 2);
        assert_eq!(summary.active_spans, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_tasks_do_not_share_stacks() {
        let tracer = tracer();

        let run = |name: &'static str| {
            let tracer = tracer.clone();
            TraceContext::instrument(async move {
                let outer = tracer.start_span(name).unwrap();
                tokio::task::yield_now().await;
                let inner = tracer.start_span("inner").unwrap();
                tokio::task::yield_now().await;
                let parent = inner.snapshot().unwrap().parent_span_id;
                inner.finish().unwrap();
                outer.finish().unwrap();
                (outer.span_id(), parent)
            })
        };

        let ((a, a_parent), (b, b_parent)) = tokio::join!(run("a"), run("b"));
        assert_eq!(a_parent, Some(a));
        assert_eq!(b_parent, Some(b));
    }

    #[tokio::test]
    async fn in_span_finishes_after_await() {
        let tracer = tracer();
        let value = tracer
            .in_span("async-op", async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(tracer.get_all_spans()[0].is_finished());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn joined_in_span_requests_stay_independent() {
        let tracer = tracer();

        let request_a = tracer.in_span("request-a", async {
            let own = tracer.get_active_span().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let query = tracer.start_span("query").unwrap();
            let parent = query.snapshot().unwrap().parent_span_id;
            query.finish().unwrap();
            (own, parent)
        });
        let request_b = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tracer
                .in_span("request-b", async { tracer.get_active_span().unwrap() })
                .await
        };

        let (a, b) = tokio::join!(request_a, request_b);
        let (a_span, query_parent) = a.unwrap();
        let b_span = b.unwrap().snapshot().unwrap();

        assert_eq!(b_span.parent_span_id, None);
        assert_ne!(b_span.trace_id, a_span.trace_id());
        assert_eq!(query_parent, Some(a_span.span_id()));
        assert!(a_span.is_finished());
        assert!(tracer.get_active_span().is_none());
    }

    #[tokio::test]
    async fn in_span_nests_under_caller_span() {
        let tracer = tracer();
        let outer = tracer.enter("outer").unwrap();
        let inner = tracer
            .in_span("inner", async { tracer.get_active_span().unwrap() })
            .await
            .unwrap();

        let inner = inner.snapshot().unwrap();
        assert_eq!(inner.parent_span_id, Some(outer.span_id()));
        assert!(inner.is_finished());
        assert_eq!(tracer.get_active_span().unwrap().span_id(), outer.span_id());
    }
}
