use crate::processor::BatchSpanProcessor;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// An open span as seen from the active-span stack. `open` is cleared when
/// the guard closes, so an entry left behind on another stack is skipped.
#[derive(Clone)]
struct ActiveEntry {
    context: SpanContext,
    open: Arc<AtomicBool>,
}

type SpanStack = RefCell<Vec<ActiveEntry>>;

tokio::task_local! {
    /// Spans opened inside a [`task_scope`], innermost last.
    static TASK_SPANS: SpanStack;
}

thread_local! {
    /// Spans opened on this thread outside any task scope, innermost last.
    static THREAD_SPANS: SpanStack = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the stack of the current task scope, or of the current
/// thread when no task scope is active.
fn with_active_stack<R>(f: impl FnOnce(&mut Vec<ActiveEntry>) -> R) -> Option<R> {
    let mut f = Some(f);
    let in_task = TASK_SPANS.try_with(|stack| f.take().map(|f| f(&mut stack.borrow_mut())));
    match in_task {
        Ok(result) => result,
        Err(_) => THREAD_SPANS
            .try_with(|stack| f.take().map(|f| f(&mut stack.borrow_mut())))
            .ok()
            .flatten(),
    }
}

/// Run `future` with its own active-span stack.
///
/// Every request handled as an async task should run inside one, so that
/// requests interleaved on the same worker thread never see each other's
/// spans. The stack travels with the future across threads.
pub fn task_scope<F: Future>(future: F) -> impl Future<Output = F::Output> {
    TASK_SPANS.scope(RefCell::new(Vec::new()), future)
}

/// 128-bit trace identifier, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// A fresh random, non-zero id.
    pub fn random() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return TraceId(id);
            }
        }
    }

    pub fn to_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 64-bit span identifier, rendered as 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// A fresh random, non-zero id.
    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return SpanId(id);
            }
        }
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of a span within its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    /// A context that belongs to no recorded span.
    pub fn random() -> Self {
        SpanContext {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
        }
    }
}

/// Innermost open span of the current task scope, or of the calling thread
/// outside one.
pub fn current_span_context() -> Option<SpanContext> {
    with_active_stack(|stack| {
        while let Some(top) = stack.last() {
            if top.open.load(Ordering::Acquire) {
                return Some(top.context);
            }
            stack.pop();
        }
        None
    })
    .flatten()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Internal,
    Server,
}

/// Terminal status of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status_code", rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { description: String },
}

impl SpanStatus {
    pub fn error(description: impl Into<String>) -> Self {
        SpanStatus::Error {
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }
}

/// Attribute value attached to a span or span event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<&String> for AttributeValue {
    fn from(v: &String) -> Self {
        AttributeValue::String(v.clone())
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<f32> for AttributeValue {
    fn from(v: f32) -> Self {
        AttributeValue::Float(f64::from(v))
    }
}

macro_rules! int_attribute {
    ($($t:ty),*) => {
        $(impl From<$t> for AttributeValue {
            fn from(v: $t) -> Self {
                AttributeValue::Int(i64::from(v))
            }
        })*
    };
}

int_attribute!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(v: usize) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

/// Timestamped annotation inside a span, e.g. a recorded exception.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A closed span as handed to the export pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanData {
    pub name: String,
    pub context: SpanContext,
    pub parent_span_id: Option<SpanId>,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub events: Vec<SpanEvent>,
    pub instrumentation_scope: String,
}

impl SpanData {
    pub fn duration_ms(&self) -> f64 {
        (self.end_time - self.start_time)
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// Handle used to open spans. Cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    scope: String,
    processor: Arc<BatchSpanProcessor>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").field("scope", &self.inner.scope).finish()
    }
}

impl Tracer {
    pub fn new(scope: impl Into<String>, processor: Arc<BatchSpanProcessor>) -> Self {
        Tracer {
            inner: Arc::new(TracerInner {
                scope: scope.into(),
                processor,
            }),
        }
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    /// Open an internal span under the active span of the current task scope
    /// (or thread), or as a new trace root when none is active.
    pub fn start_span(&self, name: impl Into<String>) -> SpanGuard {
        self.start_span_with_kind(name, SpanKind::Internal)
    }

    pub fn start_span_with_kind(&self, name: impl Into<String>, kind: SpanKind) -> SpanGuard {
        self.open(name.into(), kind, current_span_context())
    }

    /// Open a span that starts a new trace regardless of what is active.
    pub fn start_root_span(&self, name: impl Into<String>, kind: SpanKind) -> SpanGuard {
        self.open(name.into(), kind, None)
    }

    /// Run `f` inside a span. An `Err` is recorded as an exception and marks
    /// the span `ERROR`; the result is returned untouched either way.
    pub fn in_span<T, E, F>(&self, name: impl Into<String>, f: F) -> Result<T, E>
    where
        F: FnOnce(&SpanGuard) -> Result<T, E>,
        E: fmt::Display,
    {
        let span = self.start_span(name);
        let result = f(&span);
        if let Err(err) = &result {
            span.record_error(err);
        }
        result
    }

    fn open(&self, name: String, kind: SpanKind, parent: Option<SpanContext>) -> SpanGuard {
        let context = SpanContext {
            trace_id: parent.map(|p| p.trace_id).unwrap_or_else(TraceId::random),
            span_id: SpanId::random(),
        };
        let entry = ActiveEntry {
            context,
            open: Arc::new(AtomicBool::new(true)),
        };
        let pushed = entry.clone();
        with_active_stack(|stack| stack.push(pushed));

        SpanGuard {
            tracer: self.clone(),
            entry,
            parent_span_id: parent.map(|p| p.span_id),
            state: Mutex::new(Some(SpanState {
                name,
                kind,
                start_time: Utc::now(),
                attributes: BTreeMap::new(),
                events: Vec::new(),
                status: SpanStatus::Unset,
            })),
        }
    }
}

struct SpanState {
    name: String,
    kind: SpanKind,
    start_time: DateTime<Utc>,
    attributes: BTreeMap<String, AttributeValue>,
    events: Vec<SpanEvent>,
    status: SpanStatus,
}

/// An open span. Closing happens when the guard is dropped, on every exit
/// path including unwinding.
///
/// While alive the span is the innermost active span of the task scope (or
/// thread) that opened it. Guards are `Send` and may be held across `.await`.
pub struct SpanGuard {
    tracer: Tracer,
    entry: ActiveEntry,
    parent_span_id: Option<SpanId>,
    state: Mutex<Option<SpanState>>,
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("context", &self.entry.context)
            .field("parent_span_id", &self.parent_span_id)
            .finish()
    }
}

impl SpanGuard {
    pub fn context(&self) -> SpanContext {
        self.entry.context
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    /// Open a child of this span, whatever span is currently innermost.
    pub fn child(&self, name: impl Into<String>) -> SpanGuard {
        self.tracer
            .open(name.into(), SpanKind::Internal, Some(self.entry.context))
    }

    /// Run `future` in a fresh [`task_scope`] whose active span is this one.
    ///
    /// Use it for work spawned onto another task, so spans opened there
    /// become children of this span.
    pub fn in_task<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        TASK_SPANS.scope(RefCell::new(vec![self.entry.clone()]), future)
    }

    fn with_state(&self, f: impl FnOnce(&mut SpanState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = state.as_mut() {
            f(state);
        }
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_state(|state| {
            state.attributes.insert(key, value);
        });
    }

    pub fn add_event<I, K, V>(&self, name: impl Into<String>, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let event = SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self.with_state(|state| state.events.push(event));
    }

    /// Attach an `exception` event. The status is left unchanged.
    pub fn record_exception<E: fmt::Display + ?Sized>(&self, err: &E) {
        self.add_event(
            "exception",
            [
                ("exception.type", short_type_name::<E>()),
                ("exception.message", err.to_string()),
            ],
        );
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.with_state(|state| state.status = status);
    }

    /// [`record_exception`](Self::record_exception) followed by an `ERROR`
    /// status carrying the error text.
    pub fn record_error<E: fmt::Display + ?Sized>(&self, err: &E) {
        self.record_exception(err);
        self.set_status(SpanStatus::error(err.to_string()));
    }

    /// Close the span now.
    pub fn end(self) {}
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let Some(state) = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.entry.open.store(false, Ordering::Release);
        let span_id = self.entry.context.span_id;
        with_active_stack(|stack| {
            if let Some(pos) = stack.iter().rposition(|e| e.context.span_id == span_id) {
                stack.remove(pos);
            }
        });

        let status = match state.status {
            SpanStatus::Unset if std::thread::panicking() => SpanStatus::error("panicked"),
            SpanStatus::Unset => SpanStatus::Ok,
            status => status,
        };

        self.tracer.inner.processor.on_end(SpanData {
            name: state.name,
            context: self.entry.context,
            parent_span_id: self.parent_span_id,
            kind: state.kind,
            start_time: state.start_time,
            end_time: Utc::now(),
            status,
            attributes: state.attributes,
            events: state.events,
            instrumentation_scope: self.tracer.inner.scope.clone(),
        });
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
