//! Span processors used to route session spans.
//!
//! [`FilteringSpanProcessor`] forwards finished spans to an inner processor
//! only when their name passes an allow or deny list and, when scoped, they
//! belong to one trace. [`ProcessorSet`] is the
//! processor a session provider is built with: an ordered list that sessions
//! add their own processors to and remove them from again at shutdown.

use opentelemetry::trace::TraceId;
use opentelemetry::Context;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    Allow,
    Deny,
}

/// Forwards finished spans to an inner processor based on their name.
///
/// Only [`SpanProcessor::on_end`] is filtered; started spans always reach the
/// inner processor.
#[derive(Debug)]
pub struct FilteringSpanProcessor {
    inner: Box<dyn SpanProcessor>,
    names: HashSet<String>,
    mode: FilterMode,
    trace_id: Option<TraceId>,
}

impl FilteringSpanProcessor {
    /// Forwards only spans whose name is in `names`.
    pub fn allow<I, S>(names: I, inner: impl SpanProcessor + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::allow_boxed(names, Box::new(inner))
    }

    /// Forwards every span except those whose name is in `names`.
    pub fn deny<I, S>(names: I, inner: impl SpanProcessor + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::deny_boxed(names, Box::new(inner))
    }

    /// [`FilteringSpanProcessor::allow`] for an already boxed processor.
    pub fn allow_boxed<I, S>(names: I, inner: Box<dyn SpanProcessor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_mode(names, inner, FilterMode::Allow)
    }

    /// [`FilteringSpanProcessor::deny`] for an already boxed processor.
    pub fn deny_boxed<I, S>(names: I, inner: Box<dyn SpanProcessor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_mode(names, inner, FilterMode::Deny)
    }

    fn with_mode<I, S>(names: I, inner: Box<dyn SpanProcessor>, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            names: names.into_iter().map(Into::into).collect(),
            mode,
            trace_id: None,
        }
    }

    /// Only forwards spans of the trace `trace_id`.
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Returns whether a span named `name` passes the name list.
    pub fn accepts(&self, name: &str) -> bool {
        let listed = self.names.contains(name);
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }

    /// Returns whether `span` is forwarded on end.
    pub fn accepts_span(&self, span: &SpanData) -> bool {
        let in_scope = self
            .trace_id
            .is_none_or(|trace_id| span.span_context.trace_id() == trace_id);
        in_scope && self.accepts(&span.name)
    }
}

impl SpanProcessor for FilteringSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.inner.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        if self.accepts_span(&span) {
            self.inner.on_end(span);
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.inner.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.inner.set_resource(resource);
    }
}

/// Handle returned by [`ProcessorSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(u64);

/// Ordered, mutable list of span processors behind one provider.
///
/// A tracer provider's processors are fixed when it is built. Building the
/// provider with a `ProcessorSet` lets sessions attach and detach their
/// processors while the provider stays installed. Clones share the same list.
#[derive(Clone, Default)]
pub struct ProcessorSet {
    inner: Arc<SetInner>,
}

#[derive(Default)]
struct SetInner {
    processors: RwLock<Vec<(ProcessorId, Arc<dyn SpanProcessor>)>>,
    resource: RwLock<Option<Resource>>,
    next_id: AtomicU64,
}

impl Debug for ProcessorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorSet")
            .field("len", &self.len())
            .finish()
    }
}

impl ProcessorSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `processor` and returns the handle to remove it with.
    pub fn add(&self, processor: Arc<dyn SpanProcessor>) -> ProcessorId {
        let id = ProcessorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, processor));
        id
    }

    /// Removes the processor registered under `id`, returning it.
    pub fn remove(&self, id: ProcessorId) -> Option<Arc<dyn SpanProcessor>> {
        let mut processors = self
            .inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = processors.iter().position(|(pid, _)| *pid == id)?;
        Some(processors.remove(index).1)
    }

    /// Number of registered processors.
    pub fn len(&self) -> usize {
        self.inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no processor is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `other` is a handle to this same set.
    pub fn same_set(&self, other: &ProcessorSet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The resource of the provider this set was installed into.
    pub fn resource(&self) -> Option<Resource> {
        self.inner
            .resource
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Snapshot so callbacks never run under the lock.
    fn snapshot(&self) -> Vec<Arc<dyn SpanProcessor>> {
        self.inner
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, processor)| Arc::clone(processor))
            .collect()
    }

    fn for_each(&self, op: impl Fn(&dyn SpanProcessor) -> OTelSdkResult) -> OTelSdkResult {
        let failures: Vec<String> = self
            .snapshot()
            .iter()
            .filter_map(|processor| op(processor.as_ref()).err())
            .map(|err| err.to_string())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OTelSdkError::InternalFailure(failures.join("; ")))
        }
    }
}

impl SpanProcessor for ProcessorSet {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        for processor in self.snapshot() {
            processor.on_start(span, cx);
        }
    }

    fn on_end(&self, span: SpanData) {
        let processors = self.snapshot();
        if let Some((last, rest)) = processors.split_last() {
            for processor in rest {
                processor.on_end(span.clone());
            }
            last.on_end(span);
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.for_each(|processor| processor.force_flush())
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.for_each(|processor| processor.shutdown_with_timeout(timeout))
    }

    fn set_resource(&mut self, resource: &Resource) {
        *self
            .inner
            .resource
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(resource.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, TraceContextExt, Tracer, TracerProvider};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SimpleSpanProcessor};

    fn finished_names(exporter: &InMemorySpanExporter) -> Vec<String> {
        exporter
            .get_finished_spans()
            .unwrap()
            .into_iter()
            .map(|span| span.name.to_string())
            .collect()
    }

    #[test]
    fn test_allow_and_deny_partition_spans() {
        let lifecycle = InMemorySpanExporter::default();
        let events = InMemorySpanExporter::default();
        let names = ["session.start", "session.end"];

        let provider = SdkTracerProvider::builder()
            .with_span_processor(FilteringSpanProcessor::allow(
                names,
                SimpleSpanProcessor::new(lifecycle.clone()),
            ))
            .with_span_processor(FilteringSpanProcessor::deny(
                names,
                SimpleSpanProcessor::new(events.clone()),
            ))
            .build();

        let tracer = provider.tracer("test");
        for name in ["session.start", "llm.call", "session.end", "tool.call"] {
            tracer.in_span(name, |_| {});
        }

        assert_eq!(finished_names(&lifecycle), vec!["session.start", "session.end"]);
        assert_eq!(finished_names(&events), vec!["llm.call", "tool.call"]);
    }

    #[test]
    fn test_filter_accepts() {
        let simple = || SimpleSpanProcessor::new(InMemorySpanExporter::default());
        let allow = FilteringSpanProcessor::allow(["a"], simple());
        assert!(allow.accepts("a"));
        assert!(!allow.accepts("b"));

        let deny = FilteringSpanProcessor::deny(["a"], simple());
        assert!(!deny.accepts("a"));
        assert!(deny.accepts("b"));
    }

    #[test]
    fn test_trace_scoped_filter_drops_other_traces() {
        let set = ProcessorSet::new();
        let scoped = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(set.clone())
            .build();
        let tracer = provider.tracer("test");

        let root = tracer.start_with_context("root", &Context::new());
        let cx = Context::new().with_span(root);
        let trace_id = cx.span().span_context().trace_id();
        set.add(Arc::new(
            FilteringSpanProcessor::deny(
                ["session.start"],
                SimpleSpanProcessor::new(scoped.clone()),
            )
            .with_trace_id(trace_id),
        ));

        tracer.start_with_context("mine", &cx).end();
        tracer.start_with_context("session.start", &cx).end();
        tracer.start_with_context("foreign", &Context::new()).end();
        cx.span().end();

        assert_eq!(finished_names(&scoped), vec!["mine", "root"]);
    }

    #[test]
    fn test_processor_set_add_and_remove() {
        let set = ProcessorSet::new();
        let first = InMemorySpanExporter::default();
        let second = InMemorySpanExporter::default();

        let provider = SdkTracerProvider::builder()
            .with_span_processor(set.clone())
            .build();
        let tracer = provider.tracer("test");

        let first_id = set.add(Arc::new(SimpleSpanProcessor::new(first.clone())));
        set.add(Arc::new(SimpleSpanProcessor::new(second.clone())));
        tracer.in_span("both", |_| {});

        let removed = set.remove(first_id);
        assert!(removed.is_some());
        assert!(set.remove(first_id).is_none());
        assert_eq!(set.len(), 1);
        tracer.in_span("second-only", |_| {});

        assert_eq!(finished_names(&first), vec!["both"]);
        assert_eq!(finished_names(&second), vec!["both", "second-only"]);
        assert!(set.resource().is_some());
    }

    #[test]
    fn test_empty_set_flushes_cleanly() {
        let set = ProcessorSet::new();
        assert!(set.is_empty());
        assert!(set.force_flush().is_ok());
        assert!(set.shutdown_with_timeout(Duration::from_secs(1)).is_ok());
    }
}
