//! Session-scoped tracing.
//!
//! A [`SessionTracer`] owns the root span of one session. Every span it
//! starts is a child of that root, or of the innermost [`ScopedSpan`] of the
//! same session active on the calling thread.

use crate::constants::{
    SESSION_END_SPAN_NAME, SESSION_ID_ATTRIBUTE, SESSION_SPAN_NAME, SESSION_START_SPAN_NAME,
};
use opentelemetry::trace::{
    Span as _, SpanKind, SpanRef, Status, TraceContextExt, TraceId, Tracer as _,
};
use opentelemetry::{Context, ContextGuard, KeyValue};
use opentelemetry_sdk::trace::{SdkTracer, Span};
use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Root span holder for one session.
pub struct SessionTracer {
    tracer: SdkTracer,
    session_id: Uuid,
    context: Context,
    trace_id: TraceId,
    ended: AtomicBool,
}

impl Debug for SessionTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTracer")
            .field("session_id", &self.session_id)
            .field("trace_id", &self.trace_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl SessionTracer {
    /// Starts the root span of `session_id` in a new trace.
    ///
    /// The root span is named `session` and carries `session.id` plus
    /// `attributes`. A `session.start` marker span is emitted right away.
    pub fn start(
        tracer: SdkTracer,
        session_id: Uuid,
        attributes: impl IntoIterator<Item = KeyValue>,
    ) -> Self {
        let session = Self::open(tracer, session_id, attributes);
        session.mark_started();
        session
    }

    // Starts the root span only. The trace id is known from here on, so
    // trace-scoped processors can be attached before the first span ends.
    pub(crate) fn open(
        tracer: SdkTracer,
        session_id: Uuid,
        attributes: impl IntoIterator<Item = KeyValue>,
    ) -> Self {
        let mut root_attributes = vec![KeyValue::new(SESSION_ID_ATTRIBUTE, session_id.to_string())];
        root_attributes.extend(attributes);

        let root = tracer
            .span_builder(SESSION_SPAN_NAME)
            .with_kind(SpanKind::Internal)
            .with_attributes(root_attributes)
            .start_with_context(&tracer, &Context::new());
        let context = Context::new().with_span(root);
        let trace_id = context.span().span_context().trace_id();

        let session = Self {
            tracer,
            session_id,
            context,
            trace_id,
            ended: AtomicBool::new(false),
        };
        tracing::debug!(%session_id, %trace_id, "session root span started");
        session
    }

    pub(crate) fn mark_started(&self) {
        self.emit_marker(SESSION_START_SPAN_NAME);
    }

    /// The session this tracer belongs to.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Trace id shared by every span of the session.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Context holding the root span.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Makes the root span the current context until the guard drops.
    pub fn attach(&self) -> ContextGuard {
        self.context.clone().attach()
    }

    /// Whether [`SessionTracer::end`] has run.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    // The innermost active span of this session, falling back to the root.
    fn parent_context(&self) -> Context {
        let current = Context::current();
        let belongs_here = current.has_active_span()
            && current.span().span_context().trace_id() == self.trace_id;
        if belongs_here {
            current
        } else {
            self.context.clone()
        }
    }

    fn emit_marker(&self, name: &'static str) {
        self.tracer
            .span_builder(name)
            .with_attributes(vec![KeyValue::new(
                SESSION_ID_ATTRIBUTE,
                self.session_id.to_string(),
            )])
            .start_with_context(&self.tracer, &self.context)
            .end();
    }

    /// Starts a span in this session. The caller ends it.
    pub fn start_span(&self, name: impl Into<Cow<'static, str>>) -> Span {
        self.tracer
            .span_builder(name)
            .start_with_context(&self.tracer, &self.parent_context())
    }

    /// Starts a span that is current until the returned guard drops, and
    /// ends when it does.
    pub fn scoped_span(&self, name: impl Into<Cow<'static, str>>) -> ScopedSpan {
        let context = self.parent_context().with_span(self.start_span(name));
        let guard = context.clone().attach();
        ScopedSpan {
            context,
            _guard: guard,
        }
    }

    /// Runs `f` inside a scoped span.
    ///
    /// The span ends when `f` returns or unwinds.
    pub fn in_span<T, F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> T
    where
        F: FnOnce(&Context) -> T,
    {
        let scoped = self.scoped_span(name);
        f(scoped.context())
    }

    /// Ends the session: emits `session.end`, then ends the root span.
    ///
    /// Only the first call does anything; it returns `true`.
    pub fn end(&self) -> bool {
        self.end_with_status(Status::Unset)
    }

    /// Like [`SessionTracer::end`], setting `status` on the root span first.
    pub fn end_with_status(&self, status: Status) -> bool {
        if self
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.emit_marker(SESSION_END_SPAN_NAME);
        let root = self.context.span();
        root.set_status(status);
        root.end();
        tracing::debug!(session_id = %self.session_id, "session root span ended");
        true
    }
}

/// A span that is current on this thread while held and ends on drop.
#[must_use = "the span ends as soon as the guard is dropped"]
pub struct ScopedSpan {
    context: Context,
    _guard: ContextGuard,
}

impl ScopedSpan {
    /// The span.
    pub fn span(&self) -> SpanRef<'_> {
        self.context.span()
    }

    /// Context holding the span.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Debug for ScopedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSpan")
            .field("span_context", self.context.span().span_context())
            .finish()
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        self.context.span().end();
    }
}
