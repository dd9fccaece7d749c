//! Per-session tracing setup and teardown.
//!
//! A [`SessionInstrumentor`] ties one session to the shared tracer provider:
//! it installs the provider if nobody has yet, opens the root span, and
//! attaches lifecycle and event processors that only see the session's own
//! trace. Shutdown runs in a fixed order and at most once. The last session
//! to let go of the provider shuts it down.

use crate::config::Config;
use crate::constants::{
    DEFAULT_SERVICE_NAME, DEFAULT_SHUTDOWN_TIMEOUT_SECS, INSTRUMENTATION_NAME,
    LIFECYCLE_SPAN_NAMES, SESSION_ID_ATTRIBUTE,
};
use crate::exporter::{ExporterBuilder, JwtProvider};
use crate::processor::{FilteringSpanProcessor, ProcessorId, ProcessorSet};
use crate::provider::ProviderRegistry;
use crate::tracer::SessionTracer;
use crate::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{
    BatchSpanProcessor, SdkTracerProvider, SpanExporter, SpanProcessor,
};
use opentelemetry_sdk::Resource;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Builder for a [`SessionInstrumentor`].
pub struct SessionInstrumentorBuilder {
    session_id: Uuid,
    service_name: String,
    registry: Option<Arc<ProviderRegistry>>,
    lifecycle_processor: Option<Box<dyn SpanProcessor>>,
    event_processor: Option<Box<dyn SpanProcessor>>,
    lifecycle_span_names: Vec<String>,
    resource_attributes: Vec<KeyValue>,
    span_attributes: Vec<KeyValue>,
    shutdown_timeout: Duration,
}

impl SessionInstrumentorBuilder {
    /// Creates a builder for the session `session_id`.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The id of the session being traced
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            registry: None,
            lifecycle_processor: None,
            event_processor: None,
            lifecycle_span_names: LIFECYCLE_SPAN_NAMES.iter().map(|s| s.to_string()).collect(),
            resource_attributes: Vec::new(),
            span_attributes: Vec::new(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    /// Sets the `service.name` of a newly installed provider.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the provider registry. Defaults to [`ProviderRegistry::global`].
    pub fn with_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the processor receiving the lifecycle spans.
    ///
    /// # Arguments
    ///
    /// * `processor` - Receives only spans named in the lifecycle span list
    pub fn with_lifecycle_processor(mut self, processor: impl SpanProcessor + 'static) -> Self {
        self.lifecycle_processor = Some(Box::new(processor));
        self
    }

    /// Sets the processor receiving every other span.
    pub fn with_event_processor(mut self, processor: impl SpanProcessor + 'static) -> Self {
        self.event_processor = Some(Box::new(processor));
        self
    }

    /// Exports lifecycle spans through `exporter` behind a batch processor.
    pub fn with_lifecycle_exporter(self, exporter: impl SpanExporter + 'static) -> Self {
        self.with_lifecycle_processor(BatchSpanProcessor::builder(exporter).build())
    }

    /// Exports every other span through `exporter` behind a batch processor.
    pub fn with_event_exporter(self, exporter: impl SpanExporter + 'static) -> Self {
        self.with_event_processor(BatchSpanProcessor::builder(exporter).build())
    }

    /// Replaces the span names routed to the lifecycle processor.
    pub fn with_lifecycle_span_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lifecycle_span_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a resource attribute to a newly installed provider.
    pub fn with_resource_attribute<V>(mut self, key: &'static str, value: V) -> Self
    where
        V: Into<opentelemetry::Value>,
    {
        self.resource_attributes.push(KeyValue::new(key, value));
        self
    }

    /// Adds an attribute to the session root span.
    pub fn with_span_attribute<V>(mut self, key: &'static str, value: V) -> Self
    where
        V: Into<opentelemetry::Value>,
    {
        self.span_attributes.push(KeyValue::new(key, value));
        self
    }

    /// Sets how long each processor gets to drain on shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Installs or reuses the provider, opens the root span and attaches the
    /// processors, scoped to the session's trace.
    pub fn build(self) -> SessionInstrumentor {
        let registry = self.registry.unwrap_or_else(ProviderRegistry::global);

        let mut resource_attributes = vec![KeyValue::new(
            SESSION_ID_ATTRIBUTE,
            self.session_id.to_string(),
        )];
        resource_attributes.extend(self.resource_attributes);
        let resource = Resource::builder()
            .with_service_name(self.service_name)
            .with_attributes(resource_attributes)
            .build();

        let (registered, owns_provider) = registry.get_or_install(|processors| {
            SdkTracerProvider::builder()
                .with_span_processor(processors)
                .with_resource(resource.clone())
                .build()
        });
        let resource = registered.processors.resource().unwrap_or(resource);

        let tracer = SessionTracer::open(
            registered.provider.tracer(INSTRUMENTATION_NAME),
            self.session_id,
            self.span_attributes,
        );
        let trace_id = tracer.trace_id();

        let mut filtered = Vec::new();
        if let Some(lifecycle) = self.lifecycle_processor {
            filtered.push(
                FilteringSpanProcessor::allow_boxed(
                    self.lifecycle_span_names.iter().cloned(),
                    lifecycle,
                )
                .with_trace_id(trace_id),
            );
        }
        if let Some(events) = self.event_processor {
            filtered.push(
                FilteringSpanProcessor::deny_boxed(
                    self.lifecycle_span_names.iter().cloned(),
                    events,
                )
                .with_trace_id(trace_id),
            );
        }

        let processors = filtered
            .into_iter()
            .map(|mut processor| {
                processor.set_resource(&resource);
                let processor: Arc<dyn SpanProcessor> = Arc::new(processor);
                (registered.processors.add(Arc::clone(&processor)), processor)
            })
            .collect();

        tracer.mark_started();
        tracing::debug!(
            session_id = %self.session_id,
            owns_provider,
            "session instrumentation started"
        );

        SessionInstrumentor {
            session_id: self.session_id,
            registry,
            provider: registered.provider,
            processor_set: registered.processors,
            owns_provider,
            tracer,
            processors,
            shutdown_timeout: self.shutdown_timeout,
            shut_down: Mutex::new(false),
        }
    }
}

/// Tracing state owned by one running session.
#[derive(Debug)]
pub struct SessionInstrumentor {
    session_id: Uuid,
    registry: Arc<ProviderRegistry>,
    provider: SdkTracerProvider,
    processor_set: ProcessorSet,
    owns_provider: bool,
    tracer: SessionTracer,
    processors: Vec<(ProcessorId, Arc<dyn SpanProcessor>)>,
    shutdown_timeout: Duration,
    shut_down: Mutex<bool>,
}

impl SessionInstrumentor {
    /// Creates a [`SessionInstrumentorBuilder`].
    pub fn builder(session_id: Uuid) -> SessionInstrumentorBuilder {
        SessionInstrumentorBuilder::new(session_id)
    }

    /// Instruments `session_id` with two authenticated OTLP exporters, one
    /// for lifecycle spans and one for everything else.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use opentelemetry_agentops::{ApiClient, Config, SessionInstrumentor};
    /// use std::sync::Arc;
    /// use uuid::Uuid;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::from_env()?;
    /// let client = Arc::new(ApiClient::from_config(&config));
    /// let provider = config.api_key.clone().map(|key| client.jwt_provider(key));
    ///
    /// let instrumentor = SessionInstrumentor::from_config(Uuid::new_v4(), &config, provider)?;
    /// instrumentor.tracer().in_span("agent.step", |_| {
    ///     // ... agent work ...
    /// });
    /// instrumentor.shutdown();
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_config(
        session_id: Uuid,
        config: &Config,
        jwt_provider: Option<Arc<dyn JwtProvider>>,
    ) -> Result<Self> {
        let build_exporter = || {
            let builder = ExporterBuilder::from_config(config);
            match &jwt_provider {
                Some(provider) => builder.with_jwt_provider(Arc::clone(provider)).build(),
                None => builder.build(),
            }
        };

        Ok(Self::builder(session_id)
            .with_service_name(config.service_name.clone())
            .with_lifecycle_exporter(build_exporter()?)
            .with_event_exporter(build_exporter()?)
            .build())
    }

    /// The traced session.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The session tracer.
    pub fn tracer(&self) -> &SessionTracer {
        &self.tracer
    }

    /// The provider the session's spans go through.
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    /// Whether this session installed the provider.
    ///
    /// Ownership only records who built the provider; whichever session
    /// releases it last shuts it down.
    pub fn owns_provider(&self) -> bool {
        self.owns_provider
    }

    /// Whether [`SessionInstrumentor::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flushes and tears down the session's tracing.
    ///
    /// Steps run in order: flush the session's processors, end the root
    /// span, shut down and detach the processors, and finally shut down the
    /// provider if no other session still uses it. A failing step is logged and
    /// the remaining steps still run.
    ///
    /// Returns `true` for the call that did the work; every later call is a
    /// no-op returning `false`.
    pub fn shutdown(&self) -> bool {
        let mut shut_down = self.shut_down.lock().unwrap_or_else(PoisonError::into_inner);
        if *shut_down {
            return false;
        }
        *shut_down = true;

        let session_id = self.session_id;
        tracing::debug!(%session_id, "shutting down session instrumentation");

        for (_, processor) in &self.processors {
            if let Err(err) = processor.force_flush() {
                tracing::warn!(%session_id, error = %err, "failed to flush span processor");
            }
        }

        self.tracer.end();

        for (id, processor) in &self.processors {
            self.processor_set.remove(*id);
            if let Err(err) = processor.shutdown_with_timeout(self.shutdown_timeout) {
                tracing::warn!(%session_id, error = %err, "failed to shut down span processor");
            }
        }

        if self.registry.release(&self.processor_set) {
            if let Err(err) = self.provider.force_flush() {
                tracing::warn!(%session_id, error = %err, "failed to flush tracer provider");
            }
            if let Err(err) = self.provider.shutdown() {
                tracing::warn!(%session_id, error = %err, "failed to shut down tracer provider");
            }
        }

        tracing::debug!(%session_id, "session instrumentation shut down");
        true
    }
}

impl Drop for SessionInstrumentor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
