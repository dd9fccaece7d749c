//! Session tracing for AgentOps on top of OpenTelemetry.
//!
//! Every agent session becomes one trace: a root `session` span with
//! `session.start` and `session.end` markers, and whatever spans the agent
//! emits in between. Spans are exported over OTLP/HTTP to the AgentOps
//! collector, authenticated with a JWT obtained from the AgentOps API in
//! exchange for an API key.
//!
//! # Quick Start
//!
//! ```no_run
//! use opentelemetry_agentops::{Config, Session, TracingCore};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Reads AGENTOPS_API_KEY and friends
//! let core = TracingCore::from_config(Config::from_env()?);
//! // Flushes whatever is still running when main returns
//! let _exit = core.exit_guard();
//!
//! let session = Session::new();
//! core.attach(&session);
//! session.start();
//!
//! if let Some(instrumentor) = core.instrumentor(session.id()) {
//!     instrumentor.tracer().in_span("plan", |_cx| {
//!         // ... agent work ...
//!     });
//! }
//!
//! session.end();
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! ## API client
//! - [`ApiClient`] talks to the AgentOps REST API with retries on 5xx responses
//! - [`AuthManager`] caches the JWT and refreshes it on expiry
//!
//! ## Exporter
//! - [`AuthenticatedOtlpExporter`] wraps the OTLP span exporter and injects a
//!   bearer token into each export
//! - Exports pause for a cooldown after an authentication failure
//!
//! ## Sessions
//! - [`Session`] carries the lifecycle signals
//! - [`TracingCore`] turns them into one [`SessionInstrumentor`] per session
//! - [`LogCapture`] forwards a session's console output as log records
//!
//! ## Context propagation
//! - [`context::spawn`] and [`ContextThreadPool`] carry the current trace
//!   context into other threads
//!
//! # Environment Variables
//!
//! - `AGENTOPS_API_KEY`: API key exchanged for export tokens
//! - `AGENTOPS_API_ENDPOINT`: REST API base URL (defaults to `https://api.agentops.ai`)
//! - `AGENTOPS_EXPORTER_ENDPOINT`: OTLP collector base URL (defaults to
//!   `https://otlp.agentops.ai`, falls back to `OTEL_EXPORTER_OTLP_ENDPOINT`)
//! - `AGENTOPS_SERVICE_NAME`: reported `service.name`
//! - `AGENTOPS_MAX_RETRIES`: retries for 5xx API responses
//! - `AGENTOPS_AUTH_COOLDOWN_SECS`: how long exports pause after an auth failure
//! - `AGENTOPS_CAPTURE_LOGS`: forward stdout/stderr of sessions as logs
//!
//! Example:
//! ```bash
//! export AGENTOPS_API_KEY="..."
//! export AGENTOPS_EXPORTER_ENDPOINT="https://otlp.agentops.ai"
//! ```

pub mod api_client;
pub mod auth;
pub mod config;
pub mod constants;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod exporter;
pub mod instrumentor;
pub mod lifecycle;
pub mod log_capture;
pub mod processor;
pub mod provider;
pub mod session;
#[cfg(test)]
mod testing;
pub mod tracer;
pub mod transport;

// Re-export main types
pub use api_client::{ApiClient, ApiResponse, HttpMethod, RetryPolicy};
pub use auth::AuthManager;
pub use config::Config;
pub use context::ContextThreadPool;
pub use endpoint::{build_logs_endpoint, build_traces_endpoint};
pub use error::{Error, Result};
pub use exporter::{
    exporter, AuthenticatedOtlpExporter, ExporterBuilder, ExporterState, JwtProvider,
};
pub use instrumentor::{SessionInstrumentor, SessionInstrumentorBuilder};
pub use lifecycle::{ExitGuard, TracingCore, TracingCoreBuilder};
pub use log_capture::{CaptureStats, CaptureWriter, LogCapture, Stream};
pub use processor::{FilteringSpanProcessor, ProcessorSet};
pub use provider::ProviderRegistry;
pub use session::{Session, SessionRegistry, SessionState};
pub use tracer::{ScopedSpan, SessionTracer};
pub use transport::{AuthenticatedHttpClient, SharedHeaders};
