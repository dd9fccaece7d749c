//! Wiring between session signals and session instrumentation.
//!
//! [`TracingCore`] listens to sessions and keeps one [`SessionInstrumentor`]
//! per live session: it creates one when a session starts and shuts it down
//! when the session ends. Whatever is still running when the process winds
//! down is shut down by [`TracingCore::shutdown_all`], which an [`ExitGuard`]
//! calls on drop.

use crate::api_client::ApiClient;
use crate::config::Config;
use crate::instrumentor::SessionInstrumentor;
use crate::log_capture::LogCapture;
use crate::session::{Session, SessionRegistry};
use crate::Result;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Builds the instrumentor for a starting session.
pub type InstrumentorFactory =
    Arc<dyn Fn(&Arc<Session>) -> Result<SessionInstrumentor> + Send + Sync>;

/// Builds the console capture for a starting session.
pub type LogCaptureFactory = Arc<dyn Fn(&Arc<Session>) -> Result<LogCapture> + Send + Sync>;

/// Keeps one instrumentor per live session.
pub struct TracingCore {
    factory: InstrumentorFactory,
    log_capture_factory: Option<LogCaptureFactory>,
    instrumentors: Mutex<HashMap<Uuid, Arc<SessionInstrumentor>>>,
    captures: Mutex<HashMap<Uuid, Arc<LogCapture>>>,
    sessions: Arc<SessionRegistry>,
}

/// Builder for a [`TracingCore`].
pub struct TracingCoreBuilder {
    factory: InstrumentorFactory,
    log_capture_factory: Option<LogCaptureFactory>,
    sessions: Option<Arc<SessionRegistry>>,
}

impl TracingCoreBuilder {
    /// Sets the session registry. Defaults to [`SessionRegistry::global`].
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Captures each session's console output with a capture built by `factory`.
    pub fn with_log_capture(
        mut self,
        factory: impl Fn(&Arc<Session>) -> Result<LogCapture> + Send + Sync + 'static,
    ) -> Self {
        self.log_capture_factory = Some(Arc::new(factory));
        self
    }

    /// Builds the core.
    pub fn build(self) -> Arc<TracingCore> {
        Arc::new(TracingCore {
            factory: self.factory,
            log_capture_factory: self.log_capture_factory,
            instrumentors: Mutex::new(HashMap::new()),
            captures: Mutex::new(HashMap::new()),
            sessions: self.sessions.unwrap_or_else(SessionRegistry::global),
        })
    }
}

impl Debug for TracingCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingCore")
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl TracingCore {
    /// Creates a [`TracingCoreBuilder`] instrumenting sessions with `factory`.
    pub fn builder(
        factory: impl Fn(&Arc<Session>) -> Result<SessionInstrumentor> + Send + Sync + 'static,
    ) -> TracingCoreBuilder {
        TracingCoreBuilder {
            factory: Arc::new(factory),
            log_capture_factory: None,
            sessions: None,
        }
    }

    /// Creates a core that instruments sessions with `factory` and records
    /// them in `sessions`.
    pub fn new(
        factory: impl Fn(&Arc<Session>) -> Result<SessionInstrumentor> + Send + Sync + 'static,
        sessions: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Self::builder(factory).with_sessions(sessions).build()
    }

    /// Creates a core exporting every session to the collector in `config`.
    ///
    /// With an API key, exports authenticate with a JWT obtained from the
    /// API endpoint; without one they go out unauthenticated. Console output
    /// is captured when [`Config::capture_logs`] is set.
    pub fn from_config(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let jwt_provider = config.api_key.clone().map(|api_key| {
            let client = Arc::new(ApiClient::from_config(&config));
            client.jwt_provider(api_key)
        });

        let instrumentor_config = Arc::clone(&config);
        let instrumentor_jwt = jwt_provider.clone();
        let builder = Self::builder(move |session: &Arc<Session>| {
            SessionInstrumentor::from_config(
                session.id(),
                &instrumentor_config,
                instrumentor_jwt.clone(),
            )
        });
        if !config.capture_logs {
            return builder.build();
        }

        builder
            .with_log_capture(move |session: &Arc<Session>| {
                LogCapture::from_config(session.id(), &config, jwt_provider.clone())
            })
            .build()
    }

    /// The registry sessions are recorded in while instrumented.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    fn instrumentors(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<SessionInstrumentor>>> {
        self.instrumentors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to `session`'s start and end signals.
    ///
    /// A session that is already active is instrumented right away.
    pub fn attach(self: &Arc<Self>, session: &Arc<Session>) {
        let core = Arc::downgrade(self);
        session.on_start(move |session| {
            if let Some(core) = core.upgrade() {
                core.on_session_started(session);
            }
        });

        let core = Arc::downgrade(self);
        session.on_end(move |session| {
            if let Some(core) = core.upgrade() {
                core.on_session_ended(session.id());
            }
        });

        if session.is_active() {
            self.on_session_started(session);
        }
    }

    /// Instruments `session` unless it already is.
    ///
    /// Returns whether a new instrumentor was created. Factory errors are
    /// logged, not returned.
    pub fn on_session_started(&self, session: &Arc<Session>) -> bool {
        let session_id = session.id();
        let mut instrumentors = self.instrumentors();
        if instrumentors.contains_key(&session_id) {
            tracing::debug!(%session_id, "session already instrumented");
            return false;
        }

        self.sessions.register(session);
        let created = match (self.factory)(session) {
            Ok(instrumentor) => {
                instrumentors.insert(session_id, Arc::new(instrumentor));
                tracing::debug!(%session_id, "session instrumented");
                true
            }
            Err(err) => {
                tracing::error!(%session_id, error = %err, "failed to instrument session");
                false
            }
        };
        drop(instrumentors);

        if created {
            self.start_log_capture(session);
        }
        created
    }

    fn start_log_capture(&self, session: &Arc<Session>) {
        let Some(factory) = &self.log_capture_factory else {
            return;
        };
        let session_id = session.id();
        match factory(session).and_then(|capture| capture.start().map(|()| capture)) {
            Ok(capture) => {
                self.captures().insert(session_id, Arc::new(capture));
            }
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "failed to start log capture");
            }
        }
    }

    fn captures(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<LogCapture>>> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The console capture of a live session, if logs are captured.
    pub fn log_capture(&self, session_id: Uuid) -> Option<Arc<LogCapture>> {
        self.captures().get(&session_id).cloned()
    }

    /// Shuts down the instrumentor of `session_id`.
    ///
    /// Returns whether there was one to shut down.
    pub fn on_session_ended(&self, session_id: Uuid) -> bool {
        let instrumentor = self.instrumentors().remove(&session_id);
        if let Some(capture) = self.captures().remove(&session_id) {
            capture.stop();
        }
        self.sessions.unregister(session_id);

        match instrumentor {
            Some(instrumentor) => {
                instrumentor.shutdown();
                true
            }
            None => {
                tracing::debug!(%session_id, "ended session was not instrumented");
                false
            }
        }
    }

    /// The instrumentor of a live session.
    pub fn instrumentor(&self, session_id: Uuid) -> Option<Arc<SessionInstrumentor>> {
        self.instrumentors().get(&session_id).cloned()
    }

    /// Ids of all instrumented sessions.
    pub fn active_sessions(&self) -> Vec<Uuid> {
        self.instrumentors().keys().copied().collect()
    }

    /// Shuts down every instrumentor still running. Returns how many there were.
    ///
    /// The shared provider stays up until the last of them has flushed.
    pub fn shutdown_all(&self) -> usize {
        let captures: Vec<_> = self.captures().drain().collect();
        for (_, capture) in captures {
            capture.stop();
        }

        let drained: Vec<_> = self.instrumentors().drain().collect();
        for (session_id, instrumentor) in &drained {
            self.sessions.unregister(*session_id);
            instrumentor.shutdown();
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "shut down remaining sessions");
        }
        drained.len()
    }

    /// Returns a guard that shuts down every remaining session when dropped.
    ///
    /// Keep it alive in `main` so sessions are flushed on the way out.
    pub fn exit_guard(self: &Arc<Self>) -> ExitGuard {
        ExitGuard {
            core: Arc::clone(self),
        }
    }
}

/// Calls [`TracingCore::shutdown_all`] on drop.
#[must_use = "sessions are shut down as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExitGuard {
    core: Arc<TracingCore>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.core.shutdown_all();
    }
}
