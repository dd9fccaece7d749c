//! Capture of stdout/stderr output as OpenTelemetry log records.
//!
//! [`LogCapture`] hands out [`CaptureWriter`]s that tee everything written to
//! them into the real stream. While the capture is started, every complete,
//! non-blank line also becomes a log record tagged with the session id:
//! `INFO` for stdout, `ERROR` for stderr.

use crate::api_client::shared_http_client;
use crate::config::Config;
use crate::constants::{INSTRUMENTATION_NAME, SESSION_ID_ATTRIBUTE};
use crate::exporter::JwtProvider;
use crate::session::SessionRegistry;
use crate::transport::{AuthenticatedHttpClient, SharedHeaders};
use crate::{Error, Result};
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _, Severity};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::logs::{LogExporter, SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::Resource;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Which standard stream a writer stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output, logged at `INFO`.
    Stdout,
    /// Standard error, logged at `ERROR`.
    Stderr,
}

impl Stream {
    fn severity(self) -> (Severity, &'static str) {
        match self {
            Stream::Stdout => (Severity::Info, "INFO"),
            Stream::Stderr => (Severity::Error, "ERROR"),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Lines captured so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Lines logged from stdout at `INFO`.
    pub stdout_lines: u64,
    /// Lines logged from stderr at `ERROR`.
    pub stderr_lines: u64,
}

impl CaptureStats {
    /// All lines logged.
    pub fn total(&self) -> u64 {
        self.stdout_lines + self.stderr_lines
    }
}

struct CaptureState {
    session_id: Uuid,
    logger: RwLock<Option<SdkLogger>>,
    stats: Mutex<CaptureStats>,
}

impl CaptureState {
    fn emit(&self, stream: Stream, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let logger = self.logger.read().unwrap_or_else(PoisonError::into_inner);
        let Some(logger) = logger.as_ref() else {
            return;
        };

        let (severity, severity_text) = stream.severity();
        let now = SystemTime::now();
        let mut record = logger.create_log_record();
        record.set_timestamp(now);
        record.set_observed_timestamp(now);
        record.set_severity_number(severity);
        record.set_severity_text(severity_text);
        record.set_body(AnyValue::from(line.to_string()));
        record.add_attribute(SESSION_ID_ATTRIBUTE, self.session_id.to_string());
        record.add_attribute("log.stream", stream.as_str());
        logger.emit(record);

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match stream {
            Stream::Stdout => stats.stdout_lines += 1,
            Stream::Stderr => stats.stderr_lines += 1,
        }
    }
}

/// Turns one session's console output into log records.
pub struct LogCapture {
    sessions: Arc<SessionRegistry>,
    provider: SdkLoggerProvider,
    owns_provider: bool,
    state: Arc<CaptureState>,
}

impl fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCapture")
            .field("session_id", &self.state.session_id)
            .field("owns_provider", &self.owns_provider)
            .field("started", &self.is_started())
            .finish()
    }
}

impl LogCapture {
    fn new(
        session_id: Uuid,
        sessions: Arc<SessionRegistry>,
        provider: SdkLoggerProvider,
        owns_provider: bool,
    ) -> Self {
        Self {
            sessions,
            provider,
            owns_provider,
            state: Arc::new(CaptureState {
                session_id,
                logger: RwLock::new(None),
                stats: Mutex::new(CaptureStats::default()),
            }),
        }
    }

    /// Logs through a provider owned by someone else; [`LogCapture::stop`]
    /// leaves it running.
    pub fn with_shared_provider(
        session_id: Uuid,
        sessions: Arc<SessionRegistry>,
        provider: SdkLoggerProvider,
    ) -> Self {
        Self::new(session_id, sessions, provider, false)
    }

    /// Logs through a provider of its own that sends each record to
    /// `exporter` as it is emitted. [`LogCapture::stop`] shuts it down.
    pub fn with_exporter(
        session_id: Uuid,
        sessions: Arc<SessionRegistry>,
        exporter: impl LogExporter + 'static,
    ) -> Self {
        let provider = SdkLoggerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_attribute(KeyValue::new(SESSION_ID_ATTRIBUTE, session_id.to_string()))
                    .build(),
            )
            .with_simple_exporter(exporter)
            .build();
        Self::new(session_id, sessions, provider, true)
    }

    /// Exports to the OTLP logs endpoint of `config`. With a `jwt_provider`,
    /// every export carries its current token. Sessions are looked up in the
    /// global registry.
    pub fn from_config(
        session_id: Uuid,
        config: &Config,
        jwt_provider: Option<Arc<dyn JwtProvider>>,
    ) -> Result<Self> {
        let mut transport =
            AuthenticatedHttpClient::new(shared_http_client(), SharedHeaders::new());
        if let Some(provider) = jwt_provider {
            transport = transport.with_jwt_provider(provider);
        }
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .with_http_client(transport)
            .with_endpoint(config.logs_endpoint())
            .build()?;

        let provider = SdkLoggerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name(config.service_name.clone())
                    .with_attribute(KeyValue::new(SESSION_ID_ATTRIBUTE, session_id.to_string()))
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        Ok(Self::new(session_id, SessionRegistry::global(), provider, true))
    }

    /// The captured session.
    pub fn session_id(&self) -> Uuid {
        self.state.session_id
    }

    /// Whether lines are currently turned into records.
    pub fn is_started(&self) -> bool {
        self.state
            .logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether [`LogCapture::stop`] shuts the provider down.
    pub fn owns_provider(&self) -> bool {
        self.owns_provider
    }

    /// Starts turning lines into records. Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session is not registered.
    pub fn start(&self) -> Result<()> {
        let session_id = self.state.session_id;
        if !self.sessions.contains(session_id) {
            return Err(Error::SessionNotFound(session_id));
        }

        let mut logger = self
            .state
            .logger
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if logger.is_none() {
            *logger = Some(self.provider.logger(INSTRUMENTATION_NAME));
            tracing::debug!(%session_id, "log capture started");
        }
        Ok(())
    }

    /// Stops turning lines into records; writers keep passing output through.
    ///
    /// Shuts the provider down only if this capture created it.
    pub fn stop(&self) {
        let was_started = self
            .state
            .logger
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if !was_started {
            return;
        }

        let session_id = self.state.session_id;
        if self.owns_provider {
            if let Err(err) = self.provider.shutdown() {
                tracing::warn!(%session_id, error = %err, "failed to shut down log provider");
            }
        }
        tracing::debug!(%session_id, "log capture stopped");
    }

    /// Counts of lines logged so far.
    pub fn stats(&self) -> CaptureStats {
        *self
            .state
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A writer teeing into the process stdout.
    pub fn stdout(&self) -> CaptureWriter<io::Stdout> {
        self.writer(Stream::Stdout, io::stdout())
    }

    /// A writer teeing into the process stderr.
    pub fn stderr(&self) -> CaptureWriter<io::Stderr> {
        self.writer(Stream::Stderr, io::stderr())
    }

    /// A writer teeing into `inner`, logged as `stream`.
    pub fn writer<W: Write>(&self, stream: Stream, inner: W) -> CaptureWriter<W> {
        CaptureWriter {
            inner,
            stream,
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }
    }
}

/// [`Write`] adapter that forwards output unchanged and logs complete lines.
///
/// A trailing partial line is logged when the writer is dropped.
pub struct CaptureWriter<W: Write> {
    inner: W,
    stream: Stream,
    state: Arc<CaptureState>,
    pending: Vec<u8>,
}

impl<W: Write> CaptureWriter<W> {
    /// The wrapped stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn emit_line(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        self.state.emit(self.stream, line.trim_end_matches('\r'));
    }
}

impl<W: Write> fmt::Debug for CaptureWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureWriter")
            .field("stream", &self.stream)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<W: Write> Write for CaptureWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.pending.extend_from_slice(&buf[..written]);

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.emit_line(&line[..line.len() - 1]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for CaptureWriter<W> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit_line(&rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use opentelemetry_sdk::logs::InMemoryLogExporter;

    fn capture_setup() -> (LogCapture, InMemoryLogExporter, Arc<Session>) {
        let sessions = Arc::new(SessionRegistry::new());
        let session = Session::new();
        sessions.register(&session);

        let exporter = InMemoryLogExporter::default();
        let capture = LogCapture::with_exporter(session.id(), sessions, exporter.clone());
        (capture, exporter, session)
    }

    fn bodies(exporter: &InMemoryLogExporter) -> Vec<(String, Option<Severity>)> {
        exporter
            .get_emitted_logs()
            .unwrap()
            .iter()
            .map(|log| {
                let body = match log.record.body() {
                    Some(AnyValue::String(text)) => text.as_str().to_string(),
                    other => format!("{:?}", other),
                };
                (body, log.record.severity_number())
            })
            .collect()
    }

    #[test]
    fn test_lines_become_records_and_pass_through() {
        let (capture, exporter, _session) = capture_setup();
        capture.start().unwrap();

        let mut out = capture.writer(Stream::Stdout, Vec::new());
        let mut err = capture.writer(Stream::Stderr, Vec::new());
        out.write_all(b"\x1b[32mready\x1b[0m\n\n   \nstep ").unwrap();
        out.write_all(b"one\r\n").unwrap();
        err.write_all(b"boom\n").unwrap();

        assert_eq!(out.get_ref(), b"\x1b[32mready\x1b[0m\n\n   \nstep one\r\n");
        assert_eq!(err.get_ref(), b"boom\n");
        assert_eq!(
            bodies(&exporter),
            vec![
                ("\x1b[32mready\x1b[0m".to_string(), Some(Severity::Info)),
                ("step one".to_string(), Some(Severity::Info)),
                ("boom".to_string(), Some(Severity::Error)),
            ]
        );
        assert_eq!(
            capture.stats(),
            CaptureStats {
                stdout_lines: 2,
                stderr_lines: 1
            }
        );

        let record = &exporter.get_emitted_logs().unwrap()[0].record;
        assert!(record.attributes_iter().any(|(key, value)| {
            key.as_str() == SESSION_ID_ATTRIBUTE
                && *value == AnyValue::from(capture.session_id().to_string())
        }));
    }

    #[test]
    fn test_partial_line_is_logged_on_drop() {
        let (capture, exporter, _session) = capture_setup();
        capture.start().unwrap();

        {
            let mut out = capture.writer(Stream::Stdout, Vec::new());
            out.write_all(b"no newline").unwrap();
            out.flush().unwrap();
            assert!(bodies(&exporter).is_empty());
        }

        assert_eq!(bodies(&exporter), vec![("no newline".to_string(), Some(Severity::Info))]);
    }

    #[test]
    fn test_not_started_or_stopped_only_passes_through() {
        let (capture, exporter, _session) = capture_setup();
        let mut out = capture.writer(Stream::Stdout, Vec::new());

        out.write_all(b"before\n").unwrap();
        capture.start().unwrap();
        capture.start().unwrap();
        out.write_all(b"during\n").unwrap();
        // The owned provider wipes the exporter when it shuts down
        assert_eq!(bodies(&exporter), vec![("during".to_string(), Some(Severity::Info))]);

        capture.stop();
        capture.stop();
        out.write_all(b"after\n").unwrap();

        assert_eq!(out.get_ref(), b"before\nduring\nafter\n");
        assert_eq!(capture.stats().total(), 1);
        assert!(!capture.is_started());
    }

    #[test]
    fn test_unknown_session_is_rejected() {
        let capture = LogCapture::with_exporter(
            Uuid::new_v4(),
            Arc::new(SessionRegistry::new()),
            InMemoryLogExporter::default(),
        );
        assert!(matches!(capture.start(), Err(Error::SessionNotFound(_))));
        assert!(!capture.is_started());
    }

    #[test]
    fn test_stop_leaves_shared_provider_running() {
        let sessions = Arc::new(SessionRegistry::new());
        let session = Session::new();
        sessions.register(&session);

        let exporter = InMemoryLogExporter::default();
        let provider = SdkLoggerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let capture = LogCapture::with_shared_provider(session.id(), sessions, provider.clone());
        assert!(!capture.owns_provider());

        capture.start().unwrap();
        capture.stop();

        // The provider still delivers records for its other users
        let logger = provider.logger("other");
        let mut record = logger.create_log_record();
        record.set_body(AnyValue::from("still here".to_string()));
        logger.emit(record);
        assert_eq!(bodies(&exporter).len(), 1);
    }
}
