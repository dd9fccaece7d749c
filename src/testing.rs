//! Test doubles shared by the unit tests.

use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Span exporter that keeps every exported span, across shutdown too.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpanCapture {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl SpanCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.spans()
            .into_iter()
            .map(|span| span.name.to_string())
            .collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.spans().iter().filter(|span| span.name == name).count()
    }
}

impl SpanExporter for SpanCapture {
    fn export(
        &self,
        batch: Vec<SpanData>,
    ) -> impl std::future::Future<Output = OTelSdkResult> + Send {
        self.spans.lock().unwrap().extend(batch);
        std::future::ready(Ok(()))
    }

    fn shutdown_with_timeout(&mut self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}
