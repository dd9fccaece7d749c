//! Install-once registry for the session tracer provider.
//!
//! Sessions share one [`SdkTracerProvider`] per registry. The first session to
//! ask installs it; later sessions reuse it and only attach their processors
//! to its [`ProcessorSet`]. The registry counts its users, and the last one to
//! release the provider is the one that shuts it down.

use crate::processor::ProcessorSet;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<ProviderRegistry> = Arc::new(ProviderRegistry {
        inner: Mutex::new(None),
        install_global: true,
    });
}

/// A provider together with the processor set it was built with.
#[derive(Debug, Clone)]
pub struct RegisteredProvider {
    /// The installed provider.
    pub provider: SdkTracerProvider,
    /// Processors sessions attach to.
    pub processors: ProcessorSet,
}

#[derive(Debug)]
struct Entry {
    registered: RegisteredProvider,
    users: usize,
}

/// Holds at most one [`RegisteredProvider`].
#[derive(Debug)]
pub struct ProviderRegistry {
    inner: Mutex<Option<Entry>>,
    install_global: bool,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Creates an isolated registry that does not touch the global provider.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            install_global: false,
        }
    }

    /// The process-wide registry. Its provider also becomes the
    /// `opentelemetry::global` tracer provider when installed.
    pub fn global() -> Arc<ProviderRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Entry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the registered provider, installing one built by `build` if
    /// none is registered yet.
    ///
    /// `build` receives the fresh processor set the provider must be built
    /// with. The returned flag is `true` when this call installed it. Every
    /// call counts as a user until it is matched by [`ProviderRegistry::release`].
    pub fn get_or_install<F>(&self, build: F) -> (RegisteredProvider, bool)
    where
        F: FnOnce(ProcessorSet) -> SdkTracerProvider,
    {
        let mut slot = self.slot();
        if let Some(entry) = slot.as_mut() {
            entry.users += 1;
            return (entry.registered.clone(), false);
        }

        let processors = ProcessorSet::new();
        let provider = build(processors.clone());
        if self.install_global {
            opentelemetry::global::set_tracer_provider(provider.clone());
        }
        tracing::debug!(global = self.install_global, "installed session tracer provider");

        let registered = RegisteredProvider {
            provider,
            processors,
        };
        *slot = Some(Entry {
            registered: registered.clone(),
            users: 1,
        });
        (registered, true)
    }

    /// Returns the registered provider, if any.
    pub fn get(&self) -> Option<RegisteredProvider> {
        self.slot().as_ref().map(|entry| entry.registered.clone())
    }

    /// Number of users still holding the registered provider.
    pub fn users(&self) -> usize {
        self.slot().as_ref().map_or(0, |entry| entry.users)
    }

    /// Drops one use of the provider `processors` belongs to.
    ///
    /// Returns `true` for the last user: the entry is removed and the caller
    /// is responsible for shutting the provider down. A set that does not
    /// belong to the registered provider releases nothing.
    pub fn release(&self, processors: &ProcessorSet) -> bool {
        let mut slot = self.slot();
        let Some(entry) = slot.as_mut() else {
            return false;
        };
        if !entry.registered.processors.same_set(processors) {
            return false;
        }

        entry.users = entry.users.saturating_sub(1);
        if entry.users > 0 {
            return false;
        }
        *slot = None;
        true
    }

    /// Drops the registered provider without shutting it down.
    pub fn reset(&self) {
        *self.slot() = None;
    }
}
