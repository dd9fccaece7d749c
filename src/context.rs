//! Trace context propagation across threads.
//!
//! The current OpenTelemetry [`Context`] is thread-local, so a span started
//! on a freshly spawned thread would begin a new trace. The helpers here
//! capture the caller's context when work is handed off and attach it on the
//! thread that runs the work.

use crate::{Error, Result};
use opentelemetry::Context;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Wraps `f` so it runs under the context current at the time of wrapping.
pub fn wrap<F, T>(f: F) -> impl FnOnce() -> T + Send + 'static
where
    F: FnOnce() -> T + Send + 'static,
{
    let context = Context::current();
    move || {
        let _guard = context.attach();
        f()
    }
}

/// [`std::thread::spawn`] that carries the caller's context into the thread.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(wrap(f))
}

/// Fixed-size thread pool that propagates trace context into its jobs.
///
/// Every job runs under the context current when it was submitted. Between
/// jobs, workers stay under the context current when the pool was built,
/// which is also the context the initializer runs in.
#[derive(Debug)]
pub struct ContextThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ContextThreadPool {
    /// Starts `size` workers (at least one).
    pub fn new(size: usize) -> Result<Self> {
        Self::with_initializer(size, || {})
    }

    /// Starts `size` workers that each run `initializer` before taking jobs.
    pub fn with_initializer<I>(size: usize, initializer: I) -> Result<Self>
    where
        I: Fn() + Send + Sync + 'static,
    {
        let context = Context::current();
        let initializer = Arc::new(initializer);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|index| {
                let context = context.clone();
                let initializer = Arc::clone(&initializer);
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("agentops-worker-{}", index))
                    .spawn(move || {
                        let _guard = context.attach();
                        initializer();
                        run_jobs(&receiver);
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job` to run under the caller's current context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if no worker is left to run it.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(Error::PoolClosed)?;
        sender
            .send(Box::new(wrap(job)))
            .map_err(|_| Error::PoolClosed)
    }
}

fn run_jobs(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = next else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("worker job panicked");
        }
    }
}

impl Drop for ContextThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets workers finish the queue and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}
