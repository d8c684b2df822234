//! Background jobs on named OS threads.
//!
//! Shutdown is signalled by closing the job's stop channel rather than by
//! sending an explicit message: [BackgroundJob::shutdown] drops the sending
//! half and joins the thread. A job observes the request through the channel
//! it gets at spawn time, usually as one arm of its `select!` loop, and is
//! expected to return promptly once the channel fires.

use crossbeam::channel::{Receiver, Sender, bounded};
use std::thread::{Builder, JoinHandle};

/// Receiving side of a job's stop channel. Fires once shutdown begins, both
/// for `recv` calls and for `select!` arms.
pub struct StopSignal(Receiver<()>);

impl StopSignal {
    pub fn receiver(&self) -> &Receiver<()> {
        &self.0
    }
}

/// The job's thread panicked instead of returning.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("background job `{0}` panicked")]
pub struct JobPanicked(pub String);

/// Handle to one background thread and the stop channel wired into it.
#[derive(Debug)]
pub struct BackgroundJob {
    name: String,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundJob {
    pub fn spawn<F>(name: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let (stop, stop_signal) = bounded(0);
        let handle = Builder::new()
            .name(name.clone())
            .spawn(move || job(StopSignal(stop_signal)))
            .expect("failed to spawn background thread");
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Closes the stop channel and waits for the thread to finish.
    pub fn shutdown(self) -> Result<(), JobPanicked> {
        let Self { name, stop, handle } = self;
        drop(stop);
        handle.join().map_err(|_| JobPanicked(name))
    }
}
