//! Process-level events.

use crossbeam::channel::{Receiver, Sender, bounded};

/// Events flowing from the signal handler into the orchestrator's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    StopRequested,
}

/// Builds the application event channel. A single slot suffices: the only
/// event is the stop request, and repeating it carries no extra meaning, so
/// senders use `try_send` and drop duplicates.
pub fn application_channel() -> (Sender<ApplicationEvent>, Receiver<ApplicationEvent>) {
    bounded(1)
}
