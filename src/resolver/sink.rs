//! Outbound event sinks
//!
//! The caller hands the service an [`EventSink`] per request. Resolvers push
//! through a [`GuardedSender`] so that nothing reaches the caller once the
//! request has been aborted.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::ServiceEvent;

/// Receiver of service events for one request
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn send(&self, event: ServiceEvent);
}

impl EventSink for mpsc::UnboundedSender<ServiceEvent> {
    fn send(&self, event: ServiceEvent) {
        if mpsc::UnboundedSender::send(self, event).is_err() {
            trace!("EventSink: receiver dropped, event discarded");
        }
    }
}

/// Closable wrapper around a caller's sink
///
/// `send` and `close` serialize on the same lock, so an event is either
/// delivered before `close` returns or never.
#[derive(Clone)]
pub struct GuardedSender {
    sink: Arc<dyn EventSink>,
    open: Arc<Mutex<bool>>,
}

impl GuardedSender {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Deliver `event` unless closed; returns whether it was delivered
    pub fn send(&self, event: ServiceEvent) -> bool {
        let open = self.open.lock().unwrap();
        if !*open {
            trace!("GuardedSender: dropping {} after close", event.channel());
            return false;
        }
        self.sink.send(event);
        true
    }

    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }
}
