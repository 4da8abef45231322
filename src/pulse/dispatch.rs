//! Change-notification fan-out
//!
//! Handlers are keyed by facility. Each handler invocation runs as its own
//! blocking task on the tokio runtime, so a handler may issue queries (which
//! block until the drain thread delivers their replies) without stalling
//! delivery. No ordering holds between handlers or between events.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::pulse::types::{Event, EventKind, Facility};

/// A notification handler: `(kind, object index)`
pub type Handler = Arc<dyn Fn(EventKind, u32) + Send + Sync>;

/// Routes events to handlers registered per facility
pub struct Dispatcher {
    handlers: RwLock<HashMap<Facility, Vec<Handler>>>,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(runtime: Handle) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    /// Register a handler; several may share a facility
    pub fn connect<F>(&self, facility: Facility, handler: F)
    where
        F: Fn(EventKind, u32) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(facility)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of handlers registered for `facility`
    pub fn handler_count(&self, facility: Facility) -> usize {
        self.handlers
            .read()
            .get(&facility)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Spawn every handler registered for the event's facility
    pub fn dispatch(&self, event: Event) {
        let handlers = match self.handlers.read().get(&event.facility) {
            Some(handlers) if !handlers.is_empty() => handlers.clone(),
            _ => {
                tracing::debug!(
                    "Unhandled event: {} {:?} {}",
                    event.facility,
                    event.kind,
                    event.index
                );
                return;
            }
        };

        for handler in handlers {
            self.runtime
                .spawn_blocking(move || handler(event.kind, event.index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_every_handler_runs() {
        let rt = runtime();
        let dispatcher = Dispatcher::new(rt.handle().clone());
        let (tx, rx) = unbounded();

        for tag in ["first", "second"] {
            let tx = tx.clone();
            dispatcher.connect(Facility::Sink, move |kind, idx| {
                tx.send((tag, kind, idx)).unwrap();
            });
        }
        assert_eq!(dispatcher.handler_count(Facility::Sink), 2);

        dispatcher.dispatch(Event::new(Facility::Sink, EventKind::Change, 7));

        let mut seen: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_by_key(|(tag, _, _)| *tag);
        assert_eq!(
            seen,
            vec![
                ("first", EventKind::Change, 7),
                ("second", EventKind::Change, 7)
            ]
        );
    }

    #[test]
    fn test_unregistered_facility_is_dropped() {
        let rt = runtime();
        let dispatcher = Dispatcher::new(rt.handle().clone());
        let (tx, rx) = unbounded();

        dispatcher.connect(Facility::Card, move |_, idx| {
            tx.send(idx).unwrap();
        });

        dispatcher.dispatch(Event::new(Facility::Module, EventKind::New, 1));
        dispatcher.dispatch(Event::new(Facility::Card, EventKind::Remove, 2));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
