//! The seam between the context and a native audio backend
//!
//! A backend receives requests tagged with a cookie id and answers them
//! later, from its own thread, by pushing [`Delivery`] records onto the
//! delivery queue. Change notifications travel over the same queue so the
//! context sees them in the order the backend produced them.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;

use crate::error::QueryError;
use crate::pulse::cookie::CookieId;
use crate::pulse::types::{Event, InfoItem};

/// An introspection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    CardList,
    Card(u32),
    SinkList,
    Sink(u32),
    SourceList,
    Source(u32),
    SinkInputList,
    SinkInput(u32),
    SourceOutputList,
    SourceOutput(u32),
    Server,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::CardList => write!(f, "card list"),
            Query::Card(i) => write!(f, "card {}", i),
            Query::SinkList => write!(f, "sink list"),
            Query::Sink(i) => write!(f, "sink {}", i),
            Query::SourceList => write!(f, "source list"),
            Query::Source(i) => write!(f, "source {}", i),
            Query::SinkInputList => write!(f, "sink input list"),
            Query::SinkInput(i) => write!(f, "sink input {}", i),
            Query::SourceOutputList => write!(f, "source output list"),
            Query::SourceOutput(i) => write!(f, "source output {}", i),
            Query::Server => write!(f, "server info"),
        }
    }
}

/// Status of one reply callback
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    Item(InfoItem),
    EndOfList,
    Failed,
}

/// A record pushed by the backend's delivery thread
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Reply { cookie: CookieId, status: ReplyStatus },
    Event(Event),
    /// The connection is gone and will not come back
    Disconnected(String),
}

/// Producer half of the delivery queue, handed to the backend
#[derive(Debug, Clone)]
pub struct DeliverySender(Sender<Delivery>);

impl DeliverySender {
    pub fn item(&self, cookie: CookieId, item: InfoItem) {
        self.send(Delivery::Reply {
            cookie,
            status: ReplyStatus::Item(item),
        });
    }

    pub fn end_of_list(&self, cookie: CookieId) {
        self.send(Delivery::Reply {
            cookie,
            status: ReplyStatus::EndOfList,
        });
    }

    pub fn failed(&self, cookie: CookieId) {
        self.send(Delivery::Reply {
            cookie,
            status: ReplyStatus::Failed,
        });
    }

    pub fn event(&self, event: Event) {
        self.send(Delivery::Event(event));
    }

    pub fn disconnected(&self, reason: impl Into<String>) {
        self.send(Delivery::Disconnected(reason.into()));
    }

    fn send(&self, delivery: Delivery) {
        // Only fails once the context is gone, at which point nobody waits.
        if self.0.send(delivery).is_err() {
            tracing::trace!("Delivery queue closed, dropping record");
        }
    }
}

/// Create the delivery queue shared by a backend and its context
pub fn delivery_channel() -> (DeliverySender, Receiver<Delivery>) {
    let (tx, rx) = unbounded();
    (DeliverySender(tx), rx)
}

/// A native audio backend
///
/// Every method is called by the context inside [`Context::safe_do`], i.e.
/// between `lock` and `unlock`. Mutations are fire-and-forget.
///
/// [`Context::safe_do`]: crate::pulse::Context::safe_do
pub trait Backend: Send + Sync {
    /// Acquire the backend's own lock (e.g. the threaded mainloop lock)
    fn lock(&self) {}

    fn unlock(&self) {}

    /// Issue a request; the answer arrives later as deliveries for `cookie`
    fn request(&self, cookie: CookieId, query: Query) -> Result<(), QueryError>;

    fn set_card_profile(&self, card: u32, profile: &str);

    fn set_default_sink(&self, name: &str);

    fn set_default_source(&self, name: &str);

    fn set_sink_port(&self, sink: &str, port: &str);

    fn set_source_port(&self, source: &str, port: &str);

    /// `volume` is normalized, 1.0 being the backend's normal volume
    fn set_sink_volume(&self, sink: &str, volume: f64);

    fn set_source_volume(&self, source: &str, volume: f64);
}
