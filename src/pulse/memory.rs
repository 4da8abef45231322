//! In-process backend
//!
//! Models a small sound server in memory. Replies and change notifications
//! are pushed onto the delivery queue exactly like a native backend would,
//! so everything above the [`Backend`] trait runs unchanged. Used by tests
//! and by the daemon's `--simulate` mode.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::QueryError;
use crate::pulse::backend::{Backend, DeliverySender, Query};
use crate::pulse::cookie::CookieId;
use crate::pulse::types::*;

/// Everything the in-memory server knows about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hardware {
    pub cards: Vec<Card>,
    pub sinks: Vec<Sink>,
    pub sources: Vec<Source>,
    pub sink_inputs: Vec<SinkInput>,
    pub source_outputs: Vec<SourceOutput>,
    pub server: Server,
}

impl Hardware {
    /// One internal PCI card with a speaker/headphone sink and a mic source
    pub fn builtin() -> Self {
        let card = Card {
            index: 0,
            name: "alsa_card.pci-0000_00_1f.3".to_string(),
            driver: "module-alsa-card.c".to_string(),
            active_profile: Some(ProfileInfo::new("analog-stereo", 6500)),
            profiles: vec![
                ProfileInfo::new("analog-stereo", 6500),
                ProfileInfo::new("hdmi-stereo", 5900),
                ProfileInfo::new("off", 0),
            ],
            proplist: PropList::from([
                (PROP_DEVICE_BUS.to_string(), "pci".to_string()),
                (PROP_DEVICE_FORM_FACTOR.to_string(), "internal".to_string()),
            ]),
        };

        let sink = Sink {
            index: 0,
            name: "alsa_output.analog-stereo".to_string(),
            description: "Built-in Audio Analog Stereo".to_string(),
            card: Some(0),
            channels: 2,
            volume: 0.5,
            muted: false,
            ports: vec![
                PortInfo::new("analog-output-speaker", 10000),
                PortInfo::new("analog-output-headphones", 9900),
            ],
            active_port: Some("analog-output-speaker".to_string()),
            proplist: PropList::new(),
        };

        let source = Source {
            index: 0,
            name: "alsa_input.analog-stereo".to_string(),
            description: "Built-in Audio Analog Stereo".to_string(),
            card: Some(0),
            monitor_of_sink: None,
            channels: 2,
            volume: 0.8,
            muted: false,
            ports: vec![
                PortInfo::new("analog-input-internal-mic", 8900),
                PortInfo::new("analog-input-mic", 8700),
            ],
            active_port: Some("analog-input-internal-mic".to_string()),
            proplist: PropList::new(),
        };

        Self {
            server: Server {
                user_name: "user".to_string(),
                host_name: "localhost".to_string(),
                server_version: "memory".to_string(),
                default_sink_name: Some(sink.name.clone()),
                default_source_name: Some(source.name.clone()),
            },
            cards: vec![card],
            sinks: vec![sink],
            sources: vec![source],
            sink_inputs: Vec::new(),
            source_outputs: Vec::new(),
        }
    }
}

/// Backend answering from a [`Hardware`] model
pub struct MemoryBackend {
    hardware: Mutex<Hardware>,
    tx: DeliverySender,
    locked: AtomicBool,
    connected: AtomicBool,
    fail_requests: AtomicBool,
    drop_replies: AtomicBool,
    requests: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(tx: DeliverySender, hardware: Hardware) -> Self {
        Self {
            hardware: Mutex::new(hardware),
            tx,
            locked: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            fail_requests: AtomicBool::new(false),
            drop_replies: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn with_builtin_card(tx: DeliverySender) -> Self {
        Self::new(tx, Hardware::builtin())
    }

    /// Copy of the current model
    pub fn hardware(&self) -> Hardware {
        self.hardware.lock().clone()
    }

    /// Mutate the model without emitting notifications
    pub fn modify<R>(&self, f: impl FnOnce(&mut Hardware) -> R) -> R {
        f(&mut self.hardware.lock())
    }

    /// Plug in a card and announce it
    pub fn add_card(&self, card: Card) {
        let index = card.index;
        self.hardware.lock().cards.push(card);
        self.tx.event(Event::new(Facility::Card, EventKind::New, index));
    }

    /// Push an arbitrary notification
    pub fn emit(&self, event: Event) {
        self.tx.event(event);
    }

    /// Answer every request with a failure
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Accept requests but never answer them
    pub fn drop_replies(&self, drop: bool) {
        self.drop_replies.store(drop, Ordering::SeqCst);
    }

    /// Simulate losing the server
    pub fn disconnect(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.tx.disconnected(reason);
    }

    /// Queries received so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn answer(&self, cookie: CookieId, query: Query) {
        let hw = self.hardware.lock();
        let items: Option<Vec<InfoItem>> = match query {
            Query::CardList => Some(hw.cards.iter().cloned().map(InfoItem::Card).collect()),
            Query::SinkList => Some(hw.sinks.iter().cloned().map(InfoItem::Sink).collect()),
            Query::SourceList => Some(hw.sources.iter().cloned().map(InfoItem::Source).collect()),
            Query::SinkInputList => Some(
                hw.sink_inputs
                    .iter()
                    .cloned()
                    .map(InfoItem::SinkInput)
                    .collect(),
            ),
            Query::SourceOutputList => Some(
                hw.source_outputs
                    .iter()
                    .cloned()
                    .map(InfoItem::SourceOutput)
                    .collect(),
            ),
            Query::Card(i) => find(&hw.cards, |c| c.index == i, InfoItem::Card),
            Query::Sink(i) => find(&hw.sinks, |s| s.index == i, InfoItem::Sink),
            Query::Source(i) => find(&hw.sources, |s| s.index == i, InfoItem::Source),
            Query::SinkInput(i) => find(&hw.sink_inputs, |s| s.index == i, InfoItem::SinkInput),
            Query::SourceOutput(i) => {
                find(&hw.source_outputs, |s| s.index == i, InfoItem::SourceOutput)
            }
            Query::Server => Some(vec![InfoItem::Server(hw.server.clone())]),
        };
        drop(hw);

        match items {
            Some(items) => {
                for item in items {
                    self.tx.item(cookie, item);
                }
                self.tx.end_of_list(cookie);
            }
            None => self.tx.failed(cookie),
        }
    }
}

fn find<T: Clone>(
    items: &[T],
    pred: impl Fn(&T) -> bool,
    wrap: fn(T) -> InfoItem,
) -> Option<Vec<InfoItem>> {
    items
        .iter()
        .find(|item| pred(item))
        .map(|item| vec![wrap(item.clone())])
}

impl Backend for MemoryBackend {
    fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn request(&self, cookie: CookieId, query: Query) -> Result<(), QueryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(QueryError::Unavailable(query.to_string()));
        }
        if self.drop_replies.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.fail_requests.load(Ordering::SeqCst) {
            self.tx.failed(cookie);
            return Ok(());
        }
        self.answer(cookie, query);
        Ok(())
    }

    fn set_card_profile(&self, card: u32, profile: &str) {
        let mut hw = self.hardware.lock();
        let Some(card) = hw.cards.iter_mut().find(|c| c.index == card) else {
            tracing::warn!("No card {} to set profile on", card);
            return;
        };
        let Some(found) = card.profiles.iter().find(|p| p.name == profile).cloned() else {
            tracing::warn!("Card {} has no profile {}", card.name, profile);
            return;
        };
        card.active_profile = Some(found);
        let index = card.index;
        drop(hw);
        self.tx.event(Event::new(Facility::Card, EventKind::Change, index));
    }

    fn set_default_sink(&self, name: &str) {
        let mut hw = self.hardware.lock();
        if !hw.sinks.iter().any(|s| s.name == name) {
            tracing::warn!("No sink named {}", name);
            return;
        }
        hw.server.default_sink_name = Some(name.to_string());
        drop(hw);
        self.tx.event(Event::new(Facility::Server, EventKind::Change, u32::MAX));
    }

    fn set_default_source(&self, name: &str) {
        let mut hw = self.hardware.lock();
        if !hw.sources.iter().any(|s| s.name == name) {
            tracing::warn!("No source named {}", name);
            return;
        }
        hw.server.default_source_name = Some(name.to_string());
        drop(hw);
        self.tx.event(Event::new(Facility::Server, EventKind::Change, u32::MAX));
    }

    fn set_sink_port(&self, sink: &str, port: &str) {
        let mut hw = self.hardware.lock();
        let Some(sink) = hw.sinks.iter_mut().find(|s| s.name == sink) else {
            return;
        };
        if !sink.ports.iter().any(|p| p.name == port) {
            tracing::warn!("Sink {} has no port {}", sink.name, port);
            return;
        }
        sink.active_port = Some(port.to_string());
        let index = sink.index;
        drop(hw);
        self.tx.event(Event::new(Facility::Sink, EventKind::Change, index));
    }

    fn set_source_port(&self, source: &str, port: &str) {
        let mut hw = self.hardware.lock();
        let Some(source) = hw.sources.iter_mut().find(|s| s.name == source) else {
            return;
        };
        if !source.ports.iter().any(|p| p.name == port) {
            tracing::warn!("Source {} has no port {}", source.name, port);
            return;
        }
        source.active_port = Some(port.to_string());
        let index = source.index;
        drop(hw);
        self.tx.event(Event::new(Facility::Source, EventKind::Change, index));
    }

    fn set_sink_volume(&self, sink: &str, volume: f64) {
        let mut hw = self.hardware.lock();
        let Some(sink) = hw.sinks.iter_mut().find(|s| s.name == sink) else {
            return;
        };
        sink.volume = volume;
        let index = sink.index;
        drop(hw);
        self.tx.event(Event::new(Facility::Sink, EventKind::Change, index));
    }

    fn set_source_volume(&self, source: &str, volume: f64) {
        let mut hw = self.hardware.lock();
        let Some(source) = hw.sources.iter_mut().find(|s| s.name == source) else {
            return;
        };
        source.volume = volume;
        let index = source.index;
        drop(hw);
        self.tx.event(Event::new(Facility::Source, EventKind::Change, index));
    }
}
