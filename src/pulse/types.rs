//! Typed views of the objects the audio backend reports
//!
//! These are plain values built from a single reply. Nothing here is cached
//! or kept in sync with the server; query again to see fresh state.

use std::collections::BTreeMap;
use std::fmt;

/// Property key holding the device bus (e.g. `"bluetooth"`, `"usb"`, `"pci"`)
pub const PROP_DEVICE_BUS: &str = "device.bus";

/// Property key holding the device form factor (e.g. `"internal"`, `"headset"`)
pub const PROP_DEVICE_FORM_FACTOR: &str = "device.form_factor";

/// Free-form string properties attached to a backend object
pub type PropList = BTreeMap<String, String>;

/// Category of backend object a notification concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Facility {
    Server,
    Sink,
    Source,
    SinkInput,
    SourceOutput,
    Card,
    Client,
    Module,
    SampleCache,
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Facility::Server => "server",
            Facility::Sink => "sink",
            Facility::Source => "source",
            Facility::SinkInput => "sink-input",
            Facility::SourceOutput => "source-output",
            Facility::Card => "card",
            Facility::Client => "client",
            Facility::Module => "module",
            Facility::SampleCache => "sample-cache",
        };
        f.write_str(name)
    }
}

/// What happened to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

/// A change notification: (facility, kind, object index)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub facility: Facility,
    pub kind: EventKind,
    pub index: u32,
}

impl Event {
    pub fn new(facility: Facility, kind: EventKind, index: u32) -> Self {
        Self {
            facility,
            kind,
            index,
        }
    }
}

/// A card profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub name: String,
    pub description: String,
    /// Higher is more preferred
    pub priority: u32,
    pub available: bool,
}

impl ProfileInfo {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            available: true,
        }
    }
}

/// Port availability as reported by jack detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAvailable {
    #[default]
    Unknown,
    No,
    Yes,
}

/// A selectable jack/connector on a sink or source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub available: PortAvailable,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            available: PortAvailable::Unknown,
        }
    }
}

/// An audio adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub index: u32,
    pub name: String,
    pub driver: String,
    pub active_profile: Option<ProfileInfo>,
    /// In backend enumeration order
    pub profiles: Vec<ProfileInfo>,
    pub proplist: PropList,
}

impl Card {
    /// Name of the active profile, empty when the card reports none
    pub fn active_profile_name(&self) -> &str {
        self.active_profile
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("")
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.proplist.get(key).map(String::as_str)
    }
}

/// Playback endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Sink {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub card: Option<u32>,
    pub channels: u8,
    /// Average over channels, 1.0 is the backend's normal volume
    pub volume: f64,
    pub muted: bool,
    pub ports: Vec<PortInfo>,
    pub active_port: Option<String>,
    pub proplist: PropList,
}

/// Capture endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub card: Option<u32>,
    /// Set when this source monitors a sink
    pub monitor_of_sink: Option<u32>,
    pub channels: u8,
    pub volume: f64,
    pub muted: bool,
    pub ports: Vec<PortInfo>,
    pub active_port: Option<String>,
    pub proplist: PropList,
}

/// A playback stream connected to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct SinkInput {
    pub index: u32,
    pub name: String,
    pub sink: u32,
    pub proplist: PropList,
}

/// A capture stream connected to a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutput {
    pub index: u32,
    pub name: String,
    pub source: u32,
    pub proplist: PropList,
}

/// Server-wide information
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Server {
    pub user_name: String,
    pub host_name: String,
    pub server_version: String,
    pub default_sink_name: Option<String>,
    pub default_source_name: Option<String>,
}

/// One decoded reply item
#[derive(Debug, Clone, PartialEq)]
pub enum InfoItem {
    Card(Card),
    Sink(Sink),
    Source(Source),
    SinkInput(SinkInput),
    SourceOutput(SourceOutput),
    Server(Server),
}

impl InfoItem {
    pub fn into_card(self) -> Option<Card> {
        match self {
            InfoItem::Card(card) => Some(card),
            _ => None,
        }
    }

    pub fn into_sink(self) -> Option<Sink> {
        match self {
            InfoItem::Sink(sink) => Some(sink),
            _ => None,
        }
    }

    pub fn into_source(self) -> Option<Source> {
        match self {
            InfoItem::Source(source) => Some(source),
            _ => None,
        }
    }

    pub fn into_sink_input(self) -> Option<SinkInput> {
        match self {
            InfoItem::SinkInput(si) => Some(si),
            _ => None,
        }
    }

    pub fn into_source_output(self) -> Option<SourceOutput> {
        match self {
            InfoItem::SourceOutput(so) => Some(so),
            _ => None,
        }
    }

    pub fn into_server(self) -> Option<Server> {
        match self {
            InfoItem::Server(server) => Some(server),
            _ => None,
        }
    }
}
