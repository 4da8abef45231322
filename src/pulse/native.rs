//! PulseAudio backend on the libpulse threaded mainloop
//!
//! libpulse objects are reference counted without atomics and may only be
//! touched with the mainloop lock held. The context takes that lock through
//! [`Backend::lock`] before every call, and every libpulse callback runs on
//! the mainloop thread, which holds the lock while dispatching. Callbacks
//! only convert the reply and push it onto the delivery queue.

use libpulse_binding as pa;
use pa::callbacks::ListResult;
use pa::context::introspect::{
    CardInfo, CardProfileInfo, ServerInfo, SinkInfo, SinkInputInfo, SinkPortInfo, SourceInfo,
    SourceOutputInfo, SourcePortInfo,
};
use pa::context::subscribe::{Facility as PaFacility, InterestMaskSet, Operation as PaOperation};
use pa::context::{Context as PaContext, FlagSet as ContextFlagSet, State};
use pa::mainloop::threaded::Mainloop;
use pa::proplist::{properties, Proplist};
use pa::volume::{ChannelVolumes, Volume};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Error, QueryError};
use crate::pulse::backend::{Backend, DeliverySender, Query};
use crate::pulse::cookie::CookieId;
use crate::pulse::types::*;

/// Answers one list-style request through the delivery queue
macro_rules! list_callback {
    ($tx:expr, $cookie:expr, $info:ty, $project:expr) => {{
        let tx = $tx.clone();
        let cookie = $cookie;
        let project = $project;
        move |result: ListResult<&$info>| match result {
            ListResult::Item(info) => tx.item(cookie, project(info)),
            ListResult::End => tx.end_of_list(cookie),
            ListResult::Error => tx.failed(cookie),
        }
    }};
}

/// Channel counts seen in sink/source replies, needed to build volumes
type ChannelCache = Arc<Mutex<HashMap<String, u8>>>;

/// Connection to a PulseAudio server
pub struct PulseBackend {
    mainloop: Rc<RefCell<Mainloop>>,
    context: Rc<RefCell<PaContext>>,
    tx: DeliverySender,
    channels: ChannelCache,
}

// SAFETY: the Rc/RefCell handles are only used with the mainloop lock held
// (through Backend::lock, or on the mainloop thread itself), which
// serializes every access to the libpulse objects.
unsafe impl Send for PulseBackend {}
unsafe impl Sync for PulseBackend {}

impl PulseBackend {
    /// Connect to the default server and subscribe to every facility
    pub fn connect(app_name: &str, tx: DeliverySender) -> Result<Self, Error> {
        let mut proplist =
            Proplist::new().ok_or_else(|| Error::Connection("proplist allocation".into()))?;
        proplist
            .set_str(properties::APPLICATION_NAME, app_name)
            .map_err(|_| Error::Connection("proplist".into()))?;

        let mainloop = Rc::new(RefCell::new(
            Mainloop::new().ok_or_else(|| Error::Connection("mainloop allocation".into()))?,
        ));
        let context = Rc::new(RefCell::new(
            PaContext::new_with_proplist(&*mainloop.borrow(), app_name, &proplist)
                .ok_or_else(|| Error::Connection("context allocation".into()))?,
        ));

        {
            let ml = Rc::clone(&mainloop);
            let ctx = Rc::clone(&context);
            context
                .borrow_mut()
                .set_state_callback(Some(Box::new(move || {
                    let state = unsafe { (*ctx.as_ptr()).get_state() };
                    if matches!(state, State::Ready | State::Failed | State::Terminated) {
                        unsafe { (*ml.as_ptr()).signal(false) };
                    }
                })));
        }

        context
            .borrow_mut()
            .connect(None, ContextFlagSet::NOFLAGS, None)
            .map_err(|e| Error::Connection(e.to_string()))?;

        mainloop.borrow_mut().lock();
        if let Err(e) = mainloop.borrow_mut().start() {
            mainloop.borrow_mut().unlock();
            return Err(Error::Connection(e.to_string()));
        }

        loop {
            let state = context.borrow().get_state();
            match state {
                State::Ready => break,
                State::Failed | State::Terminated => {
                    mainloop.borrow_mut().unlock();
                    mainloop.borrow_mut().stop();
                    return Err(Error::Connection(format!("context state {:?}", state)));
                }
                _ => mainloop.borrow_mut().wait(),
            }
        }

        {
            let ctx = Rc::clone(&context);
            let tx = tx.clone();
            context
                .borrow_mut()
                .set_state_callback(Some(Box::new(move || {
                    let state = unsafe { (*ctx.as_ptr()).get_state() };
                    if matches!(state, State::Failed | State::Terminated) {
                        tx.disconnected(format!("context state {:?}", state));
                    }
                })));
        }

        {
            let tx = tx.clone();
            context
                .borrow_mut()
                .set_subscribe_callback(Some(Box::new(move |facility, operation, index| {
                    if let (Some(facility), Some(operation)) = (facility, operation) {
                        tx.event(Event::new(
                            map_facility(facility),
                            map_operation(operation),
                            index,
                        ));
                    }
                })));
            let _op = context.borrow_mut().subscribe(InterestMaskSet::ALL, |ok| {
                if !ok {
                    tracing::warn!("Subscribing to server events failed");
                }
            });
        }

        mainloop.borrow_mut().unlock();
        tracing::info!("Connected to PulseAudio");

        Ok(Self {
            mainloop,
            context,
            tx,
            channels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[allow(clippy::mut_from_ref)]
    fn context(&self) -> &mut PaContext {
        // SAFETY: callers hold the mainloop lock (see the Send/Sync note)
        unsafe { &mut *self.context.as_ptr() }
    }

    fn volume_for(&self, name: &str, volume: f64) -> ChannelVolumes {
        let channels = self.channels.lock().get(name).copied().unwrap_or(1);
        let raw = (volume.max(0.0) * Volume::NORMAL.0 as f64).round() as u32;
        let mut cv = ChannelVolumes::default();
        cv.set(channels, Volume(raw));
        cv
    }
}

impl Backend for PulseBackend {
    fn lock(&self) {
        unsafe { (*self.mainloop.as_ptr()).lock() };
    }

    fn unlock(&self) {
        unsafe { (*self.mainloop.as_ptr()).unlock() };
    }

    fn request(&self, cookie: CookieId, query: Query) -> Result<(), QueryError> {
        let context = self.context();
        if context.get_state() != State::Ready {
            return Err(QueryError::Unavailable(query.to_string()));
        }
        let introspect = context.introspect();

        match query {
            Query::CardList => {
                introspect.get_card_info_list(list_callback!(self.tx, cookie, CardInfo, card_from));
            }
            Query::Card(index) => {
                introspect.get_card_info_by_index(
                    index,
                    list_callback!(self.tx, cookie, CardInfo, card_from),
                );
            }
            Query::SinkList => {
                let channels = self.channels.clone();
                introspect.get_sink_info_list(list_callback!(
                    self.tx,
                    cookie,
                    SinkInfo,
                    move |info: &SinkInfo| sink_from(info, &channels)
                ));
            }
            Query::Sink(index) => {
                let channels = self.channels.clone();
                introspect.get_sink_info_by_index(
                    index,
                    list_callback!(self.tx, cookie, SinkInfo, move |info: &SinkInfo| {
                        sink_from(info, &channels)
                    }),
                );
            }
            Query::SourceList => {
                let channels = self.channels.clone();
                introspect.get_source_info_list(list_callback!(
                    self.tx,
                    cookie,
                    SourceInfo,
                    move |info: &SourceInfo| source_from(info, &channels)
                ));
            }
            Query::Source(index) => {
                let channels = self.channels.clone();
                introspect.get_source_info_by_index(
                    index,
                    list_callback!(self.tx, cookie, SourceInfo, move |info: &SourceInfo| {
                        source_from(info, &channels)
                    }),
                );
            }
            Query::SinkInputList => {
                introspect.get_sink_input_info_list(list_callback!(
                    self.tx,
                    cookie,
                    SinkInputInfo,
                    sink_input_from
                ));
            }
            Query::SinkInput(index) => {
                introspect.get_sink_input_info(
                    index,
                    list_callback!(self.tx, cookie, SinkInputInfo, sink_input_from),
                );
            }
            Query::SourceOutputList => {
                introspect.get_source_output_info_list(list_callback!(
                    self.tx,
                    cookie,
                    SourceOutputInfo,
                    source_output_from
                ));
            }
            Query::SourceOutput(index) => {
                introspect.get_source_output_info(
                    index,
                    list_callback!(self.tx, cookie, SourceOutputInfo, source_output_from),
                );
            }
            Query::Server => {
                let tx = self.tx.clone();
                introspect.get_server_info(move |info: &ServerInfo| {
                    tx.item(cookie, server_from(info));
                    tx.end_of_list(cookie);
                });
            }
        }
        Ok(())
    }

    fn set_card_profile(&self, card: u32, profile: &str) {
        let name = profile.to_string();
        self.context().introspect().set_card_profile_by_index(
            card,
            profile,
            Some(Box::new(move |ok| {
                if !ok {
                    tracing::warn!("Set card {} profile {} failed", card, name);
                }
            })),
        );
    }

    fn set_default_sink(&self, name: &str) {
        let owned = name.to_string();
        self.context().set_default_sink(name, move |ok| {
            if !ok {
                tracing::warn!("Set default sink {} failed", owned);
            }
        });
    }

    fn set_default_source(&self, name: &str) {
        let owned = name.to_string();
        self.context().set_default_source(name, move |ok| {
            if !ok {
                tracing::warn!("Set default source {} failed", owned);
            }
        });
    }

    fn set_sink_port(&self, sink: &str, port: &str) {
        self.context()
            .introspect()
            .set_sink_port_by_name(sink, port, None);
    }

    fn set_source_port(&self, source: &str, port: &str) {
        self.context()
            .introspect()
            .set_source_port_by_name(source, port, None);
    }

    fn set_sink_volume(&self, sink: &str, volume: f64) {
        let cv = self.volume_for(sink, volume);
        self.context()
            .introspect()
            .set_sink_volume_by_name(sink, &cv, None);
    }

    fn set_source_volume(&self, source: &str, volume: f64) {
        let cv = self.volume_for(source, volume);
        self.context()
            .introspect()
            .set_source_volume_by_name(source, &cv, None);
    }
}

impl Drop for PulseBackend {
    fn drop(&mut self) {
        unsafe {
            (*self.mainloop.as_ptr()).lock();
            (*self.context.as_ptr()).set_state_callback(None);
            (*self.context.as_ptr()).disconnect();
            (*self.mainloop.as_ptr()).unlock();
            (*self.mainloop.as_ptr()).stop();
        }
    }
}

fn text(value: &Option<Cow<'_, str>>) -> String {
    value.as_deref().unwrap_or_default().to_string()
}

fn props(list: &Proplist) -> PropList {
    list.iter()
        .filter_map(|key| list.get_str(&key).map(|value| (key, value)))
        .collect()
}

fn normalized(volume: &ChannelVolumes) -> f64 {
    volume.avg().0 as f64 / Volume::NORMAL.0 as f64
}

fn port_available(available: pa::def::PortAvailable) -> PortAvailable {
    match available {
        pa::def::PortAvailable::Yes => PortAvailable::Yes,
        pa::def::PortAvailable::No => PortAvailable::No,
        _ => PortAvailable::Unknown,
    }
}

fn profile_from(info: &CardProfileInfo) -> ProfileInfo {
    ProfileInfo {
        name: text(&info.name),
        description: text(&info.description),
        priority: info.priority,
        available: info.available,
    }
}

fn card_from(info: &CardInfo) -> InfoItem {
    InfoItem::Card(Card {
        index: info.index,
        name: text(&info.name),
        driver: text(&info.driver),
        active_profile: info.active_profile.as_deref().map(profile_from),
        profiles: info.profiles.iter().map(profile_from).collect(),
        proplist: props(&info.proplist),
    })
}

fn sink_port_from(info: &SinkPortInfo) -> PortInfo {
    PortInfo {
        name: text(&info.name),
        description: text(&info.description),
        priority: info.priority,
        available: port_available(info.available),
    }
}

fn source_port_from(info: &SourcePortInfo) -> PortInfo {
    PortInfo {
        name: text(&info.name),
        description: text(&info.description),
        priority: info.priority,
        available: port_available(info.available),
    }
}

fn sink_from(info: &SinkInfo, channels: &ChannelCache) -> InfoItem {
    let name = text(&info.name);
    channels.lock().insert(name.clone(), info.volume.len());
    InfoItem::Sink(Sink {
        index: info.index,
        name,
        description: text(&info.description),
        card: info.card,
        channels: info.volume.len(),
        volume: normalized(&info.volume),
        muted: info.mute,
        ports: info.ports.iter().map(sink_port_from).collect(),
        active_port: info.active_port.as_ref().map(|p| text(&p.name)),
        proplist: props(&info.proplist),
    })
}

fn source_from(info: &SourceInfo, channels: &ChannelCache) -> InfoItem {
    let name = text(&info.name);
    channels.lock().insert(name.clone(), info.volume.len());
    InfoItem::Source(Source {
        index: info.index,
        name,
        description: text(&info.description),
        card: info.card,
        monitor_of_sink: info.monitor_of_sink,
        channels: info.volume.len(),
        volume: normalized(&info.volume),
        muted: info.mute,
        ports: info.ports.iter().map(source_port_from).collect(),
        active_port: info.active_port.as_ref().map(|p| text(&p.name)),
        proplist: props(&info.proplist),
    })
}

fn sink_input_from(info: &SinkInputInfo) -> InfoItem {
    InfoItem::SinkInput(SinkInput {
        index: info.index,
        name: text(&info.name),
        sink: info.sink,
        proplist: props(&info.proplist),
    })
}

fn source_output_from(info: &SourceOutputInfo) -> InfoItem {
    InfoItem::SourceOutput(SourceOutput {
        index: info.index,
        name: text(&info.name),
        source: info.source,
        proplist: props(&info.proplist),
    })
}

fn server_from(info: &ServerInfo) -> InfoItem {
    InfoItem::Server(Server {
        user_name: text(&info.user_name),
        host_name: text(&info.host_name),
        server_version: text(&info.server_version),
        default_sink_name: info.default_sink_name.as_ref().map(|n| n.to_string()),
        default_source_name: info.default_source_name.as_ref().map(|n| n.to_string()),
    })
}

fn map_facility(facility: PaFacility) -> Facility {
    match facility {
        PaFacility::Sink => Facility::Sink,
        PaFacility::Source => Facility::Source,
        PaFacility::SinkInput => Facility::SinkInput,
        PaFacility::SourceOutput => Facility::SourceOutput,
        PaFacility::Module => Facility::Module,
        PaFacility::Client => Facility::Client,
        PaFacility::SampleCache => Facility::SampleCache,
        PaFacility::Server => Facility::Server,
        PaFacility::Card => Facility::Card,
    }
}

fn map_operation(operation: PaOperation) -> EventKind {
    match operation {
        PaOperation::New => EventKind::New,
        PaOperation::Changed => EventKind::Change,
        PaOperation::Removed => EventKind::Remove,
    }
}
