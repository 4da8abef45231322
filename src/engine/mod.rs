//! Reconciliation engine
//!
//! Keeps the persisted [`AudioState`] in line with live hardware:
//!
//! - at startup, re-apply the saved state, or capture a fresh baseline and
//!   move the first card onto its best profile when nothing was saved;
//! - on card/server/sink/source notifications, capture, compare, and persist
//!   only when something changed;
//! - when a card appears on a blacklisted profile, switch it to the best
//!   allowed one.
//!
//! The last known state lives behind one mutex which is held for a whole
//! capture-compare-persist cycle, so concurrent notifications can't race
//! each other into duplicate writes or stale overwrites.

pub mod profile;

pub use profile::{best_profile, initial_profile, reselect_profile, Blacklist, CardKind};

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::config::AppConfig;
use crate::error::ServiceError;
use crate::pulse::{Card, Context, EventKind, Facility};
use crate::service::{AudioDevice, AudioService, DeviceSnapshot, Endpoint, VolumeFlag};
use crate::state::{AudioState, StateStore};

/// Result of one [`Reconciler::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Live state matches the last known state
    Unchanged,
    /// New state written and adopted
    Persisted,
    /// Write failed; the previous state stays authoritative
    PersistFailed,
}

/// Owns the last known audio state and every transition of it
pub struct Reconciler {
    ctx: Arc<Context>,
    service: Arc<dyn AudioService>,
    store: StateStore,
    blacklist: Blacklist,
    volume_flag: VolumeFlag,
    current: Mutex<AudioState>,
}

impl Reconciler {
    pub fn new(
        ctx: Arc<Context>,
        service: Arc<dyn AudioService>,
        store: StateStore,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            service,
            store,
            blacklist: Blacklist::new(&config.profiles),
            volume_flag: config.service.volume_flag,
            current: Mutex::new(AudioState::default()),
        })
    }

    /// Last known state
    pub fn current(&self) -> AudioState {
        self.current.lock().clone()
    }

    /// Load the saved state and apply it, or establish a baseline
    pub fn start(&self) -> AudioState {
        let mut current = self.current.lock();

        match self.store.load() {
            Ok(saved) => {
                tracing::info!("Restoring audio state from {}", self.store.path().display());
                self.apply(&saved);
                *current = saved;
            }
            Err(e) => {
                tracing::warn!("Read audio helper config failed: {}", e);
                let mut fresh = self.capture();
                self.init_profile(&mut fresh);
                match self.store.save(&fresh) {
                    Ok(()) => *current = fresh,
                    Err(e) => tracing::warn!("Save config failed: {}", e),
                }
            }
        }

        tracing::info!("Current audio info: {}", *current);
        current.clone()
    }

    /// Register for backend and service notifications
    pub fn subscribe(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.ctx.connect(Facility::Card, move |kind, idx| {
            let Some(this) = this.upgrade() else { return };
            tracing::debug!("[Event] card: {:?} {}", kind, idx);
            match kind {
                EventKind::New => match this.ctx.get_card(idx) {
                    Ok(card) => {
                        this.reselect_profile(&card);
                    }
                    Err(e) => tracing::warn!("Get card {} failed: {}", idx, e),
                },
                EventKind::Change => {
                    this.update();
                }
                EventKind::Remove => {}
            }
        });

        for facility in [Facility::Server, Facility::Sink, Facility::Source] {
            let this = Arc::downgrade(self);
            self.ctx.connect(facility, move |kind, idx| {
                tracing::debug!("[Event] {}: {:?} {}", facility, kind, idx);
                // sinks appearing or going away arrive through the service
                if facility == Facility::Sink && kind != EventKind::Change {
                    return;
                }
                with_live(&this, |this| {
                    this.update();
                });
            });
        }

        let this = Arc::downgrade(self);
        self.service.connect_sinks_changed(Box::new(move || {
            tracing::debug!("[Event] sinks changed");
            with_live(&this, |this| {
                this.update();
            });
        }));
    }

    /// Capture, compare with the last known state, persist on change
    pub fn update(&self) -> UpdateOutcome {
        let mut current = self.current.lock();
        let fresh = self.capture();
        if *current == fresh {
            tracing::debug!("Audio info equal");
            return UpdateOutcome::Unchanged;
        }

        tracing::info!("Will update config: {} -> {}", *current, fresh);
        match self.store.save(&fresh) {
            Ok(()) => {
                *current = fresh;
                UpdateOutcome::Persisted
            }
            Err(e) => {
                tracing::warn!("Save config failed: {}", e);
                UpdateOutcome::PersistFailed
            }
        }
    }

    /// Read the live state
    pub fn capture(&self) -> AudioState {
        let mut state = AudioState::default();

        if let Some(card) = self.ctx.get_card_list().first() {
            state.active_profile = card.active_profile_name().to_string();
        }

        match self.read_default(Endpoint::Sink) {
            Ok(device) => {
                state.active_sink = device.name;
                state.active_sink_port = device.port;
                state.sink_volume = device.volume;
            }
            Err(e) => tracing::warn!("Get default sink failed: {}", e),
        }

        match self.read_default(Endpoint::Source) {
            Ok(device) => {
                state.active_source = device.name;
                state.active_source_port = device.port;
                state.source_volume = device.volume;
            }
            Err(e) => tracing::warn!("Get default source failed: {}", e),
        }

        state
    }

    /// Push `state` to the hardware. Every step is attempted even when an
    /// earlier one fails.
    pub fn apply(&self, state: &AudioState) {
        if !state.active_profile.is_empty() {
            match self.ctx.get_card_list().first() {
                Some(card) => self.ctx.set_card_profile(card.index, &state.active_profile),
                None => tracing::warn!("No card to restore profile {}", state.active_profile),
            }
        }

        self.apply_endpoint(
            Endpoint::Sink,
            &state.active_sink,
            &state.active_sink_port,
            state.sink_volume,
        );
        self.apply_endpoint(
            Endpoint::Source,
            &state.active_source,
            &state.active_source_port,
            state.source_volume,
        );
    }

    /// Move `card` off a blacklisted profile. Returns whether it switched.
    pub fn reselect_profile(&self, card: &Card) -> bool {
        match profile::reselect_profile(card, &self.blacklist) {
            Some(name) => {
                tracing::info!("Reselect profile for {}: {}", card.name, name);
                self.ctx.set_card_profile(card.index, &name);
                true
            }
            None => false,
        }
    }

    /// Put the first card on its best profile and record it in `state`
    fn init_profile(&self, state: &mut AudioState) -> bool {
        let cards = self.ctx.get_card_list();
        let Some(card) = cards.first() else {
            return false;
        };
        let Some(name) = initial_profile(card) else {
            return false;
        };

        tracing::info!("Init profile: {}", name);
        self.ctx.set_card_profile(card.index, &name);
        state.active_profile = name;
        true
    }

    fn read_default(&self, endpoint: Endpoint) -> Result<DeviceSnapshot, ServiceError> {
        self.service.default_device(endpoint)?.snapshot()
    }

    fn apply_endpoint(&self, endpoint: Endpoint, name: &str, port: &str, volume: f64) {
        if name.is_empty() {
            tracing::debug!("No saved {}, skipping", endpoint);
            return;
        }

        if let Err(e) = self.service.set_default(endpoint, name) {
            tracing::warn!("Set default {} {} failed: {}", endpoint, name, e);
        }

        let device = match self.service.default_device(endpoint) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("Get default {} failed: {}", endpoint, e);
                return;
            }
        };
        match device.name() {
            Ok(current) if current != name => {
                tracing::warn!("Default {} is {} instead of {}", endpoint, current, name);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Get default {} name failed: {}", endpoint, e),
        }

        self.restore_device(device.as_ref(), endpoint, port, volume);
    }

    fn restore_device(&self, device: &dyn AudioDevice, endpoint: Endpoint, port: &str, volume: f64) {
        if !port.is_empty() {
            if let Err(e) = device.set_port(port) {
                tracing::warn!("Set {} port {} failed: {}", endpoint, port, e);
            }
        }
        if let Err(e) = device.set_volume(volume, self.volume_flag) {
            tracing::warn!("Set {} volume {} failed: {}", endpoint, volume, e);
        }
    }
}

fn with_live(this: &Weak<Reconciler>, f: impl FnOnce(&Reconciler)) {
    if let Some(this) = this.upgrade() {
        f(&this);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::{delivery_channel, Event, MemoryBackend, PropList, ProfileInfo};
    use crate::service::ContextAudioService;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _rt: tokio::runtime::Runtime,
        dir: TempDir,
        backend: Arc<MemoryBackend>,
        ctx: Arc<Context>,
    }

    impl Fixture {
        fn new() -> Self {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let (tx, rx) = delivery_channel();
            let backend = Arc::new(MemoryBackend::with_builtin_card(tx));
            let ctx = Context::new(
                backend.clone(),
                rx,
                rt.handle().clone(),
                Duration::from_secs(5),
            )
            .unwrap();
            Self {
                _rt: rt,
                dir: tempfile::tempdir().unwrap(),
                backend,
                ctx,
            }
        }

        fn state_path(&self) -> std::path::PathBuf {
            self.dir.path().join(".config").join("audio.conf")
        }

        fn saved(&self) -> Result<AudioState, crate::error::StateError> {
            StateStore::new(self.state_path()).load()
        }

        fn reconciler(&self) -> Arc<Reconciler> {
            self.reconciler_at(self.state_path())
        }

        fn reconciler_at(&self, path: std::path::PathBuf) -> Arc<Reconciler> {
            let service = Arc::new(ContextAudioService::new(self.ctx.clone()));
            Reconciler::new(
                self.ctx.clone(),
                service,
                StateStore::new(path),
                &AppConfig::default(),
            )
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        for _ in 0..250 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn builtin_state() -> AudioState {
        AudioState {
            active_profile: "analog-stereo".into(),
            active_sink: "alsa_output.analog-stereo".into(),
            active_sink_port: "analog-output-speaker".into(),
            active_source: "alsa_input.analog-stereo".into(),
            active_source_port: "analog-input-internal-mic".into(),
            sink_volume: 0.5,
            source_volume: 0.8,
        }
    }

    #[test]
    fn test_capture() {
        let f = Fixture::new();
        assert_eq!(f.reconciler().capture(), builtin_state());
    }

    #[test]
    fn test_capture_without_default_sink() {
        let f = Fixture::new();
        f.backend.modify(|hw| hw.server.default_sink_name = None);

        let state = f.reconciler().capture();
        assert_eq!(state.active_sink, "");
        assert_eq!(state.sink_volume, 0.0);
        assert_eq!(state.active_source, "alsa_input.analog-stereo");
    }

    #[test]
    fn test_start_without_baseline() {
        let f = Fixture::new();
        let reconciler = f.reconciler();

        let state = reconciler.start();
        assert_eq!(state, builtin_state());
        assert_eq!(f.saved().unwrap(), builtin_state());
        assert_eq!(reconciler.current(), builtin_state());
    }

    #[test]
    fn test_start_selects_initial_profile() {
        let f = Fixture::new();
        f.backend.modify(|hw| {
            hw.cards[0].active_profile = Some(ProfileInfo::new("hdmi-stereo", 5900));
        });

        let state = f.reconciler().start();
        assert_eq!(state.active_profile, "analog-stereo");
        assert_eq!(
            f.backend.hardware().cards[0].active_profile_name(),
            "analog-stereo"
        );
    }

    #[test]
    fn test_start_applies_baseline() {
        let f = Fixture::new();
        let saved = AudioState {
            active_profile: "hdmi-stereo".into(),
            active_sink_port: "analog-output-headphones".into(),
            active_source_port: "analog-input-mic".into(),
            sink_volume: 0.3,
            source_volume: 0.6,
            ..builtin_state()
        };
        StateStore::new(f.state_path()).save(&saved).unwrap();

        let reconciler = f.reconciler();
        assert_eq!(reconciler.start(), saved);

        let hw = f.backend.hardware();
        assert_eq!(hw.cards[0].active_profile_name(), "hdmi-stereo");
        assert_eq!(hw.sinks[0].active_port.as_deref(), Some("analog-output-headphones"));
        assert_eq!(hw.sinks[0].volume, 0.3);
        assert_eq!(hw.sources[0].active_port.as_deref(), Some("analog-input-mic"));
        assert_eq!(hw.sources[0].volume, 0.6);
        assert_eq!(reconciler.update(), UpdateOutcome::Unchanged);
    }

    #[test]
    fn test_start_with_corrupt_baseline() {
        let f = Fixture::new();
        std::fs::create_dir_all(f.state_path().parent().unwrap()).unwrap();
        std::fs::write(f.state_path(), b"garbage").unwrap();

        let reconciler = f.reconciler();
        assert_eq!(reconciler.start(), builtin_state());
        assert_eq!(f.saved().unwrap(), builtin_state());
    }

    #[test]
    fn test_apply_missing_sink_restores_onto_current_default() {
        let f = Fixture::new();
        let state = AudioState {
            active_sink: "bluez_sink.00_1A_7D".into(),
            active_sink_port: "analog-output-headphones".into(),
            sink_volume: 0.9,
            source_volume: 0.1,
            ..builtin_state()
        };

        f.reconciler().apply(&state);

        let hw = f.backend.hardware();
        assert_eq!(
            hw.server.default_sink_name.as_deref(),
            Some("alsa_output.analog-stereo")
        );
        assert_eq!(hw.sinks[0].active_port.as_deref(), Some("analog-output-headphones"));
        assert_eq!(hw.sinks[0].volume, 0.9);
        assert_eq!(hw.sources[0].volume, 0.1);
    }

    #[test]
    fn test_apply_unsupported_port_still_sets_volume() {
        let f = Fixture::new();
        let state = AudioState {
            active_sink_port: "hdmi-output-0".into(),
            sink_volume: 0.7,
            ..builtin_state()
        };

        f.reconciler().apply(&state);

        let hw = f.backend.hardware();
        assert_eq!(hw.sinks[0].active_port.as_deref(), Some("analog-output-speaker"));
        assert_eq!(hw.sinks[0].volume, 0.7);
    }

    #[test]
    fn test_update_is_gated_on_change() {
        let f = Fixture::new();
        let reconciler = f.reconciler();
        reconciler.start();

        assert_eq!(reconciler.update(), UpdateOutcome::Unchanged);

        f.backend.modify(|hw| hw.sinks[0].volume = 0.51);
        assert_eq!(reconciler.update(), UpdateOutcome::Persisted);
        assert_eq!(reconciler.update(), UpdateOutcome::Unchanged);

        assert_eq!(f.saved().unwrap().sink_volume, 0.51);
        assert_eq!(reconciler.current().sink_volume, 0.51);
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let f = Fixture::new();
        let blocker = f.dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let reconciler = f.reconciler_at(blocker.join("audio.conf"));

        reconciler.start();
        assert_eq!(reconciler.current(), AudioState::default());

        assert_eq!(reconciler.update(), UpdateOutcome::PersistFailed);
        assert_eq!(reconciler.current(), AudioState::default());
    }

    #[test]
    fn test_concurrent_updates_write_once() {
        let f = Fixture::new();
        let reconciler = f.reconciler();
        reconciler.start();
        f.backend.modify(|hw| hw.sources[0].volume = 0.25);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                std::thread::spawn(move || reconciler.update())
            })
            .collect();
        let persisted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == UpdateOutcome::Persisted)
            .count();

        assert_eq!(persisted, 1);
        assert_eq!(reconciler.current().source_volume, 0.25);
    }

    #[test]
    fn test_new_bluetooth_card_is_moved_off_head_unit() {
        let f = Fixture::new();
        let reconciler = f.reconciler();
        reconciler.start();
        reconciler.subscribe();

        f.backend.add_card(Card {
            index: 5,
            name: "bluez_card.00_1A_7D".into(),
            driver: "module-bluez5-device.c".into(),
            active_profile: Some(ProfileInfo::new("headset_head_unit", 30)),
            profiles: vec![
                ProfileInfo::new("headset_head_unit", 30),
                ProfileInfo::new("a2dp_sink", 20),
                ProfileInfo::new("off", 0),
            ],
            proplist: PropList::from([("device.bus".to_string(), "bluetooth".to_string())]),
        });

        assert!(wait_for(|| {
            f.backend
                .hardware()
                .cards
                .iter()
                .any(|c| c.index == 5 && c.active_profile_name() == "a2dp_sink")
        }));
    }

    #[test]
    fn test_change_events_persist() {
        let f = Fixture::new();
        let reconciler = f.reconciler();
        reconciler.start();
        reconciler.subscribe();

        f.backend.modify(|hw| hw.sinks[0].active_port = Some("analog-output-headphones".into()));
        f.backend.emit(Event::new(Facility::Sink, EventKind::Change, 0));

        assert!(wait_for(|| {
            f.saved()
                .map(|s| s.active_sink_port == "analog-output-headphones")
                .unwrap_or(false)
        }));
        assert_eq!(reconciler.current().active_sink_port, "analog-output-headphones");
    }

    /// Forwards to the real service but never reports sink list changes
    struct QuietSinkList(ContextAudioService);

    impl AudioService for QuietSinkList {
        fn default_device(&self, endpoint: Endpoint) -> Result<Box<dyn AudioDevice>, ServiceError> {
            self.0.default_device(endpoint)
        }

        fn set_default(&self, endpoint: Endpoint, name: &str) -> Result<(), ServiceError> {
            self.0.set_default(endpoint, name)
        }

        fn connect_sinks_changed(&self, _handler: Box<dyn Fn() + Send + Sync>) {}
    }

    #[test]
    fn test_sink_added_persists() {
        let f = Fixture::new();
        let reconciler = f.reconciler();
        reconciler.start();
        reconciler.subscribe();

        f.backend.modify(|hw| hw.sinks[0].volume = 0.3);
        f.backend.emit(Event::new(Facility::Sink, EventKind::New, 1));

        assert!(wait_for(|| f.saved().map(|s| s.sink_volume == 0.3).unwrap_or(false)));
    }

    #[test]
    fn test_sink_list_changes_come_from_the_service() {
        let f = Fixture::new();
        let service = Arc::new(QuietSinkList(ContextAudioService::new(f.ctx.clone())));
        let reconciler = Reconciler::new(
            f.ctx.clone(),
            service,
            StateStore::new(f.state_path()),
            &AppConfig::default(),
        );
        reconciler.start();
        reconciler.subscribe();

        f.backend.modify(|hw| hw.sinks[0].volume = 0.3);
        f.backend.emit(Event::new(Facility::Sink, EventKind::New, 1));
        f.backend.emit(Event::new(Facility::Sink, EventKind::Remove, 1));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(f.saved().unwrap().sink_volume, 0.5);

        f.backend.emit(Event::new(Facility::Sink, EventKind::Change, 0));
        assert!(wait_for(|| f.saved().map(|s| s.sink_volume == 0.3).unwrap_or(false)));
    }
}
