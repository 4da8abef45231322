//! Persisted audio state
//!
//! [`AudioState`] is the small slice of audio configuration the daemon
//! keeps stable across restarts. [`StateStore`] reads and writes it as a
//! fixed binary record: five length-prefixed strings followed by two
//! little-endian `f64` volumes, in declaration order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::StateError;

/// Snapshot of the interesting audio state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioState {
    pub active_profile: String,
    pub active_sink: String,
    pub active_sink_port: String,
    pub active_source: String,
    pub active_source_port: String,
    /// 0.0 to 1.0
    pub sink_volume: f64,
    /// 0.0 to 1.0
    pub source_volume: f64,
}

impl fmt::Display for AudioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "profile={:?} sink={:?} port={:?} volume={:.2} source={:?} port={:?} volume={:.2}",
            self.active_profile,
            self.active_sink,
            self.active_sink_port,
            self.sink_volume,
            self.active_source,
            self.active_source_port,
            self.source_volume
        )
    }
}

impl AudioState {
    pub fn encode(&self) -> Result<Vec<u8>, StateError> {
        bincode::serialize(self).map_err(|e| StateError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        bincode::deserialize(bytes).map_err(|e| StateError::Decode(e.to_string()))
    }
}

/// The snapshot file
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted snapshot
    pub fn load(&self) -> Result<AudioState, StateError> {
        let _guard = self.lock.lock();
        let bytes = std::fs::read(&self.path)?;
        AudioState::decode(&bytes)
    }

    /// Replace the persisted snapshot, creating the parent directory.
    /// The record is written to a sibling file and renamed over the old
    /// one, so a crash never leaves a truncated snapshot behind.
    pub fn save(&self, state: &AudioState) -> Result<(), StateError> {
        let bytes = state.encode()?;

        let _guard = self.lock.lock();
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        tracing::debug!("Saved audio state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> AudioState {
        AudioState {
            active_profile: "analog-stereo".into(),
            active_sink: "alsa_output.analog-stereo".into(),
            active_sink_port: "analog-output-speaker".into(),
            active_source: "alsa_input.analog-stereo".into(),
            active_source_port: "analog-input-mic".into(),
            sink_volume: 0.5,
            source_volume: 0.8,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".config").join("audio.conf"));

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_replaces_instead_of_truncating() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.conf");
        let store = StateStore::new(&path);
        store.save(&sample()).unwrap();

        // a reader holding the old file keeps seeing the complete old record
        let mut old = std::fs::File::open(&path).unwrap();
        let changed = AudioState {
            sink_volume: 0.9,
            ..sample()
        };
        store.save(&changed).unwrap();

        let mut bytes = Vec::new();
        old.read_to_end(&mut bytes).unwrap();
        assert_eq!(AudioState::decode(&bytes).unwrap(), sample());
        assert_eq!(store.load().unwrap(), changed);

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_empty_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("audio.conf"));

        store.save(&AudioState::default()).unwrap();
        assert_eq!(store.load().unwrap(), AudioState::default());
    }

    #[test]
    fn test_record_layout() {
        let bytes = AudioState {
            active_profile: "a".into(),
            sink_volume: 1.0,
            ..Default::default()
        }
        .encode()
        .unwrap();

        // five u64 length prefixes, one byte of text, two f64s
        assert_eq!(bytes.len(), 5 * 8 + 1 + 2 * 8);
        assert_eq!(&bytes[..9], &[1, 0, 0, 0, 0, 0, 0, 0, b'a']);
        assert_eq!(&bytes[41..49], &1.0f64.to_le_bytes());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nothing-here"));
        assert!(matches!(store.load(), Err(StateError::Io(_))));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.conf");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();

        let store = StateStore::new(&path);
        assert!(matches!(store.load(), Err(StateError::Decode(_))));
    }

    #[test]
    fn test_single_field_changes_are_unequal() {
        let base = sample();
        let mut louder = base.clone();
        louder.sink_volume = 0.51;
        assert_ne!(base, louder);

        let mut other_port = base.clone();
        other_port.active_source_port = "analog-input-internal-mic".into();
        assert_ne!(base, other_port);

        assert_eq!(base, sample());
    }

    fn volume() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0]
    }

    proptest! {
        #[test]
        fn prop_store_round_trip(
            active_profile in ".*",
            active_sink in ".*",
            active_sink_port in ".*",
            active_source in ".*",
            active_source_port in ".*",
            sink_volume in volume(),
            source_volume in volume(),
        ) {
            let state = AudioState {
                active_profile,
                active_sink,
                active_sink_port,
                active_source,
                active_source_port,
                sink_volume,
                source_volume,
            };
            let dir = tempfile::tempdir().unwrap();
            let store = StateStore::new(dir.path().join("audio.conf"));

            store.save(&state).unwrap();
            prop_assert_eq!(store.load().unwrap(), state);
        }
    }
}
