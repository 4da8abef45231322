//! # Audio Saver
//!
//! Background daemon that keeps a desktop's audio device configuration
//! stable across restarts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Sound server (native)                        │
//! └───────────────▲──────────────────────────────────┬───────────────────┘
//!                 │ requests (under backend lock)    │ replies + events
//!                 │                                  ▼
//! ┌───────────────┴──────────────┐      ┌──────────────────────────────┐
//! │  pulse::Context              │      │  Delivery queue              │
//! │  get_*_list / get_* / set_*  │      │  (single drain thread)       │
//! └───────────────▲──────────────┘      └───────┬──────────────┬───────┘
//!                 │ blocking queries            │ replies      │ events
//!                 │                             ▼              ▼
//!                 │                   ┌──────────────┐  ┌──────────────┐
//!                 │                   │  CookieJar   │  │  Dispatcher  │
//!                 │                   └──────────────┘  └──────┬───────┘
//!                 │                                            │ spawn_blocking
//! ┌───────────────┴────────────────────────────────────────────▼───────┐
//! │  engine::Reconciler                                                │
//! │  start (apply | baseline)  update (capture → compare → persist)    │
//! │  reselect_profile (classify → blacklist → stable priority sort)    │
//! └───────────────┬──────────────────────────────────┬─────────────────┘
//!                 │ default devices, port, volume    │ save / load
//!                 ▼                                  ▼
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │  service::AudioService       │      │  state::StateStore           │
//! └──────────────────────────────┘      └──────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod pulse;
pub mod service;
pub mod state;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Snapshot file, relative to the home directory
    pub const STATE_FILE: &str = ".config/deepin_audio_helper.conf";

    /// How long a backend query may wait for its terminal reply
    pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;
}
