//! The audio service the daemon talks to for default devices
//!
//! Default-sink/default-source selection and per-device port and volume
//! changes belong to an external audio service. The daemon only consumes it
//! through [`AudioService`] and [`AudioDevice`].

pub mod native;

pub use native::ContextAudioService;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ServiceError;

/// Playback or capture side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Sink,
    Source,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Sink => f.write_str("sink"),
            Endpoint::Source => f.write_str("source"),
        }
    }
}

/// Secondary argument of the service's volume-set call.
///
/// The service accepts a boolean next to the volume value. Whether it means
/// "value is a percentage" or something else is up to the service; the
/// daemon passes the configured value through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeFlag(pub bool);

/// Name, current port and volume of one device, read at the same moment
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub name: String,
    /// Empty when the device reports no port
    pub port: String,
    pub volume: f64,
}

/// A sink or source object exposed by the service
pub trait AudioDevice: Send + Sync {
    fn name(&self) -> Result<String, ServiceError>;

    /// Current port first
    fn active_port(&self) -> Result<Vec<String>, ServiceError>;

    fn set_port(&self, port: &str) -> Result<(), ServiceError>;

    /// Normalized, 0.0 to 1.0
    fn volume(&self) -> Result<f64, ServiceError>;

    fn set_volume(&self, volume: f64, flag: VolumeFlag) -> Result<(), ServiceError>;

    /// All three readable fields at once. Implementations that can fetch
    /// them in one round trip should override this.
    fn snapshot(&self) -> Result<DeviceSnapshot, ServiceError> {
        Ok(DeviceSnapshot {
            name: self.name()?,
            port: self.active_port()?.into_iter().next().unwrap_or_default(),
            volume: self.volume()?,
        })
    }
}

/// The external audio service
pub trait AudioService: Send + Sync {
    /// The device currently selected as default
    fn default_device(&self, endpoint: Endpoint) -> Result<Box<dyn AudioDevice>, ServiceError>;

    fn set_default(&self, endpoint: Endpoint, name: &str) -> Result<(), ServiceError>;

    /// Invoke `handler` whenever a sink appears or goes away. Changes to an
    /// existing sink are not reported here.
    fn connect_sinks_changed(&self, handler: Box<dyn Fn() + Send + Sync>);
}
