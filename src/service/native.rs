//! Audio service implemented on top of the native context
//!
//! Default device identity comes from the server info reply, devices are
//! looked up by name on every call, and changes go out as context
//! mutations. The volume flag is ignored: values are always absolute,
//! normalized volumes.

use std::sync::Arc;

use crate::error::ServiceError;
use crate::pulse::{Context, EventKind, Facility, PortInfo};
use crate::service::{AudioDevice, AudioService, DeviceSnapshot, Endpoint, VolumeFlag};

/// [`AudioService`] backed by a [`Context`]
pub struct ContextAudioService {
    ctx: Arc<Context>,
}

impl ContextAudioService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

impl AudioService for ContextAudioService {
    fn default_device(&self, endpoint: Endpoint) -> Result<Box<dyn AudioDevice>, ServiceError> {
        let server = self.ctx.get_server()?;
        let name = match endpoint {
            Endpoint::Sink => server.default_sink_name,
            Endpoint::Source => server.default_source_name,
        }
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ServiceError::DeviceNotFound(format!("default {}", endpoint)))?;

        Ok(Box::new(ContextDevice {
            ctx: Arc::clone(&self.ctx),
            endpoint,
            name,
        }))
    }

    fn set_default(&self, endpoint: Endpoint, name: &str) -> Result<(), ServiceError> {
        lookup(&self.ctx, endpoint, name)?;
        match endpoint {
            Endpoint::Sink => self.ctx.set_default_sink(name),
            Endpoint::Source => self.ctx.set_default_source(name),
        }
        Ok(())
    }

    fn connect_sinks_changed(&self, handler: Box<dyn Fn() + Send + Sync>) {
        self.ctx.connect(Facility::Sink, move |kind, _| {
            if kind != EventKind::Change {
                handler();
            }
        });
    }
}

/// Fields shared by sinks and sources
struct DeviceInfo {
    name: String,
    ports: Vec<PortInfo>,
    active_port: Option<String>,
    volume: f64,
}

fn lookup(ctx: &Context, endpoint: Endpoint, name: &str) -> Result<DeviceInfo, ServiceError> {
    let found = match endpoint {
        Endpoint::Sink => ctx
            .get_sink_list()
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| DeviceInfo {
                name: s.name,
                ports: s.ports,
                active_port: s.active_port,
                volume: s.volume,
            }),
        Endpoint::Source => ctx
            .get_source_list()
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| DeviceInfo {
                name: s.name,
                ports: s.ports,
                active_port: s.active_port,
                volume: s.volume,
            }),
    };
    found.ok_or_else(|| ServiceError::DeviceNotFound(format!("{} {}", endpoint, name)))
}

/// A sink or source addressed by name
struct ContextDevice {
    ctx: Arc<Context>,
    endpoint: Endpoint,
    name: String,
}

impl ContextDevice {
    fn info(&self) -> Result<DeviceInfo, ServiceError> {
        lookup(&self.ctx, self.endpoint, &self.name)
    }
}

impl AudioDevice for ContextDevice {
    fn name(&self) -> Result<String, ServiceError> {
        Ok(self.info()?.name)
    }

    fn active_port(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.info()?.active_port.into_iter().collect())
    }

    fn set_port(&self, port: &str) -> Result<(), ServiceError> {
        let info = self.info()?;
        if !info.ports.iter().any(|p| p.name == port) {
            return Err(ServiceError::Rejected(format!(
                "{} {} has no port {}",
                self.endpoint, self.name, port
            )));
        }
        match self.endpoint {
            Endpoint::Sink => self.ctx.set_sink_port(&self.name, port),
            Endpoint::Source => self.ctx.set_source_port(&self.name, port),
        }
        Ok(())
    }

    fn volume(&self) -> Result<f64, ServiceError> {
        Ok(self.info()?.volume)
    }

    fn set_volume(&self, volume: f64, _flag: VolumeFlag) -> Result<(), ServiceError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(ServiceError::Rejected(format!("invalid volume {}", volume)));
        }
        self.info()?;
        match self.endpoint {
            Endpoint::Sink => self.ctx.set_sink_volume(&self.name, volume),
            Endpoint::Source => self.ctx.set_source_volume(&self.name, volume),
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, ServiceError> {
        let info = self.info()?;
        Ok(DeviceSnapshot {
            name: info.name,
            port: info.active_port.unwrap_or_default(),
            volume: info.volume,
        })
    }
}
