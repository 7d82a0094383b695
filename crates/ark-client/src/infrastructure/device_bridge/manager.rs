//! Device discovery and the "current device" selection.

use std::sync::{Arc, PoisonError, RwLock};

use ark_core::domain::device::{is_network_serial, parse_device_list, parse_wm_size};
use ark_core::{Device, DeviceState};
use thiserror::Error;
use tracing::{info, warn};

use super::{BridgeError, DeviceBridge};
use crate::infrastructure::storage::StateStore;

/// Errors produced while discovering or selecting devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A bridge command ran but reported failure.
    #[error("'{command}' failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// The serial is not listed by the bridge, or is offline.
    #[error("device {0} is not available")]
    NotFound(String),

    /// The device has not accepted this computer's debugging key.
    #[error("device {0} is unauthorized; accept the debugging prompt on the device")]
    Unauthorized(String),

    /// The device is listed but did not answer a shell command.
    #[error("device {serial} did not respond: {detail}")]
    Unresponsive { serial: String, detail: String },
}

/// Tracks attached devices and which one the client is driving.
pub struct DeviceManager {
    bridge: Arc<dyn DeviceBridge>,
    state: Option<StateStore>,
    current: RwLock<Option<Device>>,
}

impl DeviceManager {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            bridge,
            state: None,
            current: RwLock::new(None),
        }
    }

    /// Remembers the last connected serial in `state`.
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn bridge(&self) -> Arc<dyn DeviceBridge> {
        Arc::clone(&self.bridge)
    }

    /// Lists every device the bridge knows about.
    pub async fn scan(&self) -> Result<Vec<Device>, DeviceError> {
        let output = self.bridge.run(None, &["devices", "-l"]).await?;
        if !output.success {
            return Err(DeviceError::CommandFailed {
                command: "devices -l".into(),
                detail: output.detail().to_string(),
            });
        }
        let devices = parse_device_list(&output.stdout);
        info!(count = devices.len(), "device scan complete");
        Ok(devices)
    }

    /// Connects to `serial`, verifies it answers, and makes it current.
    ///
    /// Network serials (`host:port`) are attached with `connect` first.
    pub async fn connect(&self, serial: &str) -> Result<Device, DeviceError> {
        if is_network_serial(serial) {
            let output = self.bridge.run(None, &["connect", serial]).await?;
            let text = output.text().to_lowercase();
            if !output.success || !text.contains("connected") || text.contains("failed") {
                return Err(DeviceError::CommandFailed {
                    command: format!("connect {serial}"),
                    detail: output.detail().to_string(),
                });
            }
        }

        let mut device = self
            .scan()
            .await?
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| DeviceError::NotFound(serial.to_string()))?;
        match device.state {
            DeviceState::Unauthorized => return Err(DeviceError::Unauthorized(serial.to_string())),
            DeviceState::Offline => return Err(DeviceError::NotFound(serial.to_string())),
            _ => {}
        }

        let probe = self.bridge.shell(serial, "echo connected").await?;
        if !probe.success || probe.text() != "connected" {
            return Err(DeviceError::Unresponsive {
                serial: serial.to_string(),
                detail: probe.detail().to_string(),
            });
        }
        device.state = DeviceState::Online;

        match self.bridge.shell(serial, "wm size").await {
            Ok(out) if out.success => device.resolution = parse_wm_size(&out.stdout),
            Ok(out) => warn!(device = serial, detail = out.detail(), "wm size failed"),
            Err(e) => warn!(device = serial, error = %e, "wm size failed"),
        }

        if let Some(state) = &self.state {
            if let Err(e) = state.save_last_device(serial) {
                warn!(device = serial, error = %e, "failed to remember last device");
            }
        }

        info!(device = serial, resolution = ?device.resolution, "device connected");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(device.clone());
        Ok(device)
    }

    /// Reconnects the last used device if it is currently attached.
    pub async fn connect_last(&self) -> Result<Option<Device>, DeviceError> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let last = match state.last_device() {
            Ok(Some(serial)) => serial,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable last-device file");
                return Ok(None);
            }
        };
        let listed = self.scan().await?.iter().any(|d| d.serial == last);
        if !listed && !is_network_serial(&last) {
            return Ok(None);
        }
        self.connect(&last).await.map(Some)
    }

    /// Forgets the current device; network devices are also detached.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let device = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = device {
            if device.is_network() {
                let output = self.bridge.run(None, &["disconnect", &device.serial]).await?;
                if !output.success {
                    warn!(device = %device.serial, detail = output.detail(), "disconnect failed");
                }
            }
            info!(device = %device.serial, "device released");
        }
        Ok(())
    }

    pub fn current(&self) -> Option<Device> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
