//! Devices as reported by the device bridge, plus parsers for the bridge's
//! plain-text command output.

use serde::{Deserialize, Serialize};

/// Connection state reported by `devices -l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unknown,
    Online,
    Offline,
    Unauthorized,
}

impl DeviceState {
    /// Maps the bridge's state column.
    pub fn from_bridge(token: &str) -> Self {
        match token {
            "device" => Self::Online,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            _ => Self::Unknown,
        }
    }
}

/// Screen size in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A device known to the bridge.
///
/// Identity is the serial alone; the remaining fields are refreshed on every
/// scan or connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub transport_id: Option<String>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Device {
    /// A device with only its serial known.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Unknown,
            model: None,
            product: None,
            transport_id: None,
            resolution: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    /// `true` for TCP/IP devices addressed as `host:port`.
    pub fn is_network(&self) -> bool {
        is_network_serial(&self.serial)
    }
}

/// `true` if the serial looks like `host:port`.
pub fn is_network_serial(serial: &str) -> bool {
    match serial.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

// ── Output parsers ────────────────────────────────────────────────────────────

/// Parses `devices -l` output.
///
/// ```text
/// List of devices attached
/// emulator-5554   device product:sdk_phone model:Pixel_7 transport_id:1
/// R58N12ABCDE     unauthorized transport_id:2
/// ```
pub fn parse_device_list(output: &str) -> Vec<Device> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            let mut device = Device::new(serial);
            device.state = DeviceState::from_bridge(state);
            for part in parts {
                if let Some(v) = part.strip_prefix("model:") {
                    device.model = Some(v.to_string());
                } else if let Some(v) = part.strip_prefix("product:") {
                    device.product = Some(v.to_string());
                } else if let Some(v) = part.strip_prefix("transport_id:") {
                    device.transport_id = Some(v.to_string());
                }
            }
            Some(device)
        })
        .collect()
}

/// Parses the first `WxH` pair in `wm size` output
/// (`Physical size: 1080x2400`).
pub fn parse_wm_size(output: &str) -> Option<Resolution> {
    output.split(|c: char| !(c.is_ascii_digit() || c == 'x')).find_map(|token| {
        let (w, h) = token.split_once('x')?;
        let width = w.parse().ok()?;
        let height = h.parse().ok()?;
        Some(Resolution::new(width, height))
    })
}

/// Parses `displayWidth=W ... displayHeight=H` out of `dumpsys display`.
pub fn parse_dumpsys_display(output: &str) -> Option<Resolution> {
    let (_, after_w) = output.split_once("displayWidth=")?;
    let width = leading_number(after_w)?;
    let (_, after_h) = after_w.split_once("displayHeight=")?;
    let height = leading_number(after_h)?;
    Some(Resolution::new(width, height))
}

/// Parses `getprop ro.build.version.sdk`.
pub fn parse_api_level(output: &str) -> Option<u32> {
    output.trim().parse().ok()
}

/// Maps `ro.product.cpu.abi` to the architecture directory daemon binaries
/// are published under.
pub fn normalize_abi(abi: &str) -> Option<&'static str> {
    if abi.contains("arm64") || abi.contains("armv8") {
        Some("arm64-v8a")
    } else if abi.contains("armeabi") {
        Some("armeabi-v7a")
    } else if abi.contains("x86_64") {
        Some("x86_64")
    } else if abi.contains("x86") {
        Some("x86")
    } else {
        None
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}
