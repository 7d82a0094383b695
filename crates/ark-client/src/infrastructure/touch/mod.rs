//! Touch injection through an on-device touch daemon.
//!
//! # How a session is set up (for beginners)
//!
//! ```text
//!  host                                   device
//!  ────                                   ──────
//!  1. getprop sdk / abi        ────────►  (helper service on API ≥ 29)
//!  2. wm size                  ────────►  screen resolution
//!  3. push + chmod daemon      ────────►  /data/local/tmp/minitouch
//!  4. kill stale, launch       ────────►  daemon listens on an abstract socket
//!  5. forward tcp:N            ────────►  localabstract:minitouch
//!  6. TCP connect 127.0.0.1:N  ◄────────  "v 1" / "^ 10 4095 4095 255" / "$ pid"
//! ```
//!
//! After the banner has been read, every gesture is a batch of text commands
//! (see [`ark_core::domain::gesture`]) written to the socket.  Coordinates are
//! scaled from logical screen pixels into the daemon's raw space using the
//! capability announced in the banner.
//!
//! A failed write triggers one reconnect to the same forwarded port.  The
//! banner is read again; if the daemon now announces a different capability
//! the gesture is abandoned, because the scaling it was built with is stale.

pub mod artifacts;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ark_core::domain::device::{normalize_abi, parse_api_level, parse_dumpsys_display, parse_wm_size};
use ark_core::domain::gesture::{
    self, encode_commands, parse_banner_line, validate_contacts, BannerLine, Contact,
    CoordinateScaler, RawPoint,
};
use ark_core::{DaemonCapability, Device, GestureCommand, GestureError, Resolution, TouchAction};
use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

pub use artifacts::{ArtifactCache, ArtifactError, ArtifactSource};

use crate::application::automate::{ActuationError, TouchActuator};
use crate::infrastructure::device_bridge::{BridgeError, DeviceBridge};

/// Package name of the helper service needed on newer Android releases.
pub const HELPER_PACKAGE: &str = "jp.co.cyberagent.stf";
const HELPER_SERVICE: &str = "jp.co.cyberagent.stf/.Service";
const HELPER_START_ACTION: &str = "jp.co.cyberagent.stf.ACTION_START";

/// Abstract socket the daemon listens on.
const DAEMON_SOCKET: &str = "localabstract:minitouch";

/// Ports scanned above `relay_base_port` before giving up.
const PORT_SCAN_RANGE: u16 = 1000;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Tunables for [`TouchInjectionChannel`].
#[derive(Debug, Clone)]
pub struct TouchConfig {
    /// Host the forwarded relay port is reached on.
    pub relay_host: String,
    /// First local port tried for the forward.
    pub relay_base_port: u16,
    /// TCP connect attempts before the session fails.
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    /// Limit for a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Limit for each banner line.
    pub handshake_timeout: Duration,
    /// Banner lines read while looking for the capability line.
    pub handshake_lines: usize,
    pub tap_duration_ms: u64,
    pub long_press_ms: u64,
    pub swipe_duration_ms: u64,
    pub swipe_steps: u32,
    pub multi_touch_ms: u64,
    /// Requested contact pressure, clamped to the daemon's maximum.
    pub pressure: u32,
    /// Random offset (pixels) added to each action point; 0 disables it.
    pub jitter_px: u32,
    /// Where the daemon binary lives on the device.
    pub daemon_path: String,
    /// API level from which the helper service is installed.
    pub helper_min_api: u32,
    /// Pause after killing stale daemons.
    pub kill_settle: Duration,
    /// Pause after launching the daemon, before forwarding.
    pub launch_settle: Duration,
}

impl Default for TouchConfig {
    fn default() -> Self {
        Self {
            relay_host: "127.0.0.1".to_string(),
            relay_base_port: 20000,
            connect_attempts: 5,
            connect_backoff: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            handshake_lines: 10,
            tap_duration_ms: 50,
            long_press_ms: 1000,
            swipe_duration_ms: 200,
            swipe_steps: gesture::DEFAULT_SWIPE_STEPS,
            multi_touch_ms: 100,
            pressure: 100,
            jitter_px: 0,
            daemon_path: "/data/local/tmp/minitouch".to_string(),
            helper_min_api: 29,
            kill_settle: Duration::from_millis(200),
            launch_settle: Duration::from_millis(300),
        }
    }
}

impl TouchConfig {
    /// Process name of the daemon (last path component).
    fn daemon_name(&self) -> &str {
        self.daemon_path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("minitouch")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors produced by the touch channel.
#[derive(Debug, Error)]
pub enum TouchError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A setup command ran but reported failure.
    #[error("{step} failed: {detail}")]
    CommandFailed { step: &'static str, detail: String },

    /// The device's CPU ABI has no daemon build.
    #[error("unsupported CPU architecture '{0}'")]
    UnsupportedAbi(String),

    #[error("could not determine the screen resolution")]
    ResolutionUnavailable,

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Launching the daemon did not print a numeric PID.
    #[error("daemon launch returned no PID (got {0:?})")]
    DaemonLaunch(String),

    #[error("no free local port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("cannot connect to relay port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The daemon banner did not contain a usable capability line.
    #[error("daemon handshake failed: {0}")]
    Handshake(String),

    /// The daemon came back after a reconnect with a different capability.
    #[error("daemon capability changed from {before:?} to {after:?}")]
    CapabilityChanged {
        before: DaemonCapability,
        after: DaemonCapability,
    },

    #[error("no touch session for device {0}")]
    NotConnected(String),

    /// The socket failed after part of a gesture was written; the rest is
    /// not replayed on the new connection.
    #[error("gesture interrupted after {written} of {total} bytes")]
    Interrupted { written: usize, total: usize },

    /// A key event name containing characters other than letters, digits and `_`.
    #[error("invalid key code '{0}'")]
    InvalidKey(String),

    #[error("touch socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Gesture(#[from] GestureError),
}

// ── Session state ─────────────────────────────────────────────────────────────

/// Summary of an open touch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub serial: String,
    /// Local port forwarded to the daemon socket.
    pub port: u16,
    /// PID of the daemon process on the device.
    pub pid: u32,
    pub version: Option<u32>,
    pub capability: DaemonCapability,
    pub resolution: Resolution,
}

struct TouchSession {
    stream: TcpStream,
    port: u16,
    pid: u32,
    version: Option<u32>,
    scaler: CoordinateScaler,
}

impl TouchSession {
    fn info(&self, serial: &str) -> SessionInfo {
        SessionInfo {
            serial: serial.to_string(),
            port: self.port,
            pid: self.pid,
            version: self.version,
            capability: self.scaler.capability,
            resolution: self.scaler.screen,
        }
    }
}

#[derive(Debug)]
struct Banner {
    version: Option<u32>,
    capability: DaemonCapability,
}

/// One finger of a multi-touch gesture, in logical screen pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub contact: u8,
    pub x: f64,
    pub y: f64,
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Manages one touch daemon session per device.
pub struct TouchInjectionChannel {
    bridge: Arc<dyn DeviceBridge>,
    artifacts: Arc<dyn ArtifactSource>,
    config: TouchConfig,
    sessions: tokio::sync::Mutex<HashMap<String, TouchSession>>,
    /// Serializes `connect` per device for the whole setup.
    connecting: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    reserved_ports: Mutex<HashSet<u16>>,
}

impl TouchInjectionChannel {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        artifacts: Arc<dyn ArtifactSource>,
        config: TouchConfig,
    ) -> Self {
        Self {
            bridge,
            artifacts,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            reserved_ports: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &TouchConfig {
        &self.config
    }

    /// Deploys and starts the daemon on `device` and opens a session.
    ///
    /// An existing session for the same device is closed first, and
    /// concurrent calls for one device run one after another, so a device
    /// never holds more than one session.  On failure the daemon process and
    /// the port forward created so far are removed.
    ///
    /// # Errors
    ///
    /// Returns [`TouchError`] for any failed setup step; the capability line
    /// is mandatory, so a banner without one fails with
    /// [`TouchError::Handshake`].
    pub async fn connect(&self, device: &Device) -> Result<SessionInfo, TouchError> {
        let serial = device.serial.as_str();
        let guard = self.connect_guard(serial);
        let _setup = guard.lock().await;

        let previous = self.sessions.lock().await.remove(serial);
        if let Some(previous) = previous {
            debug!(device = serial, "replacing existing touch session");
            self.teardown(serial, previous).await;
        }

        let api = self.api_level(serial).await;
        if api >= self.config.helper_min_api {
            self.ensure_helper(serial).await?;
        }
        let resolution = self.resolution(serial).await?;
        self.ensure_daemon(serial).await?;
        self.kill_stale(serial).await;
        let pid = self.launch(serial).await?;

        let session = match self.open_session(serial, pid, resolution).await {
            Ok(session) => session,
            Err(e) => {
                self.kill_pid(serial, pid).await;
                return Err(e);
            }
        };
        let info = session.info(serial);
        info!(
            device = serial,
            port = info.port,
            pid = info.pid,
            capability = ?info.capability,
            "touch session ready"
        );
        let stale = self.sessions.lock().await.insert(serial.to_string(), session);
        if let Some(stale) = stale {
            warn!(device = serial, port = stale.port, "closing session opened during connect");
            self.teardown(serial, stale).await;
        }
        Ok(info)
    }

    fn connect_guard(&self, serial: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(serial.to_string())
            .or_default()
            .clone()
    }

    /// Closes the session for `serial`, removing its forward and killing the
    /// daemon.  Does nothing when no session is open.
    pub async fn disconnect(&self, serial: &str) {
        let session = self.sessions.lock().await.remove(serial);
        if let Some(session) = session {
            self.teardown(serial, session).await;
            info!(device = serial, "touch session closed");
        }
    }

    /// Closes every open session.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<(String, TouchSession)> = self.sessions.lock().await.drain().collect();
        for (serial, session) in sessions {
            self.teardown(&serial, session).await;
        }
    }

    pub async fn session_info(&self, serial: &str) -> Option<SessionInfo> {
        self.sessions.lock().await.get(serial).map(|s| s.info(serial))
    }

    // ── Gestures ──────────────────────────────────────────────────────────────

    /// Taps at logical pixel `(x, y)`.
    pub async fn tap(
        &self,
        serial: &str,
        x: f64,
        y: f64,
        duration_ms: u64,
        pressure: u32,
    ) -> Result<(), TouchError> {
        self.send_with(serial, |scaler| {
            Ok(gesture::tap(scaler.to_raw(x, y), scaler.pressure(pressure), duration_ms))
        })
        .await
    }

    /// Holds contact 0 at `(x, y)` for `duration_ms`.
    pub async fn long_press(
        &self,
        serial: &str,
        x: f64,
        y: f64,
        duration_ms: u64,
        pressure: u32,
    ) -> Result<(), TouchError> {
        self.tap(serial, x, y, duration_ms, pressure).await
    }

    /// Swipes in a straight line with `steps` interpolated moves.
    pub async fn swipe(
        &self,
        serial: &str,
        from: (f64, f64),
        to: (f64, f64),
        duration_ms: u64,
        steps: u32,
        pressure: u32,
    ) -> Result<(), TouchError> {
        self.send_with(serial, |scaler| {
            gesture::swipe(
                scaler.to_raw(from.0, from.1),
                scaler.to_raw(to.0, to.1),
                scaler.pressure(pressure),
                duration_ms,
                steps,
            )
        })
        .await
    }

    /// Presses every point simultaneously.
    ///
    /// The contact list is validated before the session is touched, and
    /// against the daemon's announced contact count before writing, so an
    /// invalid gesture never writes anything.
    pub async fn multi_touch(
        &self,
        serial: &str,
        points: &[TouchPoint],
        duration_ms: u64,
        pressure: u32,
    ) -> Result<(), TouchError> {
        let unscaled: Vec<Contact> = points
            .iter()
            .map(|p| Contact {
                id: p.contact,
                point: RawPoint { x: 0, y: 0 },
            })
            .collect();
        validate_contacts(&unscaled)?;

        self.send_with(serial, |scaler| {
            let contacts: Vec<Contact> = points
                .iter()
                .map(|p| Contact {
                    id: p.contact,
                    point: scaler.to_raw(p.x, p.y),
                })
                .collect();
            scaler.check_contacts(&contacts)?;
            gesture::multi_touch(&contacts, scaler.pressure(pressure), duration_ms)
        })
        .await
    }

    /// Types `text` through the device's input method.
    pub async fn input_text(&self, serial: &str, text: &str) -> Result<(), TouchError> {
        if text.is_empty() {
            return Ok(());
        }
        let command = format!("input text {}", shell_quote(&text.replace(' ', "%s")));
        let output = self.bridge.shell(serial, &command).await?;
        if !output.success {
            return Err(TouchError::CommandFailed {
                step: "text input",
                detail: output.detail().to_string(),
            });
        }
        Ok(())
    }

    /// Sends an Android key event (`4`, `KEYCODE_BACK`, …).
    pub async fn key_event(&self, serial: &str, code: &str) -> Result<(), TouchError> {
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TouchError::InvalidKey(code.to_string()));
        }
        let output = self.bridge.shell(serial, &format!("input keyevent {code}")).await?;
        if !output.success {
            return Err(TouchError::CommandFailed {
                step: "key event",
                detail: output.detail().to_string(),
            });
        }
        Ok(())
    }

    /// Builds commands with the session's scaler and writes them.
    ///
    /// A failed write (or a socket the daemon already closed) triggers one
    /// reconnect to the same port.  The batch is written again only when
    /// none of it reached the old socket; after a partial write the session
    /// is still re-established but the gesture fails with
    /// [`TouchError::Interrupted`] instead of replaying downs and commits.
    async fn send_with<F>(&self, serial: &str, build: F) -> Result<(), TouchError>
    where
        F: FnOnce(&CoordinateScaler) -> Result<Vec<GestureCommand>, GestureError>,
    {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(serial)
            .ok_or_else(|| TouchError::NotConnected(serial.to_string()))?;
        let mut commands = build(&session.scaler)?;
        if commands.last() != Some(&GestureCommand::Commit) {
            commands.push(GestureCommand::Commit);
        }
        let payload = encode_commands(&commands);

        let first = if peer_closed(&session.stream) {
            Err((
                0,
                io::Error::new(io::ErrorKind::BrokenPipe, "daemon closed the socket"),
            ))
        } else {
            write_counted(&mut session.stream, payload.as_bytes()).await
        };
        if let Err((written, e)) = first {
            warn!(device = serial, written, error = %e, "touch write failed, reconnecting");
            self.reconnect(serial, session).await?;
            if written > 0 {
                return Err(TouchError::Interrupted {
                    written,
                    total: payload.len(),
                });
            }
            session.stream.write_all(payload.as_bytes()).await?;
        }
        debug!(device = serial, commands = commands.len(), "gesture sent");
        Ok(())
    }

    async fn reconnect(&self, serial: &str, session: &mut TouchSession) -> Result<(), TouchError> {
        let mut stream = self.connect_relay(session.port).await?;
        let banner = read_banner(
            &mut stream,
            self.config.handshake_timeout,
            self.config.handshake_lines,
        )
        .await?;
        if banner.capability != session.scaler.capability {
            return Err(TouchError::CapabilityChanged {
                before: session.scaler.capability,
                after: banner.capability,
            });
        }
        session.stream = stream;
        session.version = banner.version.or(session.version);
        info!(device = serial, port = session.port, "touch socket re-established");
        Ok(())
    }

    // ── Setup steps ───────────────────────────────────────────────────────────

    async fn api_level(&self, serial: &str) -> u32 {
        match self.bridge.shell(serial, "getprop ro.build.version.sdk").await {
            Ok(out) if out.success => parse_api_level(&out.stdout).unwrap_or_else(|| {
                warn!(device = serial, output = out.text(), "unreadable API level");
                0
            }),
            Ok(out) => {
                warn!(device = serial, detail = out.detail(), "API level query failed");
                0
            }
            Err(e) => {
                warn!(device = serial, error = %e, "API level query failed");
                0
            }
        }
    }

    async fn ensure_helper(&self, serial: &str) -> Result<(), TouchError> {
        let listed = self
            .bridge
            .shell(serial, &format!("pm list packages {HELPER_PACKAGE}"))
            .await?;
        if listed.success && listed.stdout.contains(HELPER_PACKAGE) {
            debug!(device = serial, "helper service already installed");
        } else {
            let apk = self.artifacts.helper_package().await?;
            let apk = apk.to_string_lossy();
            info!(device = serial, "installing helper service");
            let install = self
                .bridge
                .run(Some(serial), &["install", "-r", "-g", apk.as_ref()])
                .await?;
            if !install.success || install.stdout.contains("Failure") {
                return Err(TouchError::CommandFailed {
                    step: "helper install",
                    detail: install.detail().to_string(),
                });
            }
        }

        let start = self
            .bridge
            .shell(
                serial,
                &format!("am startservice -n {HELPER_SERVICE} -a {HELPER_START_ACTION}"),
            )
            .await?;
        if !start.success {
            warn!(device = serial, detail = start.detail(), "helper service did not start");
        }
        Ok(())
    }

    async fn resolution(&self, serial: &str) -> Result<Resolution, TouchError> {
        match self.bridge.shell(serial, "wm size").await {
            Ok(out) if out.success => {
                if let Some(res) = parse_wm_size(&out.stdout) {
                    return Ok(res);
                }
            }
            Ok(out) => debug!(device = serial, detail = out.detail(), "wm size failed"),
            Err(e) => debug!(device = serial, error = %e, "wm size failed"),
        }
        match self.bridge.shell(serial, "dumpsys display").await {
            Ok(out) if out.success => {
                parse_dumpsys_display(&out.stdout).ok_or(TouchError::ResolutionUnavailable)
            }
            _ => Err(TouchError::ResolutionUnavailable),
        }
    }

    async fn ensure_daemon(&self, serial: &str) -> Result<(), TouchError> {
        let path = &self.config.daemon_path;
        let check = self
            .bridge
            .shell(serial, &format!("test -x {path} && echo OK"))
            .await?;
        if check.text() == "OK" {
            return Ok(());
        }

        let abi = self.bridge.shell(serial, "getprop ro.product.cpu.abi").await?;
        let arch = normalize_abi(abi.text())
            .ok_or_else(|| TouchError::UnsupportedAbi(abi.text().to_string()))?;
        let local = self.artifacts.daemon_binary(arch).await?;
        let local = local.to_string_lossy();

        info!(device = serial, arch, "pushing touch daemon");
        let push = self
            .bridge
            .run(Some(serial), &["push", local.as_ref(), path.as_str()])
            .await?;
        if !push.success {
            return Err(TouchError::CommandFailed {
                step: "daemon push",
                detail: push.detail().to_string(),
            });
        }
        let chmod = self.bridge.shell(serial, &format!("chmod 755 {path}")).await?;
        if !chmod.success {
            return Err(TouchError::CommandFailed {
                step: "daemon chmod",
                detail: chmod.detail().to_string(),
            });
        }
        Ok(())
    }

    async fn kill_stale(&self, serial: &str) {
        let name = self.config.daemon_name();
        let mut killed = false;
        for lookup in [format!("pidof {name}"), format!("pgrep {name}")] {
            let out = match self.bridge.shell(serial, &lookup).await {
                Ok(out) if out.success => out,
                _ => continue,
            };
            let pids: Vec<u32> = out
                .stdout
                .split_whitespace()
                .filter_map(|p| p.parse().ok())
                .collect();
            if pids.is_empty() {
                continue;
            }
            for pid in pids {
                self.kill_pid(serial, pid).await;
            }
            killed = true;
            break;
        }
        if killed {
            time::sleep(self.config.kill_settle).await;
        }
    }

    async fn launch(&self, serial: &str) -> Result<u32, TouchError> {
        let command = format!("{} >/dev/null 2>&1 & echo $!", self.config.daemon_path);
        let out = self.bridge.shell(serial, &command).await?;
        if !out.success {
            return Err(TouchError::CommandFailed {
                step: "daemon launch",
                detail: out.detail().to_string(),
            });
        }
        let text = out.text();
        let pid = if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
            text.parse::<u32>().ok()
        } else {
            None
        };
        let pid = pid.ok_or_else(|| TouchError::DaemonLaunch(text.to_string()))?;
        time::sleep(self.config.launch_settle).await;
        Ok(pid)
    }

    /// Forwards a port, connects, and reads the banner.
    async fn open_session(
        &self,
        serial: &str,
        pid: u32,
        resolution: Resolution,
    ) -> Result<TouchSession, TouchError> {
        let port = self.reserve_port()?;
        let local = format!("tcp:{port}");
        let forward = match self
            .bridge
            .run(Some(serial), &["forward", &local, DAEMON_SOCKET])
            .await
        {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(TouchError::CommandFailed {
                step: "port forward",
                detail: out.detail().to_string(),
            }),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = forward {
            self.release_port(port);
            return Err(e);
        }

        let opened = async {
            let mut stream = self.connect_relay(port).await?;
            let banner = read_banner(
                &mut stream,
                self.config.handshake_timeout,
                self.config.handshake_lines,
            )
            .await?;
            Ok::<_, TouchError>((stream, banner))
        }
        .await;

        match opened {
            Ok((stream, banner)) => Ok(TouchSession {
                stream,
                port,
                pid,
                version: banner.version,
                scaler: CoordinateScaler::new(resolution, banner.capability),
            }),
            Err(e) => {
                self.remove_forward(serial, port).await;
                Err(e)
            }
        }
    }

    async fn connect_relay(&self, port: u16) -> Result<TcpStream, TouchError> {
        let host = self.config.relay_host.as_str();
        let attempts = self.config.connect_attempts.max(1);
        let mut last = io::Error::new(io::ErrorKind::Other, "no connection attempt made");
        for attempt in 1..=attempts {
            match time::timeout(self.config.connect_timeout, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(port, error = %e, "could not disable Nagle");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => last = e,
                Err(_) => last = io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            }
            if attempt < attempts {
                debug!(port, attempt, error = %last, "relay connect failed, retrying");
                time::sleep(self.config.connect_backoff).await;
            }
        }
        Err(TouchError::Connect { port, source: last })
    }

    // ── Teardown and ports ────────────────────────────────────────────────────

    async fn teardown(&self, serial: &str, mut session: TouchSession) {
        if let Err(e) = session.stream.shutdown().await {
            debug!(device = serial, error = %e, "touch socket shutdown");
        }
        drop(session.stream);
        self.remove_forward(serial, session.port).await;
        self.kill_pid(serial, session.pid).await;
    }

    async fn remove_forward(&self, serial: &str, port: u16) {
        let local = format!("tcp:{port}");
        match self.bridge.run(Some(serial), &["forward", "--remove", &local]).await {
            Ok(out) if !out.success => {
                debug!(device = serial, port, detail = out.detail(), "forward removal failed")
            }
            Err(e) => debug!(device = serial, port, error = %e, "forward removal failed"),
            _ => {}
        }
        self.release_port(port);
    }

    async fn kill_pid(&self, serial: &str, pid: u32) {
        if let Err(e) = self.bridge.shell(serial, &format!("kill -9 {pid}")).await {
            debug!(device = serial, pid, error = %e, "kill failed");
        }
    }

    /// Picks the first port at or above the base that no session holds and
    /// that is currently bindable on the relay host.
    fn reserve_port(&self) -> Result<u16, TouchError> {
        let start = self.config.relay_base_port;
        let end = start.saturating_add(PORT_SCAN_RANGE);
        let mut reserved = self
            .reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for port in start..end {
            if reserved.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind((self.config.relay_host.as_str(), port)).is_err() {
                continue;
            }
            reserved.insert(port);
            return Ok(port);
        }
        Err(TouchError::NoFreePort { start, end })
    }

    fn release_port(&self, port: u16) {
        self.reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    // ── Action dispatch ───────────────────────────────────────────────────────

    async fn scaler(&self, serial: &str) -> Result<CoordinateScaler, TouchError> {
        self.sessions
            .lock()
            .await
            .get(serial)
            .map(|s| s.scaler)
            .ok_or_else(|| TouchError::NotConnected(serial.to_string()))
    }

    async fn perform_one(&self, serial: &str, action: &TouchAction) -> Result<(), TouchError> {
        let cfg = &self.config;
        match action {
            TouchAction::Tap { at, duration_ms } => {
                let (x, y) = self.logical(serial, at.x, at.y).await?;
                self.tap(serial, x, y, duration_ms.unwrap_or(cfg.tap_duration_ms), cfg.pressure)
                    .await
            }
            TouchAction::LongPress { at, duration_ms } => {
                let (x, y) = self.logical(serial, at.x, at.y).await?;
                self.long_press(serial, x, y, *duration_ms, cfg.pressure).await
            }
            TouchAction::Swipe {
                from,
                to,
                duration_ms,
                steps,
            } => {
                let start = self.logical(serial, from.x, from.y).await?;
                let end = self.logical(serial, to.x, to.y).await?;
                self.swipe(
                    serial,
                    start,
                    end,
                    *duration_ms,
                    steps.unwrap_or(cfg.swipe_steps),
                    cfg.pressure,
                )
                .await
            }
            TouchAction::MultiTouch { points, duration_ms } => {
                let mut touch_points = Vec::with_capacity(points.len());
                for (i, p) in points.iter().enumerate() {
                    let (x, y) = self.logical(serial, p.x, p.y).await?;
                    touch_points.push(TouchPoint {
                        contact: u8::try_from(i).unwrap_or(u8::MAX),
                        x,
                        y,
                    });
                }
                self.multi_touch(
                    serial,
                    &touch_points,
                    duration_ms.unwrap_or(cfg.multi_touch_ms),
                    cfg.pressure,
                )
                .await
            }
            TouchAction::Text(text) => self.input_text(serial, text).await,
            TouchAction::Key(code) => self.key_event(serial, code).await,
            TouchAction::Wait(ms) => {
                time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
        }
    }

    /// Normalized point to logical pixels, with optional jitter.
    async fn logical(&self, serial: &str, nx: f64, ny: f64) -> Result<(f64, f64), TouchError> {
        let scaler = self.scaler(serial).await?;
        let (x, y) = scaler.denormalize(nx, ny);
        Ok(jitter(x, y, scaler.screen, self.config.jitter_px))
    }
}

#[async_trait]
impl TouchActuator for TouchInjectionChannel {
    async fn perform(&self, device: &Device, actions: &[TouchAction]) -> Result<(), ActuationError> {
        for action in actions {
            self.perform_one(&device.serial, action)
                .await
                .map_err(|e| match e {
                    TouchError::Gesture(_) | TouchError::InvalidKey(_) => {
                        ActuationError::Invalid(e.to_string())
                    }
                    other => ActuationError::Device(other.to_string()),
                })?;
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Reads banner lines until the capability line appears.
async fn read_banner(
    stream: &mut TcpStream,
    line_timeout: Duration,
    max_lines: usize,
) -> Result<Banner, TouchError> {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    let mut seen = 0usize;
    let mut version = None;

    while seen < max_lines {
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            seen += 1;
            debug!(line, "daemon banner");
            match parse_banner_line(line) {
                Some(BannerLine::Version(v)) => version = Some(v),
                Some(BannerLine::Capability(capability)) => {
                    return Ok(Banner {
                        version,
                        capability,
                    })
                }
                _ => {}
            }
            if seen >= max_lines {
                break;
            }
        }
        if seen >= max_lines {
            break;
        }

        let n = match time::timeout(line_timeout, stream.read(&mut chunk)).await {
            Err(_) => {
                return Err(TouchError::Handshake(
                    "timed out waiting for the capability line".into(),
                ))
            }
            Ok(Err(e)) => return Err(TouchError::Io(e)),
            Ok(Ok(0)) => {
                return Err(TouchError::Handshake(
                    "connection closed before the capability line".into(),
                ))
            }
            Ok(Ok(n)) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
    }
    Err(TouchError::Handshake(format!(
        "no capability line in the first {max_lines} lines"
    )))
}

/// Writes all of `payload`, reporting how many bytes went out before a failure.
async fn write_counted<W>(writer: &mut W, payload: &[u8]) -> Result<(), (usize, io::Error)>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]).await {
            Ok(0) => return Err((written, io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) => return Err((written, e)),
        }
    }
    Ok(())
}

/// `true` when the daemon has already closed its end of the socket.
///
/// The daemon never writes after the banner, so readable EOF (or a reset)
/// means the peer is gone.  Stray bytes are discarded.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match stream.try_read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

fn jitter(x: f64, y: f64, screen: Resolution, px: u32) -> (f64, f64) {
    if px == 0 {
        return (x, y);
    }
    let mut rng = rand::thread_rng();
    let span = i64::from(px);
    let dx = rng.gen_range(-span..=span) as f64;
    let dy = rng.gen_range(-span..=span) as f64;
    let max_x = f64::from(screen.width.saturating_sub(1));
    let max_y = f64::from(screen.height.saturating_sub(1));
    ((x + dx).clamp(0.0, max_x), (y + dy).clamp(0.0, max_y))
}

/// Single-quotes `s` for the device shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
