//! Infrastructure layer for the client application.
//!
//! Contains the adapters that talk to the outside world: the `adb` command
//! bridge, the touch daemon socket, screen capture, the encrypted TCP channel
//! to the remote service, and on-disk state.
//!
//! **Dependency rule**: this layer may depend on `application` and `ark_core`,
//! but MUST NOT be imported by the `application` or domain layers.
//!
//! # Sub-modules
//!
//! - **`device_bridge`** – runs `adb` with a timeout, discovers devices, and
//!   remembers the last one used.  A scripted bridge is provided for tests.
//!
//! - **`touch`** – deploys and drives the touch daemon on each device and
//!   implements `TouchActuator`.
//!
//! - **`screen`** – captures, downscales, and JPEG-encodes screenshots;
//!   implements `ScreenSampler`.
//!
//! - **`network`** – the `SecureChannel`: one encrypted request/response per
//!   TCP connection; implements `RequestExchanger`.
//!
//! - **`storage`** – TOML configuration, credential files, and JSON state
//!   files in the cache directory.

pub mod device_bridge;
pub mod network;
pub mod screen;
pub mod storage;
pub mod touch;
