//! ark-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does ark-client do? (for beginners)
//!
//! The client plays a mobile game on an Android device on behalf of a remote
//! inference service.  For every task in the queue it:
//!
//! 1. Samples the device screen through the device bridge (`adb`).
//! 2. Sends the frame, the task id and its variables to the service over an
//!    encrypted, length-framed TCP exchange.
//! 3. Replays the touch actions the service answers with through a touch
//!    daemon running on the device, scaled into the daemon's raw coordinate
//!    space.
//! 4. Moves on once the service reports the task complete.

/// Application layer: the automation engine, authentication, and catalogue use cases.
pub mod application;

/// Infrastructure layer: device bridge, touch daemon, screen sampling, network, and storage.
pub mod infrastructure;
