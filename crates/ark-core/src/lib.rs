//! # ark-core
//!
//! Shared library for the Arknights automation client containing the secure
//! channel wire format, the token cipher, touch gesture encoding, and the
//! task-queue model.
//!
//! It has zero dependencies on OS APIs, device bridges, or network sockets, so
//! everything here can be tested on any machine without a phone attached.
//!
//! # Architecture overview (for beginners)
//!
//! The client drives an Android device on behalf of a remote inference
//! service.  In a loop it grabs a screenshot, sends it to the service, and
//! replays the touch actions the service answers with.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel to the remote service.  A JSON
//!   envelope is encrypted by [`protocol::cipher::TokenCipher`] and wrapped in
//!   a 9-byte `ARKS` frame header.
//!
//! - **`domain`** – Pure business logic: devices, touch gestures in the
//!   daemon's raw coordinate space, server-issued touch actions, task
//!   definitions and the task queue, and authentication credentials.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ark_core::TaskQueue` instead of `ark_core::domain::task::TaskQueue`.
pub use domain::action::{ActionError, TouchAction};
pub use domain::auth::{AuthSession, Credential, CredentialError};
pub use domain::device::{Device, DeviceState, Resolution};
pub use domain::gesture::{DaemonCapability, GestureCommand, GestureError, MAX_CONTACTS};
pub use domain::task::{TaskDefinition, TaskError, TaskInstance, TaskQueue, VariableSpec};
pub use protocol::cipher::{CipherError, TokenCipher};
pub use protocol::envelope::{ErrorKind, RequestEnvelope, ResponseStatus, ServerResponse};
pub use protocol::frame::{decode_frame, encode_frame, FrameError, FrameHeader};
