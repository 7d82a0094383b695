//! Domain entities for the automation client.
//!
//! This module contains pure business logic with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of the application is the **domain**.  Domain code has
//! no imports from device bridges, sockets, or file systems and can be tested
//! in isolation.  Outer layers (the engine, the touch channel, storage) depend
//! on the domain, never the other way around.

/// Server-issued touch actions in normalized screen coordinates.
pub mod action;
/// Authenticated sessions and stored credentials.
pub mod auth;
/// Devices reported by the device bridge.
pub mod device;
/// Raw touch-daemon commands, capability negotiation, and coordinate scaling.
pub mod gesture;
/// Task definitions, task instances, and the task queue.
pub mod task;
