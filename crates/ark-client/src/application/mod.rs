//! Application layer use cases for the client.
//!
//! # What use cases does the client have?
//!
//! - **`automate`** – The [`automate::AutomationEngine`]: a cancellable worker
//!   that walks the task queue, sampling the screen, exchanging requests with
//!   the service, and replaying touch actions.  Every collaborator it needs is
//!   a trait defined here and injected at construction time.
//!
//! - **`authenticate`** – Registration, login with a stored credential,
//!   automatic login from cached credentials, and the single
//!   re-authentication the engine performs when a session expires.
//!
//! - **`catalog`** – Fetching the default task catalogue and checking the
//!   published client version.
//!
//! **Dependency rule**: nothing in this layer imports `crate::infrastructure`.

pub mod authenticate;
pub mod automate;
pub mod catalog;
