//! Persistent storage: TOML configuration, credential files, and JSON state.

pub mod config;
pub mod credentials;
pub mod state;

pub use config::{AppConfig, ConfigError};
pub use credentials::FileCredentialVault;
pub use state::{StateStore, StorageError};
