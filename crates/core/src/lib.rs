//! `stockbridge-core`: shared foundation for the sync orchestration core.
//!
//! This crate contains the **pure domain** pieces: typed identifiers, the
//! error taxonomy used to classify upstream failures, and the settings
//! contract the orchestration layer reads at job start. No runtime or
//! storage concerns live here.

pub mod error;
pub mod id;
pub mod settings;

pub use error::{ErrorKind, SyncError, SyncResult};
pub use id::{JobId, LockToken, OutcomeId, ResourceId};
pub use settings::{ApiCredentials, Settings, SettingsProvider, StaticSettings};
