pub mod client;
pub mod machine;
pub mod reconcile;

pub use client::{load_last_snapshot, SyncClient, SyncConfig, SyncError, SyncHandle, SyncUpdate};
pub use machine::{ConnectionState, ReconnectPolicy};
pub use reconcile::{reconcile, PresentationStatus, ReconciledState};
