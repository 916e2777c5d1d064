pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod monitor;
pub mod process;
pub mod reconciler;
pub mod recent;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod task;
pub mod transfer;
pub mod validation;

#[cfg(test)]
mod testing;

pub use api::{CodexApi, NodeFile, NodeSummary, RemoteManifest, StreamSource};
pub use config::{CodexConfig, ConfigManager, PortKind};
pub use error::{CodexError, CodexResult};
pub use monitor::{ConnectionMonitor, ConnectionStatus};
pub use reconciler::{EffectiveStatus, StatusReconciler};
pub use recent::{RecentItem, RecentLedger, RecentOrigin};
pub use session::{Session, SessionOptions};
pub use supervisor::{Supervisor, SupervisorStatus};
pub use transfer::{
	DownloadEvent, DownloadProgress, DownloadState, TransferItem, TransferStatus, TransferTracker,
};
