use crate::api::{CodexApi, PROBE_TIMEOUT};
use crate::task::PeriodicTask;
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Steady-state polling cadence of the health endpoint.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
	Unknown,
	Found,
	NotFound,
}

impl fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionStatus::Unknown => f.write_str("Unknown"),
			ConnectionStatus::Found => f.write_str("Found"),
			ConnectionStatus::NotFound => f.write_str("Not Found"),
		}
	}
}

/// `Found` only for a 200 from the health endpoint; every failure folds to
/// `NotFound`.
pub async fn probe(api: &CodexApi, timeout: Duration) -> ConnectionStatus {
	match api.health(timeout).await {
		Ok(StatusCode::OK) => ConnectionStatus::Found,
		Ok(status) => {
			log::debug!("health probe {} answered {status}", api.base());
			ConnectionStatus::NotFound
		}
		Err(err) => {
			log::debug!("health probe {} failed: {err}", api.base());
			ConnectionStatus::NotFound
		}
	}
}

/// Polls the daemon API regardless of who started the daemon.
pub struct ConnectionMonitor {
	api: RwLock<CodexApi>,
	timeout: Duration,
	status: watch::Sender<ConnectionStatus>,
}

impl ConnectionMonitor {
	pub fn new(api: CodexApi) -> Self {
		let (status, _) = watch::channel(ConnectionStatus::Unknown);
		Self {
			api: RwLock::new(api),
			timeout: PROBE_TIMEOUT,
			status,
		}
	}

	pub fn status(&self) -> ConnectionStatus {
		*self.status.borrow()
	}

	pub fn is_connected(&self) -> bool {
		self.status() == ConnectionStatus::Found
	}

	pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
		self.status.subscribe()
	}

	/// Points the monitor at a different API; the next probe uses it.
	pub fn set_api(&self, api: CodexApi) {
		match self.api.write() {
			Ok(mut current) => *current = api,
			Err(err) => log::error!("monitor api lock poisoned: {err}"),
		}
	}

	fn api(&self) -> Option<CodexApi> {
		self.api.read().ok().map(|api| api.clone())
	}

	pub async fn check_now(&self) -> ConnectionStatus {
		let next = match self.api() {
			Some(api) => probe(&api, self.timeout).await,
			None => ConnectionStatus::NotFound,
		};
		let changed = self.status.send_if_modified(|status| {
			if *status != next {
				*status = next;
				true
			} else {
				false
			}
		});
		if changed {
			log::info!("codex connection: {next}");
		}
		next
	}

	/// Probes once right away, then every `interval` until the returned task
	/// is cancelled or the monitor is dropped.
	pub fn spawn(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
		let first = Arc::downgrade(self);
		tokio::spawn(async move {
			if let Some(monitor) = first.upgrade() {
				monitor.check_now().await;
			}
		});
		let weak = Arc::downgrade(self);
		PeriodicTask::spawn("connection monitor", interval, move || {
			let weak = weak.clone();
			async move {
				match weak.upgrade() {
					Some(monitor) => {
						monitor.check_now().await;
						true
					}
					None => false,
				}
			}
		})
	}
}
