//! Lifecycle of the codex daemon process.
//!
//! One supervisor owns at most one child. Start and stop take the same
//! control lock, so a start never overlaps a stop that is still cleaning up.

use crate::config::CodexConfig;
use crate::error::{CodexError, CodexResult};
use crate::process::{DaemonChild, ProcessBackend};
use crate::task::PeriodicTask;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};

pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

pub const MSG_NO_DIRECTORY: &str = "Please select a data directory first.";
pub const MSG_STARTING: &str = "Starting Codex...";
pub const MSG_STRAYS_KILLED: &str = "Existing Codex processes killed successfully.";
pub const MSG_STARTED: &str = "Codex started successfully and running in background...";
pub const MSG_DIED: &str = "Codex process is no longer running";
pub const MSG_KILLING: &str = "Killing Codex process...";
pub const MSG_KILLED: &str = "Codex process killed successfully.";
pub const MSG_FOUND_EXISTING: &str =
	"Found existing Codex processes. Use 'Kill Codex' to stop them.";
pub const MSG_NONE_EXISTING: &str = "No existing Codex processes found.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
	/// Latest human readable status line.
	pub output: String,
	pub is_starting: bool,
	pub running: bool,
	pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
	Alive,
	Died,
	NoProcess,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
	pub binary: PathBuf,
	pub process_name: String,
	pub bootstrap_nodes: Vec<String>,
	pub settle_delay: Duration,
	pub liveness_interval: Duration,
}

struct Slot {
	child: Option<Box<dyn DaemonChild>>,
	liveness: Option<PeriodicTask>,
}

struct Shared {
	slot: Mutex<Slot>,
	status: watch::Sender<SupervisorStatus>,
}

impl Shared {
	fn update(&self, apply: impl FnOnce(&mut SupervisorStatus)) {
		self.status.send_modify(apply);
	}

	fn report(&self, output: impl Into<String>) {
		let output = output.into();
		log::info!("{output}");
		self.update(|status| status.output = output);
	}

	async fn check(&self) -> Liveness {
		let mut slot = self.slot.lock().await;
		let Some(child) = slot.child.as_mut() else {
			return Liveness::NoProcess;
		};
		if child.is_alive() {
			return Liveness::Alive;
		}
		let tail = child.recent_output();
		slot.child = None;
		if let Some(task) = slot.liveness.take() {
			task.cancel();
		}
		drop(slot);
		let mut output = String::from(MSG_DIED);
		if !tail.is_empty() {
			output.push('\n');
			output.push_str(&tail.join("\n"));
		}
		log::warn!("{MSG_DIED}");
		self.update(|status| {
			status.output = output;
			status.running = false;
			status.pid = None;
		});
		Liveness::Died
	}
}

pub struct Supervisor {
	backend: Arc<dyn ProcessBackend>,
	options: SupervisorOptions,
	shared: Arc<Shared>,
	control: Mutex<()>,
	torn_down: AtomicBool,
	shutdown_done: AtomicBool,
}

impl Supervisor {
	pub fn new(backend: Arc<dyn ProcessBackend>, options: SupervisorOptions) -> Self {
		let (status, _) = watch::channel(SupervisorStatus::default());
		Self {
			backend,
			options,
			shared: Arc::new(Shared {
				slot: Mutex::new(Slot {
					child: None,
					liveness: None,
				}),
				status,
			}),
			control: Mutex::new(()),
			torn_down: AtomicBool::new(false),
			shutdown_done: AtomicBool::new(false),
		}
	}

	pub fn status(&self) -> SupervisorStatus {
		self.shared.status.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
		self.shared.status.subscribe()
	}

	pub async fn is_running(&self) -> bool {
		self.shared.slot.lock().await.child.is_some()
	}

	/// Best effort `pkill -f`, falling back to `killall`. Never fails.
	async fn kill_strays(&self) {
		let name = self.options.process_name.clone();
		let pkill = self
			.backend
			.execute("pkill", &[String::from("-f"), name.clone()])
			.await;
		if let Err(pkill_err) = pkill {
			log::debug!("pkill failed: {pkill_err}");
			if let Err(killall_err) = self.backend.execute("killall", &[name]).await {
				log::debug!("killall failed: {killall_err}");
				log::info!("No existing Codex processes found or already killed");
			}
		}
	}

	/// Kills strays, waits for their sockets to be released and launches a
	/// fresh daemon. Returns the pid of the new process when the platform
	/// reports one.
	pub async fn start(&self, config: &CodexConfig) -> CodexResult<Option<u32>> {
		let _control = self.control.lock().await;
		if self.torn_down.load(Ordering::SeqCst) {
			return Err(CodexError::StartFailure(String::from("supervisor is shut down")));
		}
		if !config.is_directory_set() {
			self.shared.report(MSG_NO_DIRECTORY);
			return Err(CodexError::StartFailure(String::from(MSG_NO_DIRECTORY)));
		}
		let args = config.daemon_args(&self.options.bootstrap_nodes)?;

		self.shared.update(|status| status.is_starting = true);
		self.shared.report(MSG_STARTING);

		self.kill_strays().await;
		tokio::time::sleep(self.options.settle_delay).await;
		self.shared.report(MSG_STRAYS_KILLED);

		let spawned = self.backend.spawn(&self.options.binary, &args).await;
		let mut child = match spawned {
			Ok(child) => child,
			Err(err) => {
				let message = format!("Error starting Codex: {err}");
				self.shared.update(|status| status.is_starting = false);
				self.shared.report(message.clone());
				return Err(CodexError::StartFailure(err.to_string()));
			}
		};

		let pid = child.id();
		{
			let mut slot = self.shared.slot.lock().await;
			// Checked under the slot lock: shutdown sets the flag before it
			// takes this lock to release the child.
			if self.torn_down.load(Ordering::SeqCst) {
				drop(slot);
				log::warn!("session shut down while starting codex, killing new process");
				if let Err(err) = child.kill().await {
					log::error!("failed to kill codex after teardown: {err}");
				}
				self.shared.update(|status| status.is_starting = false);
				return Err(CodexError::StartFailure(String::from(
					"session shut down during start",
				)));
			}
			if let Some(mut previous) = slot.child.take() {
				if let Err(err) = previous.kill().await {
					log::warn!("failed to kill previous codex handle: {err}");
				}
			}
			if let Some(task) = slot.liveness.take() {
				task.cancel();
			}
			slot.child = Some(child);
			let shared = Arc::downgrade(&self.shared);
			slot.liveness = Some(PeriodicTask::spawn(
				"codex liveness",
				self.options.liveness_interval,
				move || {
					let shared = shared.clone();
					async move {
						match shared.upgrade() {
							Some(shared) => shared.check().await == Liveness::Alive,
							None => false,
						}
					}
				},
			));
		}
		self.shared.update(|status| {
			status.is_starting = false;
			status.running = true;
			status.pid = pid;
		});
		self.shared.report(MSG_STARTED);
		Ok(pid)
	}

	/// Kills strays by name and the tracked child, if any. Stopping a daemon
	/// that is not running is not an error.
	pub async fn stop(&self) {
		let _control = self.control.lock().await;
		self.shared.report(MSG_KILLING);
		self.kill_strays().await;
		let failure = self.release_child().await;
		self.shared.update(|status| {
			status.is_starting = false;
			status.running = false;
			status.pid = None;
		});
		match failure {
			Some(err) => self.shared.report(format!("Error killing Codex process: {err}")),
			None => self.shared.report(MSG_KILLED),
		}
	}

	async fn release_child(&self) -> Option<std::io::Error> {
		let mut slot = self.shared.slot.lock().await;
		if let Some(task) = slot.liveness.take() {
			task.cancel();
		}
		let mut child = slot.child.take()?;
		child.kill().await.err()
	}

	/// One liveness probe of the tracked child.
	pub async fn check_liveness(&self) -> Liveness {
		self.shared.check().await
	}

	/// Scans the process table for a daemon started outside this session.
	/// Informational only.
	pub fn list_existing_processes(&self) -> String {
		let found = self.backend.list_by_name(&self.options.process_name);
		if found.is_empty() {
			String::from(MSG_NONE_EXISTING)
		} else {
			for process in &found {
				log::info!("existing codex process {} ({})", process.pid, process.name);
			}
			String::from(MSG_FOUND_EXISTING)
		}
	}

	/// Application exit hook. Kills the held child exactly once, tolerating
	/// errors; later calls do nothing.
	pub async fn shutdown(&self) {
		self.torn_down.store(true, Ordering::SeqCst);
		if self.shutdown_done.swap(true, Ordering::SeqCst) {
			return;
		}
		match self.release_child().await {
			Some(err) => log::error!("Error terminating codex process: {err}"),
			None => log::info!("Codex process terminated"),
		}
		self.shared.update(|status| {
			status.running = false;
			status.pid = None;
		});
	}
}
