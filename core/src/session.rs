//! The owned application session. Every component is built once here and
//! torn down through [`Session::shutdown`].

use crate::api::{CodexApi, NodeFile, NodeSummary, RemoteManifest};
use crate::clock::{Clock, SystemClock};
use crate::config::{BOOTSTRAP_NODE, CodexConfig, ConfigManager, DAEMON_PROCESS_NAME, PortKind};
use crate::error::{CodexError, CodexResult};
use crate::monitor::{ConnectionMonitor, POLL_INTERVAL};
use crate::process::{ProcessBackend, SystemProcessBackend, resolve_daemon_binary};
use crate::reconciler::{EffectiveStatus, StatusReconciler};
use crate::recent::RecentLedger;
use crate::settings::{JsonFileStore, SettingsStore, default_settings_path, home_dir};
use crate::supervisor::{LIVENESS_INTERVAL, SETTLE_DELAY, Supervisor, SupervisorOptions};
use crate::task::PeriodicTask;
use crate::transfer::{DownloadProgress, TransferItem, TransferTracker};
use crate::validation::validate_port_input;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionOptions {
	pub binary: PathBuf,
	pub process_name: String,
	pub bootstrap_nodes: Vec<String>,
	pub settle_delay: Duration,
	pub liveness_interval: Duration,
	pub poll_interval: Duration,
	pub default_download_dir: PathBuf,
	/// Api port for this run only; never persisted.
	pub api_port: Option<String>,
}

impl SessionOptions {
	pub fn from_env() -> anyhow::Result<Self> {
		Ok(Self {
			binary: resolve_daemon_binary(DAEMON_PROCESS_NAME),
			process_name: DAEMON_PROCESS_NAME.to_string(),
			bootstrap_nodes: vec![BOOTSTRAP_NODE.to_string()],
			settle_delay: SETTLE_DELAY,
			liveness_interval: LIVENESS_INTERVAL,
			poll_interval: POLL_INTERVAL,
			default_download_dir: home_dir()?.join("Downloads"),
			api_port: None,
		})
	}
}

pub struct Session {
	config: Mutex<ConfigManager>,
	api_port_override: Mutex<Option<String>>,
	api: RwLock<CodexApi>,
	supervisor: Supervisor,
	monitor: Arc<ConnectionMonitor>,
	reconciler: StatusReconciler,
	transfers: Arc<TransferTracker>,
	recent: Arc<RecentLedger>,
	monitor_task: Mutex<Option<PeriodicTask>>,
	poll_interval: Duration,
	shut_down: AtomicBool,
}

impl Session {
	/// Opens the settings file (default location when `settings_path` is
	/// `None`) and wires the session against the real OS and clock.
	pub fn open(settings_path: Option<PathBuf>, options: SessionOptions) -> anyhow::Result<Self> {
		let path = match settings_path {
			Some(path) => path,
			None => default_settings_path()?,
		};
		let store = JsonFileStore::open(&path)
			.with_context(|| format!("failed to open settings {}", path.display()))?;
		log::debug!("settings loaded from {}", store.path().display());
		Ok(Self::with_parts(
			Arc::new(store),
			Arc::new(SystemProcessBackend::new()),
			Arc::new(SystemClock),
			options,
		))
	}

	pub fn with_parts(
		store: Arc<dyn SettingsStore>,
		backend: Arc<dyn ProcessBackend>,
		clock: Arc<dyn Clock>,
		options: SessionOptions,
	) -> Self {
		let manager = ConfigManager::load(store.clone(), options.default_download_dir.clone());
		let api_port_override = options.api_port.as_deref().and_then(|port| {
			let valid = validate_port_input(port);
			if valid.is_none() {
				log::warn!("ignoring invalid api port override {port:?}");
			}
			valid
		});
		let api_port = api_port_override
			.clone()
			.unwrap_or_else(|| manager.config().api_port.clone());
		let api = CodexApi::for_port(&api_port);
		let recent = Arc::new(RecentLedger::load(store, clock.clone()));
		let supervisor = Supervisor::new(
			backend,
			SupervisorOptions {
				binary: options.binary,
				process_name: options.process_name,
				bootstrap_nodes: options.bootstrap_nodes,
				settle_delay: options.settle_delay,
				liveness_interval: options.liveness_interval,
			},
		);
		Self {
			config: Mutex::new(manager),
			api_port_override: Mutex::new(api_port_override),
			monitor: Arc::new(ConnectionMonitor::new(api.clone())),
			transfers: Arc::new(TransferTracker::new(api.clone(), recent.clone())),
			api: RwLock::new(api),
			supervisor,
			reconciler: StatusReconciler::new(clock),
			recent,
			monitor_task: Mutex::new(None),
			poll_interval: options.poll_interval,
			shut_down: AtomicBool::new(false),
		}
	}

	fn manager<R>(
		&self,
		apply: impl FnOnce(&mut ConfigManager) -> CodexResult<R>,
	) -> CodexResult<R> {
		let mut manager = self
			.config
			.lock()
			.map_err(|err| CodexError::Settings(format!("config lock poisoned: {err}")))?;
		apply(&mut manager)
	}

	/// Persisted configuration with the per-run api port applied.
	pub fn config(&self) -> CodexResult<CodexConfig> {
		let mut config = self.manager(|manager| Ok(manager.config().clone()))?;
		if let Ok(Some(port)) = self.api_port_override.lock().map(|port| port.clone()) {
			config.api_port = port;
		}
		Ok(config)
	}

	pub fn download_directory(&self) -> CodexResult<PathBuf> {
		self.manager(|manager| Ok(manager.current_download_directory()))
	}

	pub fn custom_download_directory(&self) -> CodexResult<Option<PathBuf>> {
		self.manager(|manager| Ok(manager.custom_download_directory().map(Path::to_path_buf)))
	}

	pub fn select_data_directory(&self, path: impl AsRef<Path>) -> CodexResult<()> {
		self.manager(|manager| manager.select_data_directory(path))
	}

	pub fn clear_data_directory(&self) -> CodexResult<()> {
		self.manager(|manager| manager.clear_data_directory())
	}

	pub fn select_download_directory(&self, path: impl AsRef<Path>) -> CodexResult<()> {
		self.manager(|manager| manager.select_download_directory(path))
	}

	pub fn reset_download_directory(&self) -> CodexResult<()> {
		self.manager(|manager| manager.reset_download_directory())
	}

	/// Validates and persists a port. A new api port replaces any per-run
	/// override and is picked up by the monitor and transfers right away.
	pub fn set_port(&self, kind: PortKind, value: &str) -> CodexResult<()> {
		self.manager(|manager| manager.set_port(kind, value))?;
		if kind == PortKind::Api {
			if let Ok(mut port) = self.api_port_override.lock() {
				*port = None;
			}
			let port = self.config()?.api_port;
			self.point_api_at(&port);
		}
		Ok(())
	}

	fn point_api_at(&self, port: &str) {
		let api = match self.api.write() {
			Ok(mut current) => {
				*current = current.with_port(port);
				current.clone()
			}
			Err(err) => {
				log::error!("session api lock poisoned: {err}");
				return;
			}
		};
		log::info!("codex api now at {}", api.base());
		self.monitor.set_api(api.clone());
		self.transfers.set_api(api);
	}

	pub fn api(&self) -> CodexResult<CodexApi> {
		self.api
			.read()
			.map(|api| api.clone())
			.map_err(|err| CodexError::Settings(format!("api lock poisoned: {err}")))
	}

	pub fn supervisor(&self) -> &Supervisor {
		&self.supervisor
	}

	pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
		&self.monitor
	}

	pub fn transfers(&self) -> &Arc<TransferTracker> {
		&self.transfers
	}

	pub fn recent(&self) -> &Arc<RecentLedger> {
		&self.recent
	}

	pub async fn start_daemon(&self) -> CodexResult<Option<u32>> {
		let config = self.config()?;
		self.reconciler.on_user_start();
		self.supervisor.start(&config).await
	}

	/// Stops the daemon. The connection reads as lost until the override
	/// expires, whatever the monitor last saw.
	pub async fn stop_daemon(&self) {
		self.reconciler.on_user_stop();
		self.supervisor.stop().await;
	}

	pub fn effective_status(&self) -> EffectiveStatus {
		self.reconciler.effective_status(self.monitor.status())
	}

	pub async fn refresh_status(&self) -> EffectiveStatus {
		let observed = self.monitor.check_now().await;
		self.reconciler.effective_status(observed)
	}

	pub fn start_monitoring(&self) {
		let Ok(mut task) = self.monitor_task.lock() else {
			return;
		};
		if task.as_ref().is_some_and(|task| task.is_alive()) {
			return;
		}
		*task = Some(self.monitor.spawn(self.poll_interval));
	}

	pub fn stop_monitoring(&self) {
		if let Ok(mut task) = self.monitor_task.lock() {
			if let Some(task) = task.take() {
				task.cancel();
			}
		}
	}

	pub async fn upload_files(&self, paths: &[PathBuf]) -> Vec<TransferItem> {
		self.transfers.upload_all(paths).await
	}

	pub fn download(&self, cid: &str, filename: Option<String>) -> CodexResult<DownloadProgress> {
		Ok(self.transfers.download(cid, filename, self.download_directory()?))
	}

	pub fn leech(&self, cid: &str) -> CodexResult<DownloadProgress> {
		Ok(self.transfers.leech(cid, self.download_directory()?))
	}

	pub async fn seed(&self, cid: &str) -> CodexResult<()> {
		self.transfers.seed(cid).await
	}

	pub fn seed_then_download(&self, cid: &str) -> CodexResult<DownloadProgress> {
		Ok(self.transfers.seed_then_download(cid, self.download_directory()?))
	}

	pub async fn node_files(&self) -> CodexResult<Vec<NodeFile>> {
		self.api()?.list_data().await
	}

	pub async fn node_summary(&self) -> CodexResult<NodeSummary> {
		Ok(NodeSummary::of(&self.node_files().await?))
	}

	pub async fn manifest(&self, cid: &str) -> CodexResult<RemoteManifest> {
		self.api()?.manifest(cid).await
	}

	/// Exit hook. Stops polling and kills the daemon this session started;
	/// later calls do nothing.
	pub async fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}
		log::info!("shutting down session");
		self.stop_monitoring();
		self.supervisor.shutdown().await;
	}

	/// Reports daemons left over from earlier runs, starts one when a data
	/// directory is configured, and watches the connection until Ctrl+C.
	pub async fn run_until_shutdown(&self) {
		log::info!("{}", self.supervisor.list_existing_processes());
		match self.config() {
			Ok(config) if config.is_directory_set() => {
				if let Err(err) = self.start_daemon().await {
					log::error!("failed to start codex: {err}");
				}
			}
			Ok(_) => log::warn!("no data directory selected, not starting codex"),
			Err(err) => log::error!("failed to read config: {err}"),
		}
		self.start_monitoring();

		let mut connection = self.monitor.subscribe();
		let mut shown = self.effective_status();
		loop {
			tokio::select! {
				res = tokio::signal::ctrl_c() => {
					if let Err(err) = res {
						log::error!("failed to listen for ctrl_c: {err}");
					}
					log::info!("interrupt received, shutting down");
					break;
				}
				changed = connection.changed() => {
					if changed.is_err() {
						break;
					}
					let status = self.effective_status();
					if status != shown {
						log::info!("Codex status: {status}");
						shown = status;
					}
				}
			}
		}
		self.shutdown().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;
	use crate::reconciler::OVERRIDE_TTL;
	use crate::settings::{KEY_API_PORT, KEY_DATA_DIRECTORY, MemoryStore};
	use crate::testing::{FakeDaemon, FakeProcessBackend};

	struct Harness {
		daemon: FakeDaemon,
		store: Arc<MemoryStore>,
		clock: Arc<ManualClock>,
		backend: Arc<FakeProcessBackend>,
		downloads: tempfile::TempDir,
	}

	impl Harness {
		async fn new() -> Self {
			let daemon = FakeDaemon::start().await;
			let store = Arc::new(MemoryStore::new());
			store.set(KEY_API_PORT, &daemon.port().to_string()).unwrap();
			store.set(KEY_DATA_DIRECTORY, "/data").unwrap();
			Self {
				daemon,
				store,
				clock: Arc::new(ManualClock::new(1_700_000_000_000)),
				backend: Arc::new(FakeProcessBackend::new()),
				downloads: tempfile::tempdir().unwrap(),
			}
		}

		fn options(&self) -> SessionOptions {
			SessionOptions {
				binary: PathBuf::from("codexdesktop"),
				process_name: DAEMON_PROCESS_NAME.to_string(),
				bootstrap_nodes: Vec::new(),
				settle_delay: Duration::ZERO,
				liveness_interval: LIVENESS_INTERVAL,
				poll_interval: POLL_INTERVAL,
				default_download_dir: self.downloads.path().to_path_buf(),
				api_port: None,
			}
		}

		fn session(&self) -> Session {
			Session::with_parts(
				self.store.clone(),
				self.backend.clone(),
				self.clock.clone(),
				self.options(),
			)
		}
	}

	#[tokio::test]
	async fn stop_masks_stale_found_until_override_expires() {
		let h = Harness::new().await;
		let session = h.session();
		assert_eq!(session.refresh_status().await, EffectiveStatus::Found);

		session.stop_daemon().await;
		assert_eq!(
			session.refresh_status().await,
			EffectiveStatus::ForcedDisconnected
		);
		h.clock.advance(OVERRIDE_TTL);
		assert_eq!(session.refresh_status().await, EffectiveStatus::Found);
	}

	#[tokio::test]
	async fn start_clears_stop_override() {
		let h = Harness::new().await;
		let session = h.session();
		session.stop_daemon().await;
		assert_eq!(session.start_daemon().await.unwrap(), Some(1000));
		assert_eq!(session.refresh_status().await, EffectiveStatus::Found);
		assert!(session.supervisor().status().running);
	}

	#[tokio::test]
	async fn api_port_change_reaches_monitor() {
		let h = Harness::new().await;
		h.store
			.set(KEY_API_PORT, &h.daemon.closed_port().to_string())
			.unwrap();
		let session = h.session();
		assert_eq!(session.refresh_status().await, EffectiveStatus::NotFound);

		session
			.set_port(PortKind::Api, &h.daemon.port().to_string())
			.unwrap();
		assert_eq!(session.refresh_status().await, EffectiveStatus::Found);
		assert_eq!(h.store.get(KEY_API_PORT), Some(h.daemon.port().to_string()));
		assert!(session.set_port(PortKind::Api, "0").is_err());
	}

	#[tokio::test]
	async fn api_port_override_is_not_persisted() {
		let h = Harness::new().await;
		let mut options = h.options();
		options.api_port = Some(String::from("9999"));
		let session =
			Session::with_parts(h.store.clone(), h.backend.clone(), h.clock.clone(), options);
		assert_eq!(session.config().unwrap().api_port, "9999");
		assert_eq!(h.store.get(KEY_API_PORT), Some(h.daemon.port().to_string()));
	}

	#[tokio::test]
	async fn shutdown_kills_daemon_once() {
		let h = Harness::new().await;
		let session = h.session();
		session.start_daemon().await.unwrap();
		session.start_monitoring();
		session.shutdown().await;
		session.shutdown().await;
		assert_eq!(h.backend.child(0).kills(), 1);
		assert!(!session.supervisor().is_running().await);
	}

	#[tokio::test]
	async fn uploads_are_listed_and_remembered() {
		let h = Harness::new().await;
		let session = h.session();
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("notes.md");
		std::fs::write(&path, "# notes").unwrap();

		let items = session.upload_files(&[path]).await;
		assert!(items[0].content_id.is_some());
		let summary = session.node_summary().await.unwrap();
		assert_eq!(summary.file_count, 1);
		assert_eq!(summary.total_size, 7);
		assert_eq!(session.recent().list()[0].name, "notes.md");
	}

	#[tokio::test]
	async fn downloads_land_in_configured_directory() {
		let h = Harness::new().await;
		h.daemon.add_content("zdj7Wdoc", "doc.txt", b"contents".to_vec());
		let session = h.session();

		let saved = session.download("zdj7Wdoc", None).unwrap().finish().await.unwrap();
		assert_eq!(saved.parent(), Some(h.downloads.path()));

		let custom = tempfile::tempdir().unwrap();
		session.select_download_directory(custom.path()).unwrap();
		let saved = session.leech("zdj7Wdoc").unwrap().finish().await.unwrap();
		assert_eq!(saved.parent(), Some(custom.path()));
	}
}
