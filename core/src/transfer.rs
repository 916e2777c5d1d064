//! Uploads and downloads against the daemon's content API.
//!
//! Upload items move strictly Pending -> InFlight -> Succeeded|Failed and are
//! only touched through `TransferTracker::transition`. Downloads report
//! progress over a stream and are keyed by content id.

use crate::api::{CodexApi, StreamSource};
use crate::error::{CodexError, CodexResult};
use crate::format::format_bytes;
use crate::recent::{NewRecentItem, RecentLedger, RecentOrigin};
use crate::validation::sanitize_file_name;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
	Pending,
	InFlight,
	Succeeded,
	Failed,
}

impl TransferStatus {
	fn can_move_to(self, next: TransferStatus) -> bool {
		matches!(
			(self, next),
			(TransferStatus::Pending, TransferStatus::InFlight)
				| (TransferStatus::InFlight, TransferStatus::Succeeded)
				| (TransferStatus::InFlight, TransferStatus::Failed)
		)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, TransferStatus::Succeeded | TransferStatus::Failed)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferItem {
	pub id: String,
	pub name: String,
	pub size: u64,
	pub mime_type: String,
	pub status: TransferStatus,
	pub content_id: Option<String>,
	pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DownloadState {
	Downloading { progress: u8 },
	Completed { path: PathBuf },
	Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
	/// Phase one of seed-then-download.
	Seeding,
	Seeded,
	Progress(u8),
	Completed(PathBuf),
	Failed(String),
}

/// Progress of one download. Yields events until the transfer ends; `finish`
/// resolves to the saved path.
pub struct DownloadProgress {
	events: mpsc::UnboundedReceiver<DownloadEvent>,
	handle: JoinHandle<CodexResult<PathBuf>>,
}

impl DownloadProgress {
	pub async fn finish(self) -> CodexResult<PathBuf> {
		match self.handle.await {
			Ok(result) => result,
			Err(err) => Err(CodexError::TransferFailure(format!("download task failed: {err}"))),
		}
	}
}

impl Stream for DownloadProgress {
	type Item = DownloadEvent;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.events.poll_recv(cx)
	}
}

#[derive(Debug, Clone)]
struct DownloadRequest {
	cid: String,
	filename: Option<String>,
	dest_dir: PathBuf,
	source: StreamSource,
	origin: RecentOrigin,
}

/// Partially written download, removed on drop unless committed.
struct PartialFile {
	path: PathBuf,
	committed: bool,
}

impl PartialFile {
	fn new(path: PathBuf) -> Self {
		Self {
			path,
			committed: false,
		}
	}
}

impl Drop for PartialFile {
	fn drop(&mut self) {
		if self.committed {
			return;
		}
		match std::fs::remove_file(&self.path) {
			Ok(()) => log::debug!("removed partial download {}", self.path.display()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
			Err(err) => log::warn!("failed to remove {}: {err}", self.path.display()),
		}
	}
}

pub struct TransferTracker {
	api: RwLock<CodexApi>,
	recent: Arc<RecentLedger>,
	items: Mutex<Vec<TransferItem>>,
	downloads: Mutex<HashMap<String, DownloadState>>,
}

impl TransferTracker {
	pub fn new(api: CodexApi, recent: Arc<RecentLedger>) -> Self {
		Self {
			api: RwLock::new(api),
			recent,
			items: Mutex::new(Vec::new()),
			downloads: Mutex::new(HashMap::new()),
		}
	}

	pub fn set_api(&self, api: CodexApi) {
		match self.api.write() {
			Ok(mut current) => *current = api,
			Err(err) => log::error!("transfer api lock poisoned: {err}"),
		}
	}

	fn api(&self) -> CodexResult<CodexApi> {
		self.api
			.read()
			.map(|api| api.clone())
			.map_err(|err| CodexError::TransferFailure(format!("api lock poisoned: {err}")))
	}

	pub fn items(&self) -> Vec<TransferItem> {
		self.items
			.lock()
			.map(|items| items.clone())
			.unwrap_or_default()
	}

	pub fn item(&self, id: &str) -> Option<TransferItem> {
		self.items
			.lock()
			.ok()?
			.iter()
			.find(|item| item.id == id)
			.cloned()
	}

	/// Stops tracking an item. An upload still in flight keeps running.
	pub fn remove(&self, id: &str) -> bool {
		match self.items.lock() {
			Ok(mut items) => {
				let before = items.len();
				items.retain(|item| item.id != id);
				items.len() != before
			}
			Err(_) => false,
		}
	}

	pub fn download_state(&self, cid: &str) -> Option<DownloadState> {
		self.downloads.lock().ok()?.get(cid).cloned()
	}

	fn enqueue(&self, name: String, size: u64, mime_type: String) -> TransferItem {
		let item = TransferItem {
			id: uuid::Uuid::new_v4().simple().to_string(),
			name,
			size,
			mime_type,
			status: TransferStatus::Pending,
			content_id: None,
			error_detail: None,
		};
		if let Ok(mut items) = self.items.lock() {
			items.push(item.clone());
		}
		item
	}

	/// The only way an item's status changes. Out-of-order moves are refused.
	fn transition(
		&self,
		id: &str,
		next: TransferStatus,
		content_id: Option<String>,
		error_detail: Option<String>,
	) -> bool {
		let Ok(mut items) = self.items.lock() else {
			return false;
		};
		let Some(item) = items.iter_mut().find(|item| item.id == id) else {
			log::debug!("transfer {id} no longer tracked");
			return false;
		};
		if !item.status.can_move_to(next) {
			log::warn!(
				"refusing transfer {id} transition {:?} -> {:?}",
				item.status,
				next
			);
			return false;
		}
		item.status = next;
		if content_id.is_some() {
			item.content_id = content_id;
		}
		if error_detail.is_some() {
			item.error_detail = error_detail;
		}
		true
	}

	/// Final state of the item, or the last known state if it was removed
	/// while the upload ran.
	fn settle(&self, snapshot: TransferItem) -> TransferItem {
		self.item(&snapshot.id).unwrap_or(snapshot)
	}

	pub async fn upload_bytes(&self, name: &str, mime_type: &str, data: Vec<u8>) -> TransferItem {
		let item = self.enqueue(name.to_string(), data.len() as u64, mime_type.to_string());
		self.run_upload(item, Ok(data)).await
	}

	pub async fn upload(&self, path: &Path) -> TransferItem {
		let name = path
			.file_name()
			.map(|name| name.to_string_lossy().to_string())
			.unwrap_or_else(|| path.display().to_string());
		let mime_type = mime_guess::from_path(path)
			.first_or_octet_stream()
			.essence_str()
			.to_string();
		let size = tokio::fs::metadata(path)
			.await
			.map(|meta| meta.len())
			.unwrap_or(0);
		let item = self.enqueue(name, size, mime_type);
		let data = tokio::fs::read(path).await.map_err(CodexError::from);
		self.run_upload(item, data).await
	}

	/// Uploads every path concurrently; each item settles independently.
	pub async fn upload_all(&self, paths: &[PathBuf]) -> Vec<TransferItem> {
		futures::future::join_all(paths.iter().map(|path| self.upload(path))).await
	}

	async fn run_upload(&self, mut item: TransferItem, data: CodexResult<Vec<u8>>) -> TransferItem {
		self.transition(&item.id, TransferStatus::InFlight, None, None);
		item.status = TransferStatus::InFlight;
		let result = match (data, self.api()) {
			(Ok(data), Ok(api)) => api.upload(&item.name, &item.mime_type, data).await,
			(Err(err), _) | (_, Err(err)) => Err(err),
		};
		match result {
			Ok(cid) => {
				log::info!("uploaded {} as {cid}", item.name);
				self.transition(
					&item.id,
					TransferStatus::Succeeded,
					Some(cid.clone()),
					None,
				);
				item.status = TransferStatus::Succeeded;
				item.content_id = Some(cid.clone());
				let recorded = self.recent.record(NewRecentItem {
					content_id: cid,
					name: item.name.clone(),
					kind: item.mime_type.clone(),
					size_label: format_bytes(item.size),
					origin: RecentOrigin::Upload,
				});
				if let Err(err) = recorded {
					log::error!("Failed to save recent files: {err}");
				}
			}
			Err(err) => {
				let detail = err.to_string();
				log::warn!("upload of {} failed: {detail}", item.name);
				self.transition(&item.id, TransferStatus::Failed, None, Some(detail.clone()));
				item.status = TransferStatus::Failed;
				item.error_detail = Some(detail);
			}
		}
		self.settle(item)
	}

	fn set_download(&self, cid: &str, state: DownloadState) {
		if let Ok(mut downloads) = self.downloads.lock() {
			downloads.insert(cid.to_string(), state);
		}
	}

	/// Claims the per-content slot, refusing while another download of the
	/// same content is running.
	fn claim_download(&self, cid: &str) -> CodexResult<()> {
		let mut downloads = self
			.downloads
			.lock()
			.map_err(|err| CodexError::TransferFailure(format!("download lock poisoned: {err}")))?;
		if let Some(DownloadState::Downloading { .. }) = downloads.get(cid) {
			return Err(CodexError::TransferFailure(format!(
				"download of {cid} already in progress"
			)));
		}
		downloads.insert(cid.to_string(), DownloadState::Downloading { progress: 0 });
		Ok(())
	}

	/// Resolves the manifest for `cid` and streams it from the network into
	/// `dest_dir`. A missing manifest fails with `ManifestNotFound` before any
	/// file is created.
	pub fn download(
		self: &Arc<Self>,
		cid: &str,
		filename: Option<String>,
		dest_dir: impl Into<PathBuf>,
	) -> DownloadProgress {
		self.spawn_download(
			DownloadRequest {
				cid: cid.to_string(),
				filename,
				dest_dir: dest_dir.into(),
				source: StreamSource::Network,
				origin: RecentOrigin::Download,
			},
			false,
		)
	}

	/// Streams straight from the network under the manifest's own name.
	pub fn leech(self: &Arc<Self>, cid: &str, dest_dir: impl Into<PathBuf>) -> DownloadProgress {
		self.spawn_download(
			DownloadRequest {
				cid: cid.to_string(),
				filename: None,
				dest_dir: dest_dir.into(),
				source: StreamSource::Network,
				origin: RecentOrigin::Search,
			},
			false,
		)
	}

	/// Has the node fetch `cid` first, then downloads the local copy. A
	/// failure in the first phase is `SeedFailure` and no download starts.
	pub fn seed_then_download(
		self: &Arc<Self>,
		cid: &str,
		dest_dir: impl Into<PathBuf>,
	) -> DownloadProgress {
		self.spawn_download(
			DownloadRequest {
				cid: cid.to_string(),
				filename: None,
				dest_dir: dest_dir.into(),
				source: StreamSource::Local,
				origin: RecentOrigin::Download,
			},
			true,
		)
	}

	pub async fn seed(&self, cid: &str) -> CodexResult<()> {
		let api = self.api()?;
		api.seed(cid).await?;
		log::info!("seeded {cid} to local node");
		Ok(())
	}

	fn spawn_download(
		self: &Arc<Self>,
		request: DownloadRequest,
		seed_first: bool,
	) -> DownloadProgress {
		let (tx, events) = mpsc::unbounded_channel();
		let tracker = Arc::clone(self);
		let handle = tokio::spawn(async move {
			let cid = request.cid.clone();
			if let Err(err) = tracker.claim_download(&cid) {
				let _ = tx.send(DownloadEvent::Failed(err.to_string()));
				return Err(err);
			}
			let result = tracker.run_download(&request, seed_first, &tx).await;
			match &result {
				Ok(path) => {
					tracker.set_download(&cid, DownloadState::Completed { path: path.clone() });
					let _ = tx.send(DownloadEvent::Completed(path.clone()));
				}
				Err(err) => {
					log::warn!("download of {cid} failed: {err}");
					tracker.set_download(
						&cid,
						DownloadState::Failed {
							error: err.to_string(),
						},
					);
					let _ = tx.send(DownloadEvent::Failed(err.to_string()));
				}
			}
			result
		});
		DownloadProgress { events, handle }
	}

	async fn run_download(
		&self,
		request: &DownloadRequest,
		seed_first: bool,
		tx: &mpsc::UnboundedSender<DownloadEvent>,
	) -> CodexResult<PathBuf> {
		let cid = request.cid.as_str();
		let api = self.api()?;
		if seed_first {
			let _ = tx.send(DownloadEvent::Seeding);
			api.seed(cid).await?;
			let _ = tx.send(DownloadEvent::Seeded);
		}
		let _ = tx.send(DownloadEvent::Progress(0));

		let manifest = api.manifest(cid).await?;
		let raw_name = request
			.filename
			.clone()
			.or_else(|| manifest.filename.clone())
			.unwrap_or_else(|| cid.to_string());
		let filename = sanitize_file_name(&raw_name)?;

		let res = api.stream(cid, request.source).await?;
		let total = res
			.content_length()
			.filter(|len| *len > 0)
			.unwrap_or(manifest.dataset_size);

		tokio::fs::create_dir_all(&request.dest_dir).await?;
		let final_path = request.dest_dir.join(&filename);
		let partial_name = format!(".{filename}.{}.part", uuid::Uuid::new_v4().simple());
		let mut partial = PartialFile::new(request.dest_dir.join(partial_name));
		let mut file = tokio::fs::File::create(&partial.path).await?;

		let mut body = res.bytes_stream();
		let mut received: u64 = 0;
		let mut reported: u8 = 0;
		while let Some(chunk) = body.next().await {
			let chunk = chunk.map_err(|err| CodexError::TransferFailure(err.to_string()))?;
			file.write_all(&chunk).await?;
			received += chunk.len() as u64;
			let progress = progress_percent(received, total);
			if progress > reported {
				reported = progress;
				self.set_download(cid, DownloadState::Downloading { progress });
				let _ = tx.send(DownloadEvent::Progress(progress));
			}
		}
		file.flush().await?;
		file.sync_all().await?;
		drop(file);

		tokio::fs::rename(&partial.path, &final_path).await?;
		partial.committed = true;
		let _ = tx.send(DownloadEvent::Progress(100));
		log::info!("saved {cid} to {}", final_path.display());

		let recorded = self.recent.record(NewRecentItem {
			content_id: cid.to_string(),
			name: filename,
			kind: manifest
				.mimetype
				.clone()
				.unwrap_or_else(|| String::from("application/octet-stream")),
			size_label: format_bytes(received),
			origin: request.origin,
		});
		if let Err(err) = recorded {
			log::error!("Failed to save recent files: {err}");
		}
		Ok(final_path)
	}
}

/// Percent complete, held below 100 until the file is in place.
fn progress_percent(received: u64, total: u64) -> u8 {
	if total == 0 {
		return 0;
	}
	let pct = received.saturating_mul(100) / total;
	pct.min(99) as u8
}
