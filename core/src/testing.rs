//! In-process stand-ins for the daemon and the OS process table.

use crate::config::API_PREFIX;
use crate::process::{DaemonChild, ProcessBackend, ProcessInfo};
use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Manifest envelope in the shape the daemon answers with.
pub fn manifest_json(cid: &str, name: &str, size: u64) -> String {
	let mimetype = mime_guess::from_path(name).first_or_octet_stream();
	serde_json::json!({
		"cid": cid,
		"manifest": {
			"treeCid": format!("{cid}-tree"),
			"datasetSize": size,
			"blockSize": 65536,
			"filename": name,
			"mimetype": mimetype.essence_str(),
			"protected": false,
		}
	})
	.to_string()
}

struct StoredContent {
	name: String,
	data: Vec<u8>,
	local: bool,
}

struct FakeState {
	health: u16,
	content: BTreeMap<String, StoredContent>,
	rejected: HashSet<String>,
	fail_seeds: bool,
	truncated: HashSet<String>,
	uploads: usize,
}

type SharedState = Arc<Mutex<FakeState>>;

/// Loopback HTTP server answering the subset of the daemon API the desktop
/// uses. Content added with `add_content` lives "on the network" until it is
/// uploaded or seeded.
pub struct FakeDaemon {
	addr: std::net::SocketAddr,
	state: SharedState,
	server: JoinHandle<()>,
}

impl FakeDaemon {
	pub async fn start() -> Self {
		let state = Arc::new(Mutex::new(FakeState {
			health: 200,
			content: BTreeMap::new(),
			rejected: HashSet::new(),
			fail_seeds: false,
			truncated: HashSet::new(),
			uploads: 0,
		}));
		let api = Router::new()
			.route("/debug/info", get(health))
			.route("/data", get(list_data).post(store_data))
			.route("/data/:cid/network", post(seed))
			.route("/data/:cid/network/manifest", get(manifest))
			.route("/data/:cid/network/stream", get(network_stream))
			.route("/data/:cid/stream", get(local_stream))
			.with_state(state.clone());
		let app = Router::new().nest(API_PREFIX, api);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let server = tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		Self {
			addr,
			state,
			server,
		}
	}

	pub fn base(&self) -> String {
		format!("http://{}{}", self.addr, API_PREFIX)
	}

	pub fn port(&self) -> u16 {
		self.addr.port()
	}

	pub fn set_health(&self, status: u16) {
		self.state.lock().unwrap().health = status;
	}

	pub fn add_content(&self, cid: &str, name: &str, data: Vec<u8>) {
		self.state.lock().unwrap().content.insert(
			cid.to_string(),
			StoredContent {
				name: name.to_string(),
				data,
				local: false,
			},
		);
	}

	pub fn reject_upload(&self, name: &str) {
		self.state.lock().unwrap().rejected.insert(name.to_string());
	}

	pub fn fail_seeds(&self) {
		self.state.lock().unwrap().fail_seeds = true;
	}

	/// Streams of `cid` send the first half of the data, then break off.
	pub fn truncate(&self, cid: &str) {
		self.state.lock().unwrap().truncated.insert(cid.to_string());
	}

	pub fn is_local(&self, cid: &str) -> bool {
		self.state
			.lock()
			.unwrap()
			.content
			.get(cid)
			.is_some_and(|content| content.local)
	}

	pub fn upload_count(&self) -> usize {
		self.state.lock().unwrap().uploads
	}

	/// A loopback port with nothing listening on it.
	pub fn closed_port(&self) -> u16 {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap().port()
	}
}

impl Drop for FakeDaemon {
	fn drop(&mut self) {
		self.server.abort();
	}
}

async fn health(State(state): State<SharedState>) -> Response {
	let code = state.lock().unwrap().health;
	let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(status, r#"{"id":"fake-node","spr":"spr:fake"}"#).into_response()
}

async fn list_data(State(state): State<SharedState>) -> Response {
	let state = state.lock().unwrap();
	let entries: Vec<String> = state
		.content
		.iter()
		.filter(|(_, content)| content.local)
		.map(|(cid, content)| manifest_json(cid, &content.name, content.data.len() as u64))
		.collect();
	(
		[(header::CONTENT_TYPE, "application/json")],
		format!(r#"{{"content":[{}]}}"#, entries.join(",")),
	)
		.into_response()
}

fn disposition_filename(headers: &HeaderMap) -> Option<String> {
	let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
	let start = value.find("filename=\"")? + "filename=\"".len();
	let rest = &value[start..];
	let end = rest.find('"')?;
	Some(rest[..end].to_string())
}

async fn store_data(State(state): State<SharedState>, headers: HeaderMap, body: Bytes) -> Response {
	let mut state = state.lock().unwrap();
	let name = disposition_filename(&headers).unwrap_or_else(|| String::from("unnamed"));
	if state.rejected.contains(&name) {
		return (StatusCode::INTERNAL_SERVER_ERROR, "rejected").into_response();
	}
	state.uploads += 1;
	let cid = format!("zdj7Wfake{}", state.uploads);
	state.content.insert(
		cid.clone(),
		StoredContent {
			name,
			data: body.to_vec(),
			local: true,
		},
	);
	cid.into_response()
}

async fn seed(State(state): State<SharedState>, UrlPath(cid): UrlPath<String>) -> Response {
	let mut state = state.lock().unwrap();
	if state.fail_seeds {
		return (StatusCode::INTERNAL_SERVER_ERROR, "seed failed").into_response();
	}
	let Some(content) = state.content.get_mut(&cid) else {
		return (StatusCode::NOT_FOUND, "not found").into_response();
	};
	content.local = true;
	manifest_json(&cid, &content.name, content.data.len() as u64).into_response()
}

async fn manifest(State(state): State<SharedState>, UrlPath(cid): UrlPath<String>) -> Response {
	let state = state.lock().unwrap();
	match state.content.get(&cid) {
		Some(content) => (
			[(header::CONTENT_TYPE, "application/json")],
			manifest_json(&cid, &content.name, content.data.len() as u64),
		)
			.into_response(),
		None => (StatusCode::NOT_FOUND, "manifest not found").into_response(),
	}
}

async fn network_stream(
	State(state): State<SharedState>,
	UrlPath(cid): UrlPath<String>,
) -> Response {
	let state = state.lock().unwrap();
	match state.content.get(&cid) {
		Some(content) if state.truncated.contains(&cid) => broken_body(&content.data),
		Some(content) => content.data.clone().into_response(),
		None => (StatusCode::NOT_FOUND, "not found").into_response(),
	}
}

/// Announces the full length, sends half of it and fails the connection.
fn broken_body(data: &[u8]) -> Response {
	let half = Bytes::copy_from_slice(&data[..data.len() / 2]);
	let chunks: Vec<Result<Bytes, io::Error>> = vec![
		Ok(half),
		Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream cut")),
	];
	(
		[(header::CONTENT_LENGTH, data.len().to_string())],
		Body::from_stream(futures::stream::iter(chunks)),
	)
		.into_response()
}

async fn local_stream(State(state): State<SharedState>, UrlPath(cid): UrlPath<String>) -> Response {
	let state = state.lock().unwrap();
	match state.content.get(&cid) {
		Some(content) if content.local && state.truncated.contains(&cid) => {
			broken_body(&content.data)
		}
		Some(content) if content.local => content.data.clone().into_response(),
		_ => (StatusCode::NOT_FOUND, "not held locally").into_response(),
	}
}

struct FakeChildState {
	alive: AtomicBool,
	kills: AtomicUsize,
	fail_kill: AtomicBool,
}

/// Test-side view of a spawned fake daemon.
#[derive(Clone)]
pub struct FakeChildHandle {
	state: Arc<FakeChildState>,
}

impl FakeChildHandle {
	pub fn die(&self) {
		self.state.alive.store(false, Ordering::SeqCst);
	}

	pub fn is_alive(&self) -> bool {
		self.state.alive.load(Ordering::SeqCst)
	}

	pub fn kills(&self) -> usize {
		self.state.kills.load(Ordering::SeqCst)
	}

	pub fn fail_kill(&self) {
		self.state.fail_kill.store(true, Ordering::SeqCst);
	}
}

struct FakeChild {
	pid: u32,
	handle: FakeChildHandle,
}

#[async_trait]
impl DaemonChild for FakeChild {
	fn id(&self) -> Option<u32> {
		Some(self.pid)
	}

	fn is_alive(&mut self) -> bool {
		self.handle.is_alive()
	}

	async fn kill(&mut self) -> io::Result<()> {
		let state = &self.handle.state;
		state.kills.fetch_add(1, Ordering::SeqCst);
		if state.fail_kill.load(Ordering::SeqCst) {
			return Err(io::Error::other("kill refused"));
		}
		state.alive.store(false, Ordering::SeqCst);
		Ok(())
	}

	fn recent_output(&self) -> Vec<String> {
		vec![String::from("fatal: fake daemon exited")]
	}
}

#[derive(Default)]
struct FakeProcesses {
	executed: Vec<(String, Vec<String>)>,
	spawned: Vec<(PathBuf, Vec<String>)>,
	failing: HashSet<String>,
	fail_spawns: bool,
	children: Vec<FakeChildHandle>,
	existing: Vec<ProcessInfo>,
}

/// Records every command and spawn instead of touching the OS. Spawned pids
/// count up from 1000.
#[derive(Default)]
pub struct FakeProcessBackend {
	inner: Mutex<FakeProcesses>,
}

impl FakeProcessBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn executed(&self) -> Vec<(String, Vec<String>)> {
		self.inner.lock().unwrap().executed.clone()
	}

	pub fn spawned(&self) -> Vec<(PathBuf, Vec<String>)> {
		self.inner.lock().unwrap().spawned.clone()
	}

	pub fn fail_command(&self, program: &str) {
		self.inner.lock().unwrap().failing.insert(program.to_string());
	}

	pub fn fail_spawns(&self) {
		self.inner.lock().unwrap().fail_spawns = true;
	}

	pub fn child(&self, index: usize) -> FakeChildHandle {
		self.inner.lock().unwrap().children[index].clone()
	}

	pub fn add_existing(&self, pid: u32, name: &str) {
		self.inner.lock().unwrap().existing.push(ProcessInfo {
			pid,
			name: name.to_string(),
		});
	}
}

#[async_trait]
impl ProcessBackend for FakeProcessBackend {
	async fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn DaemonChild>> {
		let mut inner = self.inner.lock().unwrap();
		inner.spawned.push((program.to_path_buf(), args.to_vec()));
		if inner.fail_spawns {
			return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
		}
		let pid = 1000 + inner.children.len() as u32;
		let handle = FakeChildHandle {
			state: Arc::new(FakeChildState {
				alive: AtomicBool::new(true),
				kills: AtomicUsize::new(0),
				fail_kill: AtomicBool::new(false),
			}),
		};
		inner.children.push(handle.clone());
		Ok(Box::new(FakeChild { pid, handle }))
	}

	async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
		let mut inner = self.inner.lock().unwrap();
		inner.executed.push((program.to_string(), args.to_vec()));
		if inner.failing.contains(program) {
			bail!("Command failed: {program} not permitted");
		}
		Ok(String::from("Command executed successfully"))
	}

	fn list_by_name(&self, name: &str) -> Vec<ProcessInfo> {
		self.inner
			.lock()
			.unwrap()
			.existing
			.iter()
			.filter(|process| process.name.contains(name))
			.cloned()
			.collect()
	}
}
