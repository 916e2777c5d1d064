//! Thin client for the daemon's loopback HTTP API.
//!
//! Responses are decoded into strict shapes; anything that does not match is
//! reported as `MalformedResponse` instead of being defaulted.

use crate::config::api_base_for_port;
use crate::error::{CodexError, CodexResult};
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HEALTH_PATH: &str = "/debug/info";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteManifest {
	pub content_id: String,
	pub tree_content_id: String,
	pub dataset_size: u64,
	pub block_size: u64,
	pub filename: Option<String>,
	pub mimetype: Option<String>,
	pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFile {
	pub cid: String,
	pub manifest: RemoteManifest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
	pub file_count: usize,
	pub total_size: u64,
}

impl NodeSummary {
	pub fn of(files: &[NodeFile]) -> Self {
		Self {
			file_count: files.len(),
			total_size: files.iter().map(|file| file.manifest.dataset_size).sum(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
	/// `/data/{cid}/stream`, content already held by the node.
	Local,
	/// `/data/{cid}/network/stream`, resolved from the network on demand.
	Network,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFields {
	tree_cid: String,
	dataset_size: u64,
	block_size: u64,
	#[serde(default)]
	filename: Option<String>,
	#[serde(default)]
	mimetype: Option<String>,
	protected: bool,
}

impl ManifestFields {
	fn into_manifest(self, cid: String) -> RemoteManifest {
		RemoteManifest {
			content_id: cid,
			tree_content_id: self.tree_cid,
			dataset_size: self.dataset_size,
			block_size: self.block_size,
			filename: self.filename.filter(|name| !name.is_empty()),
			mimetype: self.mimetype.filter(|mime| !mime.is_empty()),
			protected: self.protected,
		}
	}
}

#[derive(Deserialize)]
struct ManifestEnvelope {
	cid: String,
	manifest: ManifestFields,
}

#[derive(Deserialize)]
struct ContentListing {
	content: Vec<ManifestEnvelope>,
}

#[derive(Deserialize)]
struct UploadReply {
	cid: String,
}

fn malformed(what: &str, err: impl std::fmt::Display) -> CodexError {
	CodexError::MalformedResponse(format!("{what}: {err}"))
}

pub fn parse_manifest(body: &[u8]) -> CodexResult<RemoteManifest> {
	let envelope: ManifestEnvelope =
		serde_json::from_slice(body).map_err(|err| malformed("manifest", err))?;
	if envelope.cid.trim().is_empty() {
		return Err(malformed("manifest", "empty cid"));
	}
	Ok(envelope.manifest.into_manifest(envelope.cid))
}

pub fn parse_listing(body: &[u8]) -> CodexResult<Vec<NodeFile>> {
	let listing: ContentListing =
		serde_json::from_slice(body).map_err(|err| malformed("content listing", err))?;
	Ok(listing
		.content
		.into_iter()
		.map(|entry| NodeFile {
			cid: entry.cid.clone(),
			manifest: entry.manifest.into_manifest(entry.cid),
		})
		.collect())
}

/// The store endpoint answers with the bare CID, some builds wrap it as
/// `{"cid": ...}`.
pub fn parse_upload_reply(body: &str) -> CodexResult<String> {
	let body = body.trim();
	let cid = if body.starts_with('{') {
		serde_json::from_str::<UploadReply>(body)
			.map_err(|err| malformed("upload reply", err))?
			.cid
	} else {
		body.trim_matches('"').to_string()
	};
	let cid = cid.trim().to_string();
	if cid.is_empty() {
		return Err(malformed("upload reply", "empty cid"));
	}
	Ok(cid)
}

/// `/data/{cid}{suffix}`, refusing ids that would not stay one path segment.
fn content_path(cid: &str, suffix: &str) -> CodexResult<String> {
	let unsafe_char = |c: char| c.is_whitespace() || c.is_control() || "/?#%\\".contains(c);
	if cid.is_empty() || cid.contains(unsafe_char) {
		return Err(CodexError::validation("content id", cid));
	}
	Ok(format!("/data/{cid}{suffix}"))
}

#[derive(Debug, Clone)]
pub struct CodexApi {
	client: Client,
	base: String,
}

impl CodexApi {
	pub fn new(base: impl Into<String>) -> Self {
		Self::with_client(Client::new(), base)
	}

	pub fn with_client(client: Client, base: impl Into<String>) -> Self {
		let base = base.into().trim_end_matches('/').to_string();
		Self { client, base }
	}

	pub fn for_port(port: &str) -> Self {
		Self::new(api_base_for_port(port))
	}

	/// Same connection pool, different port.
	pub fn with_port(&self, port: &str) -> Self {
		Self::with_client(self.client.clone(), api_base_for_port(port))
	}

	pub fn base(&self) -> &str {
		&self.base
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base, path)
	}

	/// Status code of the health endpoint. Transport errors and timeouts are
	/// `ProbeFailure`.
	pub async fn health(&self, timeout: Duration) -> CodexResult<StatusCode> {
		let res = self
			.client
			.get(self.url(HEALTH_PATH))
			.timeout(timeout)
			.send()
			.await
			.map_err(|err| CodexError::ProbeFailure(err.to_string()))?;
		Ok(res.status())
	}

	pub async fn debug_info(&self) -> CodexResult<serde_json::Value> {
		let res = self
			.client
			.get(self.url(HEALTH_PATH))
			.timeout(PROBE_TIMEOUT)
			.send()
			.await
			.map_err(|err| CodexError::ProbeFailure(err.to_string()))?;
		let res = ensure_success(res, "debug info").await?;
		let body = res.bytes().await?;
		serde_json::from_slice(&body).map_err(|err| malformed("debug info", err))
	}

	pub async fn list_data(&self) -> CodexResult<Vec<NodeFile>> {
		let res = self.client.get(self.url("/data")).send().await?;
		let res = ensure_success(res, "Failed to fetch files").await?;
		let body = res.bytes().await?;
		parse_listing(&body)
	}

	pub async fn upload(
		&self,
		filename: &str,
		mime_type: &str,
		body: impl Into<Body>,
	) -> CodexResult<String> {
		let res = self
			.client
			.post(self.url("/data"))
			.header(CONTENT_TYPE, mime_type)
			.header(
				CONTENT_DISPOSITION,
				format!("attachment; filename=\"{}\"", filename.replace('"', "")),
			)
			.body(body)
			.send()
			.await?;
		let res = ensure_success(res, "Upload failed").await?;
		let text = res.text().await?;
		parse_upload_reply(&text)
	}

	pub async fn manifest(&self, cid: &str) -> CodexResult<RemoteManifest> {
		let path = content_path(cid, "/network/manifest")?;
		let res = self.client.get(self.url(&path)).send().await?;
		let status = res.status();
		if status.is_client_error() {
			let detail = res.text().await.unwrap_or_default();
			log::debug!("manifest lookup for {cid} returned {status}: {detail}");
			return Err(CodexError::ManifestNotFound {
				cid: cid.to_string(),
				status: status.as_u16(),
			});
		}
		let res = ensure_success(res, "manifest lookup").await?;
		let body = res.bytes().await?;
		parse_manifest(&body)
	}

	/// Asks the node to fetch and host `cid` locally.
	pub async fn seed(&self, cid: &str) -> CodexResult<()> {
		let path = content_path(cid, "/network")?;
		let res = self
			.client
			.post(self.url(&path))
			.header(ACCEPT, "application/json")
			.send()
			.await
			.map_err(|err| CodexError::SeedFailure(err.to_string()))?;
		let status = res.status();
		if !status.is_success() {
			return Err(CodexError::SeedFailure(format!("HTTP error! Status: {status}")));
		}
		Ok(())
	}

	pub async fn stream(&self, cid: &str, source: StreamSource) -> CodexResult<Response> {
		let path = match source {
			StreamSource::Local => content_path(cid, "/stream")?,
			StreamSource::Network => content_path(cid, "/network/stream")?,
		};
		let res = self
			.client
			.get(self.url(&path))
			.header(ACCEPT, "*/*")
			.send()
			.await?;
		ensure_success(res, "Download failed").await
	}
}

async fn ensure_success(res: Response, what: &str) -> CodexResult<Response> {
	let status = res.status();
	if status.is_success() {
		return Ok(res);
	}
	let detail = res.text().await.unwrap_or_default();
	let detail = detail.trim();
	if detail.is_empty() {
		Err(CodexError::TransferFailure(format!("{what}: {status}")))
	} else {
		Err(CodexError::TransferFailure(format!("{what}: {status}: {detail}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{FakeDaemon, manifest_json};

	#[test]
	fn manifest_requires_core_fields() {
		let ok = parse_manifest(manifest_json("zdj7W", "movie.mkv", 2048).as_bytes()).unwrap();
		assert_eq!(ok.content_id, "zdj7W");
		assert_eq!(ok.filename.as_deref(), Some("movie.mkv"));
		assert_eq!(ok.dataset_size, 2048);

		let missing_size =
			br#"{"cid":"x","manifest":{"treeCid":"t","blockSize":65536,"protected":false}}"#;
		assert!(matches!(
			parse_manifest(missing_size),
			Err(CodexError::MalformedResponse(_))
		));
		assert!(matches!(
			parse_manifest(b"<html>oops</html>"),
			Err(CodexError::MalformedResponse(_))
		));
	}

	#[test]
	fn manifest_filename_and_mimetype_are_optional() {
		let body = br#"{"cid":"x","manifest":{
			"treeCid":"t","datasetSize":1,"blockSize":65536,"protected":true
		}}"#;
		let manifest = parse_manifest(body).unwrap();
		assert_eq!(manifest.filename, None);
		assert_eq!(manifest.mimetype, None);
		assert!(manifest.protected);
	}

	#[test]
	fn upload_reply_accepts_text_and_json() {
		assert_eq!(parse_upload_reply("zdj7Wabc\n").unwrap(), "zdj7Wabc");
		assert_eq!(parse_upload_reply(r#"{"cid":"zdj7Wdef"}"#).unwrap(), "zdj7Wdef");
		assert!(parse_upload_reply("   ").is_err());
		assert!(parse_upload_reply(r#"{"id":"nope"}"#).is_err());
	}

	#[test]
	fn listing_requires_content_array() {
		let body = format!(r#"{{"content":[{}]}}"#, manifest_json("a", "a.txt", 3));
		let files = parse_listing(body.as_bytes()).unwrap();
		assert_eq!(files.len(), 1);
		assert_eq!(files[0].cid, "a");
		assert!(parse_listing(br#"{"items":[]}"#).is_err());
	}

	#[tokio::test]
	async fn manifest_not_found_is_distinct() {
		let daemon = FakeDaemon::start().await;
		let api = CodexApi::new(daemon.base());
		let err = api.manifest("unknown").await.unwrap_err();
		assert!(err.is_manifest_not_found(), "{err:?}");

		daemon.add_content("known", "notes.txt", b"hello".to_vec());
		let manifest = api.manifest("known").await.unwrap();
		assert_eq!(manifest.filename.as_deref(), Some("notes.txt"));
		assert_eq!(manifest.dataset_size, 5);
	}

	#[test]
	fn content_ids_stay_in_their_path_segment() {
		assert_eq!(
			content_path("zdj7Wabc", "/network").unwrap(),
			"/data/zdj7Wabc/network"
		);
		for cid in ["", "a/b", "../debug/info", "a?x=1", "a#frag", "a%2F", "a b", "a\\b"] {
			assert!(
				matches!(
					content_path(cid, "/stream"),
					Err(CodexError::ValidationFailure { field: "content id", .. })
				),
				"{cid:?}"
			);
		}
	}

	#[tokio::test]
	async fn unsafe_content_id_never_reaches_the_node() {
		let daemon = FakeDaemon::start().await;
		daemon.add_content("known", "notes.txt", b"hello".to_vec());
		let api = CodexApi::new(daemon.base());
		let err = api.manifest("known/../known").await.unwrap_err();
		assert!(matches!(err, CodexError::ValidationFailure { .. }), "{err:?}");
		assert!(api.seed("known?x").await.is_err());
		assert!(!daemon.is_local("known"));
		assert!(api.stream("known#a", StreamSource::Network).await.is_err());
	}

	#[tokio::test]
	async fn upload_then_list() {
		let daemon = FakeDaemon::start().await;
		let api = CodexApi::new(daemon.base());
		let cid = api.upload("a.txt", "text/plain", b"abc".to_vec()).await.unwrap();
		let files = api.list_data().await.unwrap();
		assert_eq!(files.len(), 1);
		assert_eq!(files[0].cid, cid);
		assert_eq!(files[0].manifest.filename.as_deref(), Some("a.txt"));
		assert_eq!(
			NodeSummary::of(&files),
			NodeSummary {
				file_count: 1,
				total_size: 3
			}
		);
	}

	#[tokio::test]
	async fn health_reports_status_and_unreachable() {
		let daemon = FakeDaemon::start().await;
		let api = CodexApi::new(daemon.base());
		assert_eq!(api.health(PROBE_TIMEOUT).await.unwrap(), StatusCode::OK);

		let closed = CodexApi::new(format!(
			"http://127.0.0.1:{}/api/codex/v1",
			daemon.closed_port()
		));
		assert!(matches!(
			closed.health(PROBE_TIMEOUT).await,
			Err(CodexError::ProbeFailure(_))
		));
	}
}
