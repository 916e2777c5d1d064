use crate::error::{CodexError, CodexResult};
use crate::settings::{
	KEY_API_PORT, KEY_DATA_DIRECTORY, KEY_DISCOVERY_PORT, KEY_DOWNLOAD_LOCATION,
	KEY_LISTENING_PORT, SettingsStore,
};
use crate::validation::{parse_port, validate_directory, validate_port_input};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_DISCOVERY_PORT: &str = "8090";
pub const DEFAULT_LISTENING_PORT: &str = "8070";
pub const DEFAULT_API_PORT: &str = "8080";

pub const API_PREFIX: &str = "/api/codex/v1";
pub const DAEMON_PROCESS_NAME: &str = "codexdesktop";

pub const BOOTSTRAP_NODE: &str = "spr:CiUIAhIhAiJvIcA_ZwPZ9ugVKDbmqwhJZaig5zKyLiuaicRcCGqLEgIDARo8CicAJQgCEiECIm8hwD9nA9n26BUoNuarCEllqKDnMrIuK5qJxFwIaosQ3d6esAYaCwoJBJ_f8zKRAnU6KkYwRAIgM0MvWNJL296kJ9gWvfatfmVvT-A7O2s8Mxp8l9c8EW0CIC-h-H-jBVSgFjg3Eny2u33qF7BDnWFzo7fGfZ7_qc9P";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodexConfig {
	pub data_directory: Option<PathBuf>,
	pub discovery_port: String,
	pub listening_port: String,
	pub api_port: String,
}

impl Default for CodexConfig {
	fn default() -> Self {
		Self {
			data_directory: None,
			discovery_port: DEFAULT_DISCOVERY_PORT.to_string(),
			listening_port: DEFAULT_LISTENING_PORT.to_string(),
			api_port: DEFAULT_API_PORT.to_string(),
		}
	}
}

impl CodexConfig {
	pub fn is_directory_set(&self) -> bool {
		self.data_directory.is_some()
	}

	pub fn api_base(&self) -> String {
		api_base_for_port(&self.api_port)
	}

	/// Command line handed to the daemon. Fails when no data directory has
	/// been chosen yet.
	pub fn daemon_args(&self, bootstrap_nodes: &[String]) -> CodexResult<Vec<String>> {
		let data_dir = self
			.data_directory
			.as_ref()
			.ok_or_else(|| CodexError::StartFailure(String::from("data directory not set")))?;
		let mut args = vec![
			format!("--data-dir={}", data_dir.display()),
			format!("--disc-port={}", self.discovery_port),
			format!("--listen-addrs=/ip4/0.0.0.0/tcp/{}", self.listening_port),
			String::from("--nat=any"),
			String::from("--api-cors-origin=*"),
			format!("--api-port={}", self.api_port),
		];
		for node in bootstrap_nodes {
			args.push(format!("--bootstrap-node={node}"));
		}
		Ok(args)
	}
}

pub fn api_base_for_port(port: &str) -> String {
	format!("http://localhost:{}{}", port, API_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
	Discovery,
	Listening,
	Api,
}

impl PortKind {
	fn key(self) -> &'static str {
		match self {
			PortKind::Discovery => KEY_DISCOVERY_PORT,
			PortKind::Listening => KEY_LISTENING_PORT,
			PortKind::Api => KEY_API_PORT,
		}
	}

	fn field(self) -> &'static str {
		match self {
			PortKind::Discovery => "discovery port",
			PortKind::Listening => "listening port",
			PortKind::Api => "api port",
		}
	}
}

impl fmt::Display for PortKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.field())
	}
}

impl FromStr for PortKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"discovery" | "disc" => Ok(PortKind::Discovery),
			"listening" | "listen" => Ok(PortKind::Listening),
			"api" => Ok(PortKind::Api),
			other => Err(format!("unknown port kind: {other}")),
		}
	}
}

/// Owns the daemon configuration and the download location. Loaded once from
/// the settings store; each setter validates, persists, and only then updates
/// the in-memory value.
pub struct ConfigManager {
	store: Arc<dyn SettingsStore>,
	config: CodexConfig,
	custom_download_dir: Option<PathBuf>,
	default_download_dir: PathBuf,
}

impl ConfigManager {
	pub fn load(store: Arc<dyn SettingsStore>, default_download_dir: PathBuf) -> Self {
		let mut config = CodexConfig::default();
		if let Some(dir) = store.get(KEY_DATA_DIRECTORY) {
			if !dir.trim().is_empty() {
				config.data_directory = Some(PathBuf::from(dir));
			}
		}
		for kind in [PortKind::Discovery, PortKind::Listening, PortKind::Api] {
			let Some(saved) = store.get(kind.key()) else {
				continue;
			};
			match validate_port_input(&saved) {
				Some(port) => *Self::port_slot(&mut config, kind) = port,
				None => log::warn!("ignoring saved {kind} {saved:?}, using default"),
			}
		}
		let custom_download_dir = store
			.get(KEY_DOWNLOAD_LOCATION)
			.filter(|dir| !dir.trim().is_empty())
			.map(PathBuf::from);
		Self {
			store,
			config,
			custom_download_dir,
			default_download_dir,
		}
	}

	fn port_slot(config: &mut CodexConfig, kind: PortKind) -> &mut String {
		match kind {
			PortKind::Discovery => &mut config.discovery_port,
			PortKind::Listening => &mut config.listening_port,
			PortKind::Api => &mut config.api_port,
		}
	}

	pub fn config(&self) -> &CodexConfig {
		&self.config
	}

	pub fn select_data_directory(&mut self, path: impl AsRef<Path>) -> CodexResult<()> {
		let dir = validate_directory("data directory", path)?;
		self.store.set(KEY_DATA_DIRECTORY, &dir.to_string_lossy())?;
		self.config.data_directory = Some(dir);
		Ok(())
	}

	pub fn clear_data_directory(&mut self) -> CodexResult<()> {
		self.store.remove(KEY_DATA_DIRECTORY)?;
		self.config.data_directory = None;
		Ok(())
	}

	pub fn set_port(&mut self, kind: PortKind, value: &str) -> CodexResult<()> {
		let port = parse_port(kind.field(), value)?;
		self.store.set(kind.key(), &port)?;
		*Self::port_slot(&mut self.config, kind) = port;
		Ok(())
	}

	pub fn set_discovery_port(&mut self, value: &str) -> CodexResult<()> {
		self.set_port(PortKind::Discovery, value)
	}

	pub fn set_listening_port(&mut self, value: &str) -> CodexResult<()> {
		self.set_port(PortKind::Listening, value)
	}

	pub fn set_api_port(&mut self, value: &str) -> CodexResult<()> {
		self.set_port(PortKind::Api, value)
	}

	pub fn select_download_directory(&mut self, path: impl AsRef<Path>) -> CodexResult<()> {
		let dir = validate_directory("download directory", path)?;
		self.store.set(KEY_DOWNLOAD_LOCATION, &dir.to_string_lossy())?;
		self.custom_download_dir = Some(dir);
		Ok(())
	}

	pub fn reset_download_directory(&mut self) -> CodexResult<()> {
		self.store.remove(KEY_DOWNLOAD_LOCATION)?;
		self.custom_download_dir = None;
		Ok(())
	}

	pub fn custom_download_directory(&self) -> Option<&Path> {
		self.custom_download_dir.as_deref()
	}

	pub fn current_download_directory(&self) -> PathBuf {
		self.custom_download_dir
			.clone()
			.unwrap_or_else(|| self.default_download_dir.clone())
	}
}
