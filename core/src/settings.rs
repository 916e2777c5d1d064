use crate::error::{CodexError, CodexResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const KEY_DATA_DIRECTORY: &str = "codexDataDirectory";
pub const KEY_DISCOVERY_PORT: &str = "codexDiscoveryPort";
pub const KEY_LISTENING_PORT: &str = "codexListeningPort";
pub const KEY_API_PORT: &str = "codexApiPort";
pub const KEY_DOWNLOAD_LOCATION: &str = "codexDownloadLocation";
pub const KEY_RECENT_FILES: &str = "recent-files";

const SETTINGS_FILE: &str = "settings.json";

/// Flat string key/value persistence for user preferences.
pub trait SettingsStore: Send + Sync {
	fn get(&self, key: &str) -> Option<String>;
	fn set(&self, key: &str, value: &str) -> CodexResult<()>;
	fn remove(&self, key: &str) -> CodexResult<()>;
}

pub fn get_json<T: DeserializeOwned>(
	store: &dyn SettingsStore,
	key: &str,
) -> CodexResult<Option<T>> {
	match store.get(key) {
		Some(raw) => serde_json::from_str(&raw)
			.map(Some)
			.map_err(|err| CodexError::Settings(format!("failed to decode {key}: {err}"))),
		None => Ok(None),
	}
}

pub fn set_json<T: Serialize>(store: &dyn SettingsStore, key: &str, value: &T) -> CodexResult<()> {
	let raw = serde_json::to_string(value)
		.map_err(|err| CodexError::Settings(format!("failed to encode {key}: {err}")))?;
	store.set(key, &raw)
}

/// Application directory holding the settings file. `CODEXDESK_HOME`
/// overrides the default of `~/.codexdesk`.
pub fn app_dir() -> anyhow::Result<PathBuf> {
	if let Some(dir) = std::env::var_os("CODEXDESK_HOME") {
		return Ok(PathBuf::from(dir));
	}
	Ok(home_dir()?.join(".codexdesk"))
}

pub fn home_dir() -> anyhow::Result<PathBuf> {
	homedir::my_home()
		.map_err(|err| anyhow::anyhow!("failed to resolve home directory: {err}"))?
		.ok_or_else(|| anyhow::anyhow!("home directory is not set"))
}

pub fn default_settings_path() -> anyhow::Result<PathBuf> {
	Ok(app_dir()?.join(SETTINGS_FILE))
}

/// Settings persisted as one JSON object. Every mutation rewrites the whole
/// document through a temp file and rename, so a reader never observes a
/// half written file.
pub struct JsonFileStore {
	path: PathBuf,
	values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
	pub fn open(path: impl Into<PathBuf>) -> CodexResult<Self> {
		let path = path.into();
		let values = match std::fs::read_to_string(&path) {
			Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
			Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
				Ok(values) => values,
				Err(err) => {
					log::error!(
						"settings file {} is corrupt, starting empty: {err}",
						path.display()
					);
					BTreeMap::new()
				}
			},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
			Err(err) => return Err(CodexError::Io(err)),
		};
		Ok(Self {
			path,
			values: Mutex::new(values),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn persist(&self, values: &BTreeMap<String, String>) -> CodexResult<()> {
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}
		let body = serde_json::to_vec_pretty(values)
			.map_err(|err| CodexError::Settings(format!("failed to encode settings: {err}")))?;
		let mut tmp = self.path.clone().into_os_string();
		tmp.push(".tmp");
		let tmp = PathBuf::from(tmp);
		std::fs::write(&tmp, body)?;
		std::fs::rename(&tmp, &self.path)?;
		Ok(())
	}

	fn mutate(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> CodexResult<()> {
		let mut values = self
			.values
			.lock()
			.map_err(|err| CodexError::Settings(format!("settings lock poisoned: {err}")))?;
		let mut next = values.clone();
		apply(&mut next);
		self.persist(&next)?;
		*values = next;
		Ok(())
	}
}

impl SettingsStore for JsonFileStore {
	fn get(&self, key: &str) -> Option<String> {
		self.values.lock().ok()?.get(key).cloned()
	}

	fn set(&self, key: &str, value: &str) -> CodexResult<()> {
		self.mutate(|values| {
			values.insert(key.to_string(), value.to_string());
		})
	}

	fn remove(&self, key: &str) -> CodexResult<()> {
		self.mutate(|values| {
			values.remove(key);
		})
	}
}

#[derive(Default)]
pub struct MemoryStore {
	values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SettingsStore for MemoryStore {
	fn get(&self, key: &str) -> Option<String> {
		self.values.lock().ok()?.get(key).cloned()
	}

	fn set(&self, key: &str, value: &str) -> CodexResult<()> {
		self.values
			.lock()
			.map_err(|err| CodexError::Settings(format!("settings lock poisoned: {err}")))?
			.insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn remove(&self, key: &str) -> CodexResult<()> {
		self.values
			.lock()
			.map_err(|err| CodexError::Settings(format!("settings lock poisoned: {err}")))?
			.remove(key);
		Ok(())
	}
}
