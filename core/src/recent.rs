use crate::clock::Clock;
use crate::error::{CodexError, CodexResult};
use crate::settings::{KEY_RECENT_FILES, SettingsStore, get_json, set_json};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const MAX_RECENT_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecentOrigin {
	Upload,
	Download,
	Search,
}

/// Persisted under the `recent-files` key with the field names the desktop
/// app has always used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentItem {
	pub id: String,
	#[serde(rename = "cid")]
	pub content_id: String,
	#[serde(rename = "fileName")]
	pub name: String,
	#[serde(rename = "fileType")]
	pub kind: String,
	#[serde(rename = "fileSize")]
	pub size_label: String,
	#[serde(rename = "timestamp")]
	pub timestamp_ms: i64,
	#[serde(rename = "source")]
	pub origin: RecentOrigin,
}

#[derive(Debug, Clone)]
pub struct NewRecentItem {
	pub content_id: String,
	pub name: String,
	pub kind: String,
	pub size_label: String,
	pub origin: RecentOrigin,
}

/// Bounded, most-recent-first list with one entry per content id.
pub struct RecentLedger {
	store: Arc<dyn SettingsStore>,
	clock: Arc<dyn Clock>,
	max: usize,
	items: Mutex<Vec<RecentItem>>,
}

impl RecentLedger {
	pub fn load(store: Arc<dyn SettingsStore>, clock: Arc<dyn Clock>) -> Self {
		let items = match get_json::<Vec<RecentItem>>(store.as_ref(), KEY_RECENT_FILES) {
			Ok(Some(mut items)) => {
				items.truncate(MAX_RECENT_ITEMS);
				items
			}
			Ok(None) => Vec::new(),
			Err(err) => {
				log::error!("Failed to load recent files: {err}");
				Vec::new()
			}
		};
		Self {
			store,
			clock,
			max: MAX_RECENT_ITEMS,
			items: Mutex::new(items),
		}
	}

	pub fn list(&self) -> Vec<RecentItem> {
		self.items
			.lock()
			.map(|items| items.clone())
			.unwrap_or_default()
	}

	/// Applies `change` to a copy, persists the copy, and only then makes it
	/// visible. A failed write leaves the previous list in place.
	fn commit(&self, change: impl FnOnce(&mut Vec<RecentItem>)) -> CodexResult<Vec<RecentItem>> {
		let mut items = self
			.items
			.lock()
			.map_err(|err| CodexError::Settings(format!("recent files lock poisoned: {err}")))?;
		let mut next = items.clone();
		change(&mut next);
		next.truncate(self.max);
		set_json(self.store.as_ref(), KEY_RECENT_FILES, &next)?;
		*items = next.clone();
		Ok(next)
	}

	pub fn record(&self, item: NewRecentItem) -> CodexResult<RecentItem> {
		let timestamp_ms = self.clock.timestamp_ms();
		let entry = RecentItem {
			id: format!("{}-{}", item.content_id, timestamp_ms),
			content_id: item.content_id,
			name: item.name,
			kind: item.kind,
			size_label: item.size_label,
			timestamp_ms,
			origin: item.origin,
		};
		let recorded = entry.clone();
		self.commit(move |items| {
			items.retain(|existing| existing.content_id != entry.content_id);
			items.insert(0, entry);
		})?;
		Ok(recorded)
	}

	pub fn remove(&self, id: &str) -> CodexResult<bool> {
		let before = self.list().len();
		let after = self.commit(|items| items.retain(|item| item.id != id))?;
		Ok(after.len() != before)
	}

	pub fn clear(&self) -> CodexResult<()> {
		self.commit(|items| items.clear())?;
		Ok(())
	}
}
