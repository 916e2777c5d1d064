use thiserror::Error;

/// Failures surfaced at the boundary of the core components.
///
/// Nothing here is meant to reach the presentation layer as a panic; callers
/// render these as inline status text next to the affected item.
#[derive(Debug, Error)]
pub enum CodexError {
	#[error("failed to start codex: {0}")]
	StartFailure(String),

	#[error("codex api unreachable: {0}")]
	ProbeFailure(String),

	#[error(
		"File manifest not found. The content may not be available on the network. Status: {status}"
	)]
	ManifestNotFound { cid: String, status: u16 },

	#[error("Failed to seed file to local node: {0}")]
	SeedFailure(String),

	#[error("transfer failed: {0}")]
	TransferFailure(String),

	#[error("invalid {field}: {value:?}")]
	ValidationFailure { field: &'static str, value: String },

	#[error("malformed response from codex: {0}")]
	MalformedResponse(String),

	#[error("settings store error: {0}")]
	Settings(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

impl CodexError {
	pub fn validation(field: &'static str, value: impl Into<String>) -> Self {
		CodexError::ValidationFailure {
			field,
			value: value.into(),
		}
	}

	pub fn is_manifest_not_found(&self) -> bool {
		matches!(self, CodexError::ManifestNotFound { .. })
	}
}

pub type CodexResult<T> = std::result::Result<T, CodexError>;
