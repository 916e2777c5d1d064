use crate::error::{CodexError, CodexResult};
use std::path::{Component, Path, PathBuf};

fn port_number(port: &str) -> Option<u16> {
	match port.trim().parse::<u32>() {
		Ok(num) if (1..=65535).contains(&num) => Some(num as u16),
		_ => None,
	}
}

pub fn is_valid_port(port: &str) -> bool {
	port_number(port).is_some()
}

/// Returns the port in canonical decimal form (`+8080` and `08080` become
/// `8080`) when it is usable, `None` otherwise.
pub fn validate_port_input(value: &str) -> Option<String> {
	port_number(value).map(|num| num.to_string())
}

pub fn parse_port(field: &'static str, value: &str) -> CodexResult<String> {
	validate_port_input(value).ok_or_else(|| CodexError::validation(field, value))
}

/// A directory path is accepted when it is non-empty and, if it already
/// exists, is a directory.
pub fn validate_directory(field: &'static str, path: impl AsRef<Path>) -> CodexResult<PathBuf> {
	let path = path.as_ref();
	let raw = path.to_string_lossy();
	if raw.trim().is_empty() {
		return Err(CodexError::validation(field, raw));
	}
	if path.exists() && !path.is_dir() {
		return Err(CodexError::validation(field, raw));
	}
	Ok(path.to_path_buf())
}

/// Reduces a remote-supplied file name to a single path component so a
/// download can never escape its destination directory.
pub fn sanitize_file_name(name: &str) -> CodexResult<String> {
	let trimmed = name.trim();
	let last = Path::new(trimmed)
		.components()
		.filter_map(|component| match component {
			Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
			_ => None,
		})
		.last();
	match last {
		Some(part) if !part.trim().is_empty() => Ok(part),
		_ => Err(CodexError::validation("file name", name)),
	}
}
