const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// 1024-based size label with at most two decimals, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
	if bytes == 0 {
		return String::from("0 Bytes");
	}
	let mut unit = 0;
	let mut value = bytes as f64;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	let rounded = format!("{value:.2}");
	let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
	format!("{} {}", trimmed, UNITS[unit])
}
