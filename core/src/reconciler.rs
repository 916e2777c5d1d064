use crate::clock::Clock;
use crate::monitor::ConnectionStatus;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How long a user stop suppresses a stale "connected" poll result.
pub const OVERRIDE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImmediateOverride {
	None,
	ForcedDisconnected,
}

/// Status shown to the user: the monitor's observation unless a recent user
/// stop is still being honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EffectiveStatus {
	Unknown,
	Found,
	NotFound,
	ForcedDisconnected,
}

impl EffectiveStatus {
	pub fn is_connected(self) -> bool {
		self == EffectiveStatus::Found
	}
}

impl From<ConnectionStatus> for EffectiveStatus {
	fn from(status: ConnectionStatus) -> Self {
		match status {
			ConnectionStatus::Unknown => EffectiveStatus::Unknown,
			ConnectionStatus::Found => EffectiveStatus::Found,
			ConnectionStatus::NotFound => EffectiveStatus::NotFound,
		}
	}
}

impl fmt::Display for EffectiveStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EffectiveStatus::Unknown => f.write_str("Unknown"),
			EffectiveStatus::Found => f.write_str("Found"),
			EffectiveStatus::NotFound => f.write_str("Not Found"),
			EffectiveStatus::ForcedDisconnected => f.write_str("Not Found (stopped)"),
		}
	}
}

#[derive(Debug, Clone, Copy)]
struct ExpiringOverride {
	value: ImmediateOverride,
	deadline: Option<Instant>,
}

impl ExpiringOverride {
	const CLEAR: ExpiringOverride = ExpiringOverride {
		value: ImmediateOverride::None,
		deadline: None,
	};

	fn current(&self, now: Instant) -> ImmediateOverride {
		match self.deadline {
			Some(deadline) if now < deadline => self.value,
			_ => ImmediateOverride::None,
		}
	}
}

/// Merges the polled connection state with short-lived user intent.
///
/// The override is a value with a deadline checked on every read. There is no
/// timer to miss: once the deadline passes the override is gone.
pub struct StatusReconciler {
	clock: Arc<dyn Clock>,
	ttl: Duration,
	state: Mutex<ExpiringOverride>,
}

impl StatusReconciler {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self::with_ttl(clock, OVERRIDE_TTL)
	}

	pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
		Self {
			clock,
			ttl,
			state: Mutex::new(ExpiringOverride::CLEAR),
		}
	}

	pub fn on_user_stop(&self) {
		let deadline = self.clock.now() + self.ttl;
		if let Ok(mut state) = self.state.lock() {
			*state = ExpiringOverride {
				value: ImmediateOverride::ForcedDisconnected,
				deadline: Some(deadline),
			};
		}
		log::debug!("connection override set for {:?}", self.ttl);
	}

	pub fn on_user_start(&self) {
		if let Ok(mut state) = self.state.lock() {
			*state = ExpiringOverride::CLEAR;
		}
	}

	pub fn immediate_override(&self) -> ImmediateOverride {
		let now = self.clock.now();
		match self.state.lock() {
			Ok(mut state) => {
				let current = state.current(now);
				if current == ImmediateOverride::None {
					*state = ExpiringOverride::CLEAR;
				}
				current
			}
			Err(_) => ImmediateOverride::None,
		}
	}

	pub fn effective_status(&self, observed: ConnectionStatus) -> EffectiveStatus {
		match self.immediate_override() {
			ImmediateOverride::ForcedDisconnected => EffectiveStatus::ForcedDisconnected,
			ImmediateOverride::None => observed.into(),
		}
	}
}
