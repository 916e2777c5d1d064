use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Time source shared by the components that reason about deadlines.
pub trait Clock: Send + Sync {
	fn now(&self) -> Instant;
	/// Wall clock milliseconds since the unix epoch.
	fn timestamp_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	fn timestamp_ms(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}

/// Clock that only moves when told to.
pub struct ManualClock {
	origin: Instant,
	epoch_ms: i64,
	elapsed: Mutex<Duration>,
}

impl ManualClock {
	pub fn new(epoch_ms: i64) -> Self {
		Self {
			origin: Instant::now(),
			epoch_ms,
			elapsed: Mutex::new(Duration::ZERO),
		}
	}

	pub fn advance(&self, by: Duration) {
		if let Ok(mut elapsed) = self.elapsed.lock() {
			*elapsed += by;
		}
	}

	fn elapsed(&self) -> Duration {
		self.elapsed.lock().map(|e| *e).unwrap_or_default()
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Instant {
		self.origin + self.elapsed()
	}

	fn timestamp_ms(&self) -> i64 {
		self.epoch_ms + self.elapsed().as_millis() as i64
	}
}
