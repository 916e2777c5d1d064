use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A repeating background check. The alive flag is consulted before every
/// tick, so a cancelled task never runs its body again even if the timer has
/// already fired.
pub struct PeriodicTask {
	alive: Arc<AtomicBool>,
	handle: JoinHandle<()>,
}

impl PeriodicTask {
	/// Runs `tick` every `period`, first after one full period. The loop ends
	/// when `tick` resolves to `false` or the task is cancelled.
	pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
	where
		F: FnMut() -> Fut + Send + 'static,
		Fut: Future<Output = bool> + Send + 'static,
	{
		let alive = Arc::new(AtomicBool::new(true));
		let flag = Arc::clone(&alive);
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval_at(Instant::now() + period, period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
			loop {
				interval.tick().await;
				if !flag.load(Ordering::SeqCst) {
					break;
				}
				if !tick().await {
					flag.store(false, Ordering::SeqCst);
					break;
				}
			}
			log::debug!("{name} loop stopped");
		});
		Self { alive, handle }
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst) && !self.handle.is_finished()
	}

	pub fn cancel(&self) {
		self.alive.store(false, Ordering::SeqCst);
		self.handle.abort();
	}
}

impl Drop for PeriodicTask {
	fn drop(&mut self) {
		self.cancel();
	}
}
