//! Process control surface used by the supervisor: spawn, run-and-collect,
//! kill, liveness probing and process table lookups.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
	pub pid: u32,
	pub name: String,
}

/// A spawned daemon. Owned by exactly one supervisor.
#[async_trait]
pub trait DaemonChild: Send + Sync {
	fn id(&self) -> Option<u32>;
	/// Non-blocking check; `false` once the process has exited.
	fn is_alive(&mut self) -> bool;
	async fn kill(&mut self) -> io::Result<()>;
	/// Last lines the process wrote to stdout/stderr.
	fn recent_output(&self) -> Vec<String> {
		Vec::new()
	}
}

#[async_trait]
pub trait ProcessBackend: Send + Sync {
	async fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn DaemonChild>>;
	/// Runs a command to completion. A non-zero exit with output on stderr is
	/// an error; a non-zero exit without stderr counts as success.
	async fn execute(&self, program: &str, args: &[String]) -> Result<String>;
	fn list_by_name(&self, name: &str) -> Vec<ProcessInfo>;
}

pub struct SystemProcessBackend;

impl SystemProcessBackend {
	pub fn new() -> Self {
		SystemProcessBackend
	}
}

impl Default for SystemProcessBackend {
	fn default() -> Self {
		Self::new()
	}
}

/// Resolves the daemon binary: `CODEXDESK_BINARY`, then a sibling of the
/// current executable under `binaries/`, then the bare name on `PATH`.
pub fn resolve_daemon_binary(name: &str) -> PathBuf {
	if let Some(path) = std::env::var_os("CODEXDESK_BINARY") {
		return PathBuf::from(path);
	}
	if let Ok(exe) = std::env::current_exe() {
		if let Some(dir) = exe.parent() {
			let candidate = dir.join("binaries").join(name);
			if candidate.exists() {
				return candidate;
			}
		}
	}
	PathBuf::from(name)
}

struct SpawnedDaemon {
	child: Child,
	output: Arc<Mutex<VecDeque<String>>>,
}

fn forward_output<R>(reader: R, stream: &'static str, tail: Arc<Mutex<VecDeque<String>>>)
where
	R: AsyncRead + Unpin + Send + 'static,
{
	tokio::spawn(async move {
		let mut lines = BufReader::new(reader).lines();
		loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					log::info!("codex {stream}: {line}");
					if let Ok(mut tail) = tail.lock() {
						if tail.len() == OUTPUT_TAIL_LINES {
							tail.pop_front();
						}
						tail.push_back(line);
					}
				}
				Ok(None) => break,
				Err(err) => {
					log::debug!("codex {stream} closed: {err}");
					break;
				}
			}
		}
	});
}

#[async_trait]
impl DaemonChild for SpawnedDaemon {
	fn id(&self) -> Option<u32> {
		self.child.id()
	}

	fn is_alive(&mut self) -> bool {
		match self.child.try_wait() {
			Ok(None) => true,
			Ok(Some(status)) => {
				log::warn!("codex exited: {status}");
				false
			}
			Err(err) => {
				log::warn!("failed to poll codex process: {err}");
				false
			}
		}
	}

	async fn kill(&mut self) -> io::Result<()> {
		match self.child.kill().await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
			Err(err) => Err(err),
		}
	}

	fn recent_output(&self) -> Vec<String> {
		self.output
			.lock()
			.map(|tail| tail.iter().cloned().collect())
			.unwrap_or_default()
	}
}

#[async_trait]
impl ProcessBackend for SystemProcessBackend {
	async fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn DaemonChild>> {
		log::info!("spawning {} {}", program.display(), args.join(" "));
		let mut child = Command::new(program)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;
		let output = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
		if let Some(stdout) = child.stdout.take() {
			forward_output(stdout, "stdout", Arc::clone(&output));
		}
		if let Some(stderr) = child.stderr.take() {
			forward_output(stderr, "stderr", Arc::clone(&output));
		}
		Ok(Box::new(SpawnedDaemon { child, output }))
	}

	async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
		let output = Command::new(program)
			.args(args)
			.output()
			.await
			.map_err(|e| anyhow!("Failed to execute command: {e}"))?;
		if output.status.success() {
			return Ok(String::from_utf8_lossy(&output.stdout).to_string());
		}
		let stderr = String::from_utf8_lossy(&output.stderr);
		if stderr.trim().is_empty() {
			Ok(String::from("Command executed successfully"))
		} else {
			Err(anyhow!("Command failed: {}", stderr.trim()))
		}
	}

	fn list_by_name(&self, name: &str) -> Vec<ProcessInfo> {
		let mut system = System::new();
		system.refresh_processes(ProcessesToUpdate::All, true);
		let own_pid = std::process::id();
		system
			.processes()
			.values()
			.filter(|process| process.pid().as_u32() != own_pid)
			.filter_map(|process| {
				let process_name = process.name().to_string_lossy().to_string();
				if process_name.contains(name) {
					Some(ProcessInfo {
						pid: process.pid().as_u32(),
						name: process_name,
					})
				} else {
					None
				}
			})
			.collect()
	}
}
