use anyhow::{Result, anyhow, bail};
use args::{Command, ConfigCommand};
use chrono::{Local, TimeZone};
use clap::Parser;
use codexdesk_core::format::format_bytes;
use codexdesk_core::{
	DownloadEvent, DownloadProgress, PortKind, Session, SessionOptions, TransferStatus,
};
use futures::StreamExt;

mod args;

#[tokio::main]
async fn main() {
	let args = args::Args::parse();
	let level = if args.verbose {
		log::Level::Debug
	} else {
		log::Level::Info
	};
	if let Err(err) = simple_logger::init_with_level(level) {
		eprintln!("failed to initialise logging: {err}");
	}

	if let Err(err) = run(args).await {
		log::error!("{err:?}");
		std::process::exit(1);
	}
}

async fn run(args: args::Args) -> Result<()> {
	let mut options = SessionOptions::from_env()?;
	options.api_port = args.api_port.clone();
	let session = Session::open(args.settings.clone(), options)?;

	match args.command.unwrap_or(Command::Run) {
		Command::Run => {
			log::info!("codexdesk version {}", env!("CARGO_PKG_VERSION"));
			session.run_until_shutdown().await;
		}
		Command::Status => {
			let status = session.refresh_status().await;
			println!("Codex: {status}");
			if status.is_connected() {
				let info = session.api()?.debug_info().await?;
				println!("{}", serde_json::to_string_pretty(&info)?);
			}
		}
		Command::Ps => {
			println!("{}", session.supervisor().list_existing_processes());
		}
		Command::Kill => {
			session.stop_daemon().await;
			println!("{}", session.supervisor().status().output);
		}
		Command::Config(cmd) => config(&session, cmd)?,
		Command::Files => {
			let files = session.node_files().await?;
			for file in &files {
				println!(
					"{}  {:>10}  {}",
					file.cid,
					format_bytes(file.manifest.dataset_size),
					file.manifest.filename.as_deref().unwrap_or("-")
				);
			}
			let summary = codexdesk_core::NodeSummary::of(&files);
			println!(
				"{} files, {} total",
				summary.file_count,
				format_bytes(summary.total_size)
			);
		}
		Command::Manifest { cid } => {
			let manifest = session.manifest(&cid).await?;
			println!("{}", serde_json::to_string_pretty(&manifest)?);
		}
		Command::Upload { paths } => {
			let items = session.upload_files(&paths).await;
			let mut failed = 0;
			for item in &items {
				match item.status {
					TransferStatus::Succeeded => println!(
						"{}  {}",
						item.content_id.as_deref().unwrap_or("-"),
						item.name
					),
					_ => {
						failed += 1;
						println!(
							"failed  {}: {}",
							item.name,
							item.error_detail.as_deref().unwrap_or("unknown error")
						);
					}
				}
			}
			if failed > 0 {
				bail!("{failed} of {} uploads failed", items.len());
			}
		}
		Command::Download { cid, name } => follow(session.download(&cid, name)?).await?,
		Command::Leech { cid } => follow(session.leech(&cid)?).await?,
		Command::Seed { cid, download } => {
			if download {
				follow(session.seed_then_download(&cid)?).await?;
			} else {
				session.seed(&cid).await?;
				println!("Successfully seeded {cid} to local node");
			}
		}
		Command::Recent { clear } => {
			if clear {
				session.recent().clear()?;
				println!("Recent files cleared");
			} else {
				for item in session.recent().list() {
					let when = Local
						.timestamp_millis_opt(item.timestamp_ms)
						.single()
						.map(|at| at.format("%Y-%m-%d %H:%M").to_string())
						.unwrap_or_default();
					println!(
						"{when}  {:?}  {}  {}  {}",
						item.origin, item.content_id, item.size_label, item.name
					);
				}
			}
		}
	}
	Ok(())
}

fn config(session: &Session, cmd: ConfigCommand) -> Result<()> {
	match cmd {
		ConfigCommand::Show => {
			let config = session.config()?;
			println!("{}", serde_json::to_string_pretty(&config)?);
			println!("download directory: {}", session.download_directory()?.display());
			println!("api: {}", config.api_base());
		}
		ConfigCommand::SetDataDir { path } => session.select_data_directory(path)?,
		ConfigCommand::ClearDataDir => session.clear_data_directory()?,
		ConfigCommand::SetPort { kind, value } => {
			let kind: PortKind = kind.parse().map_err(|err: String| anyhow!(err))?;
			session.set_port(kind, &value)?;
		}
		ConfigCommand::SetDownloadDir { path } => session.select_download_directory(path)?,
		ConfigCommand::ResetDownloadDir => session.reset_download_directory()?,
	}
	Ok(())
}

async fn follow(mut progress: DownloadProgress) -> Result<()> {
	let mut last = None;
	while let Some(event) = progress.next().await {
		match event {
			DownloadEvent::Seeding => log::info!("seeding to local node..."),
			DownloadEvent::Seeded => log::info!("seeded, downloading local copy"),
			DownloadEvent::Progress(pct) => {
				if last.is_none_or(|shown: u8| pct / 10 > shown / 10) {
					log::info!("downloading {pct}%");
					last = Some(pct);
				}
			}
			DownloadEvent::Completed(path) => println!("saved to {}", path.display()),
			DownloadEvent::Failed(err) => log::warn!("download failed: {err}"),
		}
	}
	progress.finish().await?;
	Ok(())
}
