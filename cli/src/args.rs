use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "codexdesk", about = "Desktop companion for a local Codex storage node")]
pub struct Args {
	/// Log at debug level.
	#[clap(long, short)]
	pub verbose: bool,
	/// Use this api port for this invocation without saving it.
	#[clap(long, value_name = "PORT")]
	pub api_port: Option<String>,
	/// Settings file, defaults to ~/.codexdesk/settings.json.
	#[clap(long, value_name = "PATH")]
	pub settings: Option<PathBuf>,
	#[clap(subcommand)]
	pub command: Option<Command>,
}

#[derive(Debug, Parser)]
pub enum Command {
	/// Start the daemon when configured and watch it until Ctrl+C.
	Run,
	/// Probe the daemon api once.
	Status,
	/// List codex processes already running on this machine.
	Ps,
	/// Kill every codex process by name.
	Kill,
	#[clap(subcommand)]
	Config(ConfigCommand),
	/// List content held by the local node.
	Files,
	Manifest {
		cid: String,
	},
	Upload {
		#[clap(required = true)]
		paths: Vec<PathBuf>,
	},
	Download {
		cid: String,
		/// Save under this name instead of the manifest's.
		#[clap(long)]
		name: Option<String>,
	},
	/// Stream content straight from the network.
	Leech {
		cid: String,
	},
	/// Ask the node to fetch and host content.
	Seed {
		cid: String,
		/// Download the local copy once seeding finishes.
		#[clap(long)]
		download: bool,
	},
	Recent {
		#[clap(long)]
		clear: bool,
	},
}

#[derive(Debug, Parser)]
pub enum ConfigCommand {
	Show,
	SetDataDir { path: PathBuf },
	ClearDataDir,
	/// Kind is one of discovery, listening or api.
	SetPort { kind: String, value: String },
	SetDownloadDir { path: PathBuf },
	ResetDownloadDir,
}
