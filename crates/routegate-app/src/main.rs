use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use route_core::{telemetry, version};
use routegate::Config;
use routegate::config::parse_config;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "bus-driven HTTP reverse proxy", long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse the configuration and exit
	#[arg(long)]
	validate_only: bool,

	/// Print version
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() {
	telemetry::setup_logging();
	if let Err(e) = run() {
		tracing::error!("fatal: {e:#}");
		std::process::exit(1);
	}
}

fn run() -> anyhow::Result<()> {
	let Args {
		config,
		file,
		validate_only,
		version,
	} = Args::parse();

	if version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	let (contents, filename) = match (config, file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file"),
		(Some(config), None) => (config, None),
		(None, Some(file)) => {
			let contents = std::fs::read_to_string(&file)?;
			(contents, Some(file))
		},
		(None, None) => ("{}".to_string(), None),
	};
	let config = parse_config(&contents, filename)?;
	if validate_only {
		println!("configuration is valid");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(config.worker_threads)
		.enable_all()
		.build()?
		.block_on(proxy(Arc::new(config)))
}

async fn proxy(cfg: Arc<Config>) -> anyhow::Result<()> {
	info!("starting {}", version::BuildInfo::new());
	routegate::app::run(cfg).await?.wait_termination().await
}
