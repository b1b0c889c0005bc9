use clap::Parser;
use keeper::modules::blob::HttpBlobClient;
use keeper::modules::harvest::Harvester;
use keeper::modules::serialize::{KeeperConfig, load_run_config, load_snapshot_file, parse_snapshot};
use log::info;
use simplelog::*;
use std::error::Error;
use std::fs::OpenOptions;

#[derive(Parser)]
#[command(
    name = "keeper",
    version,
    about = "URL keeper harvest worker",
    long_about = include_str!("../help.txt")
)]
struct Cli {
    #[arg(short = 'l', long = "log-file", default_value = "keeper.log")]
    log_file: String,

    #[arg(short = 'c', long = "config", default_value = "./keeper.toml")]
    config: String,

    #[arg(short = 'o', long = "out-dir", default_value = "./harvest")]
    out_dir: String,
}

fn init_logger(log_path: &str) -> Result<(), Box<dyn Error>> {
    WriteLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .build(),
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?,
    )?;
    Ok(())
}

fn load_snapshot(config: &KeeperConfig) -> Result<serde_json::Value, Box<dyn Error>> {
    if let Some(url) = &config.snapshot_url {
        let client = HttpBlobClient::new(&config.backend_url)?;
        return Ok(client.fetch_document(url)?);
    }
    if let Some(path) = &config.snapshot_file {
        return load_snapshot_file(path);
    }
    Err("keeper.toml must set snapshot_url or snapshot_file".into())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_file)?;

    let config = load_run_config(&cli.config)?;
    let snapshot = load_snapshot(&config)?;
    let (tables, _shape) = parse_snapshot(snapshot)?;
    info!("Loaded {} table(s)", tables.len());

    let harvester = Harvester::new(&cli.out_dir)?;
    let summary = harvester.run(&tables);
    info!("Harvest finished: {summary}");

    Ok(())
}
