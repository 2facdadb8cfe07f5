use std::fs;
use std::path::Path;

use anyhow::Result;
use clap::Parser;

mod models;
mod repositories;
pub mod services;
pub mod settings;
pub mod utils;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log4rs).expect("Failed to initialize logging.");
    let config = settings::Settings::load(&args.config).expect("Could not load config file.");

    log::info!("Starting Cash Points referral engine.");
    services::start_services(config).await
}

fn init_logging(path: &str) -> Result<(), anyhow::Error> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Could not initialize logging: {}", e)),
    }
}
