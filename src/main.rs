mod checkpoint;
mod config;
mod dataset;
mod evaluation;
mod grasp;
mod imaging;
mod loader;
mod model;
mod preview;
mod summary;
mod train;

use clap::Parser;
use log::warn;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if cfg!(debug_assertions) {
        warn!("Running a debug build. Training can be much slower. Use `cargo run --release ...`.");
    }
    let cfg = config::TrainConfig::parse();
    train::run_training(&cfg)
}
