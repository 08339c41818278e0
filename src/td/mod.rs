pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod context;
pub mod daemon;
pub mod definition;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod restart;
pub mod stdio;
pub mod store;
pub mod task;

pub async fn main() -> anyhow::Result<()> {
    cli::run().await
}
