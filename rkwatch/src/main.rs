use clap::Parser;
use log::error;
use rkwatch::cli::{Cli, Commands};
use rkwatch::protocol::config::load_config;
use rkwatch::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, cluster_id } => {
            let mut cfg = load_config(&config)?;
            if let Some(id) = cluster_id {
                cfg.cluster_id = id;
            }
            if let Err(e) = watch::run(cfg).await {
                error!("data watcher exited with error: {e:?}");
                return Err(e);
            }
        }
    }

    Ok(())
}
