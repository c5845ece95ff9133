use anyhow::Context;
use clap::Parser;
use fsd::cli::{Cli, Commands};
use fsd::config::load_config;
use fsd::server::run;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            addr,
            workers,
        } => {
            let mut cfg = load_config(&config)?;
            if let Some(addr) = addr {
                cfg.addr = addr;
            }
            if let Some(workers) = workers {
                cfg.workers = workers;
            }
            cfg.validate()?;

            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(cfg.log_level.as_str()),
            )
            .format_timestamp_secs()
            .init();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(cfg.workers)
                .thread_name("fsd-worker")
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(run(cfg))?;
        }
    }

    Ok(())
}
