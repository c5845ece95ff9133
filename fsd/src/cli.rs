use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fsd", version, about = "File storage daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the file storage daemon with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,

        /// Listen address, overrides `addr` in the config file
        #[arg(long)]
        addr: Option<String>,

        /// Worker thread count, overrides `workers` in the config file
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_overrides() {
        let cli = Cli::parse_from([
            "fsd",
            "start",
            "--config",
            "/etc/fsd.yaml",
            "--addr",
            "0.0.0.0:7000",
            "-w",
            "8",
        ]);
        let Commands::Start {
            config,
            addr,
            workers,
        } = cli.command;
        assert_eq!(config, PathBuf::from("/etc/fsd.yaml"));
        assert_eq!(addr.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(workers, Some(8));
    }
}
