//! modctl - Modbus command-line master and test slave
//!
//! Master subcommands send one request to the configured target and print
//! the answer as a hex string. `serve` exposes a zeroed process image until
//! Ctrl+C.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use modstack::{ModbusMaster, SlaveRegistry};
use tracing::debug;

use crate::commands::{MasterCommand, ServeArgs};
use crate::config::ModctlConfig;

#[derive(Parser, Debug)]
#[command(name = "modctl")]
#[command(about = "Modbus master and test slave over TCP, UDP and serial")]
#[command(long_about = "Modbus master and test slave over TCP, UDP and serial

Examples:
  modctl -t tcp:192.168.1.10 read-holding 0 10     # 10 holding registers of unit 1
  modctl -t udp:10.0.0.7 -u 3 write-register 4 0x00FF
  modctl -t device:/dev/ttyUSB0 read-coils 0 16
  modctl serve --registers 100 --port 1502          # test slave until Ctrl+C

Settings not given on the command line come from --config and MODCTL_*
environment variables (e.g. MODCTL_MASTER__TIMEOUT_MS=1000).")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(short = 'l', long = "log-level", global = true)]
    log_level: Option<String>,

    /// Connection target: tcp:<host>[:<port>], udp:<host>[:<port>] or device:<port>
    #[arg(short = 't', long, global = true)]
    target: Option<String>,

    /// Unit ID addressed by master commands and served by `serve`
    #[arg(short = 'u', long = "unit", global = true)]
    unit_id: Option<u8>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Master(MasterCommand),

    /// Run a slave with zeroed registers until Ctrl+C
    Serve(ServeArgs),

    /// Print the effective configuration as YAML
    Config,
}

impl Cli {
    /// Command-line flags win over file and environment
    fn apply_overrides(&self, config: &mut ModctlConfig) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(target) = &self.target {
            config.master.target = target.clone();
        }
        if let Some(unit_id) = self.unit_id {
            config.master.unit_id = unit_id;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ModctlConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    common::init_logging(&config.log_level)?;

    match cli.command {
        Commands::Master(command) => {
            let master = ModbusMaster::from_config(&config.master)?;
            debug!("Sending {:?} to {}", command, config.master.target);
            let result = commands::run_master(&master, config.master.unit_id, &command).await;
            master.disconnect().await;
            println!("{}", result?);
        },
        Commands::Serve(args) => {
            commands::serve(
                SlaveRegistry::global(),
                config.slave,
                config.master.unit_id,
                &args,
                common::wait_for_shutdown(),
            )
            .await?;
        },
        Commands::Config => {
            print!("{}", config.to_yaml()?);
        },
    }

    Ok(())
}
