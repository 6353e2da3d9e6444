//! Subcommand implementations

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use modstack::{
    Coil, ModbusMaster, ModbusSlave, ProcessImage, SlaveConfig, SlaveRegistry, StatsSnapshot,
    TransportKind,
};
use tracing::info;

use crate::output::{coils_hex, parse_coil, parse_u16, registers_hex};

/// One request against the configured target
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MasterCommand {
    /// Read holding registers (FC 03)
    ReadHolding {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        #[arg(value_parser = parse_u16, default_value = "1")]
        count: u16,
    },

    /// Read input registers (FC 04)
    ReadInput {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        #[arg(value_parser = parse_u16, default_value = "1")]
        count: u16,
    },

    /// Read coils (FC 01)
    ReadCoils {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        #[arg(value_parser = parse_u16, default_value = "1")]
        count: u16,
    },

    /// Write a single holding register (FC 06)
    WriteRegister {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        #[arg(value_parser = parse_u16)]
        value: u16,
    },

    /// Write consecutive holding registers (FC 16)
    WriteRegisters {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        #[arg(value_parser = parse_u16, required = true)]
        values: Vec<u16>,
    },

    /// Write a single coil (FC 05)
    WriteCoil {
        #[arg(value_parser = parse_u16)]
        reference: u16,
        /// on/off
        #[arg(value_parser = parse_coil, action = clap::ArgAction::Set)]
        state: bool,
    },

    /// Write then read holding registers in one request (FC 23)
    ReadWrite {
        #[arg(value_parser = parse_u16)]
        read_reference: u16,
        #[arg(value_parser = parse_u16)]
        read_count: u16,
        #[arg(value_parser = parse_u16)]
        write_reference: u16,
        #[arg(value_parser = parse_u16, required = true)]
        values: Vec<u16>,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServeArgs {
    /// Zeroed holding registers to expose
    #[arg(short, long, default_value_t = 10)]
    pub registers: usize,

    /// Cleared coils to expose
    #[arg(long, default_value_t = 0)]
    pub coils: usize,

    /// Listen port, overrides the configuration
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen on UDP instead of TCP
    #[arg(long)]
    pub udp: bool,
}

/// Run one master command and render the answer as hex
pub async fn run_master(master: &ModbusMaster, unit_id: u8, command: &MasterCommand) -> Result<String> {
    let output = match command {
        MasterCommand::ReadHolding { reference, count } => {
            registers_hex(&master.read_holding_registers(unit_id, *reference, *count).await?)
        },
        MasterCommand::ReadInput { reference, count } => {
            registers_hex(&master.read_input_registers(unit_id, *reference, *count).await?)
        },
        MasterCommand::ReadCoils { reference, count } => {
            coils_hex(&master.read_coils(unit_id, *reference, *count).await?)
        },
        MasterCommand::WriteRegister { reference, value } => {
            master.write_register(unit_id, *reference, *value).await?;
            registers_hex(&[*value])
        },
        MasterCommand::WriteRegisters { reference, values } => {
            master.write_registers(unit_id, *reference, values).await?;
            registers_hex(values)
        },
        MasterCommand::WriteCoil { reference, state } => {
            let confirmed = master.write_coil(unit_id, *reference, *state).await?;
            coils_hex(&[confirmed])
        },
        MasterCommand::ReadWrite {
            read_reference,
            read_count,
            write_reference,
            values,
        } => registers_hex(
            &master
                .read_write_registers(unit_id, *read_reference, *read_count, *write_reference, values)
                .await?,
        ),
    };
    Ok(output)
}

/// Start (or reuse) the slave for `config` and register a zeroed image for `unit_id`
pub async fn start_serving(
    registry: &SlaveRegistry,
    mut config: SlaveConfig,
    unit_id: u8,
    args: &ServeArgs,
) -> Result<Arc<ModbusSlave>> {
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.udp {
        config.transport = TransportKind::Udp;
    }

    let image = Arc::new(ProcessImage::with_registers(unit_id, args.registers));
    for _ in 0..args.coils {
        image.add_coil(Arc::new(Coil::new(false)));
    }

    let slave = registry
        .get_or_start(config)
        .await
        .context("failed to start Modbus slave")?;
    slave.add_process_image(image);

    match slave.local_addr() {
        Some(addr) => info!(
            "Serving unit {} ({} registers, {} coils) on {} {}",
            unit_id,
            args.registers,
            args.coils,
            slave.transport(),
            addr
        ),
        None => info!(
            "Serving unit {} ({} registers, {} coils) on {}",
            unit_id,
            args.registers,
            args.coils,
            slave.config().port_key()
        ),
    }
    Ok(slave)
}

/// Serve a zeroed process image until `shutdown` resolves
///
/// Returns the listener counters at the time of shutdown.
pub async fn serve(
    registry: &SlaveRegistry,
    config: SlaveConfig,
    unit_id: u8,
    args: &ServeArgs,
    shutdown: impl Future<Output = ()>,
) -> Result<StatsSnapshot> {
    let slave = start_serving(registry, config, unit_id, args).await?;
    shutdown.await;

    let stats = slave.stats();
    info!(
        "Stopping slave: {} connections, {} requests, {} exceptions",
        stats.accepted, stats.requests, stats.exceptions
    );
    registry.close_all().await;
    Ok(stats)
}
