/// Meter Simulator
///
/// Runs a Modbus RTU slave on a serial port that answers like an
/// energy/water meter. Settings come from an optional JSON file and are
/// overridden by command line flags.
///
/// ```text
/// meter_sim --port /dev/ttyUSB0 --baud 9600 --parity N --unit 1
/// ```
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use meter_modbus_sim::transport::{DataBits, Parity, StopBits};
use meter_modbus_sim::utils::format::format_duration;
use meter_modbus_sim::{
    open_serial, MeterSimulator, ModbusRegisterBank, ModbusResult, ModbusRtuServer, ModbusRtuServerConfig,
    ModbusServer, SimulationDriver, SimulatorConfig,
};

/// Modbus RTU slave emulating an energy/water meter
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serial port, e.g. /dev/ttyUSB0 or COM5
    #[arg(long)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Parity: N, E or O
    #[arg(long)]
    parity: Option<String>,

    /// Stop bits: 1 or 2
    #[arg(long)]
    stopbits: Option<u8>,

    /// Data bits: 7 or 8
    #[arg(long)]
    bytesize: Option<u8>,

    /// Unit id to answer (1-247)
    #[arg(long)]
    unit: Option<u8>,

    /// Answer every unit id on the bus
    #[arg(long)]
    single: bool,

    /// Do not update the readings; registers keep their initial values
    #[arg(long)]
    no_auto: bool,

    /// Simulation tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dump every frame on the bus
    #[arg(long)]
    log_packets: bool,
}

impl Args {
    /// Build the effective configuration: file (or defaults), then flags
    fn into_config(self) -> ModbusResult<SimulatorConfig> {
        let mut config = match &self.config {
            Some(path) => SimulatorConfig::from_json_file(path)?,
            None => SimulatorConfig::default(),
        };

        if let Some(port) = self.port {
            config.serial.port = port;
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(parity) = &self.parity {
            config.serial.parity = Parity::from_letter(parity)?;
        }
        if let Some(stop_bits) = self.stopbits {
            config.serial.stop_bits = StopBits::from_count(stop_bits)?;
        }
        if let Some(data_bits) = self.bytesize {
            config.serial.data_bits = DataBits::from_count(data_bits)?;
        }
        if let Some(unit) = self.unit {
            config.unit_id = unit;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_interval_ms = tick_ms;
        }
        config.single |= self.single;
        config.log_packets |= self.log_packets;
        if self.no_auto {
            config.auto_update = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match Args::parse().into_config() {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: SimulatorConfig) -> ModbusResult<()> {
    info!("🚀 {}", meter_modbus_sim::info());

    let port = open_serial(&config.serial)?;
    info!("📡 Serial port opened: {}", config.serial);

    let register_bank = Arc::new(ModbusRegisterBank::with_capacities(config.capacities));
    let simulator = MeterSimulator::new(register_bank.clone(), config.tick_interval())?;
    let driver = if config.auto_update {
        Some(SimulationDriver::spawn(simulator))
    } else {
        info!("⏸️  Auto update disabled, registers keep their initial values");
        None
    };

    let mut server = ModbusRtuServer::with_config(ModbusRtuServerConfig::from(&config), port, register_bank);
    server.start().await?;

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("🛑 Shutdown requested");
            Ok(())
        }
        result = server.wait() => result,
    };

    if let Some(driver) = driver {
        driver.stop().await;
    }
    server.stop().await?;

    let stats = server.get_stats();
    info!("📊 Session statistics:");
    info!("   - Uptime: {}", format_duration(std::time::Duration::from_secs(stats.uptime_seconds)));
    info!("   - Frames received: {}", stats.frames_received);
    info!("   - Requests answered: {}", stats.requests_dispatched);
    info!("   - Exception responses: {}", stats.exception_responses);
    info!("   - Checksum errors: {}", stats.checksum_errors);
    info!("   - Ignored frames: {}", stats.ignored_frames);

    outcome
}
