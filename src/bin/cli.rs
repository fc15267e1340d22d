//! ccTalk CLI - Command-line interface
//!
//! Drives an MD-100 bill acceptor/dispenser from scripts and terminals.

use anyhow::Context;
use cctalk_core::cli::{init_logging, print_exit_codes, CliResult, ExitCodes};
use cctalk_core::config::{AppConfig, ConfigError};
use cctalk_core::core::device::md100::{DispenseSlot, Md100};
use cctalk_core::core::device::{DeviceError, OperationHandle, OperationResult};
use cctalk_core::core::transport::{list_ports, MasterDevice, TransportError};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// ccTalk CLI
#[derive(Parser, Debug)]
#[command(
    name = "cctalk-cli",
    version,
    about = "ccTalk bus master for MD-100 bill acceptor/dispensers",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "CCTALK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long, env = "CCTALK_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Device address on the bus
    #[arg(short, long)]
    address: Option<u8>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Check that the device answers
    Poll,

    /// Initialise the device and print its identity
    Info,

    /// Print device notifications while polling
    Events {
        /// How long to listen (seconds)
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },

    /// Enable bill types and verify the device took them
    Enable {
        /// Bill type mask, bit 0 is bill type 1 (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = parse_mask)]
        mask: u32,
    },

    /// Pay out one bill
    Dispense {
        /// Dispenser slot (1-3)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=3))]
        slot: u8,
    },

    /// Soft reset followed by initialisation
    Reset,

    /// Print the exit code table
    ExitCodes,
}

fn parse_mask(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid mask '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match run(&cli).await {
        Ok(result) => result,
        Err(e) => classify(e),
    };

    match &result {
        CliResult::Success(Some(msg)) if !cli.quiet => eprintln!("{}", msg),
        CliResult::Error(code, msg) => eprintln!("error ({}): {}", code, msg),
        _ => {}
    }
    result.to_exit_code()
}

async fn run(cli: &Cli) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::ListPorts { detailed } => return list(cli, *detailed),
        Commands::ExitCodes => {
            print_exit_codes();
            return Ok(CliResult::success());
        }
        _ => {}
    }

    let config = load_config(cli)?;
    let _log_guard = init_logging(&config.logging)?;
    tracing::debug!("ccTalk CLI v{}", cctalk_core::VERSION);

    let session = Session::open(&config).await?;
    let result = session.execute(cli, &config).await;
    session.close().await;
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load()?,
    };

    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(address) = cli.address {
        config.bus.device_address = address;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    } else if cli.quiet {
        config.logging.level = "error".to_string();
    }
    config.validate()?;

    if config.serial.port.is_empty() {
        return Err(ConfigError::Invalid("no serial port given (use --port or serial.port)".into()).into());
    }
    Ok(config)
}

/// Open master and device for one command
struct Session {
    master: Arc<MasterDevice>,
    device: Arc<Md100>,
}

impl Session {
    async fn open(config: &AppConfig) -> anyhow::Result<Self> {
        let master = Arc::new(
            MasterDevice::new(config.bus.master_address).settle_delay(config.timing.settle_delay()),
        );
        master.configure(config.serial.clone());
        master.connect().await?;

        let slave = master
            .add_slave(config.bus.device_address)
            .with_timeout(config.timing.command_timeout());
        let device = Md100::new(slave, config.md100_options());
        Ok(Self { master, device })
    }

    async fn close(self) {
        self.device.terminate().await;
        self.master.terminate().await;
    }

    async fn execute(&self, cli: &Cli, config: &AppConfig) -> anyhow::Result<CliResult> {
        let timeout = config.timing.operation_timeout();
        let device = &self.device;

        match &cli.command {
            Commands::Poll => {
                let ack = device.slave().simple_poll().await?;
                output(cli, &format!("device {} answered", device.slave().address()), &ack);
                if ack {
                    Ok(CliResult::success())
                } else {
                    Ok(CliResult::error(ExitCodes::PROTOCOL_ERROR, "device did not acknowledge"))
                }
            }
            Commands::Info => {
                device.start_polling();
                let result = self.wait(device.init(timeout)?).await;
                finish(result, |()| {
                    let info = device.info();
                    output(cli, &format_info(&info, device), &info);
                })
            }
            Commands::Reset => {
                device.start_polling();
                let result = self.wait(device.reset(timeout)?).await;
                finish(result, |()| output(cli, "device reset", &true))
            }
            Commands::Enable { mask } => {
                device.start_polling();
                let result = self.wait(device.enable_bill_types(*mask, timeout)?).await;
                finish(result, |actual| {
                    output(cli, &format!("enabled bill types: {:#08x}", actual), &actual);
                })
            }
            Commands::Dispense { slot } => {
                let slot = DispenseSlot::from_number(*slot)
                    .ok_or_else(|| DeviceError::InvalidArgument(format!("slot {}", slot)))?;
                device.start_polling();
                let result = self.wait(device.dispense(slot, timeout)?).await;
                match result.into_result() {
                    Ok(dispensed) if dispensed.is_ok() => {
                        output(cli, "bill dispensed", &dispensed);
                        Ok(CliResult::success())
                    }
                    Ok(refused) => {
                        output(cli, &format!("dispense refused: {}", refused.description()), &refused);
                        Ok(CliResult::error(ExitCodes::DISPENSE_FAILED, refused.description()))
                    }
                    Err(description) => Ok(operation_failed(description)),
                }
            }
            Commands::Events { duration } => {
                self.listen(cli, Duration::from_secs(*duration)).await;
                Ok(CliResult::success())
            }
            Commands::ListPorts { .. } | Commands::ExitCodes => Ok(CliResult::success()),
        }
    }

    /// Await an operation, cancelling it on Ctrl+C
    async fn wait<T>(&self, handle: OperationHandle<T>) -> OperationResult<T> {
        let id = handle.id();
        let join = handle.join();
        tokio::pin!(join);
        tokio::select! {
            result = &mut join => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling operation {}", id);
                self.device.cancel_operation();
                join.await
            }
        }
    }

    async fn listen(&self, cli: &Cli, duration: Duration) {
        let mut notifications = self.device.subscribe();
        self.device.start_polling();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
                received = notifications.recv() => match received {
                    Ok(notification) => output(cli, &format!("{:?}", notification), &notification),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("skipped {} notifications", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

fn list(cli: &Cli, detailed: bool) -> anyhow::Result<CliResult> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {} [{:?}]", port.port_name, port.port_type);
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(CliResult::success())
}

fn format_info(info: &cctalk_core::core::device::md100::DeviceInfo, device: &Md100) -> String {
    let table = device.bill_types();
    let mut lines = vec![
        format!("Manufacturer:   {}", info.manufacturer_id),
        format!("Category:       {}", info.equipment_category),
        format!("Product:        {}", info.product_code),
        format!("Build:          {}", info.build_code),
        format!("Serial number:  {}", info.serial_number),
        format!("Software:       {}", info.software_revision),
        format!(
            "Comms revision: {}.{}.{}",
            info.comms_revision.release, info.comms_revision.major, info.comms_revision.minor
        ),
        format!("Currency:       {}", info.currency_revision),
        format!("Checksums:      {}", info.checksums.join(" ")),
        format!("Mode:           {:?}", info.operation_mode),
        "Bill types:".to_string(),
    ];
    for bill in table.iter().filter(|b| !b.country.is_empty()) {
        lines.push(format!(
            "  {:>2} {} {:>6} fill {:>4}/{:<4} {}",
            bill.id,
            bill.country,
            bill.value_code,
            bill.fill_size,
            bill.max_fill,
            if bill.enabled { "enabled" } else { "inhibited" }
        ));
    }
    lines.join("\n")
}

fn output<T: Serialize>(cli: &Cli, text: &str, value: &T) {
    match cli.format {
        OutputFormat::Json => match serde_json::to_string(value) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::error!("serialising output: {}", e),
        },
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", text);
            }
        }
    }
}

fn finish<T>(result: OperationResult<T>, on_success: impl FnOnce(T)) -> anyhow::Result<CliResult> {
    match result.into_result() {
        Ok(value) => {
            on_success(value);
            Ok(CliResult::success())
        }
        Err(description) => Ok(operation_failed(description)),
    }
}

fn operation_failed(description: String) -> CliResult {
    let code = if description == DeviceError::Cancelled.to_string() {
        ExitCodes::CANCELLED
    } else if description == DeviceError::BillNotDispensed.to_string()
        || description.starts_with("Dispense refused")
    {
        ExitCodes::DISPENSE_FAILED
    } else {
        ExitCodes::ERROR
    };
    CliResult::error(code, description)
}

fn classify(err: anyhow::Error) -> CliResult {
    let err = match err.downcast::<DeviceError>() {
        Ok(e) => return CliResult::from(e),
        Err(err) => err,
    };
    let err = match err.downcast::<TransportError>() {
        Ok(e) => return CliResult::from(e),
        Err(err) => err,
    };
    let err = match err.downcast::<ConfigError>() {
        Ok(e) => return CliResult::from(e),
        Err(err) => err,
    };
    match err.downcast::<std::io::Error>() {
        Ok(e) => CliResult::from(e),
        Err(err) => CliResult::error(ExitCodes::ERROR, format!("{:#}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("63"), Ok(63));
        assert_eq!(parse_mask("0x3f"), Ok(0x3f));
        assert_eq!(parse_mask("0X1FFFFF"), Ok(0x1F_FFFF));
        assert!(parse_mask("ten").is_err());
    }

    #[test]
    fn test_cli_parses_global_overrides() {
        let cli = Cli::try_parse_from([
            "cctalk-cli", "--port", "/dev/ttyUSB1", "--address", "2", "-f", "json", "enable", "--mask",
            "0x3f",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(cli.address, Some(2));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Enable { mask: 0x3f }));
    }

    #[test]
    fn test_dispense_slot_range() {
        assert!(Cli::try_parse_from(["cctalk-cli", "dispense", "--slot", "2"]).is_ok());
        assert!(Cli::try_parse_from(["cctalk-cli", "dispense", "--slot", "4"]).is_err());
    }

    #[test]
    fn test_classify_errors() {
        let err = anyhow::Error::from(DeviceError::from(TransportError::NoResponse));
        assert_eq!(classify(err).code(), ExitCodes::NO_RESPONSE);

        let err = anyhow::Error::from(ConfigError::Invalid("bad".into())).context("loading");
        assert_eq!(classify(err).code(), ExitCodes::CONFIG_ERROR);

        assert_eq!(classify(anyhow::anyhow!("other")).code(), ExitCodes::ERROR);
        assert_eq!(operation_failed("Operation cancelled".into()).code(), ExitCodes::CANCELLED);
        let refused = DeviceError::DispenseRefused {
            code: 0xA6,
            reason: "pay out denied, old pay out in process",
        };
        assert_eq!(operation_failed(refused.to_string()).code(), ExitCodes::DISPENSE_FAILED);
    }
}
