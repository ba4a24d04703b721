//! EPOS debug tool
//!
//! Issues a single object dictionary request over a serial port and reports
//! the outcome.
//!
//! Usage:
//!   epos-debug --port <PATH> [OPTIONS] <COMMAND>
//!
//! Examples:
//!   # Read the controlword of node 1
//!   epos-debug --port /dev/ttyS0 --node-id 1 read --index 0x6040
//!
//!   # Switch to velocity mode and write a set point
//!   epos-debug --port /dev/ttyS0 set-mode velocity
//!   epos-debug --port /dev/ttyS0 set-velocity 1000

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use epos::epos_cmd::Mode;
use epos::epos_main::{create_epos, Epos};
use epos::{Config, EposError, IntfError, ResponseStatus, SerialInterface};

/// Nominal transmit buffer size; the OS does not report one
const TX_CAPACITY: usize = 4096;
const DEFAULT_VELOCITY_SP: i32 = 1000;

#[derive(Parser)]
#[command(name = "epos-debug")]
#[command(about = "Test and debug an EPOS motor controller over a serial line")]
#[command(version)]
struct Cli {
    /// Serial port device
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = epos::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Transaction timeout in milliseconds
    #[arg(short, long, default_value = "500")]
    timeout_ms: u64,

    /// Target node id
    #[arg(short, long, default_value = "0")]
    node_id: u8,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an object dictionary entry
    Write {
        #[arg(long, value_parser = parse_u16)]
        index: u16,
        #[arg(long, default_value = "0")]
        subindex: u8,
        #[arg(long, value_parser = parse_u32)]
        data: u32,
    },
    /// Read an object dictionary entry
    Read {
        #[arg(long, value_parser = parse_u16)]
        index: u16,
        #[arg(long, default_value = "0")]
        subindex: u8,
    },
    FaultReset,
    Shutdown,
    SwitchOn,
    EnableOperation,
    /// Set the mode of operation
    SetMode { mode: ModeArg },
    /// Write the velocity mode set point
    SetVelocity {
        #[arg(default_value_t = DEFAULT_VELOCITY_SP, allow_negative_numbers = true)]
        value: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Homing,
    ProfileVelocity,
    ProfilePosition,
    Position,
    Velocity,
    Current,
    Diagnostic,
    MasterEncoder,
    StepDirection,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Homing => Mode::Homing,
            ModeArg::ProfileVelocity => Mode::ProfileVelocity,
            ModeArg::ProfilePosition => Mode::ProfilePosition,
            ModeArg::Position => Mode::Position,
            ModeArg::Velocity => Mode::Velocity,
            ModeArg::Current => Mode::Current,
            ModeArg::Diagnostic => Mode::Diagnostic,
            ModeArg::MasterEncoder => Mode::MasterEncoder,
            ModeArg::StepDirection => Mode::StepDirection,
        }
    }
}

fn parse_u32(value: &str) -> Result<u32, String> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|e| format!("invalid number {value:?}: {e}"))
}

fn parse_u16(value: &str) -> Result<u16, String> {
    let wide = parse_u32(value)?;
    u16::try_from(wide).map_err(|_| format!("{value} does not fit in 16 bits"))
}

/// Adapts an OS serial port to the driver. Nothing here blocks: reads are
/// only issued for bytes the port already holds.
struct PortInterface {
    port: Mutex<Box<dyn SerialPort>>,
}

impl PortInterface {
    fn open(path: &str, config: &Config) -> Result<Self> {
        let port = serialport::new(path, config.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .with_context(|| format!("Failed to open serial port {path}"))?;

        Ok(Self {
            port: Mutex::new(port),
        })
    }

    fn pending_tx(&self) -> usize {
        self.port
            .lock()
            .ok()
            .and_then(|port| port.bytes_to_write().ok())
            .unwrap_or(0) as usize
    }
}

impl SerialInterface for PortInterface {
    fn write(&self, bytes: &[u8]) -> Result<usize, IntfError> {
        let free = self.tx_free();
        let mut port = self.port.lock().map_err(|_| IntfError::Interface)?;
        match port.write(&bytes[..bytes.len().min(free)]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(_) => Err(IntfError::Interface),
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IntfError> {
        let mut port = self.port.lock().map_err(|_| IntfError::Interface)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(_) => Err(IntfError::Interface),
        }
    }

    fn rx_available(&self) -> usize {
        self.port
            .lock()
            .ok()
            .and_then(|port| port.bytes_to_read().ok())
            .unwrap_or(0) as usize
    }

    fn tx_free(&self) -> usize {
        TX_CAPACITY.saturating_sub(self.pending_tx())
    }

    fn tx_capacity(&self) -> usize {
        TX_CAPACITY
    }

    fn clear_rx(&self) -> Result<(), IntfError> {
        let port = self.port.lock().map_err(|_| IntfError::Interface)?;
        port.clear(ClearBuffer::Input).map_err(|_| IntfError::Interface)
    }

    fn clear_tx(&self) -> Result<(), IntfError> {
        let port = self.port.lock().map_err(|_| IntfError::Interface)?;
        port.clear(ClearBuffer::Output).map_err(|_| IntfError::Interface)
    }
}

fn issue(epos: &Epos<PortInterface>, node_id: u8, command: Commands) -> Result<(), EposError> {
    match command {
        Commands::Write {
            index,
            subindex,
            data,
        } => epos.write_object(index, subindex, node_id, data),
        Commands::Read { index, subindex } => epos.read_object(index, subindex, node_id),
        Commands::FaultReset => epos.fault_reset(node_id),
        Commands::Shutdown => epos.shutdown(node_id),
        Commands::SwitchOn => epos.switch_on(node_id),
        Commands::EnableOperation => epos.enable_operation(node_id),
        Commands::SetMode { mode } => epos.set_mode(node_id, mode.into()),
        Commands::SetVelocity { value } => epos.set_velocity(node_id, value),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = Config::default()
        .with_baud_rate(cli.baud)
        .with_timeout(Duration::from_millis(cli.timeout_ms));

    let interface = PortInterface::open(&cli.port, &config)?;
    let epos = create_epos(interface, config);
    info!("opened {} at {} baud", cli.port, config.baud_rate);

    issue(&epos, cli.node_id, cli.command).context("Request not admitted")?;

    // No serial interrupt out here: every poll doubles as a notification
    let status = epos.wait_for(|| {
        epos.on_serial_event();
        thread::sleep(Duration::from_millis(1));
    });
    debug!("final status {:?}", status);

    match status {
        ResponseStatus::Success => {
            let words = epos.response_words()?;
            let mut line = String::from("received response data:");
            for windex in 0..words {
                line.push_str(&format!(" {:04X}", epos.read_response_word(windex)?));
            }
            println!("{line}");
            Ok(())
        }
        ResponseStatus::None => {
            println!("Request has no response.");
            Ok(())
        }
        ResponseStatus::Waiting => {
            println!("Still waiting response...");
            Ok(())
        }
        ResponseStatus::Error => anyhow::bail!("Response error"),
    }
}
