//! # Stario CLI
//!
//! Command-line tool for poking at a Star printer through the port API.
//!
//! ## Usage
//!
//! ```bash
//! # Decoded status of the default serial port
//! stario status
//!
//! # Status as JSON from a USB printer
//! stario --port usb:TSP700 status --json
//!
//! # Print a line and confirm it printed
//! stario --port /dev/parport0 checked "Hello"
//!
//! # Visual Card command 0x46 with payload "1", 5 s budget
//! stario --port /dev/ttyS1 --settings 38400,none,8,1,hdwr card 46 1 --timeout-ms 5000
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use stario::{PortRegistry, StarIoError, StarPrinterStatus, VisualCardCommand};

/// Stario - Star printer I/O utility
#[derive(Parser, Debug)]
#[command(name = "stario")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port name: usb:<model>[;sn:<serial>], /dev/parport<N> or /dev/ttyS<N>
    #[arg(long, global = true, default_value = "/dev/ttyS0")]
    port: String,

    /// Serial settings: baud,parity,data bits,stop bits,flow control
    #[arg(long, global = true, default_value = "9600,none,8,1,none")]
    settings: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read and decode the printer status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send text followed by a line feed
    Write { text: String },

    /// Send text inside a checked block and report whether it printed
    Checked { text: String },

    /// Pulse the hardware reset
    Reset,

    /// Run one Visual Card command
    Card {
        /// Command byte in hex, e.g. 46
        command: String,

        /// Payload text
        data: Option<String>,

        /// Time budget for each handshake phase
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logger(verbose: bool) {
    let default = if verbose { "stario=debug" } else { "stario=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

fn run(cli: Cli) -> Result<(), StarIoError> {
    let registry = PortRegistry::new();
    registry.open(&cli.port, &cli.settings)?;

    let result = execute(&registry, &cli.port, cli.command);
    registry.close(&cli.port)?;
    result
}

fn execute(registry: &PortRegistry, port: &str, command: Commands) -> Result<(), StarIoError> {
    match command {
        Commands::Status { json } => {
            let status = registry.status(port)?;
            if json {
                let text = serde_json::to_string_pretty(&status)
                    .map_err(|e| StarIoError::Runtime(format!("JSON encoding failed: {}", e)))?;
                println!("{}", text);
            } else {
                print_status(&status);
            }
        }

        Commands::Write { text } => {
            let data = line(&text);
            let written = registry.write(port, &data)?;
            println!("Wrote {} of {} bytes", written, data.len());
        }

        Commands::Checked { text } => {
            registry.begin_checked_block(port)?;
            let data = line(&text);
            let written = registry.write(port, &data)?;
            let status = registry.end_checked_block(port)?;

            if status.offline {
                println!("Not printed: printer went offline and was reset");
                print_status(&status);
            } else {
                println!("Printed {} bytes", written);
            }
        }

        Commands::Reset => {
            registry.hard_reset(port)?;
            println!("Reset {}", port);
        }

        Commands::Card {
            command,
            data,
            timeout_ms,
        } => {
            let command = u8::from_str_radix(command.trim_start_matches("0x"), 16).map_err(|_| {
                StarIoError::NotAvailable(format!("command must be a hex byte, got {:?}", command))
            })?;
            let payload = data.map(String::into_bytes).unwrap_or_default();
            let request = VisualCardCommand::new(command, payload);

            let response =
                registry.visual_card(port, &request, Duration::from_millis(timeout_ms))?;
            println!("Status: {:#04x}", response.status);
            println!(
                "Data ({} bytes): {}",
                response.rx_data.len(),
                String::from_utf8_lossy(&response.rx_data)
            );
        }
    }

    Ok(())
}

fn line(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    data.push(b'\n');
    data
}

fn print_status(status: &StarPrinterStatus) {
    println!("Online: {}", if status.is_online() { "yes" } else { "no" });

    let conditions = status.active_conditions();
    if conditions.is_empty() {
        println!("Conditions: none");
    } else {
        println!("Conditions: {}", conditions.join(", "));
    }

    match status.etb_counter {
        Some(counter) => println!("ETB counter: {}", counter),
        None => println!("ETB counter: not supported"),
    }
    if let Some(state) = status.presenter_state {
        println!("Presenter state: {}", state);
    }

    let raw: Vec<String> = status.raw.iter().map(|b| format!("{:02X}", b)).collect();
    println!("Raw: {}", raw.join(" "));
}
