//! CLI entry point for rust-midi
//!
//! Exercises the session machinery against the in-process mock driver:
//! - Listing devices and their capabilities
//! - Streaming system exclusive messages from an output device back into an
//!   input session and reporting buffer statistics
//!
//! # Usage
//!
//! ```bash
//! rust-midi devices
//! rust-midi loopback --messages 100 --config rust-midi.toml
//! rust-midi show-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_midi::driver::mock::MockDriver;
use rust_midi::{logging, DeviceSession, MidiConfig, OutputDevice, RecordingReceiver};

#[derive(Parser)]
#[command(name = "rust-midi")]
#[command(about = "MIDI buffer lifecycle demo over a simulated driver", long_about = None)]
struct Cli {
    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(long, global = true, default_value = "rust-midi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List simulated input and output devices
    Devices {
        /// Number of input devices to simulate
        #[arg(long, default_value = "1")]
        inputs: u32,

        /// Number of output devices to simulate
        #[arg(long, default_value = "1")]
        outputs: u32,
    },

    /// Send system exclusive messages through an output device and receive
    /// them on an input session
    Loopback {
        /// Number of messages to send
        #[arg(long, default_value = "16")]
        messages: usize,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MidiConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Devices { inputs, outputs } => list_devices(inputs, outputs),
        Commands::Loopback { messages } => run_loopback(&config, messages),
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn list_devices(inputs: u32, outputs: u32) -> Result<()> {
    let driver = MockDriver::with_devices(inputs, outputs);

    println!("Input devices: {}", DeviceSession::device_count(&driver));
    for id in 0..DeviceSession::device_count(&driver) {
        let caps = DeviceSession::capabilities(&driver, id)?;
        println!(
            "  [{id}] {} (mid {:#06x}, pid {})",
            caps.name, caps.manufacturer_id, caps.product_id
        );
    }

    println!("Output devices: {}", OutputDevice::device_count(&driver));
    for id in 0..OutputDevice::device_count(&driver) {
        let caps = OutputDevice::capabilities(&driver, id)?;
        println!(
            "  [{id}] {} (mid {:#06x}, pid {})",
            caps.name, caps.manufacturer_id, caps.product_id
        );
    }
    Ok(())
}

fn run_loopback(config: &MidiConfig, messages: usize) -> Result<()> {
    let driver = Arc::new(MockDriver::with_devices(
        config.input.device_id.saturating_add(1),
        config.output.device_id.saturating_add(1),
    ));
    let receiver = Arc::new(RecordingReceiver::new());
    let options = config.session_options();

    let mut input = DeviceSession::with_options(driver.clone(), receiver.clone(), options.clone());
    input.open(config.input.device_id)?;
    let mut output = OutputDevice::with_options(driver.clone(), options);
    output.open(config.output.device_id)?;

    let (Some(input_handle), Some(output_handle)) = (input.handle(), output.handle()) else {
        anyhow::bail!("devices reported open without a handle");
    };

    for _ in 0..config.input.sysex_buffer_count {
        input.add_sysex_buffer(config.input.sysex_buffer_size)?;
    }
    input.start_streaming()?;
    tracing::info!(messages, "Starting loopback");

    for index in 0..messages {
        let payload = vec![0xF0, 0x7D, (index & 0x7F) as u8, 0xF7];
        output.send_long(payload.clone())?;
        driver.complete_output(output_handle);

        if !driver.complete_input(input_handle, &payload, index as u32) {
            tracing::warn!(index, "No input buffer queued, message dropped");
        }
        // Keep the input queue topped up.
        input.add_sysex_buffer(config.input.sysex_buffer_size)?;
    }

    input.stop_streaming()?;
    let input_stats = input.stats();
    input.close()?;
    output.close()?;
    let output_stats = output.stats();

    println!(
        "Received {} of {messages} messages",
        receiver.long_messages().len()
    );
    println!(
        "Input buffers:  submitted {}, reclaimed {}, unprepare failures {}",
        input_stats.submitted, input_stats.reclaimed, input_stats.unprepare_failures
    );
    println!(
        "Output buffers: submitted {}, reclaimed {}, unprepare failures {}",
        output_stats.submitted, output_stats.reclaimed, output_stats.unprepare_failures
    );
    println!("Open handles after close: {}", driver.open_handle_count());
    Ok(())
}
