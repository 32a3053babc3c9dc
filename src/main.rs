//! saber-link - command line client for the saber lighting controller
//!
//! # Usage Examples
//!
//! List the sabers a controller knows about:
//! ```bash
//! saber-link --address AA:BB:CC:DD:EE:FF get-sabers
//! ```
//!
//! Push WiFi and DMX settings:
//! ```bash
//! saber-link save-settings --ssid home --pass secret --universe 1 --max-channels 512
//! ```
//!
//! Try it without hardware:
//! ```bash
//! saber-link --simulate get-sabers
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use saber_link::domain::command::{Command, WifiSettings};
use saber_link::domain::models::{DeviceHandle, MessageSeverity, Response, SessionEvent};
use saber_link::domain::settings::SettingsService;
use saber_link::infrastructure::bluetooth::simulated::{SimulatedPeripheral, DEMO_ADDRESS};
use saber_link::infrastructure::bluetooth::{spawn_session, SessionConfig, Transport};
use saber_link::infrastructure::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// saber-link
///
/// Connects to a saber controller over Bluetooth LE, runs one command and
/// disconnects.
#[derive(Parser, Debug)]
#[command(name = "saber-link")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Controller address, e.g. AA:BB:CC:DD:EE:FF (defaults to the last one used)
    #[arg(short, long)]
    address: Option<String>,

    /// Talk to a built-in simulated controller instead of the radio
    #[arg(long)]
    simulate: bool,

    /// Response timeout in milliseconds (overrides the settings file)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List the sabers the controller knows about
    GetSabers,
    /// Store WiFi and DMX settings on the controller
    SaveSettings {
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        pass: String,
        #[arg(long, default_value = "1")]
        universe: String,
        #[arg(long, default_value = "512")]
        max_channels: String,
    },
    /// Print unsolicited notifications from the controller
    Watch {
        /// Stop after this many seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };
    let mut log_settings = settings.get().log_settings.clone();
    if args.verbose {
        log_settings.level = "debug".to_string();
    }
    let _guard = logging::init_logger(&log_settings)?;

    let mut config = SessionConfig::from_settings(&settings.get().ble)
        .context("invalid BLE settings")?;
    if let Some(ms) = args.timeout_ms {
        config.response_timeout = Duration::from_millis(ms);
    }

    let address = match (&args.address, args.simulate) {
        (Some(address), _) => address.clone(),
        (None, true) => DEMO_ADDRESS.to_string(),
        (None, false) => match &settings.get().last_connected_address {
            Some(address) => address.clone(),
            None => bail!("no controller address given and none remembered; pass --address"),
        },
    };
    let device = DeviceHandle::new(address);

    if args.simulate {
        info!("Using simulated controller");
        return run(Arc::new(SimulatedPeripheral::demo()), config, &device, &args.action).await;
    }

    run_radio(config, &device, &args.action).await?;
    if let Err(e) = settings.remember_device(device.address()) {
        warn!("Could not save settings: {:#}", e);
    }
    Ok(())
}

#[cfg(windows)]
async fn run_radio(config: SessionConfig, device: &DeviceHandle, action: &Action) -> Result<()> {
    use saber_link::infrastructure::bluetooth::WinRtTransport;
    run(Arc::new(WinRtTransport::new()), config, device, action).await
}

#[cfg(not(windows))]
async fn run_radio(_: SessionConfig, _: &DeviceHandle, _: &Action) -> Result<()> {
    bail!("no Bluetooth backend on this platform; use --simulate")
}

async fn run<T: Transport>(
    transport: Arc<T>,
    config: SessionConfig,
    device: &DeviceHandle,
    action: &Action,
) -> Result<()> {
    let (session, events) = spawn_session(transport, config);
    let printer = tokio::spawn(log_events(events));

    session.connect(device.clone()).await?;

    let outcome = match action {
        Action::GetSabers => session
            .send_command(Command::get_sabers())
            .await
            .map(print_response),
        Action::SaveSettings {
            ssid,
            pass,
            universe,
            max_channels,
        } => {
            let wifi = WifiSettings {
                ssid: ssid.clone(),
                pass: pass.clone(),
                universe: universe.clone(),
                max_channels: max_channels.clone(),
            };
            session
                .send_command(Command::save_settings(&wifi))
                .await
                .map(print_response)
        }
        Action::Watch { seconds } => {
            let wait = async {
                if *seconds == 0 {
                    let _ = tokio::signal::ctrl_c().await;
                } else {
                    tokio::time::sleep(Duration::from_secs(*seconds)).await;
                }
            };
            let mut snapshots = session.watch();
            tokio::select! {
                _ = wait => {}
                _ = snapshots.wait_for(|s| s.state.is_terminal()) => {
                    warn!("Session ended in state {}", session.state());
                }
            }
            Ok(())
        }
    };

    session.disconnect().await;
    drop(session);
    let _ = printer.await;

    outcome.map_err(Into::into)
}

fn print_response(response: Response) {
    match response {
        Response::Sabers(sabers) if sabers.is_empty() => println!("No sabers found"),
        Response::Sabers(sabers) => {
            for saber in sabers {
                println!("{}", saber.address);
            }
        }
        Response::Ack => println!("Settings saved"),
        Response::Rejected(reason) => println!("Controller rejected the command: {}", reason),
        Response::Text(text) => println!("{}", text),
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::UnsolicitedData(data) => {
                println!("<- {}", String::from_utf8_lossy(&data));
            }
            SessionEvent::Status(status) => match status.severity {
                MessageSeverity::Error => error!("{}", status.message),
                MessageSeverity::Warning => warn!("{}", status.message),
                MessageSeverity::Info | MessageSeverity::Success => info!("{}", status.message),
            },
            SessionEvent::StateChanged(state) => debug!("State: {}", state),
            SessionEvent::CommandResult(_) => {}
        }
    }
}
