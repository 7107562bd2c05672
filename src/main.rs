use anyhow::Result;
use carta_companion::domain::controller::DeviceController;
use carta_companion::domain::models::{AppEvent, DeviceCommand};
use carta_companion::domain::settings::SettingsService;
use carta_companion::infrastructure::bluetooth::connection::{DeviceLink, LinkConfig};
use carta_companion::infrastructure::bluetooth::protocol;
use carta_companion::infrastructure::bluetooth::service::{
    command_channel, CommandReceiver, CommandSender, DeviceService, ServiceConfig,
};
use carta_companion::infrastructure::bluetooth::simulator::SimulatedTransport;
use carta_companion::infrastructure::bluetooth::transport::{
    event_channel, EventReceiver, Transport,
};
use carta_companion::infrastructure::logging;
use std::io::BufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const HELP: &str = "commands: start | end | temp <n> | time <n> | disconnect | quit";

fn main() -> Result<()> {
    let simulate = std::env::args().any(|a| a == "--simulate") || !cfg!(feature = "ble");

    let settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting CARTA companion");
    info!("Settings: {}", settings_service.path().display());

    let (command_tx, command_rx) = command_channel();
    spawn_console(command_tx);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                ctrl_c.cancel();
            }
        });

        let (transport_tx, transport_rx) = event_channel();
        if simulate {
            info!("Using the simulated device");
            let mut transport = SimulatedTransport::new(transport_tx);
            transport.power_on();
            run_service(transport, transport_rx, command_rx, settings_service, cancel).await
        } else {
            run_hardware(transport_tx, transport_rx, command_rx, settings_service, cancel).await
        }
    })
}

#[cfg(feature = "ble")]
async fn run_hardware(
    transport_tx: carta_companion::infrastructure::bluetooth::transport::EventSender,
    transport_rx: EventReceiver,
    command_rx: CommandReceiver,
    settings_service: SettingsService,
    cancel: CancellationToken,
) -> Result<()> {
    use carta_companion::infrastructure::bluetooth::bluest_backend::BluestTransport;

    let transport = BluestTransport::new(transport_tx).await?;
    run_service(transport, transport_rx, command_rx, settings_service, cancel).await
}

#[cfg(not(feature = "ble"))]
async fn run_hardware(
    _transport_tx: carta_companion::infrastructure::bluetooth::transport::EventSender,
    _transport_rx: EventReceiver,
    _command_rx: CommandReceiver,
    _settings_service: SettingsService,
    _cancel: CancellationToken,
) -> Result<()> {
    anyhow::bail!("built without the `ble` feature, run with --simulate")
}

async fn run_service<T: Transport>(
    transport: T,
    transport_rx: EventReceiver,
    command_rx: CommandReceiver,
    settings_service: SettingsService,
    cancel: CancellationToken,
) -> Result<()> {
    let settings = settings_service.get().clone();
    let link = DeviceLink::new(transport, LinkConfig::from_settings(&settings)?);

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(app_rx));

    let controller = DeviceController::new(
        link,
        Box::new(settings_service),
        app_tx,
        settings.max_sync_attempts,
    );
    let service = DeviceService::new(
        controller,
        transport_rx,
        command_rx,
        ServiceConfig::from_settings(&settings),
    );

    // dropping the controller closes the event channel and ends the printer
    drop(service.run(cancel).await);
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }
    Ok(())
}

/// Read commands from stdin on a plain thread; EOF means quit
fn spawn_console(commands: CommandSender) {
    std::thread::spawn(move || {
        println!("{}", HELP);
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(command) => {
                    let quit = command == DeviceCommand::Shutdown;
                    if commands.send(command).is_err() || quit {
                        return;
                    }
                }
                None => println!("{}", HELP),
            }
        }
        let _ = commands.send(DeviceCommand::Shutdown);
    });
}

fn parse_command(line: &str) -> Option<DeviceCommand> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_lowercase();
    let index = words.next().and_then(|w| w.parse::<usize>().ok());

    match (command.as_str(), index) {
        ("start" | "begin", _) => Some(DeviceCommand::BeginSession),
        ("end" | "stop", _) => Some(DeviceCommand::EndSession),
        ("temp", Some(i)) => Some(DeviceCommand::SelectTemperature(i)),
        ("time", Some(i)) => Some(DeviceCommand::SelectTime(i)),
        ("disconnect", _) => Some(DeviceCommand::Disconnect),
        ("quit" | "exit", _) => Some(DeviceCommand::Shutdown),
        _ => None,
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::LinkState(state) => println!("link: {:?}", state),
            AppEvent::DevicesChanged(devices) => {
                for d in devices {
                    println!(
                        "  [{}] {} ({}) {} dBm",
                        d.id,
                        d.name.as_deref().unwrap_or("?"),
                        d.identifier,
                        d.signal_strength
                    );
                }
            }
            AppEvent::Ready(id) => println!("ready: {}", id),
            AppEvent::Telemetry(frame) => tracing::debug!("Telemetry: {:?}", frame),
            AppEvent::ModeChanged(mode) => println!("mode: {}", mode),
            AppEvent::ActivityChanged(true) => println!("heating"),
            AppEvent::ActivityChanged(false) => println!("idle"),
            AppEvent::RemainingChanged(seconds) => {
                println!("remaining: {}", protocol::format_remaining(seconds))
            }
            AppEvent::CountsChanged { dab, flower } => {
                println!("hits: dab {} flower {}", dab, flower)
            }
            AppEvent::SelectionChanged {
                temperature,
                duration,
            } => println!("selected: {}°F for {}", temperature, duration),
            AppEvent::SyncCompleted => println!("synced"),
            AppEvent::SyncTimedOut { attempts } => {
                println!("sync timed out after {} attempts", attempts)
            }
            AppEvent::LogMessage(msg) => println!("[{:?}] {}", msg.severity, msg.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("start"), Some(DeviceCommand::BeginSession));
        assert_eq!(parse_command(" TEMP 4 "), Some(DeviceCommand::SelectTemperature(4)));
        assert_eq!(parse_command("time 2"), Some(DeviceCommand::SelectTime(2)));
        assert_eq!(parse_command("time"), None);
        assert_eq!(parse_command("temp hot"), None);
        assert_eq!(parse_command("quit"), Some(DeviceCommand::Shutdown));
        assert_eq!(parse_command("dance"), None);
    }
}
