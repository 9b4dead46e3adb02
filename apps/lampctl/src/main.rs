use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reconciler::{Outcome, ReconcilerConfig, StateReconciler};
use shared::{
    domain::{DeviceKey, SwitchAction},
    protocol::{ConnectionStatus, PanelEvent},
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use transport::{TransportMode, TransportSettings};

#[derive(Parser, Debug)]
#[command(about = "Switch the house lamps without going through the panel server")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Direct)]
    mode: Mode,
    #[arg(long, default_value = "http://192.168.1.166")]
    bridge_url: String,
    #[arg(long, default_value = "mqtt://127.0.0.1:1883")]
    broker_url: String,
    #[arg(long)]
    broker_username: Option<String>,
    #[arg(long)]
    broker_password: Option<String>,
    #[arg(long, default_value = shared::registry::DEFAULT_BASE_TOPIC)]
    base_topic: String,
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
    /// How long to wait for retained status messages in broadcast mode.
    #[arg(long, default_value_t = 1_500)]
    settle_ms: u64,
    /// Print events as JSON lines instead of text.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Direct,
    Broadcast,
    Simulated,
}

impl From<Mode> for TransportMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Direct => TransportMode::Direct,
            Mode::Broadcast => TransportMode::Broadcast,
            Mode::Simulated => TransportMode::Simulated,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the state of one lamp, or all of them.
    Status { device: Option<DeviceKey> },
    /// Switch a lamp on or off.
    Set { device: DeviceKey, state: SwitchAction },
    /// Flip a lamp.
    Toggle { device: DeviceKey },
    /// Follow state changes until interrupted.
    Watch,
}

impl Args {
    fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            mode: self.mode.into(),
            base_topic: self.base_topic.clone(),
            bridge_url: self.bridge_url.clone(),
            broker_url: self.broker_url.clone(),
            broker_username: self.broker_username.clone(),
            broker_password: self.broker_password.clone(),
            client_id_prefix: "lampctl_".into(),
            request_timeout_ms: self.timeout_ms,
            ..TransportSettings::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = args.transport_settings();
    let transport = transport::connect(&settings).context("failed to start lamp transport")?;
    let reconciler = StateReconciler::new(
        transport.clone(),
        &settings.registry(),
        ReconcilerConfig::default(),
    );
    reconciler.start();
    learn_initial_state(&reconciler, &args).await;

    let result = run(&reconciler, &args).await;
    reconciler.shutdown();
    transport.close().await;
    result
}

/// Direct mode has to ask each device; broadcast mode gets retained status
/// messages shortly after subscribing.
async fn learn_initial_state(reconciler: &Arc<StateReconciler>, args: &Args) {
    match args.mode {
        Mode::Direct => {
            if let Err(err) = reconciler.refresh().await {
                tracing::warn!(%err, "could not read lamp states");
            }
        }
        Mode::Broadcast => tokio::time::sleep(Duration::from_millis(args.settle_ms)).await,
        Mode::Simulated => {}
    }
}

async fn run(reconciler: &Arc<StateReconciler>, args: &Args) -> Result<()> {
    match args.command {
        Command::Status { device } => {
            let snapshot = reconciler.snapshot().await;
            if args.json {
                println!("{}", serde_json::to_string(&snapshot)?);
                return Ok(());
            }
            println!("connection: {}", connection_label(snapshot.connection));
            for lamp in snapshot
                .devices
                .iter()
                .filter(|lamp| device.map_or(true, |wanted| lamp.device == wanted))
            {
                println!("{:<8} {}", lamp.device, lamp.state);
            }
        }
        Command::Set { device, state } => {
            let outcome = reconciler.issue(device, state).await?;
            report(reconciler, device, outcome, args).await?;
        }
        Command::Toggle { device } => {
            let outcome = reconciler.toggle(device).await?;
            report(reconciler, device, outcome, args).await?;
        }
        Command::Watch => watch(reconciler, args.json).await?,
    }
    Ok(())
}

/// Prints the final state of a command. A dispatched command is followed
/// until the device confirms it or the pending timeout reverts it.
async fn report(
    reconciler: &Arc<StateReconciler>,
    device: DeviceKey,
    outcome: Outcome,
    args: &Args,
) -> Result<()> {
    let final_state = match outcome {
        Outcome::Dispatched(_) => await_settled(reconciler, device).await?,
        Outcome::Unchanged(_) | Outcome::Confirmed(_) | Outcome::Superseded(_) => {
            reconciler.state(device).await.state.to_string()
        }
    };
    if args.json {
        println!(
            "{}",
            serde_json::json!({ "device": device, "status": final_state })
        );
    } else {
        println!("{device} {final_state}");
    }
    Ok(())
}

async fn await_settled(reconciler: &Arc<StateReconciler>, device: DeviceKey) -> Result<String> {
    let mut events = reconciler.subscribe();
    let current = reconciler.state(device).await;
    if !current.is_pending() {
        return Ok(current.state.to_string());
    }
    loop {
        match events.recv().await {
            Ok(PanelEvent::StateChanged { snapshot })
                if snapshot.device == device && !snapshot.is_pending() =>
            {
                return Ok(snapshot.state.to_string());
            }
            Ok(PanelEvent::CommandFailed {
                device: failed,
                message,
                ..
            }) if failed == device => bail!("{device}: {message}"),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("event feed closed"),
        }
    }
}

async fn watch(reconciler: &Arc<StateReconciler>, json: bool) -> Result<()> {
    let mut events = reconciler.subscribe();
    for lamp in reconciler.snapshot().await.devices {
        print_event(&PanelEvent::StateChanged { snapshot: lamp }, json)?;
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json)?,
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "dropped events"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_event(event: &PanelEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        PanelEvent::StateChanged { snapshot } => match snapshot.pending {
            Some(desired) => println!(
                "{:<8} {} (waiting for {desired})",
                snapshot.device, snapshot.state
            ),
            None => println!("{:<8} {}", snapshot.device, snapshot.state),
        },
        PanelEvent::Discrepancy {
            device,
            expected,
            observed,
        } => println!("{device:<8} reported {observed}, expected {expected}"),
        PanelEvent::CommandFailed {
            device, message, ..
        } => println!("{device:<8} command failed: {message}"),
        PanelEvent::ConnectionChanged { status } => {
            println!("connection: {}", connection_label(*status))
        }
        PanelEvent::LogAppended { .. } | PanelEvent::LogCleared | PanelEvent::Error(_) => {}
    }
    Ok(())
}

fn connection_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Reconnecting => "reconnecting",
        ConnectionStatus::Offline => "offline",
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
