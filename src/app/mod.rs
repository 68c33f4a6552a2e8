use crate::config::{Config, DeviceConfig};
use crate::engine::DispatchEngine;
use crate::model::{DesiredLightState, SaberState};
use crate::protocol::AuxCommand;
use crate::server::{self, DeviceHandle};
use crate::sync::{self, SyncFrame};
use crate::transport::{
    BleCommandSink, CommandSink, SaberSession, SessionEvent, SessionGates,
};
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(command) = std::env::args().nth(1) {
        return match command.as_str() {
            "config-init" => handle_config_init(),
            other => Err(format!("unknown command: {other}").into()),
        };
    }

    let config = Config::load()?;
    if config.devices.is_empty() {
        tracing::warn!("no sabers configured; run `xenopixel-bridge config-init` and add [[device]] entries");
    }

    // One shared receive stream feeds every saber; the sender must outlive
    // the device loops even when the listener is disabled.
    let (sync_tx, sync_rx) = watch::channel(SyncFrame::default());
    let mut _sync_tx_parked = None;
    if config.sync.enabled {
        let bind: SocketAddr = format!("{}:{}", config.sync.bind, config.sync.port).parse()?;
        let socket = UdpSocket::bind(bind).await?;
        tracing::info!(addr = %bind, "wled udp listener started");
        tokio::spawn(async move {
            if let Err(err) = sync::run_listener(socket, sync_tx).await {
                tracing::warn!(error = %err, "wled listener stopped");
            }
        });
    } else {
        _sync_tx_parked = Some(sync_tx);
    }

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or("no bluetooth adapter available")?;

    let mut handles = Vec::new();
    for device in &config.devices {
        handles.push(spawn_device(device, &adapter, sync_rx.clone(), &config));
    }

    let token = match config.server.token.clone() {
        Some(token) => token,
        None => generate_token(32),
    };
    let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port).parse()?;
    println!("control api: http://{}/api/devices?token={}", addr, token);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        res = server::start(addr, token, handles, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    }
}

fn spawn_device(
    device: &DeviceConfig,
    adapter: &Adapter,
    sync_rx: watch::Receiver<SyncFrame>,
    config: &Config,
) -> DeviceHandle {
    let gates = SessionGates::new();
    let wled_active = Arc::new(AtomicBool::new(false));
    let sink = Arc::new(BleCommandSink::new());

    let (state_tx, state_rx) = watch::channel(SaberState::default());
    let (desired_tx, desired_rx) = watch::channel(DesiredLightState::default());
    let (aux_tx, aux_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(8);

    let session = SaberSession::new(
        device.name.clone(),
        device.address.clone(),
        gates.clone(),
        sink.clone(),
        state_tx,
        event_tx,
        Duration::from_secs(config.bluetooth.scan_timeout_secs),
        Duration::from_secs(config.bluetooth.reconnect_max_secs),
    );
    tokio::spawn(session.run(adapter.clone()));

    let engine = DispatchEngine::new(sink, gates.clone(), wled_active.clone());
    tokio::spawn(run_device(
        device.name.clone(),
        engine,
        desired_rx,
        sync_rx,
        aux_rx,
        event_rx,
    ));

    DeviceHandle {
        name: device.name.clone(),
        state_rx,
        desired_tx,
        aux_tx,
        wled_active,
        gates,
    }
}

/// Single consumer loop per saber: every dispatch for one device runs here,
/// so commands are never interleaved and the dispatch cache has exactly one
/// owner.
async fn run_device<S: CommandSink>(
    name: String,
    mut engine: DispatchEngine<S>,
    mut desired_rx: watch::Receiver<DesiredLightState>,
    mut sync_rx: watch::Receiver<SyncFrame>,
    mut aux_rx: mpsc::Receiver<AuxCommand>,
    mut events_rx: mpsc::Receiver<SessionEvent>,
) {
    loop {
        tokio::select! {
            res = desired_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let desired = *desired_rx.borrow_and_update();
                engine.dispatch_local(&desired).await;
            }
            res = sync_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let frame = sync_rx.borrow_and_update().clone();
                engine.apply_sync_frame(&frame).await;
            }
            Some(command) = aux_rx.recv() => {
                engine.dispatch_aux(&command).await;
            }
            Some(event) = events_rx.recv() => {
                match event {
                    SessionEvent::Authorized => {
                        tracing::debug!(device = %name, "session authorized");
                    }
                    SessionEvent::Disconnected => {
                        // the characteristic handle is gone; every cached
                        // value must be re-sent on the next session
                        engine.reset_cache();
                    }
                }
            }
        }
    }
    tracing::debug!(device = %name, "device loop stopped");
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
