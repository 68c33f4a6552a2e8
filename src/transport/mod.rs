use crate::model::SaberState;
use crate::protocol;
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

const AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SendError {
    /// No live connection or the command characteristic has not been
    /// resolved yet.
    #[error("command characteristic not resolved")]
    Unresolved,
    #[error("ble write failed: {0}")]
    Write(#[from] btleplug::Error),
}

/// Point-to-point send primitive for the saber's write-no-response command
/// channel. The dispatch engine treats `Unresolved` differently from a
/// failed write (see `engine`).
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, payload: &[u8]) -> Result<(), SendError>;
}

#[async_trait]
impl<T: CommandSink + ?Sized> CommandSink for Arc<T> {
    async fn send_command(&self, payload: &[u8]) -> Result<(), SendError> {
        (**self).send_command(payload).await
    }
}

/// Shared gate flags for one saber, written only by its BLE session task.
/// `authorized` is set once the saber grants access and cleared on
/// disconnect; `syncing` is held while a notification is being applied to
/// the observed state, so local dispatches cannot race a feedback refresh.
#[derive(Debug, Clone, Default)]
pub struct SessionGates {
    authorized: Arc<AtomicBool>,
    syncing: Arc<AtomicBool>,
}

impl SessionGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn set_authorized(&self, value: bool) {
        self.authorized.store(value, Ordering::SeqCst);
    }

    pub fn set_syncing(&self, value: bool) {
        self.syncing.store(value, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Authorized,
    Disconnected,
}

#[derive(Clone)]
struct CommandLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

/// Sink bound to the 0x3AB1 characteristic of one connected saber. The
/// resolved characteristic is cached and invalidated when the session drops
/// the connection.
#[derive(Default)]
pub struct BleCommandSink {
    link: Mutex<Option<CommandLink>>,
}

impl BleCommandSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the command characteristic on a freshly discovered
    /// peripheral and bind the sink to it.
    fn attach(&self, peripheral: &Peripheral) -> Result<(), String> {
        let characteristic =
            find_characteristic(peripheral, protocol::SERVICE_COMMAND, protocol::CHAR_COMMAND)
                .ok_or("command characteristic 0x3AB1 not found")?;
        *self.link.lock().unwrap() = Some(CommandLink {
            peripheral: peripheral.clone(),
            characteristic,
        });
        Ok(())
    }

    /// Drop the cached characteristic. Until the next attach every send
    /// fails with `Unresolved`.
    fn detach(&self) {
        *self.link.lock().unwrap() = None;
    }
}

#[async_trait]
impl CommandSink for BleCommandSink {
    async fn send_command(&self, payload: &[u8]) -> Result<(), SendError> {
        let link = self.link.lock().unwrap().clone();
        let link = link.ok_or(SendError::Unresolved)?;
        link.peripheral
            .write(&link.characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service_uuid: uuid::Uuid,
    uuid: uuid::Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service_uuid && c.uuid == uuid)
}

/// Connection lifecycle for one saber: scan for its address, connect,
/// perform the handshake/authorize exchange, then pump notifications into
/// the observed state until the link drops. Reconnects with doubling
/// backoff forever.
pub struct SaberSession {
    name: String,
    address: String,
    gates: SessionGates,
    sink: Arc<BleCommandSink>,
    state_tx: watch::Sender<SaberState>,
    events: mpsc::Sender<SessionEvent>,
    scan_timeout: Duration,
    backoff_max: Duration,
}

impl SaberSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        address: String,
        gates: SessionGates,
        sink: Arc<BleCommandSink>,
        state_tx: watch::Sender<SaberState>,
        events: mpsc::Sender<SessionEvent>,
        scan_timeout: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            name,
            address,
            gates,
            sink,
            state_tx,
            events,
            scan_timeout,
            backoff_max,
        }
    }

    pub async fn run(self, adapter: Adapter) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            match self.connect_once(&adapter).await {
                Ok(()) => backoff = RECONNECT_BACKOFF_MIN,
                Err(err) => {
                    tracing::warn!(device = %self.name, error = %err, "ble session ended");
                }
            }
            self.gates.set_authorized(false);
            self.sink.detach();
            let _ = self.events.send(SessionEvent::Disconnected).await;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    async fn connect_once(
        &self,
        adapter: &Adapter,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let peripheral = self.find_peripheral(adapter).await?;
        peripheral.connect().await?;
        tracing::info!(device = %self.name, address = %self.address, "connected");

        let result = self.run_connected(&peripheral).await;
        let _ = peripheral.disconnect().await;
        result
    }

    async fn run_connected(
        &self,
        peripheral: &Peripheral,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        peripheral.discover_services().await?;
        let control =
            find_characteristic(peripheral, protocol::SERVICE_CONTROL, protocol::CHAR_CONTROL)
                .ok_or("control characteristic 0xDAE1 not found")?;
        peripheral.subscribe(&control).await?;
        let mut notifications = peripheral.notifications().await?;

        // Handshake goes to 0xDAE1 with response, authorize to 0x3AB1
        // without; the saber then reports AccessAllowed on 0xDAE1.
        peripheral
            .write(&control, &protocol::encode_handshake(), WriteType::WithResponse)
            .await?;
        self.sink.attach(peripheral)?;
        self.sink.send_command(&protocol::encode_authorize()).await?;

        // The grant may arrive on either characteristic, so no uuid filter
        // here.
        let granted = timeout(AUTHORIZE_TIMEOUT, async {
            while let Some(notification) = notifications.next().await {
                if let Some(msg) = protocol::decode_message(&notification.value) {
                    if protocol::is_authorize_granted(&msg) {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !granted {
            return Err("saber did not grant access".into());
        }
        self.gates.set_authorized(true);
        let _ = self.events.send(SessionEvent::Authorized).await;
        tracing::info!(device = %self.name, "authorized");

        while let Some(notification) = notifications.next().await {
            if notification.uuid != protocol::CHAR_CONTROL {
                continue;
            }
            let Some(msg) = protocol::decode_message(&notification.value) else {
                continue;
            };
            if msg.msg_type != protocol::MSG_TYPE_STATUS || protocol::is_authorize_granted(&msg) {
                continue;
            }
            // Hold the syncing gate while the notification lands in the
            // observed state so a local dispatch cannot race the refresh.
            self.gates.set_syncing(true);
            self.state_tx
                .send_modify(|state| protocol::apply_status(state, &msg.params));
            self.gates.set_syncing(false);
        }

        Err("notification stream closed".into())
    }

    async fn find_peripheral(
        &self,
        adapter: &Adapter,
    ) -> Result<Peripheral, Box<dyn std::error::Error + Send + Sync>> {
        adapter.start_scan(ScanFilter::default()).await?;
        let found = timeout(self.scan_timeout, async {
            loop {
                for peripheral in adapter.peripherals().await.unwrap_or_default() {
                    if let Ok(Some(props)) = peripheral.properties().await {
                        if props
                            .address
                            .to_string()
                            .eq_ignore_ascii_case(&self.address)
                        {
                            return peripheral;
                        }
                    }
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;
        let _ = adapter.stop_scan().await;
        found.map_err(|_| format!("saber {} not found during scan", self.address).into())
    }
}
