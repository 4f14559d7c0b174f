//! Single-slot connection state machine.
//!
//! One task owns the [`ConnectionState`] and the active peripheral and walks
//! them through the handshake:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> DiscoveringServices
//!      -> DiscoveringCharacteristics -> Subscribing -> Streaming
//!      -> Disconnected | Failed -> (backoff) -> Scanning
//! ```
//!
//! Callers talk to it through a cloneable [`ConnectionHandle`]. A stop
//! request drops the running session future, which cancels whatever radio
//! operation is pending, and then tears down the scan or link before the
//! machine reports `Idle`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_derive::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::messages::LinkEvent;
use crate::protocol::{self, RawFrame};
use crate::radio::{NameFilter, PeripheralHandle, Radio, ServiceEndpoint, TransportError};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Streaming,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`. Stopping is
    /// allowed from every state; everything else follows the handshake order.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle, Idle) => false,
            (_, Idle) => true,
            (Idle | Disconnected | Failed, Scanning) => true,
            (Scanning, Connecting) => true,
            (Connecting, DiscoveringServices) => true,
            (DiscoveringServices | DiscoveringCharacteristics, DiscoveringCharacteristics) => true,
            (DiscoveringCharacteristics, Subscribing) => true,
            (Subscribing, Streaming) => true,
            (Streaming, Disconnected) => true,
            (
                Scanning | Connecting | DiscoveringServices | DiscoveringCharacteristics
                | Subscribing | Streaming,
                Failed,
            ) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{stage:?} timed out after {after:?}")]
    Timeout {
        stage: ConnectionState,
        after: Duration,
    },
    #[error("service {0} not advertised by peripheral")]
    ServiceNotFound(Uuid),
    #[error("notify characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("frame pipeline closed")]
    PipelineClosed,
    #[error("connection machine is not running")]
    MachineGone,
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub backoff: Backoff,
    /// Consecutive retries allowed before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Streaming at least this long resets the retry counter.
    pub reset_after: Duration,
    /// Bound on every handshake stage after scanning.
    pub step_timeout: Duration,
    pub frame_queue: usize,
    pub endpoint: ServiceEndpoint,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            backoff: Backoff::default(),
            max_retries: None,
            reset_after: Duration::from_secs(30),
            step_timeout: Duration::from_secs(15),
            frame_queue: 32,
            endpoint: ServiceEndpoint {
                service: protocol::PIXELS_SERVICE_UUID,
                characteristic: protocol::PIXELS_NOTIFY_UUID,
            },
        }
    }
}

enum Command {
    Start(NameFilter),
    Stop(oneshot::Sender<()>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Start(filter) => f.debug_tuple("Start").field(filter).finish(),
            Command::Stop(_) => f.write_str("Stop"),
        }
    }
}

/// Cloneable control surface of a running [`ConnectionMachine`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
}

impl ConnectionHandle {
    /// Begin scanning for `filter`. Ignored while a session is already running.
    pub async fn start(&self, filter: NameFilter) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Start(filter))
            .await
            .map_err(|_| ConnectionError::MachineGone)
    }

    /// Cancel whatever is in flight and wait until the machine is Idle.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(ack_tx))
            .await
            .map_err(|_| ConnectionError::MachineGone)?;
        ack_rx.await.map_err(|_| ConnectionError::MachineGone)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}

/// Result of a session that reached Streaming and then lost the link.
struct LinkLost {
    peripheral: PeripheralHandle,
    streamed_for: Duration,
}

pub struct ConnectionMachine<R: Radio> {
    radio: Arc<R>,
    settings: ConnectionSettings,
    frames: mpsc::Sender<RawFrame>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
    active: Option<PeripheralHandle>,
    scanning: bool,
}

impl<R: Radio> ConnectionMachine<R> {
    /// Spawn the machine task. Frames are forwarded to `frames`
    /// in the order the radio delivers them.
    pub fn spawn(
        radio: Arc<R>,
        settings: ConnectionSettings,
        frames: mpsc::Sender<RawFrame>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let machine = ConnectionMachine {
            radio,
            settings,
            frames,
            state: state_tx,
            events: events_tx.clone(),
            active: None,
            scanning: false,
        };
        let task = tokio::spawn(machine.run(commands_rx));

        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
        };
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            let filter = match command {
                Command::Start(filter) => filter,
                Command::Stop(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };

            info!("Starting connection session for {:?}", filter.name);
            let stop = tokio::select! {
                () = self.session(&filter) => None,
                stop = next_stop(&mut commands) => Some(stop),
            };

            self.teardown().await;
            self.enter_idle();

            match stop {
                Some(Some(ack)) => {
                    info!("Connection session stopped");
                    let _ = ack.send(());
                }
                Some(None) => break,
                None => {}
            }
        }
        self.teardown().await;
        self.enter_idle();
        debug!("Connection machine exiting");
    }

    /// Runs attempts until the retry budget is spent. Only returns on give-up.
    async fn session(&mut self, filter: &NameFilter) {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(filter).await {
                Ok(LinkLost {
                    peripheral,
                    streamed_for,
                }) => {
                    let reason = "link lost".to_string();
                    debug!("Disconnected from {}: {reason}", peripheral.id);
                    self.teardown().await;
                    if let Err(err) = self.transition(ConnectionState::Disconnected) {
                        error!("{err}");
                    }
                    self.emit(LinkEvent::Disconnected { peripheral, reason });
                    if streamed_for >= self.settings.reset_after {
                        debug!("Streamed for {streamed_for:?}, resetting retry counter");
                        attempt = 0;
                    }
                }
                Err(err) => {
                    warn!("Connection attempt failed: {err}");
                    self.teardown().await;
                    if let Err(err) = self.transition(ConnectionState::Failed) {
                        error!("{err}");
                    }
                    self.emit(LinkEvent::Failed(err.to_string()));
                }
            }

            attempt = attempt.saturating_add(1);
            if let Some(max) = self.settings.max_retries {
                if attempt > max {
                    let reason = format!("gave up after {max} retries");
                    error!("{reason}");
                    self.emit(LinkEvent::GaveUp(reason));
                    return;
                }
            }

            let delay = self.settings.backoff.delay(attempt - 1);
            info!("Retrying in {delay:?} (attempt {attempt})");
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&mut self, filter: &NameFilter) -> Result<LinkLost, ConnectionError> {
        let radio = Arc::clone(&self.radio);
        let timeout = self.settings.step_timeout;
        let target = self.settings.endpoint;

        self.transition(ConnectionState::Scanning)?;
        self.scanning = true;
        let peripheral = radio.scan(filter).await?;
        self.scanning = false;
        info!("Found target device: {} [{}]", peripheral.name, peripheral.id);
        self.active = Some(peripheral.clone());

        self.transition(ConnectionState::Connecting)?;
        bounded(ConnectionState::Connecting, timeout, radio.connect(&peripheral)).await?;
        info!("Connected to device: {}", peripheral.id);

        self.transition(ConnectionState::DiscoveringServices)?;
        let services = bounded(
            ConnectionState::DiscoveringServices,
            timeout,
            radio.discover_services(&peripheral),
        )
        .await?;
        debug!("Services on {}: {:?}", peripheral.id, services);
        if !services.contains(&target.service) {
            return Err(ConnectionError::ServiceNotFound(target.service));
        }

        let ordered = std::iter::once(target.service)
            .chain(services.iter().copied().filter(|s| *s != target.service));
        let mut endpoint = None;
        for service in ordered {
            self.transition(ConnectionState::DiscoveringCharacteristics)?;
            let characteristics = bounded(
                ConnectionState::DiscoveringCharacteristics,
                timeout,
                radio.discover_characteristics(&peripheral, service),
            )
            .await?;
            debug!("Characteristics of {service}: {characteristics:?}");
            if characteristics
                .iter()
                .any(|c| c.uuid == target.characteristic && c.notify)
            {
                endpoint = Some(ServiceEndpoint {
                    service,
                    characteristic: target.characteristic,
                });
                break;
            }
        }
        let endpoint =
            endpoint.ok_or(ConnectionError::CharacteristicNotFound(target.characteristic))?;

        self.transition(ConnectionState::Subscribing)?;
        let mut frames = bounded(
            ConnectionState::Subscribing,
            timeout,
            radio.subscribe(&peripheral, endpoint, self.settings.frame_queue),
        )
        .await?;

        self.transition(ConnectionState::Streaming)?;
        info!("Streaming notifications from {}", peripheral.id);
        self.emit(LinkEvent::Connected(peripheral.clone()));

        let started = Instant::now();
        while let Some(frame) = frames.recv().await {
            debug!("Received data: {}", protocol::to_hex(&frame.bytes));
            if self.frames.send(frame).await.is_err() {
                return Err(ConnectionError::PipelineClosed);
            }
        }
        Ok(LinkLost {
            peripheral,
            streamed_for: started.elapsed(),
        })
    }

    /// Best-effort release of the scan and the link. Each call is bounded by
    /// the step timeout; the active peripheral is only forgotten once its
    /// disconnect has finished or expired.
    async fn teardown(&mut self) {
        let limit = self.settings.step_timeout;
        if self.scanning {
            match tokio::time::timeout(limit, self.radio.stop_scan()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("Failed to stop scan: {err}"),
                Err(_) => warn!("Stopping the scan timed out after {limit:?}"),
            }
            self.scanning = false;
        }
        if let Some(peripheral) = self.active.clone() {
            match tokio::time::timeout(limit, self.radio.disconnect(&peripheral)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Failed to disconnect {}: {err}", peripheral.id),
                Err(_) => warn!("Disconnecting {} timed out after {limit:?}", peripheral.id),
            }
            self.active = None;
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), ConnectionError> {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        debug!("{current:?} -> {next:?}");
        self.state.send_replace(next);
        self.emit(LinkEvent::Transition {
            from: current,
            to: next,
        });
        Ok(())
    }

    fn enter_idle(&mut self) {
        if *self.state.borrow() != ConnectionState::Idle {
            if let Err(err) = self.transition(ConnectionState::Idle) {
                error!("{err}");
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }
}

async fn bounded<T>(
    stage: ConnectionState,
    after: Duration,
    operation: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, ConnectionError> {
    match tokio::time::timeout(after, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ConnectionError::Timeout { stage, after }),
    }
}

/// Waits for a stop request, ignoring duplicate starts. `None` means every
/// handle is gone.
async fn next_stop(commands: &mut mpsc::Receiver<Command>) -> Option<oneshot::Sender<()>> {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Stop(ack) => return Some(ack),
            Command::Start(filter) => {
                warn!("Session already running, ignoring start for {:?}", filter.name)
            }
        }
    }
    None
}
