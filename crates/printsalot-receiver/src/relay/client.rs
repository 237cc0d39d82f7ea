//! Relay client that keeps the receiver connected to the relay.
//!
//! One task ([`RelayClient::run`]) owns the session: it performs connects,
//! processes relay events in arrival order, applies the reconnect policy and
//! serialises outbound emits. Everything else talks to it through a cloneable
//! [`RelayHandle`]. The task never blocks on printing; jobs are forwarded to
//! the dispatcher over a channel.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use printsalot_core::ConfigStore;
use printsalot_core::PrinterSettings;
use printsalot_core::settings::SettingsWarning;

use super::config::RelayConfig;
use super::error::RelayError;
use super::protocol::{AuthPayload, InboundEvent, JobStatus, JobUpdate, OutboundEvent, PrintJob};
use super::state::{RelayEvent, SessionSnapshot};
use super::transport::{Connector, RelayLink};
use super::wire;

/// Lifecycle notifications kept for slow subscribers.
const EVENT_BUS_CAPACITY: usize = 64;

enum Command {
    Connect(oneshot::Sender<bool>),
    Disconnect(oneshot::Sender<()>),
    Emit(OutboundEvent),
    SaveSettings(
        PrinterSettings,
        oneshot::Sender<Result<Vec<SettingsWarning>, RelayError>>,
    ),
    Unlink(oneshot::Sender<Result<(), RelayError>>),
}

/// Session task state. Construct with [`RelayClient::new`], then spawn
/// [`RelayClient::run`].
pub struct RelayClient<C: Connector> {
    connector: C,
    store: Arc<ConfigStore>,
    config: RelayConfig,
    commands: mpsc::Receiver<Command>,
    jobs: mpsc::UnboundedSender<PrintJob>,
    state: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<RelayEvent>,
    link: Option<RelayLink>,
    /// Pending reconnect attempt. At most one exists at a time.
    reconnect_at: Option<Instant>,
}

/// Cloneable capability to drive and observe the relay session.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<RelayEvent>,
}

impl<C: Connector> RelayClient<C> {
    /// Create the session task and its handle. Print jobs received from the
    /// relay are forwarded to `jobs`.
    pub fn new(
        connector: C,
        store: Arc<ConfigStore>,
        config: RelayConfig,
        jobs: mpsc::UnboundedSender<PrintJob>,
    ) -> (Self, RelayHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::new(
            store.token().is_some(),
            config.reconnect.initial_delay,
        ));
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let handle = RelayHandle {
            commands: cmd_tx,
            state: state_rx,
            events: events.clone(),
        };
        let client = Self {
            connector,
            store,
            config,
            commands: cmd_rx,
            jobs,
            state: state_tx,
            events,
            link: None,
            reconnect_at: None,
        };
        (client, handle)
    }

    /// Run the session until `shutdown` flips or every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All relay handles dropped");
                        break;
                    }
                },
                event = recv_link(self.link.as_mut()) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.on_transport_closed(),
                },
                () = wait_until(reconnect_at) => self.reconnect_tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Relay client shutting down");
        self.reconnect_at = None;
        self.drop_link();
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                self.set_should_reconnect(true);
                self.reconnect_at = None;
                let connected = self.connect().await;
                if !connected {
                    self.schedule_reconnect();
                }
                let _ = reply.send(connected);
            }
            Command::Disconnect(reply) => {
                info!("Disconnect requested");
                self.set_should_reconnect(false);
                self.reconnect_at = None;
                self.drop_link();
                let _ = reply.send(());
            }
            Command::Emit(event) => self.emit(event),
            Command::SaveSettings(settings, reply) => {
                let _ = reply.send(self.save_settings(settings));
            }
            Command::Unlink(reply) => {
                let result = self.unlink().await;
                let _ = reply.send(result);
            }
        }
    }

    /// One connect attempt. Failures are logged and leave the session
    /// disconnected; they never propagate.
    async fn connect(&mut self) -> bool {
        if self.link.is_some() {
            info!("Already connected");
            return true;
        }

        let relay_url = self.store.relay_url();
        if wire::is_insecure_remote(&relay_url) {
            warn!(relay_url = %relay_url, "Relay URL is not encrypted; the token is sent in clear text");
        }
        let auth = AuthPayload {
            token: self.store.token(),
            settings: self.store.printer_settings(),
        };

        info!(relay_url = %relay_url, linked = auth.token.is_some(), "Connecting to relay");
        match timeout(
            self.config.connect_timeout,
            self.connector.connect(&relay_url, &auth),
        )
        .await
        {
            Ok(Ok(link)) => {
                self.link = Some(link);
                self.on_connected();
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connection failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.connect_timeout.as_secs(),
                    "Connection attempt timed out"
                );
                false
            }
        }
    }

    fn on_connected(&mut self) {
        info!("Connected to relay");
        let floor = self.config.reconnect.initial_delay;
        self.state.send_modify(|s| {
            s.connected = true;
            s.reconnect_delay = floor;
        });
        self.notify(RelayEvent::Connected);
    }

    fn on_transport_closed(&mut self) {
        self.link = None;
        info!("Disconnected from relay");
        self.state.send_modify(|s| s.connected = false);
        self.notify(RelayEvent::Disconnected);
        if self.state.borrow().should_reconnect {
            self.schedule_reconnect();
        }
    }

    /// Tear down the live transport, if any, and announce the disconnect.
    fn drop_link(&mut self) {
        if self.link.take().is_some() {
            info!("Disconnected from relay");
            self.state.send_modify(|s| s.connected = false);
            self.notify(RelayEvent::Disconnected);
        }
    }

    /// Arm the reconnect timer with the current backoff delay. No-op when an
    /// attempt is already pending or reconnecting is switched off.
    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let snapshot = self.state.borrow().clone();
        if !snapshot.should_reconnect {
            return;
        }
        info!(
            delay_secs = snapshot.reconnect_delay.as_secs(),
            "Scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + snapshot.reconnect_delay);
    }

    async fn reconnect_tick(&mut self) {
        self.reconnect_at = None;
        if !self.state.borrow().should_reconnect {
            return;
        }
        if self.connect().await {
            return;
        }
        let policy = &self.config.reconnect;
        self.state
            .send_modify(|s| s.reconnect_delay = policy.next_delay(s.reconnect_delay));
        self.schedule_reconnect();
    }

    async fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Welcome(welcome) => {
                info!(code = ?welcome.code, linked = welcome.linked, "Welcome from relay");
                let code = if welcome.linked {
                    None
                } else {
                    welcome.code.clone()
                };
                self.state.send_modify(|s| {
                    s.pairing_code = code;
                    s.is_linked = welcome.linked;
                });
                self.notify(RelayEvent::Welcome {
                    code: welcome.code,
                    linked: welcome.linked,
                });
            }
            InboundEvent::PrintJob(job) => {
                info!(job_id = %job.job_id, auto_cut = job.auto_cut, "Received print job");
                self.notify(RelayEvent::JobReceived {
                    job_id: job.job_id.clone(),
                });
                if self.jobs.send(job).is_err() {
                    error!("Job dispatcher is gone; print job dropped");
                }
            }
            InboundEvent::TokenIssued(token) => {
                info!("Token issued, re-authenticating");
                if let Err(e) = self.store.set_token(&token) {
                    error!(error = %e, "Failed to persist issued token");
                }
                self.state.send_modify(|s| {
                    s.pairing_code = None;
                    s.is_linked = true;
                });
                self.notify(RelayEvent::TokenIssued);
                self.reauthenticate().await;
            }
            InboundEvent::TokenRotated(token) => {
                debug!("Token rotated");
                if let Err(e) = self.store.set_token(&token) {
                    error!(error = %e, "Failed to persist rotated token");
                }
                self.notify(RelayEvent::TokenRotated);
            }
            InboundEvent::Unknown(name) => debug!(event = %name, "Ignoring unhandled relay event"),
        }
    }

    /// Disconnect and immediately connect again so the relay sees the
    /// current token.
    async fn reauthenticate(&mut self) {
        self.drop_link();
        self.reconnect_at = None;
        if !self.connect().await {
            self.schedule_reconnect();
        }
    }

    fn emit(&self, event: OutboundEvent) {
        let Some(link) = &self.link else {
            debug!(event = event.name(), "Not connected, dropping outbound event");
            return;
        };
        let name = event.name();
        if let Err(e) = link.try_send(event) {
            warn!(event = name, error = %e, "Failed to emit to relay");
        }
    }

    fn save_settings(
        &self,
        settings: PrinterSettings,
    ) -> Result<Vec<SettingsWarning>, RelayError> {
        let (settings, warnings) = settings.normalized();
        for warning in &warnings {
            warn!(%warning, "Printer settings adjusted");
        }
        self.store.set_printer_settings(settings.clone())?;
        info!(width = settings.width, auto_cut = settings.auto_cut, "Printer settings saved");
        self.emit(OutboundEvent::UpdateSettings(settings));
        Ok(warnings)
    }

    async fn unlink(&mut self) -> Result<(), RelayError> {
        self.store.clear_token()?;
        info!("Unlinked from relay account");
        self.state.send_modify(|s| {
            s.is_linked = false;
            s.pairing_code = None;
        });
        if self.state.borrow().should_reconnect {
            self.reauthenticate().await;
        }
        Ok(())
    }

    fn set_should_reconnect(&self, value: bool) {
        self.state.send_modify(|s| s.should_reconnect = value);
    }

    fn notify(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn recv_link(link: Option<&mut RelayLink>) -> Option<InboundEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RelayHandle {
    /// Connect (or confirm the existing connection) and enable automatic
    /// reconnection. Returns whether the session is connected; a failed
    /// attempt is retried by the reconnect policy.
    pub async fn connect(&self) -> Result<bool, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Connect(tx)).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Disconnect and stop reconnecting until [`connect`](Self::connect) is
    /// called again. Cancels any pending reconnect wait.
    pub async fn disconnect(&self) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect(tx)).await?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Report a job's terminal status. Fire-and-forget: dropped when the
    /// session is not connected.
    pub async fn emit_status(&self, job_id: &str, status: JobStatus) {
        let event = OutboundEvent::JobUpdate(JobUpdate::new(job_id, status));
        if self.send(Command::Emit(event)).await.is_err() {
            debug!(job_id, "Relay client stopped; status dropped");
        }
    }

    /// Validate, persist and push printer settings to the live session.
    /// Returns the adjustments that were applied.
    pub async fn save_settings(
        &self,
        settings: PrinterSettings,
    ) -> Result<Vec<SettingsWarning>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SaveSettings(settings, tx)).await?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Forget the stored token and re-authenticate to obtain a new pairing
    /// code.
    pub async fn unlink(&self) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Unlink(tx)).await?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Current session state.
    pub fn state(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that is notified on every session state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Subscribe to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    async fn send(&self, cmd: Command) -> Result<(), RelayError> {
        self.commands.send(cmd).await.map_err(|_| RelayError::Closed)
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
