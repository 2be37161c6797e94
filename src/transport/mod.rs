//! Transport manager
//!
//! Owns the connection lifecycle for the terminal data sources and
//! guarantees that exactly one transport delivers events at any time.
//! Preference order: socket, then polled files, then synthetic data. The
//! socket keeps being probed in the background while a fallback is active
//! and the pipeline swaps back the moment it recovers.

pub mod poller;
pub mod socket;
pub mod synthetic;

pub use poller::{Feed, FilePoller, PollReport};
pub use socket::{CloseReason, SocketConnection};
pub use synthetic::SyntheticGenerator;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::normalize::NormalizedRecord;
use crate::signal::SignalEngine;
use crate::types::{
    now_millis, AccountSnapshot, Command, ConnectionState, Event, SnapshotKind, TransportKind,
};

/// Owner of the published `ConnectionState`, shared between the manager
/// and its source tasks. Every dispatcher publish from a transport task
/// goes through the liveness gate here, so a stopped pipeline cannot emit
/// events from stale tasks.
pub struct StatusHandle {
    dispatcher: Arc<Dispatcher>,
    alive: AtomicBool,
    status: Mutex<ConnectionState>,
}

impl StatusHandle {
    pub fn new(dispatcher: Arc<Dispatcher>, transport: TransportKind) -> Self {
        Self {
            dispatcher,
            alive: AtomicBool::new(true),
            status: Mutex::new(ConnectionState::disconnected(transport)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.lock().clone()
    }

    /// Publish through the liveness gate
    pub fn publish(&self, event: Event) {
        if self.is_alive() {
            self.dispatcher.publish(&event);
        }
    }

    /// Route a normalized record to its event kind. Account snapshots are
    /// folded into the connection state rather than published raw.
    pub fn publish_record(&self, record: NormalizedRecord) {
        match record {
            NormalizedRecord::Tick(tick) => self.publish(Event::Tick(tick)),
            NormalizedRecord::Candle(candle) => self.publish(Event::Candle(candle)),
            NormalizedRecord::Symbols(symbols) => self.publish(Event::Symbols(symbols)),
            NormalizedRecord::Account(snapshot) => self.apply_account(snapshot),
            NormalizedRecord::Pong => {}
        }
    }

    /// Merge an account snapshot into the connection state and republish
    pub fn apply_account(&self, snapshot: AccountSnapshot) {
        let state = {
            let mut status = self.lock();
            status.server = Some(snapshot.server.clone());
            status.account = Some(snapshot.account);
            status.balance = Some(snapshot.balance);
            status.equity = Some(snapshot.equity);
            status.margin = Some(snapshot.margin);
            status.free_margin = Some(snapshot.free_margin);
            status.margin_level = Some(snapshot.margin_level);
            status.last_update = now_millis();
            status.clone()
        };
        self.publish(Event::Connection(state));
    }

    /// Record a transport transition and publish the resulting state
    pub fn set_transport_state(
        &self,
        transport: TransportKind,
        is_connected: bool,
        detail: Option<String>,
    ) {
        let state = {
            let mut status = self.lock();
            status.transport = transport;
            status.is_connected = is_connected;
            status.detail = detail;
            status.last_update = now_millis();
            status.clone()
        };
        self.publish(Event::Connection(state));
    }

    /// Caller-initiated terminal state; returned for publishing outside
    /// the liveness gate.
    fn mark_stopped(&self, detail: &str) -> ConnectionState {
        let mut status = self.lock();
        status.is_connected = false;
        status.detail = Some(detail.to_string());
        status.last_update = now_millis();
        status.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum SocketPhaseEnd {
    /// Pipeline is shutting down or the session closed gracefully
    Stopped,
    /// Attempt budget spent; fail over
    Exhausted(String),
}

struct ManagerInner {
    running: bool,
    subscriptions: HashSet<String>,
    command_tx: Option<mpsc::Sender<Command>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Composition-root-owned facade over the whole transport layer
pub struct TransportManager {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<SignalEngine>,
    status: Arc<StatusHandle>,
    poller: Arc<FilePoller>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl TransportManager {
    pub fn new(
        config: Arc<PipelineConfig>,
        dispatcher: Arc<Dispatcher>,
        engine: Arc<SignalEngine>,
    ) -> Arc<Self> {
        let status = Arc::new(StatusHandle::new(dispatcher.clone(), TransportKind::Socket));
        let poller = Arc::new(FilePoller::new(config.clone(), status.clone()));
        Arc::new(Self {
            config,
            dispatcher,
            engine,
            status,
            poller,
            inner: Arc::new(Mutex::new(ManagerInner {
                running: false,
                subscriptions: HashSet::new(),
                command_tx: None,
                supervisor: None,
            })),
        })
    }

    /// Bring the pipeline up on the preferred transport. Idempotent.
    pub fn start(&self, preferred: TransportKind) {
        {
            let mut inner = self.lock();
            if inner.running {
                return;
            }
            inner.running = true;
        }
        self.status.revive();
        self.status
            .set_transport_state(preferred, false, Some("starting".to_string()));

        let supervisor = Supervisor {
            config: self.config.clone(),
            status: self.status.clone(),
            poller: self.poller.clone(),
            inner: self.inner.clone(),
        };
        let handle = tokio::spawn(async move { supervisor.run(preferred).await });
        self.lock().supervisor = Some(handle);
        info!(transport = %preferred, "transport manager started");
    }

    /// Tear the pipeline down: cancel every source task and prevent any
    /// further publishes from them. Idempotent.
    pub fn stop(&self) {
        let supervisor = {
            let mut inner = self.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.command_tx = None;
            inner.supervisor.take()
        };
        self.status.shutdown();
        self.poller.deactivate();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        // The terminal Closed event is the one publish allowed past the gate.
        let state = self.status.mark_stopped("stopped");
        self.dispatcher.publish(&Event::Connection(state));
        info!("transport manager stopped");
    }

    /// Track an instrument subscription, forwarding it when the socket is
    /// the active source. Subscriptions replay automatically on reconnect.
    pub fn subscribe_instrument(&self, symbol: &str) {
        let inner = &mut *self.lock();
        if inner.subscriptions.insert(symbol.to_string()) {
            if let Some(tx) = &inner.command_tx {
                let _ = tx.try_send(Command::with_symbol("SUBSCRIBE", symbol));
            }
        }
    }

    pub fn unsubscribe_instrument(&self, symbol: &str) {
        let inner = &mut *self.lock();
        if inner.subscriptions.remove(symbol) {
            if let Some(tx) = &inner.command_tx {
                let _ = tx.try_send(Command::with_symbol("UNSUBSCRIBE", symbol));
            }
        }
    }

    /// Ask the active source for a fresh snapshot: a socket command when
    /// connected, a forced republish on the file transport otherwise.
    pub fn request_snapshot(&self, kind: SnapshotKind) {
        let sent = {
            let inner = self.lock();
            match &inner.command_tx {
                Some(tx) => {
                    let _ = tx.try_send(Command::for_snapshot(kind));
                    true
                }
                None => false,
            }
        };
        if !sent {
            self.poller.force_refresh();
        }
    }

    /// Point the signal engine at a new instrument. The old buffer is
    /// cleared before any event for the new instrument can be processed.
    pub fn select_instrument(&self, symbol: &str) {
        let previous = self.engine.current_symbol();
        if previous == symbol {
            return;
        }
        self.unsubscribe_instrument(&previous);
        self.engine.set_instrument(symbol);
        self.subscribe_instrument(symbol);
    }

    pub async fn test_reachability(&self) -> (bool, String) {
        self.poller.test_reachability().await
    }

    /// Last published connection state
    pub fn connection(&self) -> ConnectionState {
        self.status.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the connection lifecycle loop. Holds only shared handles so the
/// spawned task never needs the manager itself.
struct Supervisor {
    config: Arc<PipelineConfig>,
    status: Arc<StatusHandle>,
    poller: Arc<FilePoller>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl Supervisor {
    async fn run(&self, preferred: TransportKind) {
        match preferred {
            TransportKind::Socket => self.socket_first().await,
            TransportKind::File => {
                run_fallback_chain(
                    self.config.clone(),
                    self.status.clone(),
                    self.poller.clone(),
                    true,
                    Arc::new(AtomicBool::new(false)),
                )
                .await
            }
            TransportKind::Synthetic => {
                run_fallback_chain(
                    self.config.clone(),
                    self.status.clone(),
                    self.poller.clone(),
                    false,
                    Arc::new(AtomicBool::new(false)),
                )
                .await
            }
        }
    }

    /// Socket with failover: spend the attempt budget, fall back to the
    /// poller (or synthetic data), keep probing, swap back on recovery.
    async fn socket_first(&self) {
        let mut recovered: Option<SocketConnection> = None;
        'outer: loop {
            if !self.status.is_alive() {
                return;
            }
            match self.socket_phase(recovered.take()).await {
                SocketPhaseEnd::Stopped => return,
                SocketPhaseEnd::Exhausted(diag) => {
                    if !self.status.is_alive() {
                        return;
                    }
                    warn!("{}; activating fallback source", diag);
                    self.status
                        .set_transport_state(TransportKind::Socket, false, Some(diag));

                    let cancel = Arc::new(AtomicBool::new(false));
                    let fallback = tokio::spawn(run_fallback_chain(
                        self.config.clone(),
                        self.status.clone(),
                        self.poller.clone(),
                        true,
                        cancel.clone(),
                    ));

                    loop {
                        tokio::time::sleep(self.config.socket_probe_interval).await;
                        if !self.status.is_alive() {
                            cancel.store(true, Ordering::SeqCst);
                            fallback.abort();
                            return;
                        }
                        match SocketConnection::establish(
                            &self.config.socket_url,
                            self.config.connect_timeout,
                        )
                        .await
                        {
                            Ok(conn) => {
                                info!("socket transport recovered, swapping back");
                                cancel.store(true, Ordering::SeqCst);
                                fallback.abort();
                                self.poller.deactivate();
                                recovered = Some(conn);
                                continue 'outer;
                            }
                            Err(e) => debug!(error = %e, "background socket probe failed"),
                        }
                    }
                }
            }
        }
    }

    /// Connection attempts with linear backoff. A successful handshake
    /// resets the attempt counter; a session drop re-enters the loop with
    /// a fresh budget.
    async fn socket_phase(&self, mut pre_established: Option<SocketConnection>) -> SocketPhaseEnd {
        let mut attempt: u32 = 0;
        loop {
            if !self.status.is_alive() {
                return SocketPhaseEnd::Stopped;
            }
            let conn = match pre_established.take() {
                Some(conn) => Ok(conn),
                None => {
                    attempt += 1;
                    SocketConnection::establish(&self.config.socket_url, self.config.connect_timeout)
                        .await
                }
            };
            match conn {
                Ok(conn) => {
                    attempt = 0;
                    match self.run_session(conn).await {
                        CloseReason::Graceful => return SocketPhaseEnd::Stopped,
                        CloseReason::Degraded => {
                            // Last good state stays visible to consumers
                            // until a replacement source takes over.
                            warn!("socket degraded (missed heartbeat), reconnecting");
                        }
                        CloseReason::Error(e) => warn!(error = %e, "socket closed, reconnecting"),
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "socket connection attempt failed");
                    if attempt >= self.config.max_reconnect_attempts {
                        return SocketPhaseEnd::Exhausted(format!(
                            "socket unreachable after {} attempts: {}",
                            attempt, e
                        ));
                    }
                }
            }
            tokio::time::sleep(self.config.reconnect_delay(attempt.max(1))).await;
        }
    }

    /// One connected socket session: replay snapshots and subscriptions,
    /// then pump the connection until it closes.
    async fn run_session(&self, conn: SocketConnection) -> CloseReason {
        let (tx, rx) = mpsc::channel(64);
        let subscriptions: Vec<String> = {
            let inner = self.lock();
            inner.subscriptions.iter().cloned().collect()
        };
        let _ = tx.try_send(Command::for_snapshot(SnapshotKind::Account));
        let _ = tx.try_send(Command::for_snapshot(SnapshotKind::Symbols));
        for symbol in subscriptions {
            let _ = tx.try_send(Command::with_symbol("SUBSCRIBE", &symbol));
        }
        self.lock().command_tx = Some(tx);
        self.status
            .set_transport_state(TransportKind::Socket, true, None);

        let reason = conn
            .run(self.status.clone(), rx, self.config.heartbeat_interval)
            .await;

        self.lock().command_tx = None;
        reason
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// File-then-synthetic fallback chain, run as its own task so the manager
/// can keep probing the socket concurrently. Cancellation is cooperative
/// via the flag plus an abort from the owner.
async fn run_fallback_chain(
    config: Arc<PipelineConfig>,
    status: Arc<StatusHandle>,
    poller: Arc<FilePoller>,
    try_file: bool,
    cancel: Arc<AtomicBool>,
) {
    if try_file {
        let (reachable, diag) = poller.test_reachability().await;
        if cancel.load(Ordering::SeqCst) || !status.is_alive() {
            return;
        }
        if reachable {
            info!(detail = %diag, "activating file transport");
            poller.activate();
            status.set_transport_state(TransportKind::File, true, None);

            let mut timer = tokio::time::interval(config.poll_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                // First tick fires immediately: consumers get their
                // snapshot without waiting out a poll period.
                timer.tick().await;
                if cancel.load(Ordering::SeqCst) || !status.is_alive() {
                    return;
                }
                let report = poller.poll().await;
                if report.exhausted {
                    warn!("file transport spent its error budget, degrading to synthetic data");
                    break;
                }
            }
        } else {
            warn!(detail = %diag, "file transport unreachable");
            status.set_transport_state(TransportKind::File, false, Some(diag));
        }
        if cancel.load(Ordering::SeqCst) || !status.is_alive() {
            return;
        }
    }

    status.set_transport_state(
        TransportKind::Synthetic,
        false,
        Some("no live source reachable; generating synthetic data".to_string()),
    );
    SyntheticGenerator::new(config, status.clone()).run(cancel).await;
}
