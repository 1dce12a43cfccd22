/*!
CONNECTION MANAGER - Single persistent push connection with bounded backoff

ROLE:
Owns the one live connection to the fleet backend. Every cycle is a spawned
task that connects, pumps frames onto the event bus and, on an unplanned
close, waits out an exponential backoff before trying again. After
`max_retries` failed reconnects the cycle ends in `permanently_failed` and
stays there until someone calls `connect` again (auth change, manual retry).

HOW IT WORKS:
- `connect(credential)` stops the running cycle (intentional close) and
  starts a fresh one with a reset retry counter
- `disconnect()` stops the running cycle; no reconnect follows
- connect/disconnect are serialized, so two cycles never overlap
- a cycle is stopped through a oneshot signal checked at every suspension
  point (handshake, read, backoff sleep)
*/

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReconnectConf;
use crate::events::{CloseInfo, EventBus, SyncEvent};
use crate::models::{ConnectionStatus, Credential};
use crate::protocol;
use crate::transport::{Frame, Transport, TransportStream};

struct RunningCycle {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    config: ReconnectConf,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    status: watch::Sender<ConnectionStatus>,
    cycle: Mutex<Option<RunningCycle>>,
    lifecycle: tokio::sync::Mutex<()>,
    unplanned_closes: AtomicU32,
    connect_attempts: AtomicU32,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ReconnectConf, transport: Arc<dyn Transport>, bus: EventBus) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                transport,
                bus,
                status,
                cycle: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                unplanned_closes: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Unplanned closes seen since creation (each one triggers a reconnect
    /// or the final failure).
    pub fn unplanned_closes(&self) -> u32 {
        self.inner.unplanned_closes.load(Ordering::Relaxed)
    }

    /// Transport connect calls since creation.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    /// Replaces whatever connection exists with a fresh cycle carrying
    /// `credential` (or none, for the public endpoint).
    pub async fn connect(&self, credential: Option<Credential>) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_cycle().await;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_cycle(inner, credential, shutdown_rx));
        *self.inner.cycle.lock() = Some(RunningCycle { shutdown, handle });
    }

    /// Closes the connection on purpose. No reconnect is attempted.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stop_cycle().await;
    }
}

impl ManagerInner {
    async fn stop_cycle(&self) {
        let Some(cycle) = self.cycle.lock().take() else {
            return;
        };
        let _ = cycle.shutdown.send(());
        if let Err(e) = cycle.handle.await {
            if !e.is_cancelled() {
                error!("connection task failed: {e}");
            }
        }

        // a cycle that already gave up has nothing left to close
        let was_live = !matches!(
            *self.status.borrow(),
            ConnectionStatus::Disconnected | ConnectionStatus::PermanentlyFailed
        );
        self.set_status(ConnectionStatus::Disconnected);
        if was_live {
            info!("connection closed by client");
            self.bus.emit(&SyncEvent::Close(CloseInfo::intentional()));
        }
    }

    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "unexpected connection status transition");
            }
            *current = next;
            true
        });
    }

    fn dispatch(&self, text: &str) {
        match protocol::decode_frame(text) {
            Ok(events) => {
                for event in &events {
                    self.bus.emit(event);
                }
            }
            Err(e) => warn!("dropping undecodable push message: {e}"),
        }
    }
}

async fn run_cycle(inner: Arc<ManagerInner>, credential: Option<Credential>, mut shutdown: oneshot::Receiver<()>) {
    let session = Uuid::new_v4();
    let mut failures: u32 = 0;

    loop {
        inner.set_status(if failures == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting
        });
        inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(%session, attempt = failures + 1, "connecting");

        let attempt = tokio::select! {
            _ = &mut shutdown => return,
            attempt = inner.transport.connect(credential.as_ref()) => attempt,
        };

        let close = match attempt {
            Ok(mut stream) => {
                failures = 0;
                inner.set_status(ConnectionStatus::Connected);
                info!(%session, authenticated = credential.is_some(), "connection open");
                inner.bus.emit(&SyncEvent::Open);

                let outcome = tokio::select! {
                    _ = &mut shutdown => None,
                    close = pump(&inner, stream.as_mut()) => Some(close),
                };
                match outcome {
                    Some(close) => close,
                    None => {
                        stream.close().await;
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(%session, "connect failed: {e}");
                inner.bus.emit(&SyncEvent::Error(e.to_string()));
                CloseInfo::abnormal(e.to_string())
            }
        };

        inner.unplanned_closes.fetch_add(1, Ordering::Relaxed);
        warn!(%session, code = ?close.code, reason = %close.reason, "connection lost");
        inner.bus.emit(&SyncEvent::Close(close));

        failures += 1;
        if failures > inner.config.max_retries {
            inner.set_status(ConnectionStatus::PermanentlyFailed);
            error!(%session, attempts = failures, "giving up on the push connection");
            inner.bus.emit(&SyncEvent::PermanentFailure { attempts: failures });
            return;
        }

        inner.set_status(ConnectionStatus::Reconnecting);
        let delay = inner.config.delay_for(failures);
        info!(%session, retry = failures, of = inner.config.max_retries, ?delay, "reconnecting");
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Reads frames until the connection ends and reports how it ended.
async fn pump(inner: &ManagerInner, stream: &mut dyn TransportStream) -> CloseInfo {
    loop {
        match stream.next_frame().await {
            Some(Ok(Frame::Text(text))) => inner.dispatch(&text),
            Some(Ok(Frame::Close { code, reason })) => {
                return CloseInfo {
                    intentional: false,
                    code,
                    reason,
                }
            }
            Some(Err(e)) => {
                inner.bus.emit(&SyncEvent::Error(e.to_string()));
                return CloseInfo::abnormal(e.to_string());
            }
            None => return CloseInfo::abnormal("connection dropped"),
        }
    }
}
