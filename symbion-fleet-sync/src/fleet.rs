/*!
FLEET STATE STORE - Canonical in-memory fleet model

ROLE:
Holds the server list exactly as the last `full_server_list` push described
it, plus the connection status shown to the user. Drives the connection
from the auth state: every auth change means a fresh connection.

HOW IT WORKS:
- a snapshot replaces the whole list (servers missing from it are gone)
- connection events move the status machine, see `StoreInner::apply`
- bus listeners are registered once per store, no matter how often `init`
  runs or how often the auth state changes
- consumers read through `watch()` or the derived views
*/

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::events::{ListenerHandle, SyncEvent, Topic};
use crate::models::{AuthState, ConnectionStatus, Server, ServerId, ServerStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct FleetState {
    pub servers: Vec<Server>,
    pub status: ConnectionStatus,
    pub loading: bool,
    pub error: Option<String>,
    /// Snapshots received since creation.
    pub snapshots: u64,
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            status: ConnectionStatus::Disconnected,
            loading: true,
            error: None,
            snapshots: 0,
        }
    }
}

/// Server list filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetFilter {
    pub group: Option<String>,
    pub tag: Option<String>,
    pub status: Option<ServerStatus>,
    /// Case-insensitive substring of the server name.
    pub search: Option<String>,
}

impl FleetFilter {
    pub fn matches(&self, server: &Server) -> bool {
        if let Some(group) = &self.group {
            if server.group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !server.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if server.status != status {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.trim().to_lowercase();
            if !needle.is_empty() && !server.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
}

struct StoreInner {
    connection: ConnectionManager,
    state: watch::Sender<FleetState>,
    listeners: Mutex<Vec<ListenerHandle>>,
    auth: Mutex<AuthState>,
    auth_task: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

#[derive(Clone)]
pub struct FleetStore {
    inner: Arc<StoreInner>,
}

impl FleetStore {
    pub fn new(connection: ConnectionManager) -> Self {
        let (state, _) = watch::channel(FleetState::default());
        Self {
            inner: Arc::new(StoreInner {
                connection,
                state,
                listeners: Mutex::new(Vec::new()),
                auth: Mutex::new(AuthState::Anonymous),
                auth_task: Mutex::new(None),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Starts following `auth`: connects now with its current value, then
    /// reconnects on every change. Calling it again is a no-op.
    pub async fn init(&self, mut auth: watch::Receiver<AuthState>) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("fleet store already initialized");
            return;
        }
        self.register_listeners();

        let initial = auth.borrow_and_update().clone();
        self.connect_with(initial).await;

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while auth.changed().await.is_ok() {
                let next = auth.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };
                let store = FleetStore { inner };
                if *store.inner.auth.lock() == next {
                    continue;
                }
                info!(authenticated = next.credential().is_some(), "auth state changed, reconnecting");
                store.connect_with(next).await;
            }
            debug!("auth watcher stopped");
        });
        if let Some(previous) = self.inner.auth_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn register_listeners(&self) {
        let mut listeners = self.inner.listeners.lock();
        if !listeners.is_empty() {
            return;
        }
        let bus = self.inner.connection.bus();
        for topic in [
            Topic::Open,
            Topic::Close,
            Topic::Error,
            Topic::PermanentFailure,
            Topic::FullServerList,
        ] {
            let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
            match bus.on(topic, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply(event);
                }
            }) {
                Ok(handle) => listeners.push(handle),
                Err(e) => warn!(%topic, "fleet store cannot listen: {e}"),
            }
        }
    }

    async fn connect_with(&self, auth: AuthState) {
        *self.inner.auth.lock() = auth.clone();
        self.inner.state.send_modify(|state| {
            state.status = ConnectionStatus::Connecting;
            state.loading = true;
            state.error = None;
        });
        self.inner.connection.connect(auth.credential()).await;
    }

    /// Reconnects with the current auth state, e.g. after `permanently_failed`.
    pub async fn retry(&self) {
        let auth = self.inner.auth.lock().clone();
        info!("manual reconnect");
        self.connect_with(auth).await;
    }

    /// Stops following auth changes, drops the bus listeners and closes the
    /// connection. `init` may be called again afterwards.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.auth_task.lock().take() {
            task.abort();
        }
        let handles: Vec<_> = self.inner.listeners.lock().drain(..).collect();
        let bus = self.inner.connection.bus();
        for handle in handles {
            bus.off(handle);
        }
        self.inner.connection.disconnect().await;
        self.inner.state.send_modify(|state| {
            state.status = ConnectionStatus::Disconnected;
            state.loading = false;
        });
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn watch(&self) -> watch::Receiver<FleetState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> FleetState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status
    }

    pub fn servers(&self) -> Vec<Server> {
        self.inner.state.borrow().servers.clone()
    }

    pub fn server(&self, id: ServerId) -> Option<Server> {
        self.inner.state.borrow().servers.iter().find(|s| s.id == id).cloned()
    }

    pub fn filtered(&self, filter: &FleetFilter) -> Vec<Server> {
        self.inner
            .state
            .borrow()
            .servers
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    pub fn groups(&self) -> Vec<String> {
        let state = self.inner.state.borrow();
        let groups: BTreeSet<_> = state.servers.iter().filter_map(|s| s.group.clone()).collect();
        groups.into_iter().collect()
    }

    pub fn tags(&self) -> Vec<String> {
        let state = self.inner.state.borrow();
        let tags: BTreeSet<_> = state.servers.iter().flat_map(|s| s.tags.iter().cloned()).collect();
        tags.into_iter().collect()
    }

    pub fn counts(&self) -> FleetCounts {
        let state = self.inner.state.borrow();
        let mut counts = FleetCounts {
            total: state.servers.len(),
            ..FleetCounts::default()
        };
        for server in &state.servers {
            match server.status {
                ServerStatus::Online => counts.online += 1,
                ServerStatus::Offline => counts.offline += 1,
                ServerStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    /// Local edit shown until the next snapshot overwrites it. Returns false
    /// when the server is not in the list.
    pub fn apply_optimistic<F>(&self, id: ServerId, edit: F) -> bool
    where
        F: FnOnce(&mut Server),
    {
        self.inner.state.send_if_modified(|state| {
            match state.servers.iter_mut().find(|s| s.id == id) {
                Some(server) => {
                    edit(server);
                    true
                }
                None => false,
            }
        })
    }

    /// Number of bus listeners owned by this store.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl StoreInner {
    fn apply(&self, event: &SyncEvent) {
        self.state.send_modify(|state| match event {
            SyncEvent::FullServerList(servers) => {
                debug!(count = servers.len(), "fleet snapshot");
                state.servers = servers.as_ref().clone();
                state.status = ConnectionStatus::Connected;
                state.loading = false;
                state.error = None;
                state.snapshots += 1;
            }
            SyncEvent::Open => {
                state.status = ConnectionStatus::Connected;
                state.error = None;
            }
            SyncEvent::Close(close) if close.intentional => {
                // a close caused by our own reconnect, not by the user
                if state.status != ConnectionStatus::Connecting {
                    state.status = ConnectionStatus::Disconnected;
                    state.loading = false;
                }
            }
            SyncEvent::Close(close) => {
                if state.status != ConnectionStatus::PermanentlyFailed {
                    state.status = ConnectionStatus::Reconnecting;
                    state.loading = true;
                    state.error = Some(match close.code {
                        Some(code) => format!("connection lost (code {code}): {}", close.reason),
                        None => format!("connection lost: {}", close.reason),
                    });
                }
            }
            SyncEvent::Error(message) => {
                if !matches!(
                    state.status,
                    ConnectionStatus::Reconnecting | ConnectionStatus::PermanentlyFailed
                ) {
                    state.status = ConnectionStatus::Error;
                    state.error = Some(message.clone());
                }
            }
            SyncEvent::PermanentFailure { attempts } => {
                state.status = ConnectionStatus::PermanentlyFailed;
                state.loading = false;
                state.error = Some(format!("connection failed after {attempts} attempts"));
            }
            SyncEvent::ServerMetrics { .. } | SyncEvent::ServiceMonitorResult(_) => {}
        });
    }
}
