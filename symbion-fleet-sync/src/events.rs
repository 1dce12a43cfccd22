/*!
EVENT BUS - Typed publish/subscribe hub between the connection and its consumers

The connection manager only knows how to emit; the fleet store, the
subscription multiplexer and the health tracker only know how to listen.
Listeners are registered per topic and identified by a `ListenerHandle`,
which is the only way to remove them.

Listeners run synchronously on the emitting task, outside the internal
lock, so a listener may register or remove listeners itself.
*/

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::{MetricPoint, ProbeResult, Server, ServerId};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Open,
    Close,
    Error,
    PermanentFailure,
    FullServerList,
    ServerMetrics,
    ServiceMonitorResult,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Open => "open",
            Topic::Close => "close",
            Topic::Error => "error",
            Topic::PermanentFailure => "permanent_failure",
            Topic::FullServerList => "full_server_list",
            Topic::ServerMetrics => "server_metrics",
            Topic::ServiceMonitorResult => "service_monitor_result",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details carried by a `close` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub intentional: bool,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;

    pub fn intentional() -> Self {
        Self {
            intentional: true,
            code: Some(Self::NORMAL),
            reason: "client disconnect".to_string(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            intentional: false,
            code: Some(Self::ABNORMAL),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Open,
    Close(CloseInfo),
    Error(String),
    PermanentFailure { attempts: u32 },
    FullServerList(Arc<Vec<Server>>),
    ServerMetrics { server_id: ServerId, point: MetricPoint },
    ServiceMonitorResult(ProbeResult),
}

impl SyncEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SyncEvent::Open => Topic::Open,
            SyncEvent::Close(_) => Topic::Close,
            SyncEvent::Error(_) => Topic::Error,
            SyncEvent::PermanentFailure { .. } => Topic::PermanentFailure,
            SyncEvent::FullServerList(_) => Topic::FullServerList,
            SyncEvent::ServerMetrics { .. } => Topic::ServerMetrics,
            SyncEvent::ServiceMonitorResult(_) => Topic::ServiceMonitorResult,
        }
    }
}

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Returned by `EventBus::on`; give it back to `EventBus::off` to remove
/// the listener. Dropping it leaves the listener in place.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    topic: Topic,
    id: u64,
}

impl ListenerHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<Topic, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: Topic, listener: F) -> Result<ListenerHandle, BusError>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(topic)
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(ListenerHandle { topic, id })
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(registered) = listeners.get_mut(&handle.topic) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(id, _)| *id != handle.id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(&handle.topic);
        }
        removed
    }

    /// Delivers `event` to every listener of its topic and returns how many
    /// were called.
    pub fn emit(&self, event: &SyncEvent) -> usize {
        let targets: Vec<Listener> = match self.inner.listeners.lock().get(&event.topic()) {
            Some(registered) => registered.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner.listeners.lock().get(&topic).map_or(0, Vec::len)
    }

    pub fn total_listeners(&self) -> usize {
        self.inner.listeners.lock().values().map(Vec::len).sum()
    }

    /// Drops every listener and refuses new registrations.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.listeners.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
