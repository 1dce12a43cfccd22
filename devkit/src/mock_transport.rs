/*!
Mock transport pour tester sans serveur WebSocket

Remplace `WsTransport` dans les tests : chaque tentative de connexion suit un
script (accepter / refuser), les frames entrantes sont injectées à la main
et la coupure réseau se simule avec `drop_connection`.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use symbion_fleet_sync::models::Credential;
use symbion_fleet_sync::transport::{Frame, Transport, TransportError, TransportStream};
use tokio::sync::mpsc;

/// What the next connect attempt does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse(String),
}

type FrameSender = mpsc::UnboundedSender<Result<Frame, TransportError>>;

struct MockInner {
    script: Mutex<VecDeque<ConnectOutcome>>,
    fallback: Mutex<ConnectOutcome>,
    live: Mutex<Option<(u64, FrameSender)>>,
    credentials: Mutex<Vec<Option<String>>>,
    attempts: AtomicUsize,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    /// Accepts every connection until told otherwise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(ConnectOutcome::Accept),
                live: Mutex::new(None),
                credentials: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues outcomes for the next attempts, in order.
    pub fn script<I: IntoIterator<Item = ConnectOutcome>>(&self, outcomes: I) -> &Self {
        self.inner.script.lock().extend(outcomes);
        self
    }

    /// Outcome once the script is exhausted.
    pub fn always(&self, outcome: ConnectOutcome) -> &Self {
        *self.inner.fallback.lock() = outcome;
        self
    }

    pub fn refuse_all(&self, reason: &str) -> &Self {
        self.always(ConnectOutcome::Refuse(reason.to_string()))
    }

    /// Pushes a JSON message on the live connection.
    pub fn send_json(&self, message: &Value) -> Result<()> {
        self.send_frame(Frame::Text(serde_json::to_string(message)?))
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Frame::Text(text.to_string()))
    }

    /// Server-side close frame.
    pub fn send_close(&self, code: u16, reason: &str) -> Result<()> {
        self.send_frame(Frame::Close {
            code: Some(code),
            reason: reason.to_string(),
        })
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let live = self.inner.live.lock();
        let Some((_, sender)) = live.as_ref() else {
            anyhow::bail!("no live connection");
        };
        sender
            .send(Ok(frame))
            .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        log::debug!("📨 [MOCK] frame pushed");
        Ok(())
    }

    /// Simulates the network going away (no close frame). Returns false if
    /// nothing was connected.
    pub fn drop_connection(&self) -> bool {
        let dropped = self.inner.live.lock().take().is_some();
        if dropped {
            log::info!("🔌 [MOCK] connection dropped");
        }
        dropped
    }

    pub fn is_connected(&self) -> bool {
        self.inner.live.lock().as_ref().is_some_and(|(_, s)| !s.is_closed())
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Token used by each attempt, `None` for anonymous ones.
    pub fn credentials(&self) -> Vec<Option<String>> {
        self.inner.credentials.lock().clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn TransportStream>, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner
            .credentials
            .lock()
            .push(credential.map(|c| c.token().to_string()));

        let outcome = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.lock().clone());

        match outcome {
            ConnectOutcome::Refuse(reason) => {
                log::info!("⛔ [MOCK] connection refused: {}", reason);
                Err(TransportError::Connect(reason))
            }
            ConnectOutcome::Accept => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let (sender, receiver) = mpsc::unbounded_channel();
                *self.inner.live.lock() = Some((id, sender));
                log::info!("✅ [MOCK] connection #{} accepted", id);
                Ok(Box::new(MockStream {
                    id,
                    receiver,
                    inner: self.inner.clone(),
                }))
            }
        }
    }
}

struct MockStream {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    inner: Arc<MockInner>,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.receiver.recv().await
    }

    async fn close(&mut self) {
        let mut live = self.inner.live.lock();
        if live.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *live = None;
        }
        log::info!("👋 [MOCK] connection #{} closed by client", self.id);
    }
}
