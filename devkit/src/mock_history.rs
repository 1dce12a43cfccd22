/*!
Mock de la source historique

Répond aux requêtes `HistorySource` à partir d'un script, enregistre chaque
requête reçue et peut retenir les réponses (`pause` / `resume`) pour tester
les courses entre requêtes en vol et changements de requête.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use symbion_fleet_sync::history::{FetchError, HistoryQuery, HistorySource};
use symbion_fleet_sync::models::Sample;
use tokio::sync::{oneshot, watch};

enum Reply {
    Ready(Result<Vec<Sample>, FetchError>),
    Deferred(oneshot::Receiver<Result<Vec<Sample>, FetchError>>),
}

/// Answer for one deferred request, given whenever the test decides.
pub struct DeferredReply {
    sender: oneshot::Sender<Result<Vec<Sample>, FetchError>>,
}

impl DeferredReply {
    pub fn resolve(self, samples: Vec<Sample>) {
        let _ = self.sender.send(Ok(samples));
    }

    pub fn fail(self, error: FetchError) {
        let _ = self.sender.send(Err(error));
    }
}

pub struct MockHistory {
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Vec<Sample>>,
    calls: Mutex<Vec<HistoryQuery>>,
    paused: watch::Sender<bool>,
    in_flight: AtomicUsize,
}

impl MockHistory {
    /// Answers every request with an empty list until scripted.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            paused,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn respond_with(&self, samples: Vec<Sample>) -> &Self {
        self.script.lock().push_back(Reply::Ready(Ok(samples)));
        self
    }

    pub fn fail_with(&self, error: FetchError) -> &Self {
        self.script.lock().push_back(Reply::Ready(Err(error)));
        self
    }

    /// The next request waits until the returned reply is resolved.
    pub fn defer(&self) -> DeferredReply {
        let (sender, receiver) = oneshot::channel();
        self.script.lock().push_back(Reply::Deferred(receiver));
        DeferredReply { sender }
    }

    /// Answer used once the script is exhausted.
    pub fn set_fallback(&self, samples: Vec<Sample>) {
        *self.fallback.lock() = samples;
    }

    /// Holds every request (already started or not) until `resume`.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn calls(&self) -> Vec<HistoryQuery> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Requests received but not answered yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySource for MockHistory {
    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<Sample>, FetchError> {
        self.calls.lock().push(query.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        log::debug!("📚 [MOCK] history request for {} #{}", query.source, query.family);

        let reply = self.script.lock().pop_front();
        let result = match reply {
            Some(Reply::Ready(result)) => result,
            Some(Reply::Deferred(receiver)) => receiver
                .await
                .unwrap_or_else(|_| Err(FetchError::Http("deferred reply dropped".into()))),
            None => {
                let fallback = self.fallback.lock().clone();
                Ok(fallback)
            }
        };

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
