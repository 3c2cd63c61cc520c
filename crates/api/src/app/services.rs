//! Service wiring: job store, status bus, embedded workers and the realtime
//! fan-out feeding `/stream`.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use bandscore_ai::{EvaluationProvider, build_provider};
use bandscore_core::UserId;
use bandscore_events::{EventBus, InMemoryEventBus, StatusChanged};
use bandscore_infra::{
    PipelineConfig, SubmissionService,
    jobs::{InMemoryJobStore, JobStore, PostgresJobStore},
    workers::{WorkerConfig, WorkerPoolHandle, WorkerStats},
};
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, watch};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{info, warn};

const REALTIME_CAPACITY: usize = 256;
const FORWARD_POLL: Duration = Duration::from_millis(500);
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

/// Realtime message broadcast via SSE.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RealtimeMessage {
    pub user_id: UserId,
    pub topic: String,
    pub payload: StatusChanged,
}

impl From<StatusChanged> for RealtimeMessage {
    fn from(msg: StatusChanged) -> Self {
        Self {
            user_id: msg.user_id,
            topic: msg.topic(),
            payload: msg,
        }
    }
}

/// Everything the handlers share.
pub struct AppServices {
    submissions: SubmissionService,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
    bus: Arc<InMemoryEventBus<StatusChanged>>,
    workers: Mutex<Option<WorkerPoolHandle>>,
    // Dropping the sender stops the bus -> broadcast forwarder.
    _alive: watch::Sender<()>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices").finish_non_exhaustive()
    }
}

impl AppServices {
    /// Wire services over `store`. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let bus = Arc::new(InMemoryEventBus::<StatusChanged>::new());
        let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(REALTIME_CAPACITY);
        let (alive, alive_rx) = watch::channel(());

        // Background subscriber: bus -> realtime broadcast
        {
            let sub = bus.subscribe();
            let realtime_tx = realtime_tx.clone();
            tokio::task::spawn_blocking(move || {
                loop {
                    match sub.recv_timeout(FORWARD_POLL) {
                        Ok(msg) => {
                            // Lossy: no SSE client connected is fine.
                            let _ = realtime_tx.send(RealtimeMessage::from(msg));
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                            if alive_rx.has_changed().is_err() {
                                break;
                            }
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            });
        }

        let status_bus: Arc<dyn EventBus<StatusChanged>> = bus.clone();
        Self {
            submissions: SubmissionService::new(store, status_bus),
            realtime_tx,
            bus,
            workers: Mutex::new(None),
            _alive: alive,
        }
    }

    /// In-memory store, nothing else started.
    pub fn in_memory() -> Self {
        Self::new(InMemoryJobStore::arc())
    }

    /// Wire from configuration: Postgres when `DATABASE_URL` is set (workers
    /// run in `bandscore-worker`), otherwise an in-memory store with embedded
    /// workers.
    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        match &config.database_url {
            Some(url) => {
                let store = PostgresJobStore::connect(url.expose_secret(), POSTGRES_MAX_CONNECTIONS).await?;
                info!(store = "postgres", "job store configured");
                Ok(Self::new(Arc::new(store)))
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory job store with embedded workers");
                let services = Self::in_memory();
                let provider = build_provider(&config.provider)?;
                services.start_workers(config.worker_count, provider, config.worker.clone());
                Ok(services)
            }
        }
    }

    /// Run `count` evaluation workers in this process against the same store
    /// and bus. A second call is ignored.
    pub fn start_workers(&self, count: usize, provider: Arc<dyn EvaluationProvider>, config: WorkerConfig) {
        let Ok(mut workers) = self.workers.lock() else {
            warn!("worker handle lock poisoned; workers not started");
            return;
        };
        if workers.is_some() {
            warn!("embedded workers already running");
            return;
        }
        let bus: Arc<dyn EventBus<StatusChanged>> = self.bus.clone();
        *workers = Some(WorkerPoolHandle::spawn(
            count,
            self.submissions.store().clone(),
            provider,
            bus,
            config,
        ));
    }

    pub fn submissions(&self) -> &SubmissionService {
        &self.submissions
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        &self.realtime_tx
    }

    /// Statistics of embedded workers, if any run here.
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.workers.lock().ok()?.as_ref().map(WorkerPoolHandle::stats)
    }

    /// Stop embedded workers, letting in-flight jobs finish.
    pub async fn shutdown(&self) -> Option<WorkerStats> {
        let handle = self.workers.lock().ok()?.take()?;
        Some(handle.shutdown().await)
    }
}

/// SSE stream of one user's status changes.
pub fn user_sse_stream(
    services: Arc<AppServices>,
    user_id: UserId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(m) if m.user_id == user_id => {
            let data = serde_json::to_string(&m.payload).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.topic).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bandscore_core::{SubmissionId, SubmissionStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn bus_messages_reach_realtime_subscribers() {
        let services = AppServices::in_memory();
        let mut rx = services.realtime_tx().subscribe();

        let msg = StatusChanged {
            submission_id: SubmissionId::new(),
            user_id: UserId::new(),
            from: SubmissionStatus::Draft,
            to: SubmissionStatus::Pending,
            attempt: 0,
            at: Utc::now(),
        };
        services.bus.publish(msg.clone()).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.topic, "submission.pending");
        assert_eq!(got.user_id, msg.user_id);
        assert_eq!(got.payload, msg);
    }

    #[tokio::test]
    async fn shutdown_without_workers_is_a_no_op() {
        let services = AppServices::in_memory();
        assert!(services.worker_stats().is_none());
        assert!(services.shutdown().await.is_none());
    }
}
