//! Background scan execution: a bounded mpsc queue feeding one worker task,
//! with a shared status map polled via `GET /jobs/{id}`.

use crate::{
    models::{ApiError, ScanRequest, ScanResponse},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

type StatusMap = Arc<Mutex<HashMap<Uuid, JobState>>>;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<(Uuid, ScanRequest)>,
    statuses: StatusMap,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: ScanResponse },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity_from_env());
        let statuses: StatusMap = Arc::new(Mutex::new(HashMap::new()));
        let handle = tokio::spawn(worker(pipeline, rx, statuses.clone()));
        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_scan(&self, request: ScanRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.statuses.lock().await.insert(id, JobState::Queued);
        self.tx.send((id, request)).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.statuses.lock().await.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

async fn worker(
    pipeline: Pipeline,
    mut rx: mpsc::Receiver<(Uuid, ScanRequest)>,
    statuses: StatusMap,
) {
    while let Some((id, request)) = rx.recv().await {
        statuses.lock().await.insert(id, JobState::Running);
        let state = match pipeline.run(request).await {
            Ok(result) => JobState::Completed { result },
            Err(err) => JobState::Failed {
                error: err.user_message(),
                stage: Some(err.stage().to_string()),
            },
        };
        info!(target = "argus.api", job_id = %id, "scan job finished");
        statuses.lock().await.insert(id, state);
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(64)
}
