//! Index Worker — the background queue for rebuild / reindex / sleep
//! consolidation jobs.
//!
//! One long-lived task consumes a bounded FIFO queue. Enqueue reports exactly
//! one of `{queued, deduped, dropped}`: duplicates collapse into the queued
//! job with the same (task_type, memory_id), and a full queue drops with an
//! explicit count rather than blocking the write path. Cancellation is
//! cooperative — a running job moves to `cancelling` and the executor checks
//! the flag at stage boundaries (per memory, per chunk batch). Job records
//! are mirrored into the `index_jobs` table; the in-process table remains the
//! authoritative state machine.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use crate::errors::{PalaceError, Result};
use crate::remote::RemoteClient;
use crate::store::index::chunk_content;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RebuildIndex,
    ReindexMemory,
    SleepConsolidation,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RebuildIndex => "rebuild_index",
            Self::ReindexMemory => "reindex_memory",
            Self::SleepConsolidation => "sleep_consolidation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Succeeded,
    Failed,
    Dropped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Succeeded | Self::Failed | Self::Dropped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub task_type: TaskType,
    pub memory_id: Option<i64>,
    pub reason: String,
    pub state: JobState,
    pub requested_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub degrade_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip)]
    cancel_requested: bool,
}

/// Enqueue outcome: exactly one of queued / deduped / dropped is true.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: String,
    pub queued: bool,
    pub deduped: bool,
    pub dropped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_job_id: Option<String>,
    pub cancelling_jobs: usize,
    pub pending_memory_jobs: usize,
    pub rebuild_pending: bool,
    pub sleep_pending: bool,
    pub stats: WorkerStats,
    pub last_error: Option<String>,
    pub last_finished_at: Option<String>,
    pub recent_jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    pub cancelled: u64,
}

struct JobTable {
    jobs: HashMap<String, JobRecord>,
    pending_memory: HashMap<i64, String>,
    rebuild_pending: Option<String>,
    sleep_pending: Option<String>,
    recent: VecDeque<String>,
    active_job: Option<String>,
    last_error: Option<String>,
    last_finished_at: Option<String>,
    stats: WorkerStats,
}

impl JobTable {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            pending_memory: HashMap::new(),
            rebuild_pending: None,
            sleep_pending: None,
            recent: VecDeque::new(),
            active_job: None,
            last_error: None,
            last_finished_at: None,
            stats: WorkerStats::default(),
        }
    }

    fn touch_recent(&mut self, job_id: &str, ring: usize) {
        self.recent.retain(|id| id != job_id);
        self.recent.push_front(job_id.to_string());
        while self.recent.len() > ring {
            if let Some(stale) = self.recent.pop_back() {
                if self
                    .jobs
                    .get(&stale)
                    .map(|j| j.state.is_terminal())
                    .unwrap_or(true)
                {
                    self.jobs.remove(&stale);
                }
            }
        }
    }

    fn release_dedup_slot(&mut self, job: &JobRecord) {
        match job.task_type {
            TaskType::ReindexMemory => {
                if let Some(memory_id) = job.memory_id {
                    if self.pending_memory.get(&memory_id) == Some(&job.job_id) {
                        self.pending_memory.remove(&memory_id);
                    }
                }
            }
            TaskType::RebuildIndex => {
                if self.rebuild_pending.as_deref() == Some(&job.job_id) {
                    self.rebuild_pending = None;
                }
            }
            TaskType::SleepConsolidation => {
                if self.sleep_pending.as_deref() == Some(&job.job_id) {
                    self.sleep_pending = None;
                }
            }
        }
    }
}

pub struct IndexWorker {
    store: Arc<Store>,
    remote: Arc<RemoteClient>,
    table: Mutex<JobTable>,
    tx: mpsc::Sender<String>,
    notify: Mutex<HashMap<String, Arc<Notify>>>,
    queue_capacity: usize,
    recent_ring: usize,
    runner: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IndexWorker {
    /// Create the worker and start its background loop.
    pub fn spawn(store: Arc<Store>, remote: Arc<RemoteClient>) -> Arc<Self> {
        let queue_capacity = store.config.index.queue_capacity.max(8);
        let recent_ring = store.config.index.recent_jobs_ring.max(5);
        let (tx, rx) = mpsc::channel(queue_capacity);

        let worker = Arc::new(Self {
            store,
            remote,
            table: Mutex::new(JobTable::new()),
            tx,
            notify: Mutex::new(HashMap::new()),
            queue_capacity,
            recent_ring,
            runner: Mutex::new(None),
        });

        let loop_worker = Arc::clone(&worker);
        let handle = tokio::spawn(async move {
            loop_worker.run_loop(rx).await;
        });
        *worker.runner.lock().expect("runner lock") = Some(handle);
        worker
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.runner.lock().expect("runner lock").take() {
            handle.abort();
        }
    }

    fn notify_handle(&self, job_id: &str) -> Arc<Notify> {
        let mut notify = self.notify.lock().expect("notify lock");
        Arc::clone(notify.entry(job_id.to_string()).or_default())
    }

    // ── Enqueue ──────────────────────────────────────────────────────────────

    pub fn enqueue_reindex_memory(&self, memory_id: i64, reason: &str) -> Result<EnqueueOutcome> {
        if memory_id <= 0 {
            return Err(PalaceError::InvalidArgument(
                "memory_id must be a positive integer".into(),
            ));
        }
        self.enqueue(TaskType::ReindexMemory, Some(memory_id), reason)
    }

    pub fn enqueue_rebuild(&self, reason: &str) -> Result<EnqueueOutcome> {
        self.enqueue(TaskType::RebuildIndex, None, reason)
    }

    pub fn enqueue_sleep_consolidation(&self, reason: &str) -> Result<EnqueueOutcome> {
        self.enqueue(TaskType::SleepConsolidation, None, reason)
    }

    fn enqueue(
        &self,
        task_type: TaskType,
        memory_id: Option<i64>,
        reason: &str,
    ) -> Result<EnqueueOutcome> {
        let mut guard = self.table.lock().expect("job table lock");
        let table = &mut *guard;

        // Dedup against a queued job with the same (task_type, memory_id).
        let existing = match task_type {
            TaskType::ReindexMemory => memory_id.and_then(|id| table.pending_memory.get(&id)),
            TaskType::RebuildIndex => table.rebuild_pending.as_ref(),
            TaskType::SleepConsolidation => table.sleep_pending.as_ref(),
        };
        if let Some(existing_id) = existing {
            return Ok(EnqueueOutcome {
                job_id: existing_id.clone(),
                queued: false,
                deduped: true,
                dropped: false,
                reason: None,
            });
        }

        let job_id = format!("idx-{}", &uuid::Uuid::new_v4().simple().to_string()[..10]);
        let mut job = JobRecord {
            job_id: job_id.clone(),
            task_type,
            memory_id,
            reason: reason.to_string(),
            state: JobState::Queued,
            requested_at: Store::now_iso(),
            started_at: None,
            finished_at: None,
            error: None,
            degrade_reasons: Vec::new(),
            result: None,
            cancel_requested: false,
        };

        match self.tx.try_send(job_id.clone()) {
            Ok(()) => {
                match task_type {
                    TaskType::ReindexMemory => {
                        if let Some(id) = memory_id {
                            table.pending_memory.insert(id, job_id.clone());
                        }
                    }
                    TaskType::RebuildIndex => table.rebuild_pending = Some(job_id.clone()),
                    TaskType::SleepConsolidation => table.sleep_pending = Some(job_id.clone()),
                }
                table.stats.enqueued += 1;
                table.jobs.insert(job_id.clone(), job.clone());
                drop(guard);
                self.mirror_job(&job);
                Ok(EnqueueOutcome {
                    job_id,
                    queued: true,
                    deduped: false,
                    dropped: false,
                    reason: None,
                })
            }
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                job.state = JobState::Dropped;
                job.error = Some("queue_full".into());
                job.finished_at = Some(Store::now_iso());
                table.stats.dropped += 1;
                table.jobs.insert(job_id.clone(), job.clone());
                table.touch_recent(&job_id, self.recent_ring);
                table.last_finished_at = job.finished_at.clone();
                drop(guard);
                self.mirror_job(&job);
                Ok(EnqueueOutcome {
                    job_id,
                    queued: false,
                    deduped: false,
                    dropped: true,
                    reason: Some("queue_full".into()),
                })
            }
        }
    }

    // ── Inspection / control ─────────────────────────────────────────────────

    pub fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        let table = self.table.lock().expect("job table lock");
        table
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| PalaceError::JobNotFound(job_id.to_string()))
    }

    /// Cancel a job. Queued jobs finalize immediately; running jobs move to
    /// `cancelling` and the executor completes the transition at the next
    /// stage boundary.
    pub fn cancel_job(&self, job_id: &str, reason: &str) -> Result<JobRecord> {
        let mut guard = self.table.lock().expect("job table lock");
        let table = &mut *guard;
        let job = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PalaceError::JobNotFound(job_id.to_string()))?;

        match job.state {
            state if state.is_terminal() => Err(PalaceError::JobAlreadyFinalized(job_id.into())),
            JobState::Queued => {
                job.state = JobState::Cancelled;
                job.error = Some(reason.to_string());
                job.finished_at = Some(Store::now_iso());
                let snapshot = job.clone();
                table.stats.cancelled += 1;
                table.release_dedup_slot(&snapshot);
                table.touch_recent(job_id, self.recent_ring);
                table.last_finished_at = snapshot.finished_at.clone();
                drop(guard);
                self.mirror_job(&snapshot);
                self.notify_handle(&snapshot.job_id).notify_waiters();
                Ok(snapshot)
            }
            JobState::Running | JobState::Cancelling => {
                job.state = JobState::Cancelling;
                job.cancel_requested = true;
                if job.error.is_none() {
                    job.error = Some(reason.to_string());
                }
                let snapshot = job.clone();
                drop(guard);
                self.mirror_job(&snapshot);
                Ok(snapshot)
            }
            _ => unreachable!("non-terminal states are covered above"),
        }
    }

    /// Enqueue a new job with a finished job's parameters. Only terminal
    /// failed / dropped / cancelled jobs are retryable.
    pub fn retry_job(&self, job_id: &str, reason: &str) -> Result<EnqueueOutcome> {
        let original = self.get_job(job_id)?;
        if !matches!(
            original.state,
            JobState::Failed | JobState::Dropped | JobState::Cancelled
        ) {
            return Err(PalaceError::InvalidArgument(format!(
                "job '{job_id}' is {}; only failed/dropped/cancelled jobs can be retried",
                original.state.as_str()
            )));
        }
        let retry_reason = if reason.trim().is_empty() {
            format!("retry:{job_id}")
        } else {
            reason.trim().to_string()
        };
        self.enqueue(original.task_type, original.memory_id, &retry_reason)
    }

    /// Block until the job reaches a terminal state or the timeout expires.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        timeout: std::time::Duration,
    ) -> Result<(JobRecord, bool)> {
        let notify = self.notify_handle(job_id);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let job = self.get_job(job_id)?;
        if job.state.is_terminal() {
            return Ok((job, false));
        }

        let timed_out = tokio::time::timeout(timeout, notified).await.is_err();
        let job = self.get_job(job_id)?;
        let still_running = timed_out && !job.state.is_terminal();
        Ok((job, still_running))
    }

    pub fn status(&self) -> WorkerStatus {
        let table = self.table.lock().expect("job table lock");
        let recent_jobs: Vec<JobRecord> = table
            .recent
            .iter()
            .filter_map(|id| table.jobs.get(id).cloned())
            .collect();
        let cancelling = table
            .jobs
            .values()
            .filter(|j| j.state == JobState::Cancelling)
            .count();
        WorkerStatus {
            running: self
                .runner
                .lock()
                .expect("runner lock")
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false),
            queue_depth: self.queue_capacity.saturating_sub(self.tx.capacity()),
            queue_capacity: self.queue_capacity,
            active_job_id: table.active_job.clone(),
            cancelling_jobs: cancelling,
            pending_memory_jobs: table.pending_memory.len(),
            rebuild_pending: table.rebuild_pending.is_some(),
            sleep_pending: table.sleep_pending.is_some(),
            stats: table.stats.clone(),
            last_error: table.last_error.clone(),
            last_finished_at: table.last_finished_at.clone(),
            recent_jobs,
        }
    }

    // ── Execution ────────────────────────────────────────────────────────────

    async fn run_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(job_id) = rx.recv().await {
            // A queued job cancelled before dequeue is already finalized.
            let start = {
                let mut guard = self.table.lock().expect("job table lock");
                let table = &mut *guard;
                match table.jobs.get_mut(&job_id) {
                    Some(job) if job.state == JobState::Queued => {
                        job.state = JobState::Running;
                        job.started_at = Some(Store::now_iso());
                        let snapshot = job.clone();
                        table.active_job = Some(job_id.clone());
                        Some(snapshot)
                    }
                    _ => None,
                }
            };
            let Some(job) = start else { continue };
            self.mirror_job(&job);

            let outcome = self.execute(&job).await;
            self.finalize(&job_id, outcome);
        }
    }

    fn is_cancel_requested(&self, job_id: &str) -> bool {
        let table = self.table.lock().expect("job table lock");
        table
            .jobs
            .get(job_id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false)
    }

    async fn execute(&self, job: &JobRecord) -> Result<Value> {
        match job.task_type {
            TaskType::ReindexMemory => {
                let memory_id = job.memory_id.ok_or_else(|| {
                    PalaceError::InvalidArgument("reindex job missing memory_id".into())
                })?;
                let mut degrade_reasons = Vec::new();
                let outcome = self
                    .reindex_one(memory_id, &job.job_id, &mut degrade_reasons)
                    .await?;
                Ok(json!({
                    "memory_id": memory_id,
                    "indexed_chunks": outcome,
                    "degrade_reasons": degrade_reasons,
                }))
            }
            TaskType::RebuildIndex => self.rebuild_all(&job.job_id).await,
            TaskType::SleepConsolidation => self.sleep_consolidation(&job.job_id).await,
        }
    }

    /// Embed the memory's chunks (remote with hash fallback) and refresh its
    /// index rows. Cancellation is honored between chunk embeds.
    async fn reindex_one(
        &self,
        memory_id: i64,
        job_id: &str,
        degrade_reasons: &mut Vec<String>,
    ) -> Result<usize> {
        let Some(memory) = self.store.get_memory_by_id(memory_id)? else {
            // Missing memories index to zero rows (idempotent cleanup).
            let outcome = self.store.reindex_memory(memory_id, None)?;
            return Ok(outcome.indexed_chunks);
        };
        if memory.deprecated || !self.remote.embedding_enabled() {
            let outcome = self.store.reindex_memory(memory_id, None)?;
            return Ok(outcome.indexed_chunks);
        }

        let chunks = chunk_content(
            &memory.content,
            self.store.config.retrieval.chunk_size,
            self.store.config.retrieval.chunk_overlap,
        );
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if self.is_cancel_requested(job_id) {
                return Err(PalaceError::InvalidArgument("job_cancelled".into()));
            }
            match self.remote.embed(&chunk.text, degrade_reasons).await {
                Some(vector) => vectors.push(vector),
                None => {
                    let outcome = self.store.reindex_memory(memory_id, None)?;
                    return Ok(outcome.indexed_chunks);
                }
            }
        }
        let outcome = self.store.reindex_memory(memory_id, Some(&vectors))?;
        Ok(outcome.indexed_chunks)
    }

    async fn rebuild_all(&self, job_id: &str) -> Result<Value> {
        let targets = self.store.rebuild_targets()?;
        let mut total_chunks = 0usize;
        let mut failures: Vec<Value> = Vec::new();
        let mut degrade_reasons = Vec::new();

        for memory_id in &targets {
            // Stage boundary: cancellation checked per candidate.
            if self.is_cancel_requested(job_id) {
                return Err(PalaceError::InvalidArgument("job_cancelled".into()));
            }
            match self.reindex_one(*memory_id, job_id, &mut degrade_reasons).await {
                Ok(chunks) => total_chunks += chunks,
                Err(e) if e.to_string().contains("job_cancelled") => return Err(e),
                Err(e) => failures.push(json!({"memory_id": memory_id, "error": e.to_string()})),
            }
        }

        self.store
            .set_runtime_meta("index.last_rebuild_at", &Store::now_iso())?;
        self.store
            .set_runtime_meta("index.last_rebuild_memories", &targets.len().to_string())?;

        Ok(json!({
            "requested_memories": targets.len(),
            "indexed_chunks": total_chunks,
            "failure_count": failures.len(),
            "failures": failures,
            "degrade_reasons": degrade_reasons,
        }))
    }

    /// Scan for duplicate and fragmented memories; produce previews, and
    /// apply only under the corresponding apply-flags.
    async fn sleep_consolidation(&self, job_id: &str) -> Result<Value> {
        let config = &self.store.config;
        let dedup_apply = config.sleep.dedup_apply;
        let rollup_apply = config.sleep.rollup_apply;
        let mut degrade_reasons: Vec<String> = Vec::new();

        // Duplicate orphans, grouped by normalized content.
        let orphans = self.store.list_orphans()?;
        let mut groups: HashMap<String, Vec<(i64, bool, String)>> = HashMap::new();
        for orphan in &orphans {
            if self.is_cancel_requested(job_id) {
                return Err(PalaceError::InvalidArgument("job_cancelled".into()));
            }
            let Some(memory) = self.store.get_memory_by_id(orphan.memory_id)? else {
                continue;
            };
            let normalized = memory
                .content
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            groups
                .entry(crate::store::content_hash(&normalized))
                .or_default()
                .push((memory.id, memory.deprecated, memory.created_at.clone()));
        }

        let mut dedup_preview: Vec<Value> = Vec::new();
        let mut deleted_duplicates = 0usize;
        let mut group_keys: Vec<&String> = groups.keys().collect();
        group_keys.sort();
        for key in group_keys {
            let mut members = groups[key].clone();
            if members.len() < 2 {
                continue;
            }
            // Keep the live (non-deprecated) or newest copy; drop the rest.
            members.sort_by(|a, b| {
                (a.1 as u8)
                    .cmp(&(b.1 as u8))
                    .then_with(|| b.2.cmp(&a.2))
                    .then_with(|| a.0.cmp(&b.0))
            });
            let keep = members[0].0;
            let duplicates: Vec<i64> = members[1..].iter().map(|m| m.0).collect();
            dedup_preview.push(json!({"keep": keep, "duplicates": duplicates}));

            if dedup_apply {
                for duplicate in &duplicates {
                    match self.store.permanently_delete_memory(*duplicate, true, None) {
                        Ok(()) => deleted_duplicates += 1,
                        Err(e) => {
                            crate::remote::push_degrade(
                                &mut degrade_reasons,
                                "sleep_dedup_partial_failure",
                            );
                            tracing::warn!(memory_id = duplicate, error = %e, "sleep dedup delete failed");
                        }
                    }
                }
            }
        }

        // Fragment rollup: siblings under one parent whose combined length
        // stays below the rollup budget.
        let recent = self.store.get_recent(120)?;
        let mut siblings: HashMap<(String, String), Vec<(i64, String)>> = HashMap::new();
        for item in &recent {
            let parent = match item.path.rsplit_once('/') {
                Some((parent, _)) => parent.to_string(),
                None => continue,
            };
            siblings
                .entry((item.domain.clone(), parent))
                .or_default()
                .push((item.memory.id, item.memory.content.clone()));
        }

        let mut rollup_preview: Vec<Value> = Vec::new();
        let mut rollups_applied = 0usize;
        let mut sibling_keys: Vec<(String, String)> = siblings.keys().cloned().collect();
        sibling_keys.sort();
        for key in sibling_keys {
            if self.is_cancel_requested(job_id) {
                return Err(PalaceError::InvalidArgument("job_cancelled".into()));
            }
            let members = &siblings[&key];
            if members.len() < 3 {
                continue;
            }
            let combined_len: usize = members.iter().map(|(_, c)| c.len()).sum();
            if combined_len >= config.sleep.rollup_max_chars {
                continue;
            }
            let (domain, parent) = &key;
            rollup_preview.push(json!({
                "parent": format!("{domain}://{parent}"),
                "members": members.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "combined_chars": combined_len,
            }));

            if rollup_apply {
                let concatenated: String = members
                    .iter()
                    .map(|(_, content)| crate::store::memory::snippet(content, 180))
                    .collect::<Vec<_>>()
                    .join("\n- ");
                let rollup_body = format!(
                    "Consolidated fragments under {domain}://{parent}:\n- {concatenated}"
                );
                match self.store.create_memory(
                    domain,
                    parent,
                    &rollup_body,
                    config.session.flush_priority,
                    None,
                    Some("Sleep consolidation rollup"),
                    true,
                ) {
                    Ok(created) => {
                        let source_hash = crate::store::content_hash(&rollup_body);
                        self.store.upsert_memory_gist(
                            created.id,
                            &crate::store::memory::snippet(&rollup_body, 280),
                            &source_hash,
                            "sleep_fragment_rollup",
                            0.55,
                        )?;
                        rollups_applied += 1;
                    }
                    Err(e) => {
                        crate::remote::push_degrade(
                            &mut degrade_reasons,
                            "sleep_rollup_partial_failure",
                        );
                        tracing::warn!(error = %e, "sleep rollup write failed");
                    }
                }
            }
        }

        let cleanup_candidates = self.store.cleanup_candidates(None, None, 50, None)?;

        Ok(json!({
            "task": "sleep_consolidation",
            "policy": {
                "dedup_apply": dedup_apply,
                "rollup_apply": rollup_apply,
            },
            "orphans_scanned": orphans.len(),
            "dedup": {
                "duplicate_groups": dedup_preview.len(),
                "preview": dedup_preview,
                "deleted_duplicates": deleted_duplicates,
                "preview_only": !dedup_apply,
            },
            "rollup": {
                "groups": rollup_preview.len(),
                "preview": rollup_preview,
                "applied": rollups_applied,
                "preview_only": !rollup_apply,
            },
            "cleanup_preview_count": cleanup_candidates.len(),
            "degrade_reasons": degrade_reasons,
        }))
    }

    fn finalize(&self, job_id: &str, outcome: Result<Value>) {
        let snapshot = {
            let mut guard = self.table.lock().expect("job table lock");
            let table = &mut *guard;
            let Some(job) = table.jobs.get_mut(job_id) else {
                return;
            };
            let was_cancelling = job.state == JobState::Cancelling || job.cancel_requested;
            match outcome {
                Ok(result) => {
                    if let Some(reasons) = result.get("degrade_reasons").and_then(Value::as_array) {
                        job.degrade_reasons = reasons
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect();
                    }
                    job.state = JobState::Succeeded;
                    job.result = Some(result);
                }
                Err(e) if was_cancelling || e.to_string().contains("job_cancelled") => {
                    job.state = JobState::Cancelled;
                    job.error = Some("job_cancelled".into());
                }
                Err(e) => {
                    job.state = JobState::Failed;
                    job.error = Some(e.to_string());
                }
            }
            job.finished_at = Some(Store::now_iso());
            let snapshot = job.clone();

            match snapshot.state {
                JobState::Succeeded => table.stats.succeeded += 1,
                JobState::Failed => {
                    table.stats.failed += 1;
                    table.last_error = snapshot.error.clone();
                }
                JobState::Cancelled => table.stats.cancelled += 1,
                _ => {}
            }
            table.release_dedup_slot(&snapshot);
            if table.active_job.as_deref() == Some(job_id) {
                table.active_job = None;
            }
            table.last_finished_at = snapshot.finished_at.clone();
            table.touch_recent(job_id, self.recent_ring);
            snapshot
        };

        self.mirror_job(&snapshot);
        self.notify_handle(job_id).notify_waiters();
    }

    /// Mirror a job record into the `index_jobs` table. Mirroring failures
    /// are logged, never propagated — observability must not block indexing.
    fn mirror_job(&self, job: &JobRecord) {
        let result = {
            let conn = self.store.conn();
            conn.execute(
                "INSERT INTO index_jobs \
                 (job_id, task_type, memory_id, reason, state, requested_at, started_at, \
                  finished_at, error, degrade_reasons) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(job_id) DO UPDATE SET \
                 state = excluded.state, started_at = excluded.started_at, \
                 finished_at = excluded.finished_at, error = excluded.error, \
                 degrade_reasons = excluded.degrade_reasons",
                rusqlite::params![
                    job.job_id,
                    job.task_type.as_str(),
                    job.memory_id,
                    job.reason,
                    job.state.as_str(),
                    job.requested_at,
                    job.started_at,
                    job.finished_at,
                    job.error,
                    serde_json::to_string(&job.degrade_reasons).unwrap_or_default(),
                ],
            )
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %job.job_id, error = %e, "index job mirror failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PalaceConfig;
    use std::time::Duration;

    fn test_worker(queue_capacity: usize) -> (Arc<Store>, Arc<IndexWorker>) {
        let mut config = PalaceConfig::default();
        config.index.queue_capacity = queue_capacity;
        let config = Arc::new(config);
        let conn = crate::db::open_memory_database(config.embedding.dim).unwrap();
        let store = Arc::new(Store::new(conn, Arc::clone(&config)));
        let remote = Arc::new(RemoteClient::new(config));
        let worker = IndexWorker::spawn(Arc::clone(&store), remote);
        (store, worker)
    }

    #[tokio::test]
    async fn reindex_job_succeeds_and_indexes() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "content to index later", 0, Some("doc"), None, false)
            .unwrap();

        let outcome = worker.enqueue_reindex_memory(created.id, "test").unwrap();
        assert!(outcome.queued);

        let (job, timed_out) = worker
            .wait_for_job(&outcome.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!timed_out);
        assert_eq!(job.state, JobState::Succeeded);
        assert!(store.indexed_chunk_count(created.id).unwrap() > 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_dedupes_while_queued() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "dedupe target", 0, Some("doc"), None, false)
            .unwrap();

        // Stall the worker with a rebuild so the reindex stays queued.
        let hold = worker.enqueue_rebuild("hold").unwrap();
        let first = worker.enqueue_reindex_memory(created.id, "one").unwrap();
        let second = worker.enqueue_reindex_memory(created.id, "two").unwrap();

        assert!(first.queued);
        assert!(second.deduped);
        assert_eq!(second.job_id, first.job_id);

        worker
            .wait_for_job(&first.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        let _ = hold;

        // Once the job finishes, a new enqueue is a fresh job.
        let third = worker.enqueue_reindex_memory(created.id, "three").unwrap();
        assert!(third.queued);
        assert_ne!(third.job_id, first.job_id);
    }

    #[tokio::test]
    async fn full_queue_drops_with_reason() {
        let (store, worker) = test_worker(8);
        // Hold the loop on a slow-ish job, then saturate the queue.
        let mut ids = Vec::new();
        for i in 0..40 {
            let created = store
                .create_memory("core", "", &format!("body {i}"), 0, Some(&format!("m{i}")), None, false)
                .unwrap();
            ids.push(created.id);
        }

        let mut dropped = 0;
        let mut queued = 0;
        for id in &ids {
            let outcome = worker.enqueue_reindex_memory(*id, "flood").unwrap();
            if outcome.dropped {
                dropped += 1;
                assert_eq!(outcome.reason.as_deref(), Some("queue_full"));
                assert_eq!(
                    worker.get_job(&outcome.job_id).unwrap().state,
                    JobState::Dropped
                );
            } else if outcome.queued {
                queued += 1;
            }
        }
        assert!(queued > 0);
        assert!(dropped > 0, "flooding a capacity-8 queue must drop");
        assert_eq!(worker.status().stats.dropped, dropped as u64);
    }

    #[tokio::test]
    async fn cancel_queued_job_finalizes_directly() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "cancel me", 0, Some("doc"), None, false)
            .unwrap();

        let hold = worker.enqueue_rebuild("hold").unwrap();
        let target = worker.enqueue_reindex_memory(created.id, "target").unwrap();
        assert!(target.queued);

        let cancelled = worker.cancel_job(&target.job_id, "manual_cancel").unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        // Terminal states are stable: a second cancel is rejected.
        let err = worker.cancel_job(&target.job_id, "again").unwrap_err();
        assert_eq!(err.kind(), "job_already_finalized");

        worker
            .wait_for_job(&hold.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        // The cancelled job never ran.
        assert_eq!(store.indexed_chunk_count(created.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_rebuilds_from_terminal_job() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "retry target", 0, Some("doc"), None, false)
            .unwrap();

        let hold = worker.enqueue_rebuild("hold").unwrap();
        let target = worker.enqueue_reindex_memory(created.id, "target").unwrap();
        worker.cancel_job(&target.job_id, "cancel").unwrap();
        worker
            .wait_for_job(&hold.job_id, Duration::from_secs(5))
            .await
            .unwrap();

        let retried = worker.retry_job(&target.job_id, "").unwrap();
        assert!(retried.queued);
        assert_ne!(retried.job_id, target.job_id);
        assert!(worker
            .get_job(&retried.job_id)
            .unwrap()
            .reason
            .starts_with("retry:"));

        let (job, _) = worker
            .wait_for_job(&retried.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);

        // A queued or succeeded job is not retryable.
        let err = worker.retry_job(&retried.job_id, "").unwrap_err();
        assert!(err.to_string().contains("can be retried"));
    }

    #[tokio::test]
    async fn rebuild_covers_all_live_memories() {
        let (store, worker) = test_worker(16);
        for i in 0..3 {
            store
                .create_memory("core", "", &format!("rebuild body {i}"), 0, Some(&format!("r{i}")), None, false)
                .unwrap();
        }

        let outcome = worker.enqueue_rebuild("test").unwrap();
        let (job, _) = worker
            .wait_for_job(&outcome.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        let result = job.result.unwrap();
        assert_eq!(result["requested_memories"], 3);
        assert_eq!(result["failure_count"], 0);
    }

    #[tokio::test]
    async fn sleep_consolidation_previews_without_apply() {
        let (store, worker) = test_worker(16);
        // Two identical orphans via update (old versions share content).
        store
            .create_memory("core", "", "duplicate body", 0, Some("a"), None, false)
            .unwrap();
        store
            .update_memory("core", "a", Some("changed a"), None, None, false)
            .unwrap();
        store
            .create_memory("core", "", "duplicate body", 0, Some("b"), None, false)
            .unwrap();
        store
            .update_memory("core", "b", Some("changed b"), None, None, false)
            .unwrap();

        let outcome = worker.enqueue_sleep_consolidation("test").unwrap();
        let (job, _) = worker
            .wait_for_job(&outcome.job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        let result = job.result.unwrap();
        assert_eq!(result["dedup"]["preview_only"], true);
        assert_eq!(result["dedup"]["duplicate_groups"], 1);
        assert_eq!(result["dedup"]["deleted_duplicates"], 0);

        // Preview only: both orphans still exist.
        assert_eq!(store.list_orphans().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_reports_ring_and_stats() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "status body", 0, Some("doc"), None, false)
            .unwrap();
        let outcome = worker.enqueue_reindex_memory(created.id, "status").unwrap();
        worker
            .wait_for_job(&outcome.job_id, Duration::from_secs(5))
            .await
            .unwrap();

        let status = worker.status();
        assert!(status.running);
        assert_eq!(status.stats.enqueued, 1);
        assert_eq!(status.stats.succeeded, 1);
        assert!(status
            .recent_jobs
            .iter()
            .any(|j| j.job_id == outcome.job_id));
        assert!(status.active_job_id.is_none());
    }

    #[tokio::test]
    async fn jobs_are_mirrored_to_table() {
        let (store, worker) = test_worker(16);
        let created = store
            .create_memory("core", "", "mirror body", 0, Some("doc"), None, false)
            .unwrap();
        let outcome = worker.enqueue_reindex_memory(created.id, "mirror").unwrap();
        worker
            .wait_for_job(&outcome.job_id, Duration::from_secs(5))
            .await
            .unwrap();

        let state: String = store
            .conn()
            .query_row(
                "SELECT state FROM index_jobs WHERE job_id = ?1",
                rusqlite::params![outcome.job_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(state, "succeeded");
    }

    #[tokio::test]
    async fn wait_for_unknown_job_errors() {
        let (_store, worker) = test_worker(16);
        let err = worker
            .wait_for_job("idx-missing", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "job_not_found");
    }
}
