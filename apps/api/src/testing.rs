//! In-memory fakes and a harness for pipeline tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::time::Instant;
use uuid::Uuid;

use crate::analysis::analyzer::{AnalyzerError, CvAnalyzer, OptimizationContext};
use crate::analysis::extractor::DocumentExtractor;
use crate::config::PipelineTimeouts;
use crate::models::analysis::{
    AnalysisResult, AnalysisRow, AnalysisStatus, ExtractedData, Improvement, NewAnalysis,
};
use crate::models::user::{PlanTier, User};
use crate::pipeline::{Dispatcher, ProcessingRoutine, QuotaTracker};
use crate::queue::{
    AnalysisJob, BrokerMonitor, BrokerProbe, Delivery, EnqueueError, FailOutcome, JobHandle,
    JobQueue, QueueError, RetryPolicy, WorkerPool, WorkerPoolConfig,
};
use crate::state::AppState;
use crate::storage::{ArtifactStore, RemoteStorage, StorageError};
use crate::store::{AnalysisStore, UserStore};

pub const SAMPLE_CV: &str = "\
Jane Doe - Senior Backend Engineer
jane.doe@example.com | +44 20 7946 0958 | London, United Kingdom

Summary
Backend engineer with eight years of experience designing and operating distributed
systems for payments and logistics companies. Comfortable owning services end to end,
from schema design and API contracts through deployment, observability and on-call.
Known for pragmatic architecture decisions, careful code review and mentoring.

Experience
Lead Engineer, Northwind Logistics, 2020 to present. Led a team of five engineers
rebuilding the shipment tracking platform. Replaced a nightly batch pipeline with an
event-driven design on Kafka and PostgreSQL, cutting tracking latency from hours to
seconds. Introduced structured logging and tracing across twelve services and reduced
mean time to recovery by forty percent. Ran the hiring loop for backend roles.

Software Engineer, Contoso Payments, 2016 to 2020. Built the settlement reconciliation
service handling two million transactions a day. Designed idempotent retry handling for
card network callbacks and eliminated duplicate settlements. Migrated the ledger from a
monolith to a dedicated service with zero downtime using dual writes and backfills.

Junior Developer, Fabrikam Retail, 2014 to 2016. Maintained the order management system,
wrote integration tests for the warehouse API and automated release tooling.

Skills
Rust, Go, Python, PostgreSQL, Redis, Kafka, Docker, Kubernetes, Terraform, AWS, gRPC,
REST API design, distributed systems, observability, incident response, mentoring.

Education
MSc Computer Science, University of Edinburgh, 2014.
BSc Mathematics, University of Leeds, 2013.

Projects
Maintainer of an open-source rate limiting library used by several fintech startups.
Speaker at two regional meetups on designing reliable background job systems.

Languages
English (native), Spanish (professional working proficiency).
";

// ────────────────────────────────────────────────────────────────────────────
// Record store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAnalysisStore {
    rows: Mutex<HashMap<Uuid, AnalysisRow>>,
    vanish_on_complete: Mutex<HashSet<Uuid>>,
}

impl MemoryAnalysisStore {
    pub fn find(&self, id: Uuid) -> Option<AnalysisRow> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn record(&self, id: Uuid) -> AnalysisRow {
        self.find(id).expect("analysis record should exist")
    }

    pub fn remove(&self, id: Uuid) {
        self.rows.lock().unwrap().remove(&id);
    }

    /// Simulates the owner deleting the record while it is being analysed.
    pub fn remove_on_complete(&self, id: Uuid) {
        self.vanish_on_complete.lock().unwrap().insert(id);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn insert(&self, row: AnalysisRow) {
        self.rows.lock().unwrap().insert(row.id, row);
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn create(&self, new: NewAnalysis) -> Result<AnalysisRow> {
        let row = AnalysisRow::processing(new, Utc::now());
        self.insert(row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(self.find(id))
    }

    async fn get_owned(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(self.find(id).filter(|row| row.user_id == user_id))
    }

    async fn list_completed(&self, user_id: Uuid, limit: i64) -> Result<Vec<AnalysisRow>> {
        let mut rows: Vec<AnalysisRow> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.user_id == user_id && row.status == AnalysisStatus::Completed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        processing_time_ms: i64,
    ) -> Result<bool> {
        if self.vanish_on_complete.lock().unwrap().remove(&id) {
            self.remove(id);
            return Ok(false);
        }
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.status == AnalysisStatus::Processing => {
                row.apply_result(result, processing_time_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.status == AnalysisStatus::Processing => {
                row.apply_failure(message);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn relocate(&self, id: Uuid, file_url: &str, storage_key: Option<&str>) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) => {
                row.file_url = file_url.to_string();
                row.storage_key = storage_key.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_optimized(&self, id: Uuid, optimized: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.status == AnalysisStatus::Completed => {
                row.optimized_version = Some(optimized.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>> {
        let mut rows = self.rows.lock().unwrap();
        if rows.get(&id).is_some_and(|row| row.user_id == user_id) {
            Ok(rows.remove(&id))
        } else {
            Ok(None)
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// User store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn insert(&self, plan: PlanTier, analyses_count: i32, anchor: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.users.lock().unwrap().insert(
            id,
            User {
                id,
                email: format!("{id}@example.com"),
                plan_type: plan,
                analyses_count,
                monthly_analyses_reset: anchor,
                created_at: anchor,
            },
        );
        id
    }

    pub fn user(&self, id: Uuid) -> User {
        self.users
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("user should exist")
    }

    pub fn count(&self, id: Uuid) -> i32 {
        self.user(id).analyses_count
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn reset_monthly(&self, id: Uuid, anchor: DateTime<Utc>) -> Result<()> {
        if let Some(user) = self.users.lock().unwrap().get_mut(&id) {
            user.analyses_count = 0;
            user.monthly_analyses_reset = anchor;
        }
        Ok(())
    }

    async fn increment_analyses(&self, id: Uuid) -> Result<()> {
        if let Some(user) = self.users.lock().unwrap().get_mut(&id) {
            if user.plan_type == PlanTier::Free {
                user.analyses_count += 1;
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Job queue
// ────────────────────────────────────────────────────────────────────────────

/// Lease granted by [`MemoryJobQueue`] on every reservation.
pub const TEST_LEASE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<String>,
    active: Vec<String>,
    leases: HashMap<String, Instant>,
    jobs: HashMap<String, (AnalysisJob, u32)>,
    dead: usize,
    enqueued: usize,
}

impl QueueState {
    fn release(&mut self, job_id: &str) {
        self.active.retain(|id| id != job_id);
        self.leases.remove(job_id);
    }
}

/// Queue fake on the tokio clock. Retries are made ready immediately; backoff
/// is not simulated.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    policy: RetryPolicy,
    down: AtomicBool,
    reject_enqueue: AtomicBool,
    drop_next_settle: AtomicBool,
}

impl MemoryJobQueue {
    /// Makes the next ack or fail error out as if the broker dropped the connection.
    pub fn drop_next_settle(&self) {
        self.drop_next_settle.store(true, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn reject_enqueue(&self, reject: bool) {
        self.reject_enqueue.store(reject, Ordering::SeqCst);
    }

    pub fn enqueued(&self) -> usize {
        self.state.lock().unwrap().enqueued
    }

    /// Jobs waiting or in flight.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.waiting.len() + state.active.len()
    }

    pub fn dead(&self) -> usize {
        self.state.lock().unwrap().dead
    }

    fn check_up(&self) -> Result<(), QueueError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(QueueError::Broker("connection refused".to_string()));
        }
        Ok(())
    }

    fn check_settle(&self) -> Result<(), QueueError> {
        self.check_up()?;
        if self.drop_next_settle.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Broker("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &AnalysisJob) -> Result<JobHandle, EnqueueError> {
        if self.down.load(Ordering::SeqCst) || self.reject_enqueue.load(Ordering::SeqCst) {
            return Err(EnqueueError::BrokerUnavailable(
                "connection refused".to_string(),
            ));
        }
        job.validate()?;

        let job_id = job.dedupe_key();
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job_id) {
            return Ok(JobHandle {
                job_id,
                duplicate: true,
            });
        }
        state.jobs.insert(job_id.clone(), (job.clone(), 0));
        state.waiting.push_back(job_id.clone());
        state.enqueued += 1;
        Ok(JobHandle {
            job_id,
            duplicate: false,
        })
    }

    async fn reserve(&self) -> Result<Option<Delivery>, QueueError> {
        self.check_up()?;
        let mut state = self.state.lock().unwrap();
        let Some(job_id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        state.active.push(job_id.clone());
        state
            .leases
            .insert(job_id.clone(), Instant::now() + TEST_LEASE);
        let delivery = state.jobs.get(&job_id).map(|(job, attempts)| Delivery {
            job: job.clone(),
            attempt: attempts + 1,
        });
        Ok(delivery)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.check_settle()?;
        let job_id = delivery.job_id();
        let mut state = self.state.lock().unwrap();
        state.release(&job_id);
        state.jobs.remove(&job_id);
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, _reason: &str) -> Result<FailOutcome, QueueError> {
        self.check_settle()?;
        let job_id = delivery.job_id();
        let outcome = self.policy.on_failure(delivery.attempt);
        let mut state = self.state.lock().unwrap();
        state.release(&job_id);
        match outcome {
            FailOutcome::Retrying { .. } => {
                if let Some(entry) = state.jobs.get_mut(&job_id) {
                    entry.1 = delivery.attempt;
                }
                state.waiting.push_back(job_id);
            }
            FailOutcome::DeadLettered { .. } => {
                state.jobs.remove(&job_id);
                state.dead += 1;
            }
        }
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        self.check_up()?;
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut moved = 0;
        for job_id in expired {
            state.release(&job_id);
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                entry.1 += 1;
                state.waiting.push_back(job_id);
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl BrokerProbe for MemoryJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        self.check_up()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

pub struct FakeAnalyzer {
    score: i32,
    calls: AtomicUsize,
    optimize_calls: AtomicUsize,
    failures_left: AtomicUsize,
    hang: AtomicBool,
}

impl Default for FakeAnalyzer {
    fn default() -> Self {
        Self {
            score: 82,
            calls: AtomicUsize::new(0),
            optimize_calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            hang: AtomicBool::new(false),
        }
    }
}

impl FakeAnalyzer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn optimize_calls(&self) -> usize {
        self.optimize_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `n` calls fail with a service error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Makes every analysis call wait forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CvAnalyzer for FakeAnalyzer {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn analyze(&self, _text: &str) -> Result<AnalysisResult, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.take_failure() {
            return Err(AnalyzerError::Malformed("simulated outage".to_string()));
        }
        Ok(AnalysisResult {
            score: self.score,
            strengths: vec!["Quantified impact".to_string()],
            weaknesses: vec!["Summary is long".to_string()],
            missing_skills: vec!["Java".to_string()],
            improvements: vec![Improvement {
                category: "Summary".to_string(),
                suggestion: "Trim to three lines".to_string(),
            }],
            extracted_data: ExtractedData {
                name: Some("Jane Doe".to_string()),
                email: Some("jane.doe@example.com".to_string()),
                phone: None,
                skills: vec!["Rust".to_string(), "PostgreSQL".to_string()],
                experience: vec!["Lead Engineer, Northwind Logistics".to_string()],
                education: vec!["MSc Computer Science".to_string()],
            },
            ats_compatible: true,
        })
    }

    async fn optimize(
        &self,
        _text: &str,
        context: &OptimizationContext,
    ) -> Result<String, AnalyzerError> {
        self.optimize_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(AnalyzerError::Malformed("simulated outage".to_string()));
        }
        Ok(format!("# Jane Doe\n\nRewritten from a {}/100 CV.", context.score))
    }
}

#[derive(Default)]
pub struct FakeRemote {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
    hang_uploads: AtomicBool,
}

impl FakeRemote {
    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn hang_uploads(&self) {
        self.hang_uploads.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStorage for FakeRemote {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        if self.hang_uploads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("simulated upload failure".to_string()));
        }
        let bytes = tokio::fs::read(local).await?;
        self.put(key, &bytes);
        Ok(format!("https://cvs.example.com/{key}"))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::Remote(format!("no such key: {key}")))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

/// Wires the pipeline against fakes and a temporary upload directory.
pub struct Harness {
    pub records: Arc<MemoryAnalysisStore>,
    pub users: Arc<MemoryUserStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub analyzer: Arc<FakeAnalyzer>,
    remote: Option<Arc<FakeRemote>>,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_remote() -> Self {
        Self::build(Some(Arc::new(FakeRemote::default())))
    }

    fn build(remote: Option<Arc<FakeRemote>>) -> Self {
        Self {
            records: Arc::new(MemoryAnalysisStore::default()),
            users: Arc::new(MemoryUserStore::default()),
            queue: Arc::new(MemoryJobQueue::default()),
            analyzer: Arc::new(FakeAnalyzer::default()),
            remote,
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn remote(&self) -> &FakeRemote {
        self.remote.as_deref().expect("harness built without remote storage")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    pub fn artifacts(&self) -> ArtifactStore {
        let remote = self
            .remote
            .clone()
            .map(|remote| remote as Arc<dyn RemoteStorage>);
        ArtifactStore::new(self.upload_dir(), 1024 * 1024, remote)
    }

    pub fn routine(&self) -> ProcessingRoutine {
        ProcessingRoutine::new(
            self.records.clone(),
            QuotaTracker::new(self.users.clone()),
            Arc::new(DocumentExtractor),
            self.analyzer.clone(),
            self.artifacts(),
            PipelineTimeouts::default(),
        )
    }

    pub fn monitor(&self, broker_up: bool) -> Arc<BrokerMonitor> {
        Arc::new(BrokerMonitor::new(broker_up))
    }

    pub fn dispatcher(&self, broker_up: bool) -> Dispatcher {
        Dispatcher::new(
            QuotaTracker::new(self.users.clone()),
            self.records.clone(),
            self.artifacts(),
            self.monitor(broker_up),
            Arc::new(self.routine()),
            self.queue.clone(),
        )
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            Arc::new(self.routine()),
            WorkerPoolConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(5),
                reap_interval: Duration::from_secs(1),
            },
        )
    }

    pub fn state(&self, broker_up: bool) -> AppState {
        let monitor = self.monitor(broker_up);
        AppState {
            records: self.records.clone(),
            artifacts: self.artifacts(),
            extractor: Arc::new(DocumentExtractor),
            analyzer: self.analyzer.clone(),
            dispatcher: Arc::new(Dispatcher::new(
                QuotaTracker::new(self.users.clone()),
                self.records.clone(),
                self.artifacts(),
                monitor.clone(),
                Arc::new(self.routine()),
                self.queue.clone(),
            )),
            monitor,
            timeouts: PipelineTimeouts::default(),
        }
    }

    /// Writes `text` as an uploaded `.txt` artifact and creates its record.
    pub async fn stage(&self, user_id: Uuid, text: &str) -> AnalysisJob {
        let dir = self.upload_dir();
        tokio::fs::create_dir_all(&dir).await.expect("create upload dir");
        let id = Uuid::new_v4();
        let path = dir.join(format!("{id}.txt"));
        tokio::fs::write(&path, text).await.expect("write artifact");

        self.records
            .create(NewAnalysis {
                id,
                user_id,
                original_file_name: "cv.txt".to_string(),
                file_url: path.to_string_lossy().into_owned(),
            })
            .await
            .expect("create record");

        AnalysisJob {
            analysis_id: id,
            user_id,
            file_path: path,
            original_file_name: "cv.txt".to_string(),
        }
    }
}
