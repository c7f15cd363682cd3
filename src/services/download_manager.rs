//! Persistent, slot-limited background download engine.
//!
//! Tasks are keyed by a caller-chosen id (by convention `provider:trackId`)
//! and survive restarts: the whole task map is serialized to the settings
//! store on every mutation. At most `max_concurrent` transfers run at a
//! time; pending tasks start in ascending task-id order as slots free up.
//! Deezer downloads get a whole-file decryption pass after the transfer;
//! YouTube downloads go through the remux collaborator with a raw-file
//! fallback.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use crate::crypto::{ChunkCodec, CipherFallback, TrackKey, CHUNK_SIZE};
use crate::db::queries::SettingsQueries;
use crate::db::Database;
use crate::errors::{HarmonyError, Result};
use crate::models::{
    AudioFormat, DownloadStatus, DownloadSummary, EnqueueRequest, Provider, TaskRecord,
};
use crate::services::fetcher::RangeFetcher;
use crate::utils::file::FileManager;

/// Settings key the serialized task map lives under.
pub const TASKS_KEY: &str = "harmony.download.tasks";

const DEFAULT_MAX_CONCURRENT: usize = 2;
const MAX_CONCURRENT_LIMIT: usize = 8;
const PROGRESS_EMIT_STEP: f64 = 0.01;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Container remux collaborator for progressive (YouTube) downloads.
/// Failure is recoverable: the raw file is moved into place instead.
pub trait Remuxer: Send + Sync {
    fn remux(&self, input: &Path, output: &Path) -> std::io::Result<()>;
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress {
        task_id: String,
        progress: f64,
    },
    Complete {
        task_id: String,
        file_path: String,
        artwork_path: Option<String>,
        file_size: u64,
        format: AudioFormat,
    },
    Error {
        task_id: String,
        error: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransferControl {
    Running,
    Cancelled,
}

struct TransferHandle {
    control: watch::Sender<TransferControl>,
}

struct ManagerState {
    tasks: BTreeMap<String, TaskRecord>,
    active: HashMap<String, TransferHandle>,
}

struct ManagerInner {
    db: Database,
    files: FileManager,
    fetcher: Arc<dyn RangeFetcher>,
    runtime: Handle,
    events: broadcast::Sender<DownloadEvent>,
    fallback: CipherFallback,
    remuxer: Option<Arc<dyn Remuxer>>,
    max_concurrent: usize,
    state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

struct TaskOutcome {
    file_path: String,
    artwork_path: Option<String>,
    file_size: u64,
}

impl DownloadManager {
    pub fn new(
        db: Database,
        files: FileManager,
        fetcher: Arc<dyn RangeFetcher>,
        runtime: Handle,
        fallback: CipherFallback,
        remuxer: Option<Arc<dyn Remuxer>>,
        max_concurrent: Option<usize>,
    ) -> Result<Self> {
        files.ensure_layout()?;

        let mut tasks = load_tasks(&db)?;
        let requeued = reconcile_tasks(&mut tasks);
        if requeued > 0 {
            tracing::info!("requeued {} interrupted download task(s)", requeued);
            persist_tasks(&db, &tasks)?;
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                db,
                files,
                fetcher,
                runtime,
                events,
                fallback,
                remuxer,
                max_concurrent: resolve_max_concurrent(max_concurrent),
                state: Mutex::new(ManagerState {
                    tasks,
                    active: HashMap::new(),
                }),
            }),
        };

        let startup = manager.clone();
        manager.inner.runtime.spawn(async move {
            startup.schedule().await;
        });

        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<()> {
        if request.task_id.trim().is_empty() {
            return Err(HarmonyError::InvalidInput("empty task id".to_string()));
        }
        if request.url.trim().is_empty() {
            return Err(HarmonyError::InvalidInput("empty url".to_string()));
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.active.contains_key(&request.task_id) {
                return Ok(());
            }
            let now = chrono::Utc::now().timestamp();
            let record = TaskRecord {
                task_id: request.task_id.clone(),
                url: request.url,
                track_id: request.track_id,
                provider: request.provider,
                format: request.format,
                artwork_url: request.artwork_url,
                metadata: request.metadata,
                status: DownloadStatus::Pending,
                file_path: None,
                artwork_path: None,
                file_size: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            state.tasks.insert(request.task_id, record);
            persist_tasks(&self.inner.db, &state.tasks)?;
        }

        self.schedule().await;
        Ok(())
    }

    pub async fn enqueue_batch(&self, requests: Vec<EnqueueRequest>) -> Result<()> {
        for request in requests {
            self.enqueue(request).await?;
        }
        Ok(())
    }

    /// Abort the transfer if running, drop the record, persist.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(handle) = state.active.remove(task_id) {
                let _ = handle.control.send(TransferControl::Cancelled);
            }
            state.tasks.remove(task_id);
            persist_tasks(&self.inner.db, &state.tasks)?;
        }
        self.schedule().await;
        Ok(())
    }

    pub async fn cancel_all(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        for (_, handle) in state.active.drain() {
            let _ = handle.control.send(TransferControl::Cancelled);
        }
        state.tasks.clear();
        persist_tasks(&self.inner.db, &state.tasks)?;
        Ok(())
    }

    /// Remove a finished or failed record so the task can be enqueued again.
    pub async fn clear_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.active.contains_key(task_id) {
            return Err(HarmonyError::InvalidInput(format!(
                "task {task_id} is still active"
            )));
        }
        state.tasks.remove(task_id);
        persist_tasks(&self.inner.db, &state.tasks)?;
        Ok(())
    }

    pub async fn get_downloads(&self) -> Vec<DownloadSummary> {
        let state = self.inner.state.lock().await;
        state.tasks.values().map(summarize).collect()
    }

    /// Start pending tasks, smallest task id first, until the slots are
    /// full. Called after every mutation that could free or fill a slot.
    fn schedule<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut guard = self.inner.state.lock().await;
            while guard.active.len() < self.inner.max_concurrent {
                let ManagerState { tasks, active } = &mut *guard;
                let next = tasks
                    .iter()
                    .find(|(id, record)| {
                        record.status == DownloadStatus::Pending && !active.contains_key(*id)
                    })
                    .map(|(id, _)| id.clone());
                let Some(task_id) = next else { break };

                let record = {
                    let Some(record) = tasks.get_mut(&task_id) else {
                        break;
                    };
                    record.status = DownloadStatus::Downloading;
                    record.updated_at = chrono::Utc::now().timestamp();
                    record.clone()
                };

                let (control, control_rx) = watch::channel(TransferControl::Running);
                active.insert(task_id.clone(), TransferHandle { control });
                if let Err(err) = persist_tasks(&self.inner.db, tasks) {
                    tracing::warn!("failed to persist download tasks: {}", err);
                }

                let manager = self.clone();
                self.inner.runtime.spawn(async move {
                    manager.run_task(task_id, record, control_rx).await;
                });
            }
        })
    }

    async fn run_task(
        &self,
        task_id: String,
        record: TaskRecord,
        control: watch::Receiver<TransferControl>,
    ) {
        let outcome = self.transfer_and_finalize(&task_id, &record, control).await;

        {
            let mut state = self.inner.state.lock().await;
            state.active.remove(&task_id);
            match outcome {
                Ok(done) => {
                    if let Some(rec) = state.tasks.get_mut(&task_id) {
                        rec.status = DownloadStatus::Completed;
                        rec.file_path = Some(done.file_path.clone());
                        rec.artwork_path = done.artwork_path.clone();
                        rec.file_size = Some(done.file_size);
                        rec.error = None;
                        rec.updated_at = chrono::Utc::now().timestamp();
                        let format = rec.format;
                        if let Err(err) = persist_tasks(&self.inner.db, &state.tasks) {
                            tracing::warn!("failed to persist download tasks: {}", err);
                        }
                        let _ = self.inner.events.send(DownloadEvent::Complete {
                            task_id: task_id.clone(),
                            file_path: done.file_path,
                            artwork_path: done.artwork_path,
                            file_size: done.file_size,
                            format,
                        });
                    }
                }
                Err(err) if err.is_cancelled() => {
                    tracing::debug!("download task {} cancelled", task_id);
                }
                Err(err) => {
                    tracing::error!("download task {} failed: {}", task_id, err);
                    if let Some(rec) = state.tasks.get_mut(&task_id) {
                        rec.status = DownloadStatus::Error;
                        rec.error = Some(err.to_string());
                        rec.updated_at = chrono::Utc::now().timestamp();
                        if let Err(persist_err) = persist_tasks(&self.inner.db, &state.tasks) {
                            tracing::warn!("failed to persist download tasks: {}", persist_err);
                        }
                        let _ = self.inner.events.send(DownloadEvent::Error {
                            task_id: task_id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        self.schedule().await;
    }

    async fn transfer_and_finalize(
        &self,
        task_id: &str,
        record: &TaskRecord,
        mut control: watch::Receiver<TransferControl>,
    ) -> Result<TaskOutcome> {
        let temp_path = self
            .inner
            .files
            .temp_dir()
            .join(format!("harmony-dl-{}", Uuid::new_v4()));

        if let Err(err) = self
            .download_to(&temp_path, record, &mut control, task_id)
            .await
        {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        if !self.set_status(task_id, DownloadStatus::Decrypting).await {
            let _ = std::fs::remove_file(&temp_path);
            return Err(HarmonyError::Cancelled);
        }

        let final_path = self
            .inner
            .files
            .track_path(record.provider, &record.track_id, record.format);
        let finalized = match record.provider {
            Provider::Deezer => decrypt_file(
                &self.inner.files,
                &TrackKey::for_track_id(&record.track_id),
                self.inner.fallback,
                &temp_path,
                &final_path,
            ),
            Provider::Youtube => {
                remux_or_move(self.inner.remuxer.as_deref(), &temp_path, &final_path)
            }
        };
        let _ = std::fs::remove_file(&temp_path);
        finalized?;

        let artwork_path = match &record.artwork_url {
            Some(url) => self.fetch_artwork(url, record).await,
            None => None,
        };

        let file_size = std::fs::metadata(&final_path)?.len();
        Ok(TaskOutcome {
            file_path: final_path.to_string_lossy().to_string(),
            artwork_path,
            file_size,
        })
    }

    async fn download_to(
        &self,
        path: &Path,
        record: &TaskRecord,
        control: &mut watch::Receiver<TransferControl>,
        task_id: &str,
    ) -> Result<()> {
        if *control.borrow() == TransferControl::Cancelled {
            return Err(HarmonyError::Cancelled);
        }

        let response = self.inner.fetcher.fetch(&record.url, None).await?;
        let total = response.content_length.filter(|total| *total > 0);
        let mut stream = response.stream;
        let mut file = std::fs::File::create(path)?;
        let mut downloaded: u64 = 0;
        let mut last_progress = 0.0f64;

        loop {
            let next = tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() == TransferControl::Cancelled {
                        return Err(HarmonyError::Cancelled);
                    }
                    continue;
                }
                next = futures_util::StreamExt::next(&mut stream) => next,
            };

            let Some(next) = next else { break };
            let bytes = next?;
            file.write_all(&bytes)?;
            downloaded += bytes.len() as u64;

            if let Some(total) = total {
                let progress = (downloaded as f64 / total as f64).min(1.0);
                if progress - last_progress >= PROGRESS_EMIT_STEP || progress >= 1.0 {
                    last_progress = progress;
                    let _ = self.inner.events.send(DownloadEvent::Progress {
                        task_id: task_id.to_string(),
                        progress,
                    });
                }
            }
        }

        Ok(())
    }

    /// Best-effort: artwork failures are logged, never fatal to the task.
    async fn fetch_artwork(&self, url: &str, record: &TaskRecord) -> Option<String> {
        let path = self
            .inner
            .files
            .artwork_path(record.provider, &record.track_id);
        match self.collect_body(url).await {
            Ok(bytes) => match self.inner.files.write_atomic(&path, &bytes) {
                Ok(()) => Some(path.to_string_lossy().to_string()),
                Err(err) => {
                    tracing::warn!("failed to write artwork for {}: {}", record.task_id, err);
                    None
                }
            },
            Err(err) => {
                tracing::warn!("artwork fetch failed for {}: {}", record.task_id, err);
                None
            }
        }
    }

    async fn collect_body(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.inner.fetcher.fetch(url, None).await?;
        let mut stream = response.stream;
        let mut bytes = Vec::new();
        while let Some(next) = futures_util::StreamExt::next(&mut stream).await {
            bytes.extend_from_slice(&next?);
        }
        Ok(bytes)
    }

    /// Returns false when the record no longer exists, i.e. the task was
    /// cancelled while the transfer was finishing.
    async fn set_status(&self, task_id: &str, status: DownloadStatus) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.tasks.get_mut(task_id) {
            Some(record) => {
                record.status = status;
                record.updated_at = chrono::Utc::now().timestamp();
                if let Err(err) = persist_tasks(&self.inner.db, &state.tasks) {
                    tracing::warn!("failed to persist download tasks: {}", err);
                }
                true
            }
            None => false,
        }
    }
}

fn resolve_max_concurrent(configured: Option<usize>) -> usize {
    std::env::var("HARMONY_MAX_CONCURRENT_DOWNLOADS")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .or(configured)
        .map(|value| value.clamp(1, MAX_CONCURRENT_LIMIT))
        .unwrap_or(DEFAULT_MAX_CONCURRENT)
}

fn load_tasks(db: &Database) -> Result<BTreeMap<String, TaskRecord>> {
    match db.get_setting(TASKS_KEY)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(BTreeMap::new()),
    }
}

fn persist_tasks(db: &Database, tasks: &BTreeMap<String, TaskRecord>) -> Result<()> {
    db.set_setting(TASKS_KEY, &serde_json::to_string(tasks)?)
}

/// Startup reconciliation: no transport task outlives the process, so any
/// record still marked in-flight is an orphan and goes back to pending.
fn reconcile_tasks(tasks: &mut BTreeMap<String, TaskRecord>) -> usize {
    let mut requeued = 0;
    for record in tasks.values_mut() {
        if matches!(
            record.status,
            DownloadStatus::Downloading | DownloadStatus::Decrypting
        ) {
            record.status = DownloadStatus::Pending;
            record.updated_at = chrono::Utc::now().timestamp();
            requeued += 1;
        }
    }
    requeued
}

fn summarize(record: &TaskRecord) -> DownloadSummary {
    DownloadSummary {
        task_id: record.task_id.clone(),
        provider: record.provider,
        format: record.format,
        status: record.status,
        metadata: record.metadata.clone(),
        file_path: record.file_path.clone(),
        artwork_path: record.artwork_path.clone(),
        file_size: record.file_size,
        error: record.error.clone(),
    }
}

/// Whole-file decryption pass for a finished Deezer transfer: map the
/// ciphertext, run it through the stream codec, rename into place.
fn decrypt_file(
    files: &FileManager,
    key: &TrackKey,
    fallback: CipherFallback,
    input: &Path,
    output: &Path,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // memmap rejects empty files; an empty track decrypts to an empty file.
    if std::fs::metadata(input)?.len() == 0 {
        std::fs::write(output, b"")?;
        return Ok(());
    }

    let mapped = files.mmap_read(input)?;
    let part = output.with_extension("part");
    let result = decrypt_into(&mapped, key, fallback, &part);
    if result.is_err() {
        let _ = std::fs::remove_file(&part);
        return result;
    }
    std::fs::rename(&part, output)?;
    Ok(())
}

fn decrypt_into(
    cipher_text: &[u8],
    key: &TrackKey,
    fallback: CipherFallback,
    part: &Path,
) -> Result<()> {
    let mut codec = ChunkCodec::new(*key, fallback);
    let mut writer = std::io::BufWriter::new(std::fs::File::create(part)?);
    let mut out = Vec::with_capacity(32 * CHUNK_SIZE);

    for piece in cipher_text.chunks(64 * 1024) {
        out.clear();
        codec.feed(piece, &mut out)?;
        writer.write_all(&out)?;
    }
    out.clear();
    codec.flush(&mut out);
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(())
}

fn remux_or_move(remuxer: Option<&dyn Remuxer>, input: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(remuxer) = remuxer {
        match remuxer.remux(input, output) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!("remux failed, falling back to the raw file: {}", err);
            }
        }
    }
    move_file(input, output)
}

fn move_file(input: &Path, output: &Path) -> Result<()> {
    if std::fs::rename(input, output).is_ok() {
        return Ok(());
    }
    std::fs::copy(input, output)?;
    let _ = std::fs::remove_file(input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::crypto::{cipher, STRIPE_PERIOD};
    use crate::models::TrackMetadata;
    use crate::services::fetcher::testing::MemoryFetcher;

    const TRACK_URL: &str = "https://cdn.example/media/3135556";
    const ART_URL: &str = "https://cdn.example/art/3135556.jpg";

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 17 & 0xFF) as u8).collect()
    }

    fn encrypt_stream(track_id: &str, plain: &[u8]) -> Vec<u8> {
        let key = TrackKey::for_track_id(track_id);
        let mut out = Vec::with_capacity(plain.len());
        for (i, chunk) in plain.chunks(CHUNK_SIZE).enumerate() {
            if i as u64 % STRIPE_PERIOD == 0 && chunk.len() == CHUNK_SIZE {
                out.extend_from_slice(&cipher::encrypt_chunk(&key, chunk).unwrap());
            } else {
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("harmony-dm-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager_with(
        dir: &Path,
        fetcher: Arc<MemoryFetcher>,
        remuxer: Option<Arc<dyn Remuxer>>,
        max_concurrent: usize,
    ) -> DownloadManager {
        let db = Database::new(dir.join("harmony.db")).unwrap();
        db.run_migrations().unwrap();
        let files = FileManager::new(dir.to_path_buf());
        DownloadManager::new(
            db,
            files,
            fetcher,
            Handle::current(),
            CipherFallback::Passthrough,
            remuxer,
            Some(max_concurrent),
        )
        .unwrap()
    }

    fn request(task_id: &str, provider: Provider, format: AudioFormat) -> EnqueueRequest {
        EnqueueRequest {
            task_id: task_id.to_string(),
            url: TRACK_URL.to_string(),
            track_id: "3135556".to_string(),
            provider,
            format,
            artwork_url: None,
            metadata: TrackMetadata {
                title: "One More Time".to_string(),
                artist: "Daft Punk".to_string(),
                album: "Discovery".to_string(),
                duration: 320.0,
                thumbnail: None,
            },
        }
    }

    async fn wait_for_terminal(
        rx: &mut broadcast::Receiver<DownloadEvent>,
        task_id: &str,
    ) -> DownloadEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let terminal = match &event {
                            DownloadEvent::Complete { task_id: id, .. }
                            | DownloadEvent::Error { task_id: id, .. } => id == task_id,
                            DownloadEvent::Progress { .. } => false,
                        };
                        if terminal {
                            return event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(err) => panic!("event channel closed: {err}"),
                }
            }
        })
        .await
        .expect("task did not reach a terminal state in time")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deezer_task_downloads_decrypts_and_persists() {
        let plain = pattern(3 * CHUNK_SIZE + 500);
        let cipher_text = encrypt_stream("3135556", &plain);
        let artwork = pattern(900);

        let dir = test_dir();
        let fetcher = Arc::new(
            MemoryFetcher::new(1500, Duration::ZERO)
                .route(TRACK_URL, cipher_text)
                .route(ART_URL, artwork.clone()),
        );
        let manager = manager_with(&dir, fetcher, None, 2);
        let mut events = manager.subscribe();

        let mut req = request("deezer:3135556", Provider::Deezer, AudioFormat::Flac);
        req.artwork_url = Some(ART_URL.to_string());
        manager.enqueue(req).await.unwrap();

        let event = wait_for_terminal(&mut events, "deezer:3135556").await;
        let DownloadEvent::Complete {
            file_path,
            artwork_path,
            file_size,
            format,
            ..
        } = event
        else {
            panic!("expected completion, got {event:?}");
        };

        assert_eq!(format, AudioFormat::Flac);
        assert_eq!(file_size, plain.len() as u64);
        assert!(file_path.ends_with("deezer_3135556.flac"));
        assert_eq!(std::fs::read(&file_path).unwrap(), plain);
        let artwork_path = artwork_path.expect("artwork fetched");
        assert_eq!(std::fs::read(&artwork_path).unwrap(), artwork);

        let downloads = manager.get_downloads().await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].status, DownloadStatus::Completed);
        assert_eq!(downloads[0].file_size, Some(plain.len() as u64));

        // The terminal state must be on disk as well.
        let db = Database::new(dir.join("harmony.db")).unwrap();
        let persisted = db.get_setting(TASKS_KEY).unwrap().unwrap();
        assert!(persisted.contains("\"completed\""));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn youtube_task_without_remuxer_keeps_the_raw_file() {
        let raw = pattern(5000);
        let dir = test_dir();
        let fetcher =
            Arc::new(MemoryFetcher::new(1024, Duration::ZERO).route(TRACK_URL, raw.clone()));
        let manager = manager_with(&dir, fetcher, None, 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("youtube:abc", Provider::Youtube, AudioFormat::M4a))
            .await
            .unwrap();

        let event = wait_for_terminal(&mut events, "youtube:abc").await;
        let DownloadEvent::Complete { file_path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert!(file_path.ends_with("youtube_3135556.m4a"));
        assert_eq!(std::fs::read(&file_path).unwrap(), raw);

        let _ = std::fs::remove_dir_all(dir);
    }

    struct ReversingRemuxer;

    impl Remuxer for ReversingRemuxer {
        fn remux(&self, input: &Path, output: &Path) -> std::io::Result<()> {
            let mut data = std::fs::read(input)?;
            data.reverse();
            std::fs::write(output, data)
        }
    }

    struct FailingRemuxer;

    impl Remuxer for FailingRemuxer {
        fn remux(&self, _input: &Path, _output: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("no stream found"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn youtube_task_goes_through_the_remuxer() {
        let raw = pattern(4000);
        let mut reversed = raw.clone();
        reversed.reverse();

        let dir = test_dir();
        let fetcher =
            Arc::new(MemoryFetcher::new(1024, Duration::ZERO).route(TRACK_URL, raw.clone()));
        let manager = manager_with(&dir, fetcher, Some(Arc::new(ReversingRemuxer)), 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("youtube:def", Provider::Youtube, AudioFormat::M4a))
            .await
            .unwrap();

        let event = wait_for_terminal(&mut events, "youtube:def").await;
        let DownloadEvent::Complete { file_path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert_eq!(std::fs::read(&file_path).unwrap(), reversed);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn remux_failure_falls_back_to_the_raw_file() {
        let raw = pattern(4000);
        let dir = test_dir();
        let fetcher =
            Arc::new(MemoryFetcher::new(1024, Duration::ZERO).route(TRACK_URL, raw.clone()));
        let manager = manager_with(&dir, fetcher, Some(Arc::new(FailingRemuxer)), 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("youtube:ghi", Provider::Youtube, AudioFormat::M4a))
            .await
            .unwrap();

        let event = wait_for_terminal(&mut events, "youtube:ghi").await;
        let DownloadEvent::Complete { file_path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert_eq!(std::fs::read(&file_path).unwrap(), raw);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transport_failure_marks_the_task_as_error() {
        let dir = test_dir();
        // No route registered for the track URL: the fetch 404s.
        let fetcher = Arc::new(MemoryFetcher::new(1024, Duration::ZERO));
        let manager = manager_with(&dir, fetcher, None, 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("deezer:broken", Provider::Deezer, AudioFormat::Mp3))
            .await
            .unwrap();

        let event = wait_for_terminal(&mut events, "deezer:broken").await;
        let DownloadEvent::Error { error, .. } = event else {
            panic!("expected error, got {event:?}");
        };
        assert!(error.contains("404"));

        let downloads = manager.get_downloads().await;
        assert_eq!(downloads[0].status, DownloadStatus::Error);
        assert!(downloads[0].error.is_some());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_aborts_and_removes_the_task() {
        let dir = test_dir();
        let fetcher = Arc::new(
            MemoryFetcher::new(1024, Duration::from_millis(20))
                .route(TRACK_URL, pattern(100 * 1024)),
        );
        let manager = manager_with(&dir, fetcher, None, 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("deezer:slow", Provider::Deezer, AudioFormat::Mp3))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.cancel("deezer:slow").await.unwrap();

        assert!(manager.get_downloads().await.is_empty());

        // No terminal event may arrive for the cancelled task.
        let late = tokio::time::timeout(Duration::from_millis(400), async {
            loop {
                match events.recv().await {
                    Ok(DownloadEvent::Complete { .. }) | Ok(DownloadEvent::Error { .. }) => {
                        return ();
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(late.is_err(), "cancelled task emitted a terminal event");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_two_transfers_run_concurrently() {
        let dir = test_dir();
        let data = pattern(60 * 1024);
        let fetcher = Arc::new(
            MemoryFetcher::new(1024, Duration::from_millis(10))
                .route(TRACK_URL, data),
        );
        let manager = manager_with(&dir, fetcher, None, 2);

        for id in ["deezer:a", "deezer:b", "deezer:c"] {
            manager
                .enqueue(request(id, Provider::Deezer, AudioFormat::Mp3))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let downloads = manager.get_downloads().await;
        let downloading = downloads
            .iter()
            .filter(|summary| summary.status == DownloadStatus::Downloading)
            .count();
        let pending = downloads
            .iter()
            .filter(|summary| summary.status == DownloadStatus::Pending)
            .count();
        assert_eq!(downloading, 2);
        assert_eq!(pending, 1);

        manager.cancel_all().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_tasks_start_in_ascending_id_order() {
        let dir = test_dir();
        let data = pattern(3000);
        let fetcher = Arc::new(
            MemoryFetcher::new(1024, Duration::from_millis(5)).route(TRACK_URL, data),
        );
        let manager = manager_with(&dir, fetcher, None, 1);
        let mut events = manager.subscribe();

        // "t-b" grabs the single slot first; afterwards the queue drains in
        // lexicographic order.
        for id in ["t-b", "t-a", "t-c"] {
            manager
                .enqueue(request(id, Provider::Youtube, AudioFormat::M4a))
                .await
                .unwrap();
        }

        let mut completions = Vec::new();
        while completions.len() < 3 {
            match events.recv().await.unwrap() {
                DownloadEvent::Complete { task_id, .. } => completions.push(task_id),
                DownloadEvent::Error { task_id, .. } => panic!("task {task_id} failed"),
                _ => {}
            }
        }
        assert_eq!(completions, ["t-b", "t-a", "t-c"]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reconcile_requeues_interrupted_tasks() {
        let mut tasks = BTreeMap::new();
        for (id, status) in [
            ("a", DownloadStatus::Downloading),
            ("b", DownloadStatus::Decrypting),
            ("c", DownloadStatus::Completed),
            ("d", DownloadStatus::Error),
            ("e", DownloadStatus::Pending),
        ] {
            let mut record = serde_json::from_value::<TaskRecord>(serde_json::json!({
                "task_id": id,
                "url": TRACK_URL,
                "track_id": "3135556",
                "provider": "deezer",
                "format": "mp3",
                "metadata": {
                    "title": "t", "artist": "a", "album": "al", "duration": 1.0
                },
                "status": "pending",
                "created_at": 0,
                "updated_at": 0
            }))
            .unwrap();
            record.status = status;
            tasks.insert(id.to_string(), record);
        }

        assert_eq!(reconcile_tasks(&mut tasks), 2);
        assert_eq!(tasks["a"].status, DownloadStatus::Pending);
        assert_eq!(tasks["b"].status, DownloadStatus::Pending);
        assert_eq!(tasks["c"].status, DownloadStatus::Completed);
        assert_eq!(tasks["d"].status, DownloadStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restart_revives_interrupted_tasks() {
        let dir = test_dir();
        let db = Database::new(dir.join("harmony.db")).unwrap();
        db.run_migrations().unwrap();

        // A task the previous process left mid-transfer.
        let orphan = serde_json::json!({
            "deezer:orphan": {
                "task_id": "deezer:orphan",
                "url": TRACK_URL,
                "track_id": "3135556",
                "provider": "deezer",
                "format": "mp3",
                "metadata": {
                    "title": "t", "artist": "a", "album": "al", "duration": 1.0
                },
                "status": "downloading",
                "created_at": 0,
                "updated_at": 0
            }
        });
        db.set_setting(TASKS_KEY, &orphan.to_string()).unwrap();

        let fetcher = Arc::new(
            MemoryFetcher::new(1024, Duration::from_millis(20))
                .route(TRACK_URL, pattern(100 * 1024)),
        );
        let files = FileManager::new(dir.clone());
        let manager = DownloadManager::new(
            db,
            files,
            fetcher,
            Handle::current(),
            CipherFallback::Passthrough,
            None,
            Some(2),
        )
        .unwrap();

        // The orphan re-enters scheduling and is transferring again.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let downloads = manager.get_downloads().await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].status, DownloadStatus::Downloading);

        manager.cancel_all().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_task_rejects_active_and_removes_failed() {
        let dir = test_dir();
        let fetcher = Arc::new(MemoryFetcher::new(1024, Duration::ZERO));
        let manager = manager_with(&dir, fetcher, None, 2);
        let mut events = manager.subscribe();

        manager
            .enqueue(request("deezer:x", Provider::Deezer, AudioFormat::Mp3))
            .await
            .unwrap();
        wait_for_terminal(&mut events, "deezer:x").await;

        manager.clear_task("deezer:x").await.unwrap();
        assert!(manager.get_downloads().await.is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }
}
