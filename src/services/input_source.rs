//! Blocking, seekable input source over an in-flight HTTP download.
//!
//! A producer task streams the origin body into a temp file, decrypting
//! on the fly for Deezer tracks, while the decoder thread reads through a
//! synchronous `Read + Seek` surface that blocks until the requested bytes
//! have been committed. The temp file is what makes seeking into
//! not-yet-consumed regions cheap.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::crypto::{ChunkCodec, CipherFallback, TrackKey};
use crate::errors::{HarmonyError, Result};
use crate::models::TrackDescriptor;
use crate::services::fetcher::RangeFetcher;

/// Upper bound on one blocking wait, so cancellation is observed promptly
/// without spinning.
const WAIT_QUANTUM: Duration = Duration::from_millis(100);

enum SourcePayload {
    /// Chunk-obfuscated Deezer stream; decrypted through the stream codec.
    Deezer {
        key: TrackKey,
        fallback: CipherFallback,
    },
    /// Plain progressive HTTP download, passed through verbatim.
    Progressive,
}

#[derive(Default)]
struct SourceState {
    total_length: Option<u64>,
    bytes_downloaded: u64,
    bytes_written: u64,
    complete: bool,
    failed: Option<String>,
    cancelled: bool,
}

struct SourceShared {
    state: Mutex<SourceState>,
    data_ready: Condvar,
}

impl SourceShared {
    fn lock(&self) -> Result<MutexGuard<'_, SourceState>> {
        self.state
            .lock()
            .map_err(|_| HarmonyError::Config("input source state lock poisoned".to_string()))
    }

    fn notify(&self) {
        self.data_ready.notify_all();
    }
}

/// Cancellation handle usable from any thread while the consumer owns the
/// source itself. Cancelling unblocks a waiting reader, which then returns
/// zero bytes.
#[derive(Clone)]
pub struct InputSourceHandle {
    shared: Arc<SourceShared>,
    cancel: Arc<watch::Sender<bool>>,
}

impl InputSourceHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
        if let Ok(mut state) = self.shared.state.lock() {
            state.cancelled = true;
        }
        self.shared.notify();
    }
}

pub struct StreamingInputSource {
    url: String,
    payload: SourcePayload,
    fetcher: Arc<dyn RangeFetcher>,
    runtime: Handle,
    shared: Arc<SourceShared>,
    cancel: Arc<watch::Sender<bool>>,
    temp_path: Option<PathBuf>,
    reader: Option<std::fs::File>,
    read_offset: u64,
    deferred_error: Option<String>,
    open: bool,
    closed: bool,
}

impl StreamingInputSource {
    /// Source for an encrypted Deezer track. The declared content length is
    /// authoritative: decryption is length-preserving.
    pub fn deezer(
        descriptor: &TrackDescriptor,
        fetcher: Arc<dyn RangeFetcher>,
        runtime: Handle,
        fallback: CipherFallback,
    ) -> Self {
        let source = Self::with_payload(
            descriptor.url.clone(),
            SourcePayload::Deezer {
                key: TrackKey::for_track_id(&descriptor.track_id),
                fallback,
            },
            fetcher,
            runtime,
        );
        if let Ok(mut state) = source.shared.state.lock() {
            state.total_length = Some(descriptor.content_length);
        }
        source
    }

    /// Source for a plain progressive download (e.g. a YouTube audio URL).
    /// The length is learned from the response header.
    pub fn progressive(url: String, fetcher: Arc<dyn RangeFetcher>, runtime: Handle) -> Self {
        Self::with_payload(url, SourcePayload::Progressive, fetcher, runtime)
    }

    fn with_payload(
        url: String,
        payload: SourcePayload,
        fetcher: Arc<dyn RangeFetcher>,
        runtime: Handle,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            url,
            payload,
            fetcher,
            runtime,
            shared: Arc::new(SourceShared {
                state: Mutex::new(SourceState::default()),
                data_ready: Condvar::new(),
            }),
            cancel: Arc::new(cancel),
            temp_path: None,
            reader: None,
            read_offset: 0,
            deferred_error: None,
            open: false,
            closed: false,
        }
    }

    /// Allocate the temp file and start the fetch. Idempotent while open.
    pub fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        if self.closed {
            return Err(HarmonyError::InvalidInput(
                "input source already closed".to_string(),
            ));
        }

        let temp_path =
            std::env::temp_dir().join(format!("harmony-stream-{}", Uuid::new_v4()));
        let writer = std::fs::File::create(&temp_path)?;
        let reader = std::fs::File::open(&temp_path)?;

        let codec = match &self.payload {
            SourcePayload::Deezer { key, fallback } => Some(ChunkCodec::new(*key, *fallback)),
            SourcePayload::Progressive => None,
        };

        let shared = Arc::clone(&self.shared);
        let fetcher = Arc::clone(&self.fetcher);
        let url = self.url.clone();
        let cancel_rx = self.cancel.subscribe();
        self.runtime.spawn(async move {
            run_producer(shared, fetcher, url, codec, writer, cancel_rx).await;
        });

        self.temp_path = Some(temp_path);
        self.reader = Some(reader);
        self.open = true;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn supports_seeking(&self) -> bool {
        true
    }

    pub fn offset(&self) -> u64 {
        self.read_offset
    }

    /// Handle for cancelling the download from another thread.
    pub fn cancel_handle(&self) -> InputSourceHandle {
        InputSourceHandle {
            shared: Arc::clone(&self.shared),
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Raw ciphertext bytes received so far. Monitoring only.
    pub fn bytes_downloaded(&self) -> u64 {
        self.shared
            .state
            .lock()
            .map(|state| state.bytes_downloaded)
            .unwrap_or(0)
    }

    /// Cleartext bytes committed to the temp file so far.
    pub fn bytes_written(&self) -> u64 {
        self.shared
            .state
            .lock()
            .map(|state| state.bytes_written)
            .unwrap_or(0)
    }

    /// Total stream length. Known up front for Deezer sources; for
    /// progressive sources this blocks until the response header arrives
    /// (or the fetch terminates).
    pub fn length(&self) -> Result<u64> {
        let mut guard = self.shared.lock()?;
        loop {
            if let Some(total) = guard.total_length {
                return Ok(total);
            }
            if let Some(message) = &guard.failed {
                return Err(HarmonyError::Http(message.clone()));
            }
            if guard.cancelled {
                return Err(HarmonyError::Cancelled);
            }
            if guard.complete {
                return Ok(guard.bytes_written);
            }
            if !self.open {
                return Err(HarmonyError::InvalidInput(
                    "input source is not open".to_string(),
                ));
            }
            guard = self
                .shared
                .data_ready
                .wait_timeout(guard, WAIT_QUANTUM)
                .map_err(|_| {
                    HarmonyError::Config("input source state lock poisoned".to_string())
                })?
                .0;
        }
    }

    /// Fill `buf` starting at the current offset, blocking until the bytes
    /// have been committed. Short reads (including zero) happen only at end
    /// of stream or after cancellation. A transport failure surfaces once
    /// already-committed cleartext is exhausted; if some bytes were read
    /// first, they are returned and the error is kept for the next call.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(HarmonyError::InvalidInput(
                "input source is not open".to_string(),
            ));
        }
        if let Some(message) = self.deferred_error.take() {
            return Err(HarmonyError::Http(message));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut filled = 0usize;
        loop {
            let (written, complete, cancelled, failed) = {
                let state = self.shared.lock()?;
                (
                    state.bytes_written,
                    state.complete,
                    state.cancelled,
                    state.failed.clone(),
                )
            };

            if cancelled {
                return Ok(filled);
            }

            let available = written.saturating_sub(self.read_offset);
            if available > 0 {
                let want = (buf.len() - filled).min(available as usize);
                let reader = self.reader.as_mut().ok_or_else(|| {
                    HarmonyError::InvalidInput("input source is not open".to_string())
                })?;
                reader.seek(SeekFrom::Start(self.read_offset))?;
                reader.read_exact(&mut buf[filled..filled + want])?;
                filled += want;
                self.read_offset += want as u64;
                if filled == buf.len() {
                    return Ok(filled);
                }
                continue;
            }

            if let Some(message) = failed {
                if filled > 0 {
                    self.deferred_error = Some(message);
                    return Ok(filled);
                }
                return Err(HarmonyError::Http(message));
            }
            if complete {
                return Ok(filled);
            }

            self.wait_for_commit()?;
        }
    }

    /// Position the next read. Blocks until the target offset has been
    /// written, the download finished, or the fetch was cancelled or
    /// failed. Seeking past the end is allowed and reads as EOF.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        if !self.open {
            return Err(HarmonyError::InvalidInput(
                "input source is not open".to_string(),
            ));
        }

        let mut guard = self.shared.lock()?;
        loop {
            if guard.bytes_written >= offset
                || guard.complete
                || guard.cancelled
                || guard.failed.is_some()
            {
                break;
            }
            guard = self
                .shared
                .data_ready
                .wait_timeout(guard, WAIT_QUANTUM)
                .map_err(|_| {
                    HarmonyError::Config("input source state lock poisoned".to_string())
                })?
                .0;
        }
        drop(guard);

        self.read_offset = offset;
        Ok(())
    }

    fn wait_for_commit(&self) -> Result<()> {
        let guard = self.shared.lock()?;
        let _ = self
            .shared
            .data_ready
            .wait_timeout(guard, WAIT_QUANTUM)
            .map_err(|_| HarmonyError::Config("input source state lock poisoned".to_string()))?;
        Ok(())
    }

    /// Cancel the fetch, release the handles, and delete the temp file.
    /// Safe to call more than once; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;

        let _ = self.cancel.send(true);
        if let Ok(mut state) = self.shared.state.lock() {
            state.cancelled = true;
        }
        self.shared.notify();

        self.reader = None;
        if let Some(path) = self.temp_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::debug!("failed to remove temp file {}: {}", path.display(), err);
            }
        }
    }
}

impl Drop for StreamingInputSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for StreamingInputSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(io::Error::other)
    }
}

impl Seek for StreamingInputSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                self.read_offset.checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek to negative or overflowing position",
                    )
                })?
            }
            SeekFrom::End(delta) => {
                let total = self.length().map_err(io::Error::other)?;
                total.checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek to negative or overflowing position",
                    )
                })?
            }
        };
        self.seek_to(target).map_err(io::Error::other)?;
        Ok(target)
    }
}

async fn run_producer(
    shared: Arc<SourceShared>,
    fetcher: Arc<dyn RangeFetcher>,
    url: String,
    mut codec: Option<ChunkCodec>,
    mut writer: std::fs::File,
    mut cancel: watch::Receiver<bool>,
) {
    let result = pump(
        &shared,
        fetcher.as_ref(),
        &url,
        codec.as_mut(),
        &mut writer,
        &mut cancel,
    )
    .await;

    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    match result {
        Ok(()) => {
            state.complete = true;
            if state.total_length.is_none() {
                state.total_length = Some(state.bytes_written);
            }
        }
        Err(err) if err.is_cancelled() => {
            state.cancelled = true;
        }
        Err(err) => {
            tracing::warn!("stream download failed for {}: {}", url, err);
            state.failed = Some(err.to_string());
        }
    }
    drop(state);
    shared.notify();
}

async fn pump(
    shared: &SourceShared,
    fetcher: &dyn RangeFetcher,
    url: &str,
    mut codec: Option<&mut ChunkCodec>,
    writer: &mut std::fs::File,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    if *cancel.borrow() {
        return Err(HarmonyError::Cancelled);
    }

    let response = fetcher.fetch(url, None).await?;
    if let Some(length) = response.content_length {
        let mut state = shared.lock()?;
        if state.total_length.is_none() {
            state.total_length = Some(length);
        }
        drop(state);
        shared.notify();
    }

    let mut stream = response.stream;
    let mut out = Vec::with_capacity(8 * 1024);
    loop {
        let next = tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(HarmonyError::Cancelled);
                }
                continue;
            }
            next = futures_util::StreamExt::next(&mut stream) => next,
        };

        let Some(next) = next else { break };
        let bytes = next?;

        out.clear();
        match codec.as_deref_mut() {
            Some(codec) => codec.feed(&bytes, &mut out)?,
            None => out.extend_from_slice(&bytes),
        }
        commit(shared, writer, &out, bytes.len() as u64)?;
    }

    out.clear();
    if let Some(codec) = codec.as_deref_mut() {
        codec.flush(&mut out);
    }
    commit(shared, writer, &out, 0)?;
    Ok(())
}

/// Append cleartext and advance the counters. The write completes before
/// `bytes_written` moves, so a reader never sees bytes that are not on disk.
fn commit(
    shared: &SourceShared,
    writer: &mut std::fs::File,
    data: &[u8],
    downloaded: u64,
) -> Result<()> {
    if !data.is_empty() {
        writer.write_all(data)?;
    }
    let mut state = shared.lock()?;
    state.bytes_downloaded += downloaded;
    state.bytes_written += data.len() as u64;
    drop(state);
    shared.notify();
    Ok(())
}
