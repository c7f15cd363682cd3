//! Byte-range servicing over the encrypted origin.
//!
//! Used when the decoder reads through HTTP-range-style data requests
//! instead of the push-pull input source. Each request is widened to the
//! 2048-byte grid, fetched with an HTTP `Range` header, run through a
//! range-mode codec, and trimmed back to the exact bytes asked for.
//! Requests are independent and may be in flight concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::crypto::{CipherFallback, RangeCodec, TrackKey, CHUNK_SIZE};
use crate::errors::{HarmonyError, Result};
use crate::models::TrackDescriptor;
use crate::services::fetcher::{ByteRange, RangeFetcher};

/// What the asset layer needs to know before issuing data requests.
#[derive(Clone, Debug)]
pub struct ContentInfo {
    pub content_length: u64,
    pub byte_range_access: bool,
    /// Uniform type identifier derived from the descriptor's content type.
    pub content_type: &'static str,
}

/// One data request from the decoder. Ids are caller-assigned and identify
/// the request for cancellation.
#[derive(Copy, Clone, Debug)]
pub struct DataRequest {
    pub id: u64,
    pub offset: u64,
    pub length: u64,
}

/// Receiver of a request's cleartext. `respond` is called zero or more
/// times with bytes in increasing-offset order, then `finish` exactly once.
/// A cancelled request gets neither.
pub trait DataSink: Send + Sync {
    fn respond(&self, data: &[u8]);
    fn finish(&self, result: Result<()>);
}

struct InFlight {
    cancel: watch::Sender<bool>,
}

/// Grid-aligned fetch window for a byte range. `drop_bytes` is what must be
/// discarded from the first decrypted chunk to land on the caller's offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct RangePlan {
    aligned_start: u64,
    aligned_end: u64,
    chunk_index: u64,
    drop_bytes: usize,
    effective_length: u64,
}

fn plan_range(offset: u64, length: u64, total: u64) -> RangePlan {
    let chunk = CHUNK_SIZE as u64;
    let aligned_start = offset / chunk * chunk;
    let aligned_end = (offset.saturating_add(length).div_ceil(chunk) * chunk).min(total);
    RangePlan {
        aligned_start,
        aligned_end,
        chunk_index: aligned_start / chunk,
        drop_bytes: (offset - aligned_start) as usize,
        effective_length: length.min(total - offset),
    }
}

pub struct RangeResourceLoader {
    descriptor: TrackDescriptor,
    key: TrackKey,
    fallback: CipherFallback,
    fetcher: Arc<dyn RangeFetcher>,
    runtime: Handle,
    requests: Arc<Mutex<HashMap<u64, InFlight>>>,
}

impl RangeResourceLoader {
    pub fn new(
        descriptor: TrackDescriptor,
        fetcher: Arc<dyn RangeFetcher>,
        runtime: Handle,
        fallback: CipherFallback,
    ) -> Self {
        let key = TrackKey::for_track_id(&descriptor.track_id);
        Self {
            descriptor,
            key,
            fallback,
            fetcher,
            runtime,
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn content_info(&self) -> ContentInfo {
        ContentInfo {
            content_length: self.descriptor.content_length,
            byte_range_access: true,
            content_type: self.descriptor.content_type.uti(),
        }
    }

    /// Start servicing a data request. Returns immediately; bytes and the
    /// final result arrive on the sink from a background task.
    pub fn begin_data_request(&self, request: DataRequest, sink: Arc<dyn DataSink>) {
        let total = self.descriptor.content_length;
        // A window past the end finishes short, here trivially so.
        if request.length == 0 || request.offset >= total {
            sink.finish(Ok(()));
            return;
        }

        let plan = plan_range(request.offset, request.length, total);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        if let Ok(mut map) = self.requests.lock() {
            map.insert(request.id, InFlight { cancel: cancel_tx });
        } else {
            sink.finish(Err(HarmonyError::Config(
                "range loader request map poisoned".to_string(),
            )));
            return;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let requests = Arc::clone(&self.requests);
        let url = self.descriptor.url.clone();
        let key = self.key;
        let fallback = self.fallback;
        self.runtime.spawn(async move {
            let result = run_data_request(
                fetcher,
                &url,
                key,
                fallback,
                plan,
                request.id,
                &requests,
                sink.as_ref(),
                &mut cancel_rx,
            )
            .await;

            // The map is authoritative: once the entry is gone the request
            // was cancelled and nobody is listening.
            let was_tracked = requests
                .lock()
                .map(|mut map| map.remove(&request.id).is_some())
                .unwrap_or(false);
            match result {
                Err(err) if err.is_cancelled() => {}
                result => {
                    if was_tracked {
                        sink.finish(result);
                    }
                }
            }
        });
    }

    /// Abort the underlying fetch and discard the request state. A late
    /// transport callback against the cancelled id becomes a no-op.
    pub fn cancel_data_request(&self, id: u64) {
        let entry = self
            .requests
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&id));
        if let Some(entry) = entry {
            let _ = entry.cancel.send(true);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.requests.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Deliver bytes while holding the request map lock, so a response can
/// never interleave with cancellation. Returns false once the id is gone.
fn respond_if_tracked(
    requests: &Mutex<HashMap<u64, InFlight>>,
    id: u64,
    sink: &dyn DataSink,
    data: &[u8],
) -> bool {
    let Ok(map) = requests.lock() else {
        return false;
    };
    if !map.contains_key(&id) {
        return false;
    }
    if !data.is_empty() {
        sink.respond(data);
    }
    true
}

#[allow(clippy::too_many_arguments)]
async fn run_data_request(
    fetcher: Arc<dyn RangeFetcher>,
    url: &str,
    key: TrackKey,
    fallback: CipherFallback,
    plan: RangePlan,
    id: u64,
    requests: &Mutex<HashMap<u64, InFlight>>,
    sink: &dyn DataSink,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    let response = fetcher
        .fetch(
            url,
            Some(ByteRange {
                start: plan.aligned_start,
                end: plan.aligned_end - 1,
            }),
        )
        .await?;

    let mut codec = RangeCodec::new(
        key,
        plan.chunk_index,
        plan.drop_bytes,
        plan.effective_length,
        fallback,
    );
    let mut stream = response.stream;
    let mut out = Vec::with_capacity(2 * CHUNK_SIZE);

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
        codec.feed(&bytes, &mut out)?;
        if !respond_if_tracked(requests, id, sink, &out) {
            return Err(HarmonyError::Cancelled);
        }
        if codec.is_done() {
            return Ok(());
        }
    }

    out.clear();
    codec.flush(&mut out);
    if !respond_if_tracked(requests, id, sink, &out) {
        return Err(HarmonyError::Cancelled);
    }
    Ok(())
}
