//! Engine entry point: owns the long-lived services and hands out ready
//! input sources, range loaders, and the download bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::crypto::CipherFallback;
use crate::db::Database;
use crate::errors::{HarmonyError, Result};
use crate::models::{ContentType, TrackDescriptor};
use crate::services::download_manager::{DownloadEvent, DownloadManager, Remuxer};
use crate::services::fetcher::{HttpRangeFetcher, RangeFetcher};
use crate::services::input_source::StreamingInputSource;
use crate::services::range_loader::RangeResourceLoader;
use crate::services::registry::{self, TrackRegistry};
use crate::utils::file::FileManager;

#[derive(Default)]
pub struct EngineConfig {
    /// Root of the persisted layout. Falls back to `HARMONY_DATA_DIR`, then
    /// to `./harmony-data`.
    pub data_dir: Option<PathBuf>,
    /// Transfer slots for the download manager (default 2, env override
    /// `HARMONY_MAX_CONCURRENT_DOWNLOADS`, clamped to 1..=8).
    pub max_concurrent_downloads: Option<usize>,
    pub cipher_fallback: CipherFallback,
    /// Container remux collaborator for YouTube downloads.
    pub remuxer: Option<Arc<dyn Remuxer>>,
    /// Transport override, mainly for tests.
    pub fetcher: Option<Arc<dyn RangeFetcher>>,
}

pub struct Engine {
    files: FileManager,
    fetcher: Arc<dyn RangeFetcher>,
    registry: TrackRegistry,
    downloads: DownloadManager,
    runtime: Handle,
    cipher_fallback: CipherFallback,
}

impl Engine {
    /// Must be called from within a tokio runtime; the engine captures the
    /// handle to spawn producer and transfer tasks on.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            HarmonyError::Config("engine must be constructed inside a tokio runtime".to_string())
        })?;

        let data_dir = resolve_data_dir(config.data_dir)?;
        let files = FileManager::new(data_dir.clone());
        files.ensure_layout()?;

        let db = Database::new(data_dir.join("harmony.db"))?;
        db.run_migrations()?;

        let fetcher = config
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpRangeFetcher::new()));
        let downloads = DownloadManager::new(
            db,
            files.clone(),
            Arc::clone(&fetcher),
            runtime.clone(),
            config.cipher_fallback,
            config.remuxer,
            config.max_concurrent_downloads,
        )?;

        Ok(Self {
            files,
            fetcher,
            registry: TrackRegistry::new(),
            downloads,
            runtime,
            cipher_fallback: config.cipher_fallback,
        })
    }

    pub fn data_dir(&self) -> &Path {
        self.files.data_dir()
    }

    /// Register a track for playback and return its `deezer-enc://` URL.
    pub fn register_track(
        &self,
        track_id: &str,
        encrypted_url: &str,
        content_length: u64,
        content_type: &str,
    ) -> String {
        self.registry.register(TrackDescriptor {
            track_id: track_id.to_string(),
            url: encrypted_url.to_string(),
            content_length,
            content_type: ContentType::from_hint(content_type),
        })
    }

    pub fn unregister_track(&self, track_id: &str) {
        self.registry.unregister(track_id);
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    /// Decrypting source for a registered track. Unlike the loader path
    /// this fails loudly: a caller naming a track explicitly wants the
    /// decryption pipeline attached.
    pub fn open_deezer_source(&self, track_id: &str) -> Result<StreamingInputSource> {
        let descriptor = self.registry.lookup(track_id).ok_or_else(|| {
            HarmonyError::NotFound(format!("track {track_id} is not registered"))
        })?;
        Ok(StreamingInputSource::deezer(
            &descriptor,
            Arc::clone(&self.fetcher),
            self.runtime.clone(),
            self.cipher_fallback,
        ))
    }

    /// Plain progressive source for any HTTP URL.
    pub fn open_progressive_source(&self, url: &str) -> StreamingInputSource {
        StreamingInputSource::progressive(
            url.to_string(),
            Arc::clone(&self.fetcher),
            self.runtime.clone(),
        )
    }

    /// The custom-URL intercept: `deezer-enc://` URLs resolve through the
    /// registry, everything else opens progressively.
    pub fn open_url(&self, url: &str) -> Result<StreamingInputSource> {
        match registry::parse_track_url(url) {
            Some(track_id) => self.open_deezer_source(track_id),
            None => Ok(self.open_progressive_source(url)),
        }
    }

    /// Range loader for a `deezer-enc://` URL. Fails open: an unregistered
    /// track yields `None`, no loader is attached, and the decoder will see
    /// ciphertext it cannot parse.
    pub fn loader_for_url(&self, url: &str) -> Option<RangeResourceLoader> {
        let track_id = registry::parse_track_url(url)?;
        let descriptor = self.registry.lookup(track_id)?;
        Some(RangeResourceLoader::new(
            descriptor,
            Arc::clone(&self.fetcher),
            self.runtime.clone(),
            self.cipher_fallback,
        ))
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }
}

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn resolve_data_dir(configured: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return ensure_dir(&path).ok_or_else(|| {
            HarmonyError::Config(format!("data dir {} is not usable", path.display()))
        });
    }

    if let Ok(value) = std::env::var("HARMONY_DATA_DIR") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if let Some(dir) = ensure_dir(&path) {
                return Ok(dir);
            }
        }
    }

    let fallback = PathBuf::from("harmony-data");
    ensure_dir(&fallback)
        .ok_or_else(|| HarmonyError::Config("no usable data directory".to_string()))
}
