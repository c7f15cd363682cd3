use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use memmap2::MmapOptions;

use crate::models::{AudioFormat, Provider};

/// Owns the on-disk layout of the engine's data directory:
///
/// ```text
/// {data}/downloads/tracks/{provider}_{trackId}.{flac|mp3|m4a}
/// {data}/downloads/artwork/{provider}_{trackId}.jpg
/// {data}/tmp/           in-flight transfer spool
/// {data}/harmony.db
/// ```
#[derive(Clone)]
pub struct FileManager {
    data_dir: PathBuf,
}

impl FileManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn tracks_dir(&self) -> PathBuf {
        self.data_dir.join("downloads").join("tracks")
    }

    pub fn artwork_dir(&self) -> PathBuf {
        self.data_dir.join("downloads").join("artwork")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Create the directory layout. Idempotent.
    pub fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.tracks_dir())?;
        fs::create_dir_all(self.artwork_dir())?;
        fs::create_dir_all(self.temp_dir())?;
        Ok(())
    }

    pub fn track_path(&self, provider: Provider, track_id: &str, format: AudioFormat) -> PathBuf {
        self.tracks_dir().join(format!(
            "{}_{}.{}",
            provider.as_str(),
            track_id,
            format.extension()
        ))
    }

    pub fn artwork_path(&self, provider: Provider, track_id: &str) -> PathBuf {
        self.artwork_dir()
            .join(format!("{}_{}.jpg", provider.as_str(), track_id))
    }

    pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let temp_path = path.with_extension("tmp");
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&temp_path)?;
        use std::io::Write;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(temp_path, path)?;
        Ok(())
    }

    pub fn mmap_read(&self, path: &Path) -> io::Result<Mmap> {
        let file = File::open(path)?;
        unsafe { MmapOptions::new().map(&file) }
    }
}
