use serde::{Deserialize, Serialize};

/// Payload hint for a registered track. The engine never parses the audio
/// itself; the hint is only surfaced to the decoder as a content type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Flac,
    Mpeg,
    Other,
}

impl ContentType {
    /// Lenient parse of the MIME-ish hints the upstream APIs hand over
    /// ("audio/flac", "FLAC", "audio/mpeg", "mp3", ...).
    pub fn from_hint(hint: &str) -> Self {
        let lower = hint.trim().to_ascii_lowercase();
        if lower.contains("flac") {
            ContentType::Flac
        } else if lower.contains("mpeg") || lower.contains("mp3") {
            ContentType::Mpeg
        } else {
            ContentType::Other
        }
    }

    /// Uniform type identifier reported to the asset layer.
    pub fn uti(self) -> &'static str {
        match self {
            ContentType::Flac => "org.xiph.flac",
            ContentType::Mpeg => "public.mp3",
            ContentType::Other => "public.audio",
        }
    }
}

/// Everything needed to open an encrypted stream for one track.
///
/// `content_length` is declared by the upstream API and is identical for
/// ciphertext and cleartext: decryption is length-preserving.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrackDescriptor {
    pub track_id: String,
    pub url: String,
    pub content_length: u64,
    pub content_type: ContentType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Deezer,
    Youtube,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Deezer => "deezer",
            Provider::Youtube => "youtube",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Flac,
    Mp3,
    M4a,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: f64,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Decrypting,
    Completed,
    Error,
}

/// Persistent record of one download task. The whole task map is serialized
/// to the settings store on every mutation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskRecord {
    pub task_id: String,
    pub url: String,
    pub track_id: String,
    pub provider: Provider,
    pub format: AudioFormat,
    #[serde(default)]
    pub artwork_url: Option<String>,
    pub metadata: TrackMetadata,
    pub status: DownloadStatus,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub artwork_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Bridge-facing view of a task, as returned by `get_downloads`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadSummary {
    pub task_id: String,
    pub provider: Provider,
    pub format: AudioFormat,
    pub status: DownloadStatus,
    pub metadata: TrackMetadata,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub artwork_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Parameters for enqueueing one download. Task ids are caller-chosen;
/// by convention `provider:trackId`, and scheduling order is ascending
/// lexicographic on the id.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EnqueueRequest {
    pub task_id: String,
    pub url: String,
    pub track_id: String,
    pub provider: Provider,
    pub format: AudioFormat,
    #[serde(default)]
    pub artwork_url: Option<String>,
    pub metadata: TrackMetadata,
}
