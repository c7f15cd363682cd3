use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::TrackDescriptor;

/// URL scheme the host runtime hands to the asset layer for encrypted
/// tracks: `deezer-enc://{trackId}`.
pub const TRACK_URL_SCHEME: &str = "deezer-enc";

/// Process-wide map from track id to fetch parameters.
///
/// The host registers a descriptor before constructing the asset and
/// removes it explicitly when playback ends or fails; the registry never
/// owns the consumer. Lookups are safe from any thread.
pub struct TrackRegistry {
    inner: Mutex<HashMap<String, TrackDescriptor>>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a descriptor and return the playback URL for it.
    pub fn register(&self, descriptor: TrackDescriptor) -> String {
        let url = track_url(&descriptor.track_id);
        self.inner
            .lock()
            .expect("track registry lock poisoned")
            .insert(descriptor.track_id.clone(), descriptor);
        url
    }

    pub fn lookup(&self, track_id: &str) -> Option<TrackDescriptor> {
        self.inner
            .lock()
            .expect("track registry lock poisoned")
            .get(track_id)
            .cloned()
    }

    pub fn unregister(&self, track_id: &str) -> Option<TrackDescriptor> {
        self.inner
            .lock()
            .expect("track registry lock poisoned")
            .remove(track_id)
    }
}

impl Default for TrackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn track_url(track_id: &str) -> String {
    format!("{TRACK_URL_SCHEME}://{track_id}")
}

/// Extract the track id from a `deezer-enc://` URL, if it is one.
pub fn parse_track_url(url: &str) -> Option<&str> {
    url.strip_prefix(TRACK_URL_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .filter(|id| !id.is_empty())
}
