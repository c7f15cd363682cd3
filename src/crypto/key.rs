use md5::{Digest, Md5};

/// Length of a derived track key in bytes, as required by Blowfish here.
pub const KEY_LENGTH: usize = 16;

/// Fixed master secret of the stream obfuscation scheme.
const BF_SECRET: &[u8; KEY_LENGTH] = b"g4el58wc0zvf9na1";

/// Per-track Blowfish key.
///
/// Derived from the ASCII hex digest of the track id, not the raw MD5
/// bytes: `key[i] = hex[i] ^ hex[i + 16] ^ secret[i]`. Interoperability
/// depends on XOR-ing the hex *characters*.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TrackKey([u8; KEY_LENGTH]);

impl TrackKey {
    pub fn for_track_id(track_id: &str) -> Self {
        let track_hash = format!("{:x}", Md5::digest(track_id.as_bytes()));
        let track_hash = track_hash.as_bytes();

        let mut key = [0u8; KEY_LENGTH];
        for i in 0..KEY_LENGTH {
            key[i] = track_hash[i] ^ track_hash[i + KEY_LENGTH] ^ BF_SECRET[i];
        }
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}
