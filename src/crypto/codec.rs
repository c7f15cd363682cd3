use crate::crypto::cipher;
use crate::crypto::key::TrackKey;
use crate::errors::Result;

/// Size of one obfuscation chunk. The grid is aligned to the origin start.
pub const CHUNK_SIZE: usize = 2048;

/// Every `STRIPE_PERIOD`-th chunk (grid index 0, 3, 6, ...) is encrypted.
pub const STRIPE_PERIOD: u64 = 3;

/// What to do when a chunk fails to decrypt.
///
/// `Passthrough` emits the ciphertext chunk unmodified, so a bad chunk that
/// falls outside critical bitstream headers still yields audible audio.
/// `Fail` aborts the stream instead.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CipherFallback {
    #[default]
    Passthrough,
    Fail,
}

/// Stream-mode chunk codec: ciphertext in, cleartext out, starting at grid
/// offset 0 and running to the end of the stream.
///
/// Bytes may arrive in arbitrary pieces; the codec buffers until a full
/// chunk forms, applies the grid rule, and emits. [`ChunkCodec::flush`]
/// emits the residual short tail verbatim once the input is exhausted.
pub struct ChunkCodec {
    key: TrackKey,
    chunk_index: u64,
    buffer: Vec<u8>,
    fallback: CipherFallback,
}

impl ChunkCodec {
    pub fn new(key: TrackKey, fallback: CipherFallback) -> Self {
        Self::with_start_index(key, 0, fallback)
    }

    /// Start decoding mid-stream at a chunk-aligned grid position. The
    /// caller is responsible for feeding ciphertext that actually begins at
    /// `chunk_index * CHUNK_SIZE`.
    pub fn with_start_index(key: TrackKey, chunk_index: u64, fallback: CipherFallback) -> Self {
        Self {
            key,
            chunk_index,
            buffer: Vec::with_capacity(2 * CHUNK_SIZE),
            fallback,
        }
    }

    /// Append ciphertext and emit every full chunk that forms.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.buffer.extend_from_slice(input);

        while self.buffer.len() >= CHUNK_SIZE {
            let chunk: Vec<u8> = self.buffer.drain(..CHUNK_SIZE).collect();
            if self.chunk_index % STRIPE_PERIOD == 0 {
                match cipher::decrypt_chunk(&self.key, &chunk) {
                    Ok(plain) => out.extend_from_slice(&plain),
                    Err(err) => match self.fallback {
                        CipherFallback::Passthrough => {
                            tracing::warn!(
                                "chunk {} failed to decrypt, passing ciphertext through: {}",
                                self.chunk_index,
                                err
                            );
                            out.extend_from_slice(&chunk);
                        }
                        CipherFallback::Fail => return Err(err),
                    },
                }
            } else {
                out.extend_from_slice(&chunk);
            }
            self.chunk_index += 1;
        }

        Ok(())
    }

    /// Emit the residual tail. A final chunk shorter than `CHUNK_SIZE` is
    /// never encrypted, so this is a plain copy.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        if !self.buffer.is_empty() {
            out.append(&mut self.buffer);
            self.chunk_index += 1;
        }
    }

    /// Ciphertext bytes buffered but not yet emitted. Always `< CHUNK_SIZE`
    /// after a `feed` call returns.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Range-mode chunk codec: decodes a chunk-aligned ciphertext window and
/// trims it to the caller's exact byte range.
///
/// Fed with ciphertext starting at `chunk_index * CHUNK_SIZE`, it drops
/// `drop_bytes` cleartext bytes from the front (always after decryption,
/// always before the length cap) and emits at most `requested_length` bytes.
pub struct RangeCodec {
    inner: ChunkCodec,
    drop_bytes: usize,
    requested_length: u64,
    bytes_responded: u64,
    scratch: Vec<u8>,
}

impl RangeCodec {
    pub fn new(
        key: TrackKey,
        chunk_index: u64,
        drop_bytes: usize,
        requested_length: u64,
        fallback: CipherFallback,
    ) -> Self {
        Self {
            inner: ChunkCodec::with_start_index(key, chunk_index, fallback),
            drop_bytes,
            requested_length,
            bytes_responded: 0,
            scratch: Vec::with_capacity(2 * CHUNK_SIZE),
        }
    }

    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let result = self.inner.feed(input, &mut scratch);
        if result.is_ok() {
            self.emit(&scratch, out);
        }
        self.scratch = scratch;
        result
    }

    pub fn flush(&mut self, out: &mut Vec<u8>) {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        self.inner.flush(&mut scratch);
        self.emit(&scratch, out);
        self.scratch = scratch;
    }

    fn emit(&mut self, mut data: &[u8], out: &mut Vec<u8>) {
        if data.is_empty() || self.is_done() {
            return;
        }
        if self.drop_bytes > 0 {
            let discard = self.drop_bytes.min(data.len());
            data = &data[discard..];
            self.drop_bytes -= discard;
        }
        let room = self.requested_length - self.bytes_responded;
        let take = (data.len() as u64).min(room) as usize;
        out.extend_from_slice(&data[..take]);
        self.bytes_responded += take as u64;
    }

    /// True once the requested length has been fully served. The caller can
    /// stop feeding (and abort the underlying fetch) at this point.
    pub fn is_done(&self) -> bool {
        self.bytes_responded == self.requested_length
    }

    pub fn bytes_responded(&self) -> u64 {
        self.bytes_responded
    }
}
