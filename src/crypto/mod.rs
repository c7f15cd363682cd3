//! Deezer-scheme track decryption.
//!
//! The ciphertext is a sequence of 2048-byte chunks aligned to the origin
//! start; every third full chunk is Blowfish-CBC encrypted with a fixed IV
//! and a per-track key. Everything else, including the final short chunk,
//! is cleartext in place. Decryption is length-preserving.

pub mod cipher;
pub mod codec;
pub mod key;

pub use cipher::{decrypt_chunk, encrypt_chunk, CBC_IV};
pub use codec::{ChunkCodec, CipherFallback, RangeCodec, CHUNK_SIZE, STRIPE_PERIOD};
pub use key::{TrackKey, KEY_LENGTH};
