use blowfish::Blowfish;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::crypto::key::TrackKey;
use crate::errors::{HarmonyError, Result};

type BlowfishCbcDec = cbc::Decryptor<Blowfish>;
type BlowfishCbcEnc = cbc::Encryptor<Blowfish>;

/// Fixed IV of the scheme. The cipher is re-initialized for every chunk, so
/// CBC chaining never crosses a chunk boundary.
pub const CBC_IV: [u8; 8] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

/// Decrypt one encrypted chunk. `chunk` must be a multiple of the Blowfish
/// block size; the codec only ever passes full 2048-byte chunks.
pub fn decrypt_chunk(key: &TrackKey, chunk: &[u8]) -> Result<Vec<u8>> {
    let cipher = BlowfishCbcDec::new_from_slices(key.as_bytes(), &CBC_IV)
        .map_err(|e| HarmonyError::Crypto(e.to_string()))?;

    let mut buffer = chunk.to_vec();
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| HarmonyError::Crypto(e.to_string()))?;
    Ok(buffer)
}

/// Inverse of [`decrypt_chunk`]. Production code never encrypts; this exists
/// for the round-trip property and for building test fixtures.
pub fn encrypt_chunk(key: &TrackKey, chunk: &[u8]) -> Result<Vec<u8>> {
    let cipher = BlowfishCbcEnc::new_from_slices(key.as_bytes(), &CBC_IV)
        .map_err(|e| HarmonyError::Crypto(e.to_string()))?;

    let mut buffer = chunk.to_vec();
    let len = buffer.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
        .map_err(|e| HarmonyError::Crypto(e.to_string()))?;
    Ok(buffer)
}
