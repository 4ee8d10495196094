//! authenticated encryption for archives
//!
//! chacha20poly1305 with a 256-bit key. blob layout:
//!
//! ```text
//! ┌──────────┬──────────────────────┬─────────┐
//! │ nonce 12 │ ciphertext (len = p) │ tag 16  │
//! └──────────┴──────────────────────┴─────────┘
//! ```
//!
//! there is no header. both sides agree on the nonce width.
//! nonces are drawn from the os rng on every call and never accepted from
//! callers.

use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};

use crate::keys::{write_private, MasterKey};
use crate::{Error, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// smallest valid blob: nonce and tag around an empty plaintext
pub const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

/// encrypt `plaintext`, returning `nonce ‖ ciphertext ‖ tag`
pub fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// decrypt a blob produced by [`seal`]. any tag mismatch is
/// `Error::Authentication` and no plaintext bytes are returned.
pub fn open(key: &MasterKey, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < MIN_BLOB_LEN {
        return Err(Error::ArchiveTooShort {
            len: blob.len(),
            need: MIN_BLOB_LEN,
        });
    }

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Authentication)
}

/// read `src`, seal it, write the blob to `dst` with mode 0600
pub fn seal_file(key: &MasterKey, src: &Path, dst: &Path) -> Result<u64> {
    let plaintext = std::fs::read(src).map_err(|e| Error::io(src, e))?;
    let blob = seal(key, &plaintext)?;
    write_private(dst, &blob)?;
    Ok(blob.len() as u64)
}

/// read and open the archive at `path`
pub fn open_file(key: &MasterKey, path: &Path) -> Result<Vec<u8>> {
    let blob = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    open(key, &blob)
}
