//! AES-128-CBC segment decryption.
//!
//! HLS `METHOD=AES-128` encrypts whole segments with PKCS#7 padding. The IV is
//! either given by the key tag or derived from the media sequence number.

use aes::Aes128;
use bytes::Bytes;
use cbc::{
    Decryptor,
    cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7},
};

use crate::error::{HlsError, HlsResult};

/// IV for a segment without an explicit `IV=` attribute: the sequence number
/// as a big-endian 128-bit integer.
pub fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypts a whole segment and strips the padding.
pub fn decrypt_aes128_cbc(payload: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> HlsResult<Bytes> {
    if payload.is_empty() || payload.len() % 16 != 0 {
        return Err(HlsError::DecryptionFailed(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            payload.len()
        )));
    }

    let mut data = payload.to_vec();
    let decryptor = Decryptor::<Aes128>::new(key.into(), iv.into());
    let plain_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|e| HlsError::DecryptionFailed(format!("AES-128-CBC decryption failed: {e}")))?
        .len();
    data.truncate(plain_len);
    Ok(Bytes::from(data))
}
