//! LoRaWAN cryptographic operations
//!
//! This module provides the LoRaWAN 1.0.x security primitives used by the
//! network server:
//! - Message Integrity Code (MIC) computation for data and join frames
//! - FRMPayload encryption/decryption
//! - Join accept encryption
//! - Session key derivation

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr, NetId};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cmac(key: &AESKey, chunks: &[&[u8]]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.as_bytes().into());
    for chunk in chunks {
        mac.update(chunk);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Compute the MIC of a data frame
///
/// # Arguments
/// * `key` - Network session key
/// * `data` - MHDR | FHDR | FPort | FRMPayload
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
pub fn compute_mic(
    key: &AESKey,
    data: &[u8],
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
) -> [u8; MIC_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = data.len() as u8;
    cmac(key, &[&b0, data])
}

/// Compute the MIC of a join request or join accept
///
/// # Arguments
/// * `key` - Application key
/// * `data` - Message bytes without MIC
pub fn compute_join_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    cmac(key, &[data])
}

/// Encrypt or decrypt FRMPayload (AES-128 in counter mode)
///
/// # Arguments
/// * `key` - AppSKey, or NwkSKey when FPort is 0
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
/// * `payload` - Data to encrypt/decrypt
pub fn encrypt_payload(
    key: &AESKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = Aes128::new(key.as_bytes().into());
    let mut result = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        cipher.encrypt_block((&mut a).into());
        result.extend(chunk.iter().zip(a.iter()).map(|(p, s)| p ^ s));
    }

    result
}

/// Encrypt a join accept (MACPayload | MIC).
///
/// The network applies AES decryption so the device only needs the
/// encrypt primitive.
pub fn encrypt_join_accept(key: &AESKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.as_bytes().into());
    let mut result = Vec::with_capacity(data.len());

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        result.extend_from_slice(&block[..chunk.len()]);
    }

    result
}

/// Reverse of [`encrypt_join_accept`], as performed by the device
pub fn decrypt_join_accept(key: &AESKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.as_bytes().into());
    let mut result = Vec::with_capacity(data.len());

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        result.extend_from_slice(&block[..chunk.len()]);
    }

    result
}

/// Derive network and application session keys after a join
///
/// # Arguments
/// * `app_key` - Application key
/// * `app_nonce` - AppNonce/JoinNonce as sent on the wire
/// * `net_id` - Network ID
/// * `dev_nonce` - Device nonce from the join request
pub fn derive_session_keys(
    app_key: &AESKey,
    app_nonce: &[u8; 3],
    net_id: NetId,
    dev_nonce: u16,
) -> (AESKey, AESKey) {
    let cipher = Aes128::new(app_key.as_bytes().into());

    let derive = |prefix: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = prefix;
        block[1..4].copy_from_slice(app_nonce);
        block[4..7].copy_from_slice(&net_id.to_le_bytes());
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block((&mut block).into());
        AESKey::new(block)
    };

    (derive(0x01), derive(0x02))
}
