//! Security Access seed→key computation (C5): a closed set of built-in
//! algorithms plus one opaque, externally-provided variant (spec §9:
//! "dynamic dispatch on algorithms -> tagged sum").

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SecurityError;

/// An externally supplied `(level, seed) -> key` computation, treated as a
/// black box.
pub type ExternalProvider = Arc<
    dyn Fn(u8, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> + Send + Sync,
>;

/// The closed set of seed/key algorithms, plus one opaque escape hatch.
/// New algorithms are added by extending this enum, not by subclassing
/// (spec §9).
#[derive(Clone)]
pub enum Algorithm {
    /// `key[i] = seed[i] XOR ((S >> (8*(i%2))) & 0xFF)`, 16-bit constant S.
    Xor { constant: u16 },
    /// `key[i] = (seed[i] + ((S >> (8*(i%2))) & 0xFF)) mod 256`.
    Add { constant: u16 },
    /// `key[i] = (~seed[i]) & 0xFF`.
    Complement,
    /// CRC16-CCITT (poly 0x1021, init 0xFFFF) of the whole seed, emitted
    /// big-endian and right-padded with 0x00 to the seed's length.
    Crc16Ccitt,
    /// Delegates to an external callable under a 500ms wall-clock deadline.
    External(ExternalProvider),
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Xor { constant } => write!(f, "Xor {{ constant: {constant:#06x} }}"),
            Algorithm::Add { constant } => write!(f, "Add {{ constant: {constant:#06x} }}"),
            Algorithm::Complement => write!(f, "Complement"),
            Algorithm::Crc16Ccitt => write!(f, "Crc16Ccitt"),
            Algorithm::External(_) => write!(f, "External(..)"),
        }
    }
}

pub const DEFAULT_XOR_CONSTANT: u16 = 0x1234;
pub const DEFAULT_ADD_CONSTANT: u16 = 0x5678;
/// Wall-clock deadline applied to the opaque external provider (spec §4.5).
pub const EXTERNAL_PROVIDER_DEADLINE: Duration = Duration::from_millis(500);

/// Computes seed->key responses for UDS Security Access (service 0x27).
pub struct SecurityEngine;

impl SecurityEngine {
    /// All-zero seeds mean "already unlocked at this level" (spec §4.4);
    /// callers should check this *before* calling `compute_key` and skip
    /// the key step entirely.
    pub fn seed_means_already_unlocked(seed: &[u8]) -> bool {
        !seed.is_empty() && seed.iter().all(|&b| b == 0)
    }

    pub async fn compute_key(algorithm: &Algorithm, level: u8, seed: &[u8]) -> Result<Vec<u8>, SecurityError> {
        match algorithm {
            Algorithm::Xor { constant } => Ok(xor(seed, *constant)),
            Algorithm::Add { constant } => Ok(add(seed, *constant)),
            Algorithm::Complement => Ok(complement(seed)),
            Algorithm::Crc16Ccitt => Ok(crc16_key(seed)),
            Algorithm::External(provider) => {
                let fut = provider(level, seed.to_vec());
                match tokio::time::timeout(EXTERNAL_PROVIDER_DEADLINE, fut).await {
                    Ok(Ok(key)) => Ok(key),
                    Ok(Err(msg)) => Err(SecurityError::ProviderFailed(msg)),
                    Err(_) => Err(SecurityError::ProviderTimeout),
                }
            }
        }
    }
}

fn xor(seed: &[u8], constant: u16) -> Vec<u8> {
    seed.iter()
        .enumerate()
        .map(|(i, &b)| b ^ ((constant >> (8 * (i % 2))) & 0xFF) as u8)
        .collect()
}

fn add(seed: &[u8], constant: u16) -> Vec<u8> {
    seed.iter()
        .enumerate()
        .map(|(i, &b)| (b as u16 + ((constant >> (8 * (i % 2))) & 0xFF)) as u8)
        .collect()
}

fn complement(seed: &[u8]) -> Vec<u8> {
    seed.iter().map(|&b| !b).collect()
}

/// CRC16-CCITT, poly 0x1021, init 0xFFFF, no reflection, no final XOR.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

fn crc16_key(seed: &[u8]) -> Vec<u8> {
    let crc = crc16_ccitt(seed);
    let mut key = vec![(crc >> 8) as u8, (crc & 0xFF) as u8];
    key.resize(seed.len(), 0x00);
    key
}
