//! Symmetric keys per node-participation mask, with per-node nonce state and
//! rotation limits.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use bitflags::bitflags;
use parking_lot::Mutex;
use ring::aead::{LessSafeKey, UnboundKey, AES_128_GCM};
use tracing as log;

use crate::{
    config::MeshConfig,
    error::{ExhaustionReason, MeshError, MeshResult},
    node::{NodeId, NodeMask, MAX_NODES},
};

pub const MAX_KEY_LEN: usize = 16;
pub const NONCE_PREFIX_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
/// Nonces a node may draw before the key must rotate.
pub const NONCE_LIMIT: u64 = 1 << 32;

const PREFIX_CONTEXT: &str = "bag-mesh 2025-06 chunk nonce prefix";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyFlags: u8 {
        const ENCRYPT = 0b01;
        const DECRYPT = 0b10;
    }
}

/// `prefix || counter`, never repeated for one key and node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkNonce {
    pub prefix: [u8; NONCE_PREFIX_LEN],
    pub counter: u32,
}

impl ChunkNonce {
    pub fn to_bytes(self) -> [u8; NONCE_LEN] {
        let mut out = [0u8; NONCE_LEN];
        out[..NONCE_PREFIX_LEN].copy_from_slice(&self.prefix);
        out[NONCE_PREFIX_LEN..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&bytes[..NONCE_PREFIX_LEN]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&bytes[NONCE_PREFIX_LEN..]);
        Self {
            prefix,
            counter: u32::from_be_bytes(counter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits {
    pub max_buffers: u64,
    pub max_seconds: u64,
}

impl From<&MeshConfig> for KeyLimits {
    fn from(config: &MeshConfig) -> Self {
        Self {
            max_buffers: config.max_buffers_per_key,
            max_seconds: config.max_key_seconds,
        }
    }
}

const NOT_EXHAUSTED: u8 = 0;

fn reason_code(reason: ExhaustionReason) -> u8 {
    match reason {
        ExhaustionReason::Buffers => 1,
        ExhaustionReason::Time => 2,
        ExhaustionReason::Nonces => 3,
    }
}

fn reason_from_code(code: u8) -> Option<ExhaustionReason> {
    match code {
        1 => Some(ExhaustionReason::Buffers),
        2 => Some(ExhaustionReason::Time),
        3 => Some(ExhaustionReason::Nonces),
        _ => None,
    }
}

/// Derives the nonce prefix for `node`: its rank followed by seven key-bound bytes.
pub fn nonce_prefix(key: &[u8], node: NodeId) -> [u8; NONCE_PREFIX_LEN] {
    let mut material = Vec::with_capacity(key.len() + 1);
    material.extend_from_slice(key);
    material.push(node.rank());
    let derived = blake3::derive_key(PREFIX_CONTEXT, &material);
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix[0] = node.rank();
    prefix[1..].copy_from_slice(&derived[..NONCE_PREFIX_LEN - 1]);
    prefix
}

pub struct CryptoKeyState {
    mask: NodeMask,
    flags: KeyFlags,
    aead_key: LessSafeKey,
    prefixes: [[u8; NONCE_PREFIX_LEN]; MAX_NODES],
    counters: [AtomicU64; MAX_NODES],
    buffers_used: AtomicU64,
    installed_at: Instant,
    exhausted: AtomicU8,
    limits: KeyLimits,
}

impl std::fmt::Debug for CryptoKeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoKeyState")
            .field("mask", &self.mask)
            .field("flags", &self.flags)
            .field("buffers_used", &self.buffers_used.load(Ordering::Relaxed))
            .field("exhausted", &self.exhaustion())
            .finish_non_exhaustive()
    }
}

impl CryptoKeyState {
    pub fn new(mask: NodeMask, key: &[u8], flags: KeyFlags, limits: KeyLimits) -> MeshResult<Self> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(MeshError::InvalidKey(format!(
                "key length {} not in 1..={}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if mask.is_empty() {
            return Err(MeshError::InvalidKey("empty node mask".into()));
        }
        let mut padded = [0u8; MAX_KEY_LEN];
        padded[..key.len()].copy_from_slice(key);
        let unbound = UnboundKey::new(&AES_128_GCM, &padded)
            .map_err(|_| MeshError::InvalidKey("rejected by AES-128-GCM".into()))?;

        let mut prefixes = [[0u8; NONCE_PREFIX_LEN]; MAX_NODES];
        for node in mask.iter() {
            prefixes[node.index()] = nonce_prefix(&padded, node);
        }

        Ok(Self {
            mask,
            flags,
            aead_key: LessSafeKey::new(unbound),
            prefixes,
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            buffers_used: AtomicU64::new(0),
            installed_at: Instant::now(),
            exhausted: AtomicU8::new(NOT_EXHAUSTED),
            limits,
        })
    }

    pub fn mask(&self) -> NodeMask {
        self.mask
    }

    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    pub(crate) fn aead_key(&self) -> &LessSafeKey {
        &self.aead_key
    }

    pub fn buffers_used(&self) -> u64 {
        self.buffers_used.load(Ordering::Acquire)
    }

    pub fn seconds_active(&self) -> u64 {
        self.installed_at.elapsed().as_secs()
    }

    pub fn exhaustion(&self) -> Option<ExhaustionReason> {
        reason_from_code(self.exhausted.load(Ordering::Acquire))
    }

    fn exhaust(&self, reason: ExhaustionReason) -> MeshError {
        if self
            .exhausted
            .compare_exchange(
                NOT_EXHAUSTED,
                reason_code(reason),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            log::warn!(mask = %self.mask, %reason, "Crypto key exhausted, rotation required");
        }
        MeshError::KeyExhausted {
            mask: self.mask.bits(),
            reason: self.exhaustion().unwrap_or(reason),
        }
    }

    fn check_usable(&self) -> MeshResult<()> {
        if let Some(reason) = self.exhaustion() {
            return Err(MeshError::KeyExhausted {
                mask: self.mask.bits(),
                reason,
            });
        }
        if self.installed_at.elapsed() > Duration::from_secs(self.limits.max_seconds) {
            return Err(self.exhaust(ExhaustionReason::Time));
        }
        Ok(())
    }

    /// Accounts one more buffer protected by this key.
    pub fn touch(&self) -> MeshResult<u64> {
        self.check_usable()?;
        let used = self.buffers_used.fetch_add(1, Ordering::AcqRel) + 1;
        if used > self.limits.max_buffers {
            return Err(self.exhaust(ExhaustionReason::Buffers));
        }
        Ok(used)
    }

    /// Returns a buffer accounted by `touch` that never started.
    pub fn untouch(&self) {
        let _ = self
            .buffers_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
    }

    /// Draws the next nonce `node` encrypts with.
    pub fn get_nonce(&self, node: NodeId) -> MeshResult<ChunkNonce> {
        if !self.flags.contains(KeyFlags::ENCRYPT) {
            return Err(MeshError::InvalidKey(format!(
                "key for {} is not installed for encryption",
                self.mask
            )));
        }
        if !self.mask.contains(node) {
            return Err(MeshError::InvalidNode(node.rank() as u32));
        }
        self.check_usable()?;
        let counter = self.counters[node.index()].fetch_add(1, Ordering::AcqRel);
        if counter >= NONCE_LIMIT {
            return Err(self.exhaust(ExhaustionReason::Nonces));
        }
        Ok(ChunkNonce {
            prefix: self.prefixes[node.index()],
            counter: counter as u32,
        })
    }

    /// Prefix a nonce drawn by `node` must carry.
    pub fn prefix_of(&self, node: NodeId) -> Option<[u8; NONCE_PREFIX_LEN]> {
        self.mask
            .contains(node)
            .then(|| self.prefixes[node.index()])
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&self, node: NodeId, value: u64) {
        self.counters[node.index()].store(value, Ordering::Release);
    }
}

/// Installed keys, one per node mask. Lookups are lock-free; installs are
/// serialized.
pub struct CryptoKeyStateArray {
    keys: ArcSwap<HashMap<NodeMask, Arc<CryptoKeyState>>>,
    install_lock: Mutex<()>,
    max_masks: usize,
    limits: KeyLimits,
}

impl CryptoKeyStateArray {
    pub fn new(max_masks: usize, limits: KeyLimits) -> Self {
        Self {
            keys: ArcSwap::from_pointee(HashMap::new()),
            install_lock: Mutex::new(()),
            max_masks,
            limits,
        }
    }

    pub fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.max_key_masks, KeyLimits::from(config))
    }

    /// Installs or replaces the key for `mask`, resetting nonce counters and usage.
    pub fn set_key(&self, mask: NodeMask, key: &[u8], flags: KeyFlags) -> MeshResult<()> {
        let state = Arc::new(CryptoKeyState::new(mask, key, flags, self.limits)?);
        let _guard = self.install_lock.lock();
        let current = self.keys.load();
        if !current.contains_key(&mask) && current.len() >= self.max_masks {
            log::error!(%mask, max = self.max_masks, "Crypto key table full");
            return Err(MeshError::KeyTableFull(self.max_masks));
        }
        let mut next = HashMap::clone(&current);
        next.insert(mask, state);
        self.keys.store(Arc::new(next));
        log::info!(%mask, ?flags, "Installed crypto key");
        Ok(())
    }

    pub fn remove_key(&self, mask: NodeMask) -> bool {
        let _guard = self.install_lock.lock();
        let current = self.keys.load();
        if !current.contains_key(&mask) {
            return false;
        }
        let mut next = HashMap::clone(&current);
        next.remove(&mask);
        self.keys.store(Arc::new(next));
        true
    }

    pub fn get(&self, mask: NodeMask) -> MeshResult<Arc<CryptoKeyState>> {
        self.keys
            .load()
            .get(&mask)
            .cloned()
            .ok_or(MeshError::KeyNotInstalled(mask.bits()))
    }

    pub fn touch(&self, mask: NodeMask) -> MeshResult<u64> {
        self.get(mask)?.touch()
    }

    pub fn get_nonce(&self, mask: NodeMask, node: NodeId) -> MeshResult<ChunkNonce> {
        self.get(mask)?.get_nonce(node)
    }

    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
