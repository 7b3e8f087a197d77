//! Per-chunk AES-128-GCM.
//!
//! The additional data binds a chunk to its buffer, generation and offset, so a
//! chunk replayed into another slot or round fails authentication.

use bag_protocol::AuthTag;
use bytes::{Bytes, BytesMut};
use ring::aead::{Aad, Nonce, Tag};

use crate::{
    crypto_key::{ChunkNonce, CryptoKeyState, KeyFlags},
    error::{MeshError, MeshResult},
    node::NodeId,
};

pub const AAD_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkContext {
    pub buffer_id: u64,
    pub generation: u64,
    pub offset: u64,
}

impl ChunkContext {
    pub fn aad(&self) -> [u8; AAD_LEN] {
        let mut aad = [0u8; AAD_LEN];
        aad[..8].copy_from_slice(&self.buffer_id.to_be_bytes());
        aad[8..16].copy_from_slice(&self.generation.to_be_bytes());
        aad[16..].copy_from_slice(&self.offset.to_be_bytes());
        aad
    }

    fn auth_failed(&self) -> MeshError {
        MeshError::AuthFailed {
            buffer_id: self.buffer_id,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub payload: Bytes,
    pub tag: AuthTag,
    pub nonce: ChunkNonce,
}

/// Encrypts a chunk originated by `origin` under a fresh nonce.
pub fn seal_chunk(
    key: &CryptoKeyState,
    origin: NodeId,
    context: ChunkContext,
    plaintext: &[u8],
) -> MeshResult<SealedChunk> {
    let nonce = key.get_nonce(origin)?;
    let mut in_out = BytesMut::from(plaintext);
    let tag = key
        .aead_key()
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce.to_bytes()),
            Aad::from(context.aad()),
            &mut in_out,
        )
        .map_err(|_| MeshError::InvalidKey("chunk too large to seal".into()))?;
    let mut tag_bytes = [0u8; 16];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok(SealedChunk {
        payload: in_out.freeze(),
        tag: AuthTag::from(tag_bytes),
        nonce,
    })
}

/// Verifies and decrypts a chunk claimed to originate at `origin`.
pub fn open_chunk(
    key: &CryptoKeyState,
    origin: NodeId,
    context: ChunkContext,
    ciphertext: &[u8],
    tag: &AuthTag,
    nonce: ChunkNonce,
) -> MeshResult<Bytes> {
    if !key.flags().contains(KeyFlags::DECRYPT) {
        return Err(MeshError::InvalidKey(format!(
            "key for {} is not installed for decryption",
            key.mask()
        )));
    }
    if key.prefix_of(origin) != Some(nonce.prefix) {
        return Err(context.auth_failed());
    }
    let mut in_out = BytesMut::from(ciphertext);
    key.aead_key()
        .open_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce.to_bytes()),
            Aad::from(context.aad()),
            Tag::from(tag.0),
            &mut in_out,
            0..,
        )
        .map_err(|_| context.auth_failed())?;
    Ok(in_out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto_key::KeyLimits, node::NodeMask};

    fn key() -> CryptoKeyState {
        CryptoKeyState::new(
            NodeMask::first_n(3),
            b"sixteen byte key",
            KeyFlags::ENCRYPT | KeyFlags::DECRYPT,
            KeyLimits {
                max_buffers: 10,
                max_seconds: 3600,
            },
        )
        .unwrap()
    }

    fn n(rank: u8) -> NodeId {
        NodeId::new(rank).unwrap()
    }

    const CTX: ChunkContext = ChunkContext {
        buffer_id: 7,
        generation: 3,
        offset: 4096,
    };

    #[test]
    fn test_seal_then_open() {
        let key = key();
        let plaintext = vec![0xAB; 1000];
        let sealed = seal_chunk(&key, n(1), CTX, &plaintext).unwrap();
        assert_ne!(&sealed.payload[..], &plaintext[..]);
        let opened = open_chunk(&key, n(1), CTX, &sealed.payload, &sealed.tag, sealed.nonce).unwrap();
        assert_eq!(&opened[..], &plaintext[..]);
    }

    #[test]
    fn test_wrong_context_fails() {
        let key = key();
        let sealed = seal_chunk(&key, n(0), CTX, b"payload").unwrap();
        let moved = ChunkContext {
            offset: 8192,
            ..CTX
        };
        assert!(matches!(
            open_chunk(&key, n(0), moved, &sealed.payload, &sealed.tag, sealed.nonce),
            Err(MeshError::AuthFailed {
                buffer_id: 7,
                offset: 8192
            })
        ));
        let next_round = ChunkContext {
            generation: 4,
            ..CTX
        };
        assert!(open_chunk(&key, n(0), next_round, &sealed.payload, &sealed.tag, sealed.nonce)
            .is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let key = key();
        let sealed = seal_chunk(&key, n(0), CTX, b"payload").unwrap();
        let mut corrupted = sealed.payload.to_vec();
        corrupted[0] ^= 1;
        assert!(open_chunk(&key, n(0), CTX, &corrupted, &sealed.tag, sealed.nonce).is_err());

        let mut tag = sealed.tag;
        tag.0[15] ^= 1;
        assert!(open_chunk(&key, n(0), CTX, &sealed.payload, &tag, sealed.nonce).is_err());
    }

    #[test]
    fn test_origin_prefix_enforced() {
        let key = key();
        let sealed = seal_chunk(&key, n(0), CTX, b"payload").unwrap();
        assert!(matches!(
            open_chunk(&key, n(2), CTX, &sealed.payload, &sealed.tag, sealed.nonce),
            Err(MeshError::AuthFailed { .. })
        ));
    }
}
