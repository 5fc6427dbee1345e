//! Extensible-digest authentication (request subtype 13).
//!
//! The server names an algorithm by index from a closed set and supplies a
//! salt plus its own nonce; the client answers with
//! `hash(server_nonce || hash(password || salt))` and a fresh nonce of its
//! own, derived from the current time.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use sha2::{Digest, Sha256};

use crate::errors::Error;

/// The closed algorithm set; the selector is an index into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn from_index(index: i32) -> Result<DigestAlgorithm, Error> {
        match index {
            0 => Ok(DigestAlgorithm::Sha256),
            other => Err(Error::NotSupported(format!(
                "digest algorithm index {other}"
            ))),
        }
    }

    fn hash(self, input: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(input).to_vec(),
        }
    }
}

/// The server's digest challenge: algorithm, salt and server nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub algorithm: DigestAlgorithm,
    pub salt: Vec<u8>,
    pub server_nonce: Vec<u8>,
}

impl DigestChallenge {
    /// Parse the challenge payload following the request subtype.
    pub fn parse(message: &mut BytesMut) -> Result<DigestChallenge, Error> {
        if message.remaining() < 8 {
            return Err(Error::ProtocolViolation("digest challenge is truncated".into()));
        }
        let algorithm = DigestAlgorithm::from_index(message.get_i32())?;
        let salt_len = message.get_i32();
        if salt_len < 0 || message.remaining() < salt_len as usize + 4 {
            return Err(Error::ProtocolViolation("digest challenge is truncated".into()));
        }
        let salt = message.split_to(salt_len as usize).to_vec();
        let nonce_len = message.get_i32();
        if nonce_len < 0 || message.remaining() < nonce_len as usize {
            return Err(Error::ProtocolViolation("digest challenge is truncated".into()));
        }
        let server_nonce = message.split_to(nonce_len as usize).to_vec();
        Ok(DigestChallenge {
            algorithm,
            salt,
            server_nonce,
        })
    }

    /// Compute the response digest for the given password.
    pub fn digest(&self, password: &str) -> Vec<u8> {
        let mut inner = Vec::with_capacity(password.len() + self.salt.len());
        inner.extend_from_slice(password.as_bytes());
        inner.extend_from_slice(&self.salt);
        let inner_hash = self.algorithm.hash(&inner);

        let mut outer = Vec::with_capacity(self.server_nonce.len() + inner_hash.len());
        outer.extend_from_slice(&self.server_nonce);
        outer.extend_from_slice(&inner_hash);
        self.algorithm.hash(&outer)
    }
}

/// A fresh client nonce: the current time in nanoseconds, big-endian.
pub fn client_nonce() -> Vec<u8> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos.to_be_bytes().to_vec()
}
