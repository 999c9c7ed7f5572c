use data_encoding::HEXLOWER;
use prost::Message;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::proto;

pub const SHA256_HEX_LEN: usize = 64;

#[derive(Error, Debug, PartialEq)]
pub enum DigestError {
    #[error("invalid digest hash length: {0}")]
    InvalidHashLen(usize),

    #[error("invalid digest hash encoding: {0}")]
    InvalidHashEncoding(String),

    #[error("missing digest")]
    MissingDigest,
}

impl proto::Digest {
    /// Computes the digest of a raw blob.
    pub fn of_blob(blob: &[u8]) -> Self {
        proto::Digest {
            hash: HEXLOWER.encode(Sha256::digest(blob).as_slice()),
            size_bytes: blob.len() as i64,
        }
    }

    /// Computes the digest of a message over its canonical encoding.
    pub fn of_message<M: Message>(message: &M) -> Self {
        Self::of_blob(&message.encode_to_vec())
    }

    pub fn empty() -> Self {
        Self::of_blob(b"")
    }

    /// Whether this digest names the empty blob. Empty-length digests
    /// resolve to canonical empty values without a backend call.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Checks the hash is well-formed lowercase hex of the right length.
    pub fn verify(&self) -> Result<(), DigestError> {
        if self.hash.len() != SHA256_HEX_LEN {
            return Err(DigestError::InvalidHashLen(self.hash.len()));
        }
        if HEXLOWER.decode(self.hash.as_bytes()).is_err() {
            return Err(DigestError::InvalidHashEncoding(self.hash.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Display for proto::Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// The digest of a canonicalized [proto::Action], the key every
/// action-result cache lookup goes through. A separate type so a plain
/// blob digest can't be used as a cache key by accident.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ActionKey(proto::Digest);

impl ActionKey {
    pub fn digest(&self) -> &proto::Digest {
        &self.0
    }
}

impl From<proto::Digest> for ActionKey {
    fn from(digest: proto::Digest) -> Self {
        ActionKey(digest)
    }
}

impl From<&proto::Action> for ActionKey {
    fn from(action: &proto::Action) -> Self {
        ActionKey(proto::Digest::of_message(action))
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Serializes a blob reference the way violation subjects and resource
/// names spell them.
pub fn blob_name(digest: &proto::Digest) -> String {
    format!("blobs/{}", digest)
}
