//! Top-level error type.
//!
//! Every narrower error (`codec::CodecError`, `crypto::CryptoError`,
//! `dedup::DedupError`, `container::ContainerError`) converts into this one
//! via `#[from]`. The variant names are the error *kinds* described in §7,
//! not an incidental grouping of the narrower types.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::container::ContainerError;
use crate::crypto::CryptoError;
use crate::dedup::DedupError;

#[derive(Error, Debug)]
pub enum PcompressError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("short read: expected {expected} bytes, got {got}")]
    IoShort { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported format version {found} (this build handles {current}..={min})")]
    VersionUnsupported { found: u16, current: u16, min: u16 },

    #[error("chunk {chunk_id} declares len_cmp {len_cmp} exceeding the allowed maximum {max}")]
    OversizeChunk { chunk_id: u64, len_cmp: u64, max: u64 },

    #[error("corrupt frame at chunk {chunk_id}: {reason}")]
    CorruptFrame { chunk_id: u64, reason: String },

    #[error("authentication failed at chunk {chunk_id} ({stage}): {reason}")]
    AuthMismatch { chunk_id: u64, stage: &'static str, reason: String },

    #[error("decrypt failed at chunk {chunk_id}: {source}")]
    DecryptFail { chunk_id: u64, source: CryptoError },

    #[error("decompress failed at chunk {chunk_id}: {source}")]
    DecompressFail { chunk_id: u64, source: CodecError },

    #[error("dedup recovery failed at chunk {chunk_id}: {source}")]
    DedupRecoveryFail { chunk_id: u64, source: DedupError },

    #[error("checksum mismatch at chunk {chunk_id}")]
    ChecksumMismatch { chunk_id: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("password unavailable: {0}")]
    PasswordUnavailable(String),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("dedup error: {0}")]
    Dedup(#[from] DedupError),
}

pub type Result<T> = std::result::Result<T, PcompressError>;
