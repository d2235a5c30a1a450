//! `PipelineConfig` — the single immutable-after-init value every worker,
//! the producer, the writer, and the container codec read from.
//!
//! The reference archive format keeps the equivalent of this struct in a
//! pile of process-globals (codec vtable pointers, algo flags, crypto
//! context, cancel flag). Per §9's "Global mutable state" note, we gather
//! everything except the cancel flag into one `Arc<PipelineConfig>`
//! built once in the Controller and handed to every thread; the cancel flag
//! is the one piece of state that is genuinely mutated concurrently, so it
//! stays a separate `Arc<AtomicBool>` rather than a `&mut` field here.

use crate::codec::CodecId;
use crate::checksum::ChecksumKind;

/// Current on-wire format version. Decoders accept `CURRENT_VERSION - 3 ..= CURRENT_VERSION`.
pub const CURRENT_VERSION: u16 = 8;
/// Oldest version this build will decode (inclusive).
pub const MIN_SUPPORTED_VERSION: u16 = CURRENT_VERSION - 3;
/// First version that carries a header CRC32 when crypto is not in use.
pub const HEADER_CRC_SINCE_VERSION: u16 = 5;

/// Smallest chunk size accepted by `-s`.
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
/// Default chunk size when `-s` is not given.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
/// Default compression level when `-l` is not given.
pub const DEFAULT_LEVEL: i32 = 6;
/// Maximum compression level accepted by `-l`.
pub const MAX_LEVEL: i32 = 14;

/// Extra bytes a chunk buffer must reserve beyond `chunksize` to hold the
/// worst-case framing + backend expansion + dedup header, per §3's
/// `CompressedChunkCap = ChunkSize + HeaderOverhead + BackendExtra + DedupExtra`.
pub const HEADER_OVERHEAD: usize = 64;
pub const BACKEND_EXTRA: usize = 128;
pub const DEDUP_EXTRA: usize = 64;

/// Any `len_cmp` beyond `chunksize + OVERSIZE_SLACK` is treated as corrupt (§3, §8).
pub const OVERSIZE_SLACK: u64 = 256;

#[inline]
pub fn compressed_chunk_cap(chunk_size: u64) -> usize {
    chunk_size as usize + HEADER_OVERHEAD + BACKEND_EXTRA + DEDUP_EXTRA
}

/// Which dedup strategy, if any, runs ahead of preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    /// No dedup stage.
    None,
    /// Content-defined (rabin) chunk-internal dedup; chunk boundaries are
    /// carried to coincide with rabin cut points (§4.4) unless `-r` is given.
    Rabin { delta_similarity: Option<DeltaSimilarity> },
    /// Fixed-boundary block dedup (`-F`); mutually exclusive with Rabin.
    Fixed,
    /// Rabin dedup whose index is shared across the whole file rather than
    /// one chunk (`-G`); requires the index-sem ring across workers.
    Global { delta_similarity: Option<DeltaSimilarity> },
}

impl DedupMode {
    #[inline]
    pub fn is_enabled(self) -> bool {
        !matches!(self, DedupMode::None)
    }

    #[inline]
    pub fn is_global(self) -> bool {
        matches!(self, DedupMode::Global { .. })
    }

    #[inline]
    pub fn is_fixed(self) -> bool {
        matches!(self, DedupMode::Fixed)
    }

    /// The delta-encoding similarity threshold carried by `-E`/`--delta-aggressive`,
    /// if any. Only `Rabin`/`Global` dedup can carry one; `Fixed` and `None` never do.
    #[inline]
    pub fn delta_similarity(self) -> Option<DeltaSimilarity> {
        match self {
            DedupMode::Rabin { delta_similarity } | DedupMode::Global { delta_similarity } => {
                delta_similarity
            }
            DedupMode::None | DedupMode::Fixed => None,
        }
    }
}

/// `-E` (60% similarity) / `-EE` (40% similarity) delta-encoding thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaSimilarity {
    Moderate,
    Aggressive,
}

impl DeltaSimilarity {
    /// Minimum fraction of matching content required to emit a delta record.
    pub fn threshold(self) -> f32 {
        match self {
            DeltaSimilarity::Moderate => 0.60,
            DeltaSimilarity::Aggressive => 0.40,
        }
    }
}

/// Encryption algorithm selected by `-e`. Both are length-preserving stream
/// ciphers; authentication is always a separate HMAC pass (§4.2 step 8),
/// never an AEAD tag, so the on-wire chunk length never changes under
/// encryption (Design Notes, "In-place encryption length contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlgo {
    None,
    Aes,
    Salsa20,
}

impl CryptoAlgo {
    #[inline]
    pub fn is_enabled(self) -> bool {
        !matches!(self, CryptoAlgo::None)
    }
}

/// Average dedup block size index (`-B 1..5`), coarser as the index grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeIndex(pub u8);

impl BlockSizeIndex {
    pub fn clamped(v: u8) -> Self {
        Self(v.clamp(1, 5))
    }

    /// Average CDC block size in bytes for this index: 2 KiB .. 32 KiB, doubling per step.
    pub fn average_bytes(self) -> u32 {
        2048u32 << (self.0.saturating_sub(1))
    }
}

/// Preprocessing toggles (`-L`, `-P`), independent of dedup and of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreprocessConfig {
    pub lzp: bool,
    pub delta2: bool,
}

impl PreprocessConfig {
    #[inline]
    pub fn is_enabled(self) -> bool {
        self.lzp || self.delta2
    }
}

/// Which direction the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Compress,
    Decompress,
}

/// Everything the pipeline needs to process a stream, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub direction: Direction,
    pub algo: CodecId,
    pub level: i32,
    pub chunk_size: u64,
    pub nthreads: usize,
    pub version: u16,

    pub checksum_kind: ChecksumKind,
    pub dedup: DedupMode,
    pub block_size: BlockSizeIndex,
    pub preprocess: PreprocessConfig,

    pub crypto_algo: CryptoAlgo,
    pub key_len: usize,

    /// Set once the Controller knows the whole input fits in one chunk.
    /// Drives `FLAG_SINGLE_CHUNK` (§3).
    pub single_chunk: bool,

    pub show_memory: bool,
    pub show_stats: bool,
}

impl PipelineConfig {
    /// `chunksize <= 80% of total physical memory`, the sanity rule from §3/§6.1.
    pub fn validate_chunk_size(chunk_size: u64, total_memory_bytes: u64) -> crate::error::Result<()> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(crate::error::PcompressError::ConfigInvalid(format!(
                "chunk size {chunk_size} is below the minimum of {MIN_CHUNK_SIZE}"
            )));
        }
        let ceiling = (total_memory_bytes as f64 * 0.80) as u64;
        if total_memory_bytes > 0 && chunk_size > ceiling {
            return Err(crate::error::PcompressError::ConfigInvalid(format!(
                "chunk size {chunk_size} exceeds 80% of physical memory ({ceiling} bytes)"
            )));
        }
        Ok(())
    }

    /// The crypto-off, version>=5 authenticator is always 4-byte CRC32; the
    /// crypto-on authenticator is an HMAC whose length depends on the MAC
    /// function (HMAC-SHA256 here, so 32 bytes). Checksum bytes are zero
    /// whenever crypto is enabled (§3 invariants).
    pub fn mac_bytes(&self) -> usize {
        if self.crypto_algo.is_enabled() {
            32
        } else if self.version >= HEADER_CRC_SINCE_VERSION {
            4
        } else {
            0
        }
    }

    pub fn cksum_bytes(&self) -> usize {
        if self.crypto_algo.is_enabled() {
            0
        } else {
            self.checksum_kind.cksum_bytes()
        }
    }
}
