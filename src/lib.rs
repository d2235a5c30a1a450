//! # pcompress — parallel chunked compression pipeline
//!
//! Format guarantees (frozen at wire version 8):
//! - Every multi-byte field is big-endian.
//! - The stream is `FileHeader` | `ChunkFrame`* | `Trailer`; a chunk's frame
//!   is fully self-describing (length, checksum/mac, flags, payload).
//! - Authentication is always present: HMAC-SHA256 when encryption is on,
//!   CRC32 otherwise (from wire version 5 onward).
//! - Codec identity is an 8-byte ASCII tag, resolved the same way at decode
//!   time that `-c <algo>` resolves it at encode time; an unrecognized tag
//!   or an unavailable plugin-backed codec fails hard, no fallback.
//! - Chunks decode back out in the exact order they were read in, regardless
//!   of thread count.
//! - The plugin C ABI (`codec::plugin`) is stable at `PLUGIN_ABI_VERSION=1`.

pub mod error;
pub mod config;
pub mod checksum;
pub mod codec;
pub mod crypto;
pub mod dedup;
pub mod preprocess;
pub mod container;
pub mod pipeline;
pub mod worker;
pub mod producer;
pub mod writer;
pub mod controller;
pub mod perf;

pub use error::{PcompressError, Result};
pub use config::{CryptoAlgo, DedupMode, Direction, PipelineConfig};
pub use codec::{register_plugin, CodecError, CodecId, PcompressCodecPlugin, PluginCodec, PLUGIN_ABI_VERSION};
pub use checksum::{ChecksumError, ChecksumKind};
pub use crypto::CryptoError;
pub use controller::{run, RunRequest};
