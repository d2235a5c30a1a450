//! Codec Registry (C1) — §4.1.
//!
//! `resolve(name)` returns a capability set equivalent to the vtable
//! `{init, deinit, compress, decompress, stats, props}` described in §4.1.
//! Stateless backends (everything but `lzmaMt`'s internal thread count)
//! fold `init`/`deinit` into construction; `props()` exposes the one
//! per-codec tunable the pipeline reads back (`delta2_span`, used to decide
//! whether Delta2 preprocessing is worth attempting, §4.2 step 4).
//!
//! Identity on the wire is the 8-byte ASCII `algo` tag (§3, §6.2), not a
//! UUID — single-file framing has no superblock to declare required codecs
//! up front, so the tag in the `FileHeader` is resolved the same way at
//! decode time that `-c <algo>` resolves it at encode time. A decoder that
//! doesn't recognize the tag fails hard, same "no fallback" ethos a UUID
//! registry would enforce.

mod plugin;
pub use plugin::{register_plugin, PcompressCodecPlugin, PluginCodec, PLUGIN_ABI_VERSION};

use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown codec name: {0}")]
    UnknownName(String),
    /// A name is recognized but no implementation (built-in or plugin) backs it.
    /// No fallback is attempted — decoding MUST NOT continue without it.
    #[error("Codec '{0}' is not available in this build (no plugin registered)")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    None,
    Zlib,
    Lz4,
    Lzma,
    LzmaMt,
    Bzip2,
    Ppmd,
    Lzfx,
    Libbsc,
    Adapt,
    Adapt2,
}

impl CodecId {
    /// `algo[8]` ASCII tag written to the `FileHeader`, zero-padded (§3).
    /// Minimum significant length per §6.2: zlib/4, lzma/4, lzmaMt/6,
    /// bzip2/5, ppmd/4, lzfx/4, lz4/3, none/4, adapt2/6, adapt/5, libbsc/6.
    pub fn tag(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zlib => "zlib",
            CodecId::Lz4 => "lz4",
            CodecId::Lzma => "lzma",
            CodecId::LzmaMt => "lzmaMt",
            CodecId::Bzip2 => "bzip2",
            CodecId::Ppmd => "ppmd",
            CodecId::Lzfx => "lzfx",
            CodecId::Libbsc => "libbsc",
            CodecId::Adapt => "adapt",
            CodecId::Adapt2 => "adapt2",
        }
    }

    pub fn write_tag(self, buf: &mut [u8; 8]) {
        buf.fill(0);
        let t = self.tag().as_bytes();
        buf[..t.len()].copy_from_slice(t);
    }

    pub fn from_tag(buf: &[u8; 8]) -> Result<Self, CodecError> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(8);
        let name = std::str::from_utf8(&buf[..end])
            .map_err(|_| CodecError::UnknownName(hex::encode(buf)))?;
        Self::from_name(name)
    }

    pub fn from_name(s: &str) -> Result<Self, CodecError> {
        match s {
            "none" => Ok(CodecId::None),
            "zlib" => Ok(CodecId::Zlib),
            "lz4" => Ok(CodecId::Lz4),
            "lzma" => Ok(CodecId::Lzma),
            "lzmaMt" => Ok(CodecId::LzmaMt),
            "bzip2" => Ok(CodecId::Bzip2),
            "ppmd" => Ok(CodecId::Ppmd),
            "lzfx" => Ok(CodecId::Lzfx),
            "libbsc" => Ok(CodecId::Libbsc),
            "adapt" => Ok(CodecId::Adapt),
            "adapt2" => Ok(CodecId::Adapt2),
            other => Err(CodecError::UnknownName(other.to_owned())),
        }
    }

    /// True for `adapt`/`adapt2`: these reserve chunk-flag bits 6-4 (§4.6)
    /// to record which sub-codec actually compressed a given chunk.
    pub fn is_adaptive(self) -> bool {
        matches!(self, CodecId::Adapt | CodecId::Adapt2)
    }

    /// Sub-codec list tried by an adaptive codec, in preference order. Index
    /// into this list (1-based; 0 means "non-adaptive") is what's stored in
    /// the chunk-flag adaptive-sub-algo bits.
    pub fn adaptive_members(self) -> &'static [CodecId] {
        match self {
            CodecId::Adapt => &[CodecId::Lz4, CodecId::Zlib],
            CodecId::Adapt2 => &[CodecId::Lz4, CodecId::Zlib, CodecId::Lzma],
            _ => &[],
        }
    }
}

/// Per-codec tunables the pipeline reads back, mirroring a `props`
/// vtable entry (`props(&props, level, chunksize)`).
#[derive(Debug, Clone, Copy)]
pub struct CodecProps {
    /// Nonzero enables Delta2 preprocessing ahead of this backend (§4.2 step 4).
    pub delta2_span: u32,
    pub supports_internal_threads: bool,
}

pub trait Codec: Send + Sync {
    fn id(&self) -> CodecId;
    fn compress(&self, src: &[u8], level: i32, nthreads: usize) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn props(&self, level: i32, chunk_size: u64) -> CodecProps {
        let _ = (level, chunk_size);
        CodecProps { delta2_span: 0, supports_internal_threads: false }
    }
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn id(&self) -> CodecId { CodecId::None }
    fn compress(&self, src: &[u8], _level: i32, _nthreads: usize) -> Result<Vec<u8>, CodecError> {
        Ok(src.to_vec())
    }
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(src.to_vec())
    }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn id(&self) -> CodecId { CodecId::Zlib }
    fn compress(&self, src: &[u8], level: i32, _nthreads: usize) -> Result<Vec<u8>, CodecError> {
        use flate2::{write::ZlibEncoder, Compression};
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level.clamp(0, 9) as u32));
        enc.write_all(src).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        use flate2::read::ZlibDecoder;
        let mut out = Vec::new();
        ZlibDecoder::new(src)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn props(&self, _level: i32, _chunk_size: u64) -> CodecProps {
        CodecProps { delta2_span: 4, supports_internal_threads: false }
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, src: &[u8], _level: i32, _nthreads: usize) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(src))
    }
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(src)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, src: &[u8], _level: i32, _nthreads: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(src), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(src), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn props(&self, _level: i32, _chunk_size: u64) -> CodecProps {
        CodecProps { delta2_span: 8, supports_internal_threads: false }
    }
}

/// `lzmaMt`: `lzma-rs` has no internal threading, so "multi-threaded LZMA"
/// here means splitting the chunk into `nthreads` independent sub-blocks,
/// each LZMA-compressed in its own rayon task, framed as
/// `<u32 LE count>(<u32 LE len><payload>)*`. Decompression reverses that
/// framing, not the LZMA codec itself.
pub struct LzmaMtCodec;
impl Codec for LzmaMtCodec {
    fn id(&self) -> CodecId { CodecId::LzmaMt }

    fn compress(&self, src: &[u8], level: i32, nthreads: usize) -> Result<Vec<u8>, CodecError> {
        let nthreads = nthreads.max(1);
        if src.is_empty() || nthreads == 1 {
            let mut out = Vec::new();
            out.extend_from_slice(&1u32.to_le_bytes());
            let sub = LzmaCodec.compress(src, level, 1)?;
            out.extend_from_slice(&(sub.len() as u32).to_le_bytes());
            out.extend_from_slice(&sub);
            return Ok(out);
        }

        let sub_len = src.len().div_ceil(nthreads).max(1);
        let sub_blocks: Vec<&[u8]> = src.chunks(sub_len).collect();

        #[cfg(feature = "parallel")]
        let compressed: Result<Vec<Vec<u8>>, CodecError> = {
            use rayon::prelude::*;
            sub_blocks.par_iter().map(|b| LzmaCodec.compress(b, level, 1)).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let compressed: Result<Vec<Vec<u8>>, CodecError> =
            sub_blocks.iter().map(|b| LzmaCodec.compress(b, level, 1)).collect();

        let compressed = compressed?;
        let mut out = Vec::new();
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        for sub in &compressed {
            out.extend_from_slice(&(sub.len() as u32).to_le_bytes());
            out.extend_from_slice(sub);
        }
        Ok(out)
    }

    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        if src.len() < 4 {
            return Err(CodecError::Decompression("lzmaMt frame too short".into()));
        }
        let count = u32::from_le_bytes(src[0..4].try_into().unwrap()) as usize;
        let mut pos = 4usize;
        let mut out = Vec::new();
        for _ in 0..count {
            if pos + 4 > src.len() {
                return Err(CodecError::Decompression("lzmaMt frame truncated".into()));
            }
            let len = u32::from_le_bytes(src[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > src.len() {
                return Err(CodecError::Decompression("lzmaMt sub-block truncated".into()));
            }
            out.extend(LzmaCodec.decompress(&src[pos..pos + len])?);
            pos += len;
        }
        Ok(out)
    }

    fn props(&self, _level: i32, _chunk_size: u64) -> CodecProps {
        CodecProps { delta2_span: 8, supports_internal_threads: true }
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn id(&self) -> CodecId { CodecId::Bzip2 }
    fn compress(&self, src: &[u8], level: i32, _nthreads: usize) -> Result<Vec<u8>, CodecError> {
        use bzip2::{write::BzEncoder, Compression};
        let lvl = level.clamp(1, 9) as u32;
        let mut enc = BzEncoder::new(Vec::new(), Compression::new(lvl));
        enc.write_all(src).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        use bzip2::read::BzDecoder;
        let mut out = Vec::new();
        BzDecoder::new(src)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// `adapt`/`adapt2`: race the member sub-codecs, keep the smallest result.
/// The winning member's 1-based index into `adaptive_members()` is reported
/// via [`AdaptiveCodec::compress_adaptive`] for the pipeline to stash in the
/// chunk-flag bits; plain `compress`/`decompress` below exist only to satisfy
/// the `Codec` trait object and are not used on the adaptive path.
pub struct AdaptiveCodec(pub CodecId);

impl AdaptiveCodec {
    pub fn compress_adaptive(
        &self,
        src: &[u8],
        level: i32,
        nthreads: usize,
    ) -> Result<(Vec<u8>, u8), CodecError> {
        let members = self.0.adaptive_members();
        let mut best: Option<(Vec<u8>, u8)> = None;
        for (i, member) in members.iter().enumerate() {
            let codec = get_codec(*member)?;
            let payload = codec.compress(src, level, nthreads)?;
            let is_better = best.as_ref().map(|(b, _)| payload.len() < b.len()).unwrap_or(true);
            if is_better {
                best = Some((payload, (i + 1) as u8));
            }
        }
        best.ok_or_else(|| CodecError::Compression("adaptive codec has no members".into()))
    }

    pub fn decompress_adaptive(&self, src: &[u8], sub_algo: u8) -> Result<Vec<u8>, CodecError> {
        if sub_algo == 0 {
            return Err(CodecError::Decompression(
                "adaptive sub-algo id is 0 (non-adaptive)".into(),
            ));
        }
        let members = self.0.adaptive_members();
        let idx = sub_algo as usize - 1;
        let member = members.get(idx).ok_or_else(|| {
            CodecError::Decompression(format!("adaptive sub-algo id {sub_algo} out of range"))
        })?;
        get_codec(*member)?.decompress(src)
    }
}

impl Codec for AdaptiveCodec {
    fn id(&self) -> CodecId { self.0 }
    fn compress(&self, src: &[u8], level: i32, nthreads: usize) -> Result<Vec<u8>, CodecError> {
        self.compress_adaptive(src, level, nthreads).map(|(p, _)| p)
    }
    fn decompress(&self, _src: &[u8]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Decompression(
            "adaptive codecs must be decoded via decompress_adaptive with the stored sub-algo id"
                .into(),
        ))
    }
}

/// Resolve a [`CodecId`] to a working implementation. `lzfx`/`ppmd`/`libbsc`
/// only resolve if a plugin has registered them (§4.1.1) — no built-in
/// fallback is attempted, per the "fail hard on unavailable codec" policy.
pub fn get_codec(id: CodecId) -> Result<Box<dyn Codec>, CodecError> {
    match id {
        CodecId::None => Ok(Box::new(NoneCodec)),
        CodecId::Zlib => Ok(Box::new(ZlibCodec)),
        CodecId::Lz4 => Ok(Box::new(Lz4Codec)),
        CodecId::Lzma => Ok(Box::new(LzmaCodec)),
        CodecId::LzmaMt => Ok(Box::new(LzmaMtCodec)),
        CodecId::Bzip2 => Ok(Box::new(Bzip2Codec)),
        CodecId::Adapt => Ok(Box::new(AdaptiveCodec(CodecId::Adapt))),
        CodecId::Adapt2 => Ok(Box::new(AdaptiveCodec(CodecId::Adapt2))),
        CodecId::Ppmd | CodecId::Lzfx | CodecId::Libbsc => {
            plugin::resolve_plugin(id).ok_or_else(|| CodecError::Unavailable(id.tag().to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(id: CodecId, data: &[u8]) {
        let codec = get_codec(id).unwrap();
        let compressed = codec.compress(data, 6, 2).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data, "{:?} round-trip failed", id);
    }

    #[test]
    fn builtin_backends_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(200);
        for id in [CodecId::None, CodecId::Zlib, CodecId::Lz4, CodecId::Lzma, CodecId::Bzip2] {
            roundtrip(id, &data);
        }
    }

    #[test]
    fn lzma_mt_roundtrips_across_thread_counts() {
        let data = b"abcdefghijklmnopqrstuvwxyz".repeat(5000);
        let codec = LzmaMtCodec;
        for nthreads in [1usize, 2, 4, 8] {
            let compressed = codec.compress(&data, 6, nthreads).unwrap();
            let decompressed = codec.decompress(&compressed).unwrap();
            assert_eq!(decompressed, data);
        }
    }

    #[test]
    fn adaptive_picks_smaller_and_decodes_back() {
        let data = b"0123456789".repeat(4096);
        let adaptive = AdaptiveCodec(CodecId::Adapt2);
        let (payload, sub_algo) = adaptive.compress_adaptive(&data, 6, 1).unwrap();
        assert!(sub_algo >= 1);
        let decompressed = adaptive.decompress_adaptive(&payload, sub_algo).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn tag_roundtrip() {
        for id in [
            CodecId::None, CodecId::Zlib, CodecId::Lz4, CodecId::Lzma, CodecId::LzmaMt,
            CodecId::Bzip2, CodecId::Ppmd, CodecId::Lzfx, CodecId::Libbsc, CodecId::Adapt,
            CodecId::Adapt2,
        ] {
            let mut buf = [0u8; 8];
            id.write_tag(&mut buf);
            assert_eq!(CodecId::from_tag(&buf).unwrap(), id);
        }
    }

    #[test]
    fn unavailable_plugin_backed_codec_fails_hard() {
        match get_codec(CodecId::Ppmd) {
            Err(CodecError::Unavailable(name)) => assert_eq!(name, "ppmd"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }
}
