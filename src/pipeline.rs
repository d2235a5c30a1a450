//! Transform Pipeline (C2) — §4.2.
//!
//! `compress_chunk`/`decompress_chunk` run one chunk through the full
//! transform order and its exact inverse. Every step after checksum is a
//! fallback candidate: if a step doesn't shrink what it's given, the chunk
//! flag bit for that step stays off and the untouched bytes are framed
//! instead, mirroring `block::encode_block`'s "only the things that help
//! make it to disk" posture but applied per-transform rather than per-block.

use crate::checksum::compute_checksum;
use crate::codec::{get_codec, AdaptiveCodec, Codec, CodecId, LzmaCodec};
use crate::config::PipelineConfig;
use crate::container::{self, chunk_flag, ChunkFrame};
use crate::crypto::CryptoContext;
use crate::dedup::{self, DedupIndex};
use crate::error::{PcompressError, Result};
use crate::preprocess::{delta2_decode, delta2_encode, lzp_decode, lzp_encode};

/// Elements of the flattened `(flag, hash, len)` dedup record the transpose
/// filter groups by byte position (`dedup::encode_dedup_header`'s record
/// width: 1 + 32 + 4).
const DEDUP_RECORD_WIDTH: usize = 37;

/// Sentinel level passed to the LZMA backend when compressing the (usually
/// tiny) dedup header: effort doesn't matter at this size, and `LzmaCodec`
/// ignores the level argument entirely, but a named sentinel documents that
/// this call site is not subject to `-l`.
const DEDUP_HEADER_LZMA_LEVEL: i32 = 255;

/// Compress one chunk end to end, returning the fully framed and
/// authenticated bytes ready to write (§4.2 steps 1-8). `dedup_index` is the
/// per-chunk index for non-global dedup, or the single shared index for `-G`.
pub fn compress_chunk(
    cfg: &PipelineConfig,
    chunk_id: u64,
    data: &[u8],
    dedup_index: &mut DedupIndex,
    crypto: Option<&CryptoContext>,
) -> Result<Vec<u8>> {
    // Step 1: checksum over the untouched original bytes.
    let checksum = if cfg.cksum_bytes() > 0 {
        compute_checksum(cfg.checksum_kind, data, cfg.single_chunk).as_slice().to_vec()
    } else {
        Vec::new()
    };

    // Step 2-3: dedup + transposed (optionally LZMA'd) index header, kept
    // only if it actually shrinks the chunk versus the original bytes —
    // trialled against a scratch copy of the index so a chunk that doesn't
    // benefit leaves no trace for later chunks to (wrongly) reference.
    let (dedup_section, literal, dedup_used) = if cfg.dedup.is_enabled() {
        let mut trial_index = dedup_index.clone();
        let (header, candidate_literal) = dedup::dedupe_compress(
            data,
            cfg.block_size,
            cfg.dedup.is_fixed(),
            cfg.dedup.delta_similarity(),
            &mut trial_index,
        );
        let section = encode_dedup_section(&header)?;
        if candidate_literal.len() + section.len() < data.len() {
            *dedup_index = trial_index;
            (section, candidate_literal, true)
        } else {
            (Vec::new(), data.to_vec(), false)
        }
    } else {
        (Vec::new(), data.to_vec(), false)
    };

    // Step 4: preprocess (LZP then Delta2), kept only if it actually helps
    // the backend that follows — evaluated by comparing compressed sizes.
    let backend = resolve_backend(cfg.algo)?;
    let (transformed, preproc_used) = apply_preprocess_with_fallback(cfg, &backend, &literal, cfg.level, cfg.nthreads)?;

    // Step 5: backend compress, with store-raw fallback if it doesn't shrink.
    let (payload, compressed_flag, adaptive_id) =
        compress_with_fallback(cfg.algo, &backend, &transformed, cfg.level, cfg.nthreads)?;

    // Step 6: encrypt the framed payload (compressed-or-raw, either way
    // length-preserving) in place.
    let mut payload = payload;
    if let Some(ctx) = crypto {
        ctx.crypt_buf(chunk_id, &mut payload).map_err(|e| PcompressError::DecryptFail {
            chunk_id,
            source: e,
        })?;
    }

    // Step 7: frame.
    let mut flags = compressed_flag;
    if dedup_used {
        flags |= chunk_flag::DEDUP;
    }
    if preproc_used {
        flags |= chunk_flag::PREPROC;
    }
    flags = chunk_flag::with_adaptive_id(flags, adaptive_id);

    let mut frame_payload = Vec::with_capacity(dedup_section.len() + 4 + payload.len());
    if dedup_used {
        frame_payload.extend_from_slice(&(dedup_section.len() as u32).to_be_bytes());
        frame_payload.extend_from_slice(&dedup_section);
    }
    frame_payload.extend_from_slice(&payload);

    let original_size = if cfg.single_chunk && data.len() as u64 > 0 {
        flags |= chunk_flag::CHSIZE_MASK;
        Some(data.len() as u64)
    } else {
        None
    };

    let frame = ChunkFrame {
        len_cmp: frame_payload.len() as u64,
        checksum,
        flags,
        payload: frame_payload,
        original_size,
    };

    // Step 8: authenticate (HMAC under crypto, CRC32 otherwise).
    let mac_key = crypto.map(|c| c.mac_key());
    Ok(container::encode_chunk_frame(&frame, mac_key.as_ref(), cfg.mac_bytes()))
}

/// Decode and strictly invert `compress_chunk`'s frame for one chunk,
/// starting at offset 0 of `buf`. Returns the reconstructed bytes and the
/// number of bytes consumed.
pub fn decompress_chunk(
    cfg: &PipelineConfig,
    chunk_id: u64,
    buf: &[u8],
    dedup_index: &mut DedupIndex,
    crypto: Option<&CryptoContext>,
) -> Result<(Vec<u8>, usize)> {
    let mac_key = crypto.map(|c| c.mac_key());
    let max_len_cmp = cfg.chunk_size + crate::config::OVERSIZE_SLACK;
    let (frame, consumed) = container::decode_chunk_frame(
        buf,
        cfg.cksum_bytes(),
        cfg.mac_bytes(),
        mac_key.as_ref(),
        max_len_cmp,
    )
    .map_err(|e| to_pcompress_error(chunk_id, e))?;

    let dedup_used = frame.flags & chunk_flag::DEDUP != 0;
    let preproc_used = frame.flags & chunk_flag::PREPROC != 0;
    let adaptive_id = chunk_flag::adaptive_id(frame.flags);
    let compressed = frame.flags & chunk_flag::COMPRESSED != 0;

    let mut frame_payload = frame.payload;

    // Undo step 6 (decrypt) before touching any length-prefixed framing
    // inside the payload, since encryption is the outermost, length
    // preserving wrapper around everything produced by steps 2-5.
    if let Some(ctx) = crypto {
        ctx.crypt_buf(chunk_id, &mut frame_payload)
            .map_err(|e| PcompressError::DecryptFail { chunk_id, source: e })?;
    }

    let (dedup_section, payload) = if dedup_used {
        if frame_payload.len() < 4 {
            return Err(PcompressError::CorruptFrame {
                chunk_id,
                reason: "dedup section length prefix missing".into(),
            });
        }
        let len = u32::from_be_bytes(frame_payload[0..4].try_into().unwrap()) as usize;
        if frame_payload.len() < 4 + len {
            return Err(PcompressError::CorruptFrame {
                chunk_id,
                reason: "dedup section truncated".into(),
            });
        }
        (frame_payload[4..4 + len].to_vec(), frame_payload[4 + len..].to_vec())
    } else {
        (Vec::new(), frame_payload)
    };

    let backend = resolve_backend_from_frame(cfg.algo, adaptive_id)?;

    // Step 5 inverse.
    let transformed = if compressed {
        decode_backend(cfg.algo, &backend, &payload, adaptive_id)
            .map_err(|e| PcompressError::DecompressFail { chunk_id, source: e })?
    } else {
        payload
    };

    // Step 4 inverse: Delta2 undone before LZP, the reverse of the encode order.
    let literal = if preproc_used {
        let mut buf = transformed;
        if cfg.preprocess.delta2 {
            buf = delta2_decode(&buf);
        }
        if cfg.preprocess.lzp {
            buf = lzp_decode(&buf).ok_or_else(|| PcompressError::CorruptFrame {
                chunk_id,
                reason: "LZP stream is malformed".into(),
            })?;
        }
        buf
    } else {
        transformed
    };

    // Step 2-3 inverse.
    let data = if dedup_used {
        let header = decode_dedup_section(&dedup_section, chunk_id)?;
        dedup::dedupe_decompress(&header, &literal, dedup_index)
            .map_err(|e| PcompressError::DedupRecoveryFail { chunk_id, source: e })?
    } else {
        literal
    };

    // Step 1 inverse: verify the checksum computed over the original bytes.
    if cfg.cksum_bytes() > 0 {
        let expected = compute_checksum(cfg.checksum_kind, &data, cfg.single_chunk);
        if expected.as_slice() != frame.checksum.as_slice() {
            return Err(PcompressError::ChecksumMismatch { chunk_id });
        }
    }

    Ok((data, consumed))
}

fn to_pcompress_error(chunk_id: u64, e: container::ContainerError) -> PcompressError {
    use container::ContainerError as CE;
    match e {
        CE::OversizeChunk { len_cmp, max } => PcompressError::OversizeChunk { chunk_id, len_cmp, max },
        CE::AuthMismatch { stage, reason } => PcompressError::AuthMismatch { chunk_id, stage, reason },
        other => PcompressError::Container(other),
    }
}

enum Backend {
    Plain(Box<dyn Codec>),
    Adaptive(AdaptiveCodec),
}

fn resolve_backend(id: CodecId) -> Result<Backend> {
    if id.is_adaptive() {
        Ok(Backend::Adaptive(AdaptiveCodec(id)))
    } else {
        Ok(Backend::Plain(get_codec(id)?))
    }
}

fn resolve_backend_from_frame(id: CodecId, _adaptive_id: u8) -> Result<Backend> {
    resolve_backend(id)
}

fn compress_with_fallback(
    id: CodecId,
    backend: &Backend,
    data: &[u8],
    level: i32,
    nthreads: usize,
) -> Result<(Vec<u8>, u8, u8)> {
    let (compressed, adaptive_id) = match backend {
        Backend::Plain(codec) => (codec.compress(data, level, nthreads)?, 0u8),
        Backend::Adaptive(adaptive) => {
            let (payload, idx) = adaptive.compress_adaptive(data, level, nthreads)?;
            (payload, idx)
        }
    };
    let _ = id;
    if compressed.len() < data.len() {
        Ok((compressed, chunk_flag::COMPRESSED, adaptive_id))
    } else {
        Ok((data.to_vec(), 0, 0))
    }
}

fn decode_backend(
    id: CodecId,
    backend: &Backend,
    data: &[u8],
    adaptive_id: u8,
) -> std::result::Result<Vec<u8>, crate::codec::CodecError> {
    let _ = id;
    match backend {
        Backend::Plain(codec) => codec.decompress(data),
        Backend::Adaptive(adaptive) => adaptive.decompress_adaptive(data, adaptive_id),
    }
}

/// Try the configured preprocess chain and keep it only if it shrinks the
/// eventual backend output versus skipping it — the "fallback-cascade
/// bitmask" the container flag byte records.
fn apply_preprocess_with_fallback(
    cfg: &PipelineConfig,
    backend: &Backend,
    literal: &[u8],
    level: i32,
    nthreads: usize,
) -> Result<(Vec<u8>, bool)> {
    if !cfg.preprocess.is_enabled() {
        return Ok((literal.to_vec(), false));
    }

    let mut filtered = literal.to_vec();
    if cfg.preprocess.lzp {
        filtered = lzp_encode(&filtered);
    }
    if cfg.preprocess.delta2 {
        filtered = delta2_encode(&filtered);
    }

    let without = trial_compress_len(backend, literal, level, nthreads)?;
    let with = trial_compress_len(backend, &filtered, level, nthreads)?;

    if with < without {
        Ok((filtered, true))
    } else {
        Ok((literal.to_vec(), false))
    }
}

fn trial_compress_len(backend: &Backend, data: &[u8], level: i32, nthreads: usize) -> Result<usize> {
    let len = match backend {
        Backend::Plain(codec) => codec.compress(data, level, nthreads)?.len(),
        Backend::Adaptive(adaptive) => adaptive.compress_adaptive(data, level, nthreads)?.0.len(),
    };
    Ok(len)
}

/// `<u8 flag><section bytes>`: flag 1 means the transposed dedup header is
/// LZMA-compressed, flag 0 means it's stored as the raw transposed bytes.
fn encode_dedup_section(header: &[u8]) -> Result<Vec<u8>> {
    let transposed = dedup::transpose_encode(header, DEDUP_RECORD_WIDTH)
        .map_err(|e| PcompressError::Dedup(e))?;
    let lzma = LzmaCodec.compress(&transposed, DEDUP_HEADER_LZMA_LEVEL, 1)?;
    let mut out = Vec::with_capacity(1 + transposed.len().max(lzma.len()));
    if lzma.len() < transposed.len() {
        out.push(1);
        out.extend_from_slice(&lzma);
    } else {
        out.push(0);
        out.extend_from_slice(&transposed);
    }
    Ok(out)
}

fn decode_dedup_section(section: &[u8], chunk_id: u64) -> Result<Vec<u8>> {
    if section.is_empty() {
        return Err(PcompressError::CorruptFrame {
            chunk_id,
            reason: "empty dedup section".into(),
        });
    }
    let transposed = if section[0] == 1 {
        LzmaCodec.decompress(&section[1..])?
    } else {
        section[1..].to_vec()
    };
    dedup::transpose_decode(&transposed, DEDUP_RECORD_WIDTH).map_err(|e| PcompressError::Dedup(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockSizeIndex, ChecksumKind, CryptoAlgo, DedupMode, Direction, PreprocessConfig};

    fn cfg(algo: CodecId, dedup: DedupMode, preprocess: PreprocessConfig) -> PipelineConfig {
        PipelineConfig {
            direction: Direction::Compress,
            algo,
            level: 6,
            chunk_size: 1 << 20,
            nthreads: 2,
            version: crate::config::CURRENT_VERSION,
            checksum_kind: ChecksumKind::Crc32,
            dedup,
            block_size: BlockSizeIndex::clamped(1),
            preprocess,
            crypto_algo: CryptoAlgo::None,
            key_len: 0,
            single_chunk: false,
            show_memory: false,
            show_stats: false,
        }
    }

    #[test]
    fn round_trips_plain_zlib_chunk() {
        let c = cfg(CodecId::Zlib, DedupMode::None, PreprocessConfig::default());
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(500);
        let mut idx = DedupIndex::new();
        let frame = compress_chunk(&c, 0, &data, &mut idx, None).unwrap();

        let mut idx2 = DedupIndex::new();
        let (decoded, consumed) = decompress_chunk(&c, 0, &frame, &mut idx2, None).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn round_trips_with_dedup_and_preprocessing() {
        let preprocess = PreprocessConfig { lzp: true, delta2: true };
        let c = cfg(CodecId::Lz4, DedupMode::Fixed, preprocess);
        let block = b"abcdefghijklmnopqrstuvwxyz0123456789".repeat(128);
        let mut data = Vec::new();
        data.extend_from_slice(&block);
        data.extend_from_slice(&block);

        let mut idx = DedupIndex::new();
        let frame = compress_chunk(&c, 7, &data, &mut idx, None).unwrap();

        let mut idx2 = DedupIndex::new();
        let (decoded, _) = decompress_chunk(&c, 7, &frame, &mut idx2, None).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn round_trips_with_encryption() {
        let c = {
            let mut c = cfg(CodecId::Zlib, DedupMode::None, PreprocessConfig::default());
            c.crypto_algo = CryptoAlgo::Aes;
            c
        };
        let crypto = CryptoContext::new(CryptoAlgo::Aes, [5u8; 32], [6u8; crate::crypto::NONCE_LEN]);
        let data = b"secret payload that should round trip through AES-CTR".repeat(100);
        let mut idx = DedupIndex::new();
        let frame = compress_chunk(&c, 3, &data, &mut idx, Some(&crypto)).unwrap();

        let mut idx2 = DedupIndex::new();
        let (decoded, _) = decompress_chunk(&c, 3, &frame, &mut idx2, Some(&crypto)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let c = {
            let mut c = cfg(CodecId::Zlib, DedupMode::None, PreprocessConfig::default());
            c.crypto_algo = CryptoAlgo::Aes;
            c
        };
        let crypto = CryptoContext::new(CryptoAlgo::Aes, [5u8; 32], [6u8; crate::crypto::NONCE_LEN]);
        let wrong = CryptoContext::new(CryptoAlgo::Aes, [9u8; 32], [6u8; crate::crypto::NONCE_LEN]);
        let data = b"another secret payload".repeat(50);
        let mut idx = DedupIndex::new();
        let frame = compress_chunk(&c, 1, &data, &mut idx, Some(&crypto)).unwrap();

        let mut idx2 = DedupIndex::new();
        match decompress_chunk(&c, 1, &frame, &mut idx2, Some(&wrong)) {
            Err(PcompressError::AuthMismatch { .. }) => {}
            other => panic!("expected AuthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn incompressible_data_falls_back_to_raw_storage() {
        let c = cfg(CodecId::Zlib, DedupMode::None, PreprocessConfig::default());
        let mut x: u32 = 0xC0FFEE;
        let data: Vec<u8> = (0..8192)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x & 0xff) as u8
            })
            .collect();
        let mut idx = DedupIndex::new();
        let frame = compress_chunk(&c, 0, &data, &mut idx, None).unwrap();
        let mut idx2 = DedupIndex::new();
        let (decoded, _) = decompress_chunk(&c, 0, &frame, &mut idx2, None).unwrap();
        assert_eq!(decoded, data);
    }
}
