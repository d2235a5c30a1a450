//! Producer (C4) — §4.4.
//!
//! Reads input and round-robin dispatches chunks to the [`WorkerPool`],
//! mirroring the order the [`Writer`](crate::writer::Writer) will drain
//! results in. On compress, each read is nudged to a content-defined
//! boundary near `chunk_size` rather than cut at a hard byte offset, so a
//! single inserted or deleted byte upstream shifts only the one chunk it
//! falls in rather than every subsequent chunk — the same reasoning
//! `fastcdc` dedup blocks rely on, applied one level up at chunk
//! granularity. Bytes past the chosen boundary are carried into the next
//! read instead of being re-read from the source.

use std::io::Read;

use fastcdc::v2020::FastCDC;

use crate::config::PipelineConfig;
use crate::worker::WorkerPool;

/// Reads up to `2 * chunk_size` bytes at a time so a content-defined cut
/// point can be chosen inside that window; without this slack every chunk
/// would end at a hard byte boundary instead.
fn read_fill<R: Read>(reader: &mut R, carry: &mut Vec<u8>, target_len: usize) -> std::io::Result<bool> {
    let mut buf = vec![0u8; 64 * 1024];
    while carry.len() < target_len {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        carry.extend_from_slice(&buf[..n]);
    }
    Ok(true)
}

/// Pick the boundary (byte offset into `window`) nearest `chunk_size`
/// using FastCDC, or `window.len()` if FastCDC finds nothing (tiny final
/// window, below its minimum cut size).
fn next_boundary(window: &[u8], chunk_size: usize) -> usize {
    if window.len() <= chunk_size {
        return window.len();
    }
    let avg = chunk_size as u32;
    let min = (avg / 2).max(64);
    let max = (avg * 2).min(window.len() as u32).max(min + 1);
    FastCDC::new(window, min, avg, max)
        .next()
        .map(|cut| cut.offset + cut.length)
        .unwrap_or_else(|| chunk_size.min(window.len()))
}

/// Read the whole input, splitting it into content-defined-ish chunks and
/// dispatching each to `pool` round robin, followed by an end-of-stream
/// marker so the Writer (running concurrently) knows where to stop
/// draining without needing the total count known in advance. Returns the
/// total chunk count produced.
pub fn run_compress_producer<R: Read>(
    mut reader: R,
    cfg: &PipelineConfig,
    pool: &WorkerPool,
) -> std::io::Result<u64> {
    let chunk_size = cfg.chunk_size as usize;
    let mut carry: Vec<u8> = Vec::new();
    let mut chunk_id = 0u64;

    loop {
        let more = read_fill(&mut reader, &mut carry, chunk_size * 2)?;
        if carry.is_empty() {
            break;
        }
        let boundary = if more {
            next_boundary(&carry, chunk_size)
        } else {
            carry.len()
        };
        let boundary = boundary.max(1).min(carry.len());
        let chunk: Vec<u8> = carry.drain(..boundary).collect();
        pool.dispatch(chunk_id, chunk);
        chunk_id += 1;
        if !more {
            break;
        }
    }

    pool.dispatch_end(chunk_id);
    Ok(chunk_id)
}

/// Read framed chunks sequentially off the wire (the `len_cmp` prefix of
/// each [`crate::container::ChunkFrame`] must be parsed in order — there's
/// no content-defined shortcut for decompression) and dispatch the whole
/// frame to `pool` for the worker to invert.
pub fn run_decompress_producer<R: Read>(
    mut reader: R,
    cksum_bytes: usize,
    mac_bytes: usize,
    pool: &WorkerPool,
) -> std::io::Result<u64> {
    let mut chunk_id = 0u64;
    loop {
        let mut len_buf = [0u8; 8];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len_cmp = u64::from_be_bytes(len_buf);
        if len_cmp == 0 {
            // Trailer: an all-zero u64 where a real frame would carry a
            // nonzero payload length.
            break;
        }
        let fixed_rest = cksum_bytes + mac_bytes + 1; // checksum + mac + flags
        let mut rest = vec![0u8; fixed_rest];
        reader.read_exact(&mut rest)?;
        let has_chsize = rest[fixed_rest - 1] & crate::container::chunk_flag::CHSIZE_MASK != 0;

        let mut payload = vec![0u8; len_cmp as usize];
        reader.read_exact(&mut payload)?;
        let mut orig_size_buf = [0u8; 8];
        if has_chsize {
            reader.read_exact(&mut orig_size_buf)?;
        }

        let mut frame = Vec::with_capacity(8 + rest.len() + payload.len() + 8);
        frame.extend_from_slice(&len_buf);
        frame.extend_from_slice(&rest);
        frame.extend_from_slice(&payload);
        if has_chsize {
            frame.extend_from_slice(&orig_size_buf);
        }

        pool.dispatch(chunk_id, frame);
        chunk_id += 1;
    }
    pool.dispatch_end(chunk_id);
    Ok(chunk_id)
}
