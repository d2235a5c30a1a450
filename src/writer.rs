//! Writer (C5) — §4.5.
//!
//! Runs concurrently with the Producer (§4.7): draining worker slots in the
//! same round-robin order the Producer fed them in, so output lands in
//! strict chunk-id order without a reorder buffer. Rather than needing the
//! total chunk count known up front — which would force the Producer to
//! finish reading before the Writer could start — the Writer just keeps
//! draining slots until it reaches the [`crate::worker::WorkOutcome::EndOfStream`]
//! marker the Producer dispatches once it's done.
//!
//! A worker result carrying an error is the cancel-cascade signal (§4.7,
//! §7): the Writer stops writing (but keeps draining, so the Producer —
//! which may still be mid-flight on another thread — never blocks forever
//! trying to hand off a chunk nobody is reading) and surfaces the first
//! error it saw once the stream actually ends. [`crate::perf::WriteBuffer`]
//! batches the actual `write_all` calls the same way the reference archive
//! writer does for its block stream.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PcompressError, Result};
use crate::perf::WriteBuffer;
use crate::worker::{WorkOutcome, WorkerPool};

/// Drain `pool` until the end-of-stream marker is reached, writing each
/// payload to `out` in order. Returns the number of bytes written.
pub fn run_writer<W: Write>(out: W, pool: &WorkerPool, cancel: &Arc<AtomicBool>) -> Result<u64> {
    let mut buffered = WriteBuffer::new(out, 1024 * 1024);
    let nthreads = pool.nthreads();
    let mut first_error: Option<PcompressError> = None;
    let mut i = 0u64;

    loop {
        let slot_index = (i as usize) % nthreads;
        let result = pool.recv(slot_index);
        debug_assert_eq!(result.chunk_id, i, "worker pool drained out of chunk-id order");

        match result.outcome {
            WorkOutcome::EndOfStream => break,
            WorkOutcome::Chunk(Ok(bytes)) => {
                if first_error.is_none() {
                    buffered.write_all(&bytes)?;
                }
            }
            WorkOutcome::Chunk(Err(e)) => {
                if first_error.is_none() {
                    cancel.store(true, Ordering::SeqCst);
                    first_error = Some(e);
                }
            }
        }
        i += 1;
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    buffered.flush()?;
    Ok(buffered.bytes_written)
}
