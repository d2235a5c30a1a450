//! Worker Pool (C3) — §4.3.
//!
//! The reference semaphore handshake (`start`/`done`) becomes two
//! `crossbeam_channel::bounded(1)` channels per slot (§9 "Semaphore pair →
//! channels"): `start` hands a unit of work to the worker, `done` hands the
//! result back. Both channels being `bounded(1)` is itself the backpressure:
//! a worker blocks in `done_tx.send()` until the Writer calls `recv()` and
//! drains the previous result, and the Producer blocks in `dispatch()` until
//! the worker has taken the previous item out of `start_rx`. No separate
//! acknowledgement channel is needed — draining `done_rx` *is* the ack.
//!
//! Chunks are dispatched round robin: worker `i` only ever handles chunk
//! ids congruent to `i mod nthreads`. The Writer drains slots in the same
//! cyclic order, so strict chunk-id ordering on output falls out of the
//! dispatch pattern rather than needing an explicit reorder buffer. Once the
//! Producer has dispatched the last real chunk it also sends an
//! [`WorkItem::EndOfStream`] marker through the same round-robin sequence,
//! so the Writer learns where the stream ends without needing the total
//! chunk count known up front — which in turn is what lets the Producer and
//! the Writer run concurrently instead of the Producer having to finish
//! before the Writer can start.
//!
//! `-G` global dedup shares one [`DedupIndex`] across every worker. Since a
//! dedup `Reference` record is only valid once the block it points at has
//! actually been inserted, the shared index must be touched in strict
//! chunk-id order even though workers otherwise run concurrently. The
//! "ring of index semaphores" in the design notes is realized here as a
//! ring of bounded(1) token channels: a worker must hold the token for its
//! chunk id before running the pipeline, and hands it to the next worker
//! in the ring when done. This serializes global-dedup runs down to one
//! chunk in flight at a time — a deliberate trade of parallelism for
//! correctness that only applies to `-G`; `None`/`Rabin`/`Fixed` dedup give
//! every worker its own [`DedupIndex`] and never touch the ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::PipelineConfig;
use crate::crypto::CryptoContext;
use crate::dedup::DedupIndex;
use crate::error::{PcompressError, Result};
use crate::pipeline::{compress_chunk, decompress_chunk};

/// One unit of work handed to a worker. `EndOfStream` is dispatched once,
/// in the same round-robin sequence as real chunks, right after the last
/// one; `Shutdown` is sent once per slot once the pool is being torn down,
/// to let worker threads exit their loop.
pub enum WorkItem {
    Chunk { chunk_id: u64, data: Vec<u8> },
    EndOfStream { chunk_id: u64 },
    Shutdown,
}

/// What a worker hands back for a real chunk: framed+authenticated bytes on
/// compress, reconstructed original bytes on decompress.
pub enum WorkOutcome {
    Chunk(Result<Vec<u8>>),
    /// Relayed straight through from [`WorkItem::EndOfStream`] — there was
    /// no chunk to process, this slot is just passing along the stream-end
    /// marker in its proper place in the sequence.
    EndOfStream,
}

/// `chunk_id` lets the Writer assert it drained slots in the order it
/// expected.
pub struct WorkResult {
    pub chunk_id: u64,
    pub outcome: WorkOutcome,
}

struct Slot {
    start_tx: Sender<WorkItem>,
    done_rx: Receiver<WorkResult>,
}

/// A running pool of worker threads plus the channels to feed and drain
/// them. Dropping a `WorkerPool` after `shutdown()` joins every thread.
pub struct WorkerPool {
    slots: Vec<Slot>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `cfg.nthreads` worker threads. `cancel` is the process-wide
    /// cancellation flag (§4.7) — a worker checks it before starting each
    /// chunk and exits early, without running the pipeline, once set.
    pub fn spawn(
        cfg: Arc<PipelineConfig>,
        crypto: Option<Arc<CryptoContext>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let nthreads = cfg.nthreads.max(1);
        let global_index: Option<Arc<Mutex<DedupIndex>>> =
            cfg.dedup.is_global().then(|| Arc::new(Mutex::new(DedupIndex::new())));

        // Token ring for global-dedup serialization; worker 0 starts holding
        // the token for chunk 0.
        let token_channels: Vec<(Sender<()>, Receiver<()>)> =
            (0..nthreads).map(|_| bounded::<()>(1)).collect();
        if global_index.is_some() {
            token_channels[0].0.send(()).expect("fresh bounded(1) channel accepts first send");
        }

        let mut slots = Vec::with_capacity(nthreads);
        let mut handles = Vec::with_capacity(nthreads);

        for worker_id in 0..nthreads {
            let (start_tx, start_rx) = bounded::<WorkItem>(1);
            let (done_tx, done_rx) = bounded::<WorkResult>(1);

            let cfg = Arc::clone(&cfg);
            let crypto = crypto.clone();
            let cancel = Arc::clone(&cancel);
            let global_index = global_index.clone();
            let my_token_rx = token_channels[worker_id].1.clone();
            let next_token_tx = token_channels[(worker_id + 1) % nthreads].0.clone();

            let handle = std::thread::Builder::new()
                .name(format!("pcompress-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(
                        worker_id,
                        cfg,
                        crypto,
                        cancel,
                        global_index,
                        my_token_rx,
                        next_token_tx,
                        start_rx,
                        done_tx,
                    )
                })
                .expect("failed to spawn worker thread");

            slots.push(Slot { start_tx, done_rx });
            handles.push(handle);
        }

        Self { slots, handles }
    }

    pub fn nthreads(&self) -> usize {
        self.slots.len()
    }

    /// Hand a chunk to worker `chunk_id % nthreads()`.
    pub fn dispatch(&self, chunk_id: u64, data: Vec<u8>) {
        let slot = &self.slots[(chunk_id as usize) % self.slots.len()];
        slot.start_tx
            .send(WorkItem::Chunk { chunk_id, data })
            .expect("worker thread exited before consuming its slot");
    }

    /// Mark the end of the stream at `chunk_id` (== the total chunk count),
    /// in the slot that would have received a real chunk with this id.
    pub fn dispatch_end(&self, chunk_id: u64) {
        let slot = &self.slots[(chunk_id as usize) % self.slots.len()];
        slot.start_tx
            .send(WorkItem::EndOfStream { chunk_id })
            .expect("worker thread exited before consuming its slot");
    }

    /// Block for the result a given worker slot currently holds. Draining
    /// this is what lets a worker blocked in `done_tx.send()` proceed.
    pub fn recv(&self, slot_index: usize) -> WorkResult {
        self.slots[slot_index]
            .done_rx
            .recv()
            .expect("worker thread exited before producing a result")
    }

    /// Send a shutdown marker to every slot and join all worker threads.
    /// A worker that's currently blocked handing back a result nobody has
    /// claimed yet (e.g. after the Writer bailed out on an earlier error)
    /// would otherwise never get back around to its `start_rx` to see the
    /// shutdown marker, so drain one leftover result per slot first.
    pub fn shutdown(mut self) {
        for slot in &self.slots {
            let _ = slot.done_rx.try_recv();
            let _ = slot.start_tx.send(WorkItem::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    cfg: Arc<PipelineConfig>,
    crypto: Option<Arc<CryptoContext>>,
    cancel: Arc<AtomicBool>,
    global_index: Option<Arc<Mutex<DedupIndex>>>,
    my_token_rx: Receiver<()>,
    next_token_tx: Sender<()>,
    start_rx: Receiver<WorkItem>,
    done_tx: Sender<WorkResult>,
) {
    let mut local_index = DedupIndex::new();

    loop {
        let item = match start_rx.recv() {
            Ok(item) => item,
            Err(_) => return,
        };
        let (chunk_id, data) = match item {
            WorkItem::Chunk { chunk_id, data } => (chunk_id, data),
            WorkItem::EndOfStream { chunk_id } => {
                if done_tx.send(WorkResult { chunk_id, outcome: WorkOutcome::EndOfStream }).is_err() {
                    return;
                }
                continue;
            }
            WorkItem::Shutdown => return,
        };

        if cancel.load(Ordering::SeqCst) {
            let _ = done_tx.send(WorkResult {
                chunk_id,
                outcome: WorkOutcome::Chunk(Err(PcompressError::ConfigInvalid("cancelled".into()))),
            });
            continue;
        }

        let result = if let Some(shared) = &global_index {
            // Hold this chunk's place in line before touching the shared
            // index; the whole per-chunk pipeline runs while holding it so
            // a `Reference` can never be emitted/resolved before its
            // `Literal` counterpart is visible to every other worker.
            let _ = my_token_rx.recv();
            let mut guard = shared.lock().expect("dedup index mutex poisoned");
            let r = run_pipeline(&cfg, chunk_id, &data, &mut guard, crypto.as_deref());
            drop(guard);
            let _ = next_token_tx.send(());
            r
        } else {
            run_pipeline(&cfg, chunk_id, &data, &mut local_index, crypto.as_deref())
        };

        // Blocks here if the Writer hasn't yet drained this slot's previous
        // result — `done_tx` is bounded(1), so that block *is* the
        // backpressure that bounds memory to one in-flight buffer per
        // worker, with no separate acknowledgement channel needed.
        if done_tx.send(WorkResult { chunk_id, outcome: WorkOutcome::Chunk(result) }).is_err() {
            return;
        }
    }
}

fn run_pipeline(
    cfg: &PipelineConfig,
    chunk_id: u64,
    data: &[u8],
    index: &mut DedupIndex,
    crypto: Option<&CryptoContext>,
) -> Result<Vec<u8>> {
    use crate::config::Direction;
    match cfg.direction {
        Direction::Compress => compress_chunk(cfg, chunk_id, data, index, crypto),
        Direction::Decompress => {
            decompress_chunk(cfg, chunk_id, data, index, crypto).map(|(bytes, _consumed)| bytes)
        }
    }
}
