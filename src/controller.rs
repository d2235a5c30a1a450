//! Controller (C7) — §4.7.
//!
//! Owns the whole run: validates the source file, opens a temp output file
//! next to the real destination, wires up the [`WorkerPool`], runs the
//! Producer and Writer, and on success renames the temp file into place and
//! propagates the source file's mode. `SIGINT`/`SIGTERM` set the same
//! `AtomicBool` cancel flag a fatal pipeline error would, via
//! `signal_hook::flag::register` — one cancellation path regardless of why
//! the run is stopping, the way the reference archive writer's own
//! single-shot `finalize()` has exactly one success path and nothing else
//! commits.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use crate::config::{Direction, PipelineConfig};
use crate::container::{self, FileHeaderFields};
use crate::crypto::{self, CryptoContext};
use crate::error::{PcompressError, Result};
use crate::producer::{run_compress_producer, run_decompress_producer};
use crate::worker::WorkerPool;
use crate::writer::run_writer;

/// What the Controller needs beyond `PipelineConfig` to actually touch the
/// filesystem: paths, password, and whatever of `-M -C` affects logging
/// only (kept here rather than in `PipelineConfig` since they don't change
/// wire semantics).
pub struct RunRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub password: Option<String>,
}

/// Validate the source per §6.1: must be a regular file, non-empty.
fn validate_source(path: &Path) -> Result<std::fs::Metadata> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(PcompressError::ConfigInvalid(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(PcompressError::ConfigInvalid(format!("{} is empty", path.display())));
    }
    Ok(meta)
}

/// `<dir>/.pcompXXXXXX` next to `output`, where `XXXXXX` is six random
/// alphanumerics seeded from the wall clock and process id — good enough
/// for collision avoidance in a single directory, not a security property.
fn temp_path_for(output: &Path) -> PathBuf {
    let dir = output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut seed = std::process::id() as u64;
    if let Ok(d) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        seed ^= d.as_nanos() as u64;
    }
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut suffix = String::with_capacity(6);
    let mut x = seed | 1;
    for _ in 0..6 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        suffix.push(ALPHABET[(x as usize) % ALPHABET.len()] as char);
    }
    dir.join(format!(".pcomp{suffix}"))
}

/// Register `cancel` to flip true on `SIGINT`/`SIGTERM`. Errors registering
/// the handler are logged and otherwise ignored — a run that can't install
/// a signal handler still completes normally, it just can't be interrupted
/// gracefully.
fn install_signal_handlers(cancel: &Arc<AtomicBool>) {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(cancel)) {
            warn!("failed to register handler for signal {sig}: {e}");
        }
    }
}

/// Propagate the source file's Unix permission bits onto the destination.
/// Ownership (uid/gid) is intentionally not touched — changing it needs
/// privileges this process may not have and no dependency here wraps
/// `chown`; mode bits cover the common "keep the archive readable the same
/// way the source was" expectation.
#[cfg(unix)]
fn propagate_mode(src_meta: &std::fs::Metadata, dest: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perm = std::fs::Permissions::from_mode(src_meta.permissions().mode());
    fs::set_permissions(dest, perm)?;
    Ok(())
}

#[cfg(not(unix))]
fn propagate_mode(_src_meta: &std::fs::Metadata, _dest: &Path) -> Result<()> {
    Ok(())
}

/// Run a full compress or decompress pass per `cfg`/`req`. On success, the
/// temp file is renamed to `req.output`; on any error (including a caught
/// signal) the temp file is removed and nothing at `req.output` is touched.
pub fn run(mut cfg: PipelineConfig, req: RunRequest) -> Result<()> {
    let src_meta = validate_source(&req.input)?;
    if req.output.exists() {
        return Err(PcompressError::ConfigInvalid(format!(
            "{} already exists",
            req.output.display()
        )));
    }

    if matches!(cfg.direction, Direction::Compress) && src_meta.len() <= cfg.chunk_size {
        cfg.single_chunk = true;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&cancel);

    let temp_path = temp_path_for(&req.output);
    let result = match cfg.direction {
        Direction::Compress => run_compress(&cfg, &req, &temp_path, &cancel),
        Direction::Decompress => run_decompress(&cfg, &req, &temp_path, &cancel),
    };

    match result {
        Ok(()) => {
            fs::rename(&temp_path, &req.output)?;
            propagate_mode(&src_meta, &req.output)?;
            info!("wrote {}", req.output.display());
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            error!("run failed: {e}");
            Err(e)
        }
    }
}

fn derive_crypto(cfg: &PipelineConfig, req: &RunRequest, salt: [u8; crypto::SALT_LEN]) -> Result<Option<CryptoContext>> {
    if !cfg.crypto_algo.is_enabled() {
        return Ok(None);
    }
    let password = req
        .password
        .as_deref()
        .ok_or_else(|| PcompressError::PasswordUnavailable("encryption requested but no password given".into()))?;
    let key = crypto::derive_key(password, &salt)?;
    let nonce_base = random_nonce_base();
    Ok(Some(CryptoContext::new(cfg.crypto_algo, key, nonce_base)))
}

fn random_nonce_base() -> [u8; crypto::NONCE_LEN] {
    let mut seed = std::process::id() as u64 ^ 0x9E3779B97F4A7C15;
    if let Ok(d) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        seed ^= d.as_nanos() as u64;
    }
    let mut out = [0u8; crypto::NONCE_LEN];
    let mut x = seed | 1;
    for b in out.iter_mut() {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *b = x as u8;
    }
    out
}

fn random_salt() -> [u8; crypto::SALT_LEN] {
    let mut seed = (std::process::id() as u64).wrapping_mul(2654435761);
    if let Ok(d) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        seed ^= d.as_nanos() as u64;
    }
    let mut out = [0u8; crypto::SALT_LEN];
    let mut x = seed | 1;
    for b in out.iter_mut() {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *b = x as u8;
    }
    out
}

fn run_compress(cfg: &PipelineConfig, req: &RunRequest, temp_path: &Path, cancel: &Arc<AtomicBool>) -> Result<()> {
    let salt = random_salt();
    let crypto = derive_crypto(cfg, req, salt)?;

    let fields = FileHeaderFields {
        algo: cfg.algo,
        version: cfg.version,
        checksum_kind: cfg.checksum_kind,
        dedup_enabled: cfg.dedup.is_enabled(),
        dedup_fixed: cfg.dedup.is_fixed(),
        dedup_global: cfg.dedup.is_global(),
        single_chunk: cfg.single_chunk,
        crypto_algo: cfg.crypto_algo,
        chunk_size: cfg.chunk_size,
        level: cfg.level as u32,
        salt: if cfg.crypto_algo.is_enabled() { salt.to_vec() } else { Vec::new() },
        nonce: if cfg.crypto_algo.is_enabled() {
            crypto.as_ref().expect("crypto enabled implies a context").nonce_base_for_header().to_vec()
        } else {
            Vec::new()
        },
        key_len: if cfg.crypto_algo.is_enabled() { 32 } else { 0 },
    };
    let mut header_bytes = container::encode_file_header_prefix(&fields);
    let mac_key = crypto.as_ref().map(|c| c.mac_key());
    container::append_file_header_auth(&mut header_bytes, mac_key.as_ref(), cfg.version);

    let mut out = BufWriter::new(File::create(temp_path)?);
    std::io::Write::write_all(&mut out, &header_bytes)?;

    let cfg_arc = Arc::new(cfg.clone());
    let crypto_arc = crypto.map(Arc::new);
    let pool = WorkerPool::spawn(Arc::clone(&cfg_arc), crypto_arc, Arc::clone(cancel));
    let pool_ref = &pool;

    let reader = BufReader::new(File::open(&req.input)?);
    // Producer and Writer run concurrently: the Producer gets its own
    // thread, the Writer drains on the thread already here. Neither needs
    // the other to finish first — the worker pool's bounded channels
    // provide the backpressure between them.
    let (produced, written) = std::thread::scope(|scope| {
        let handle = scope.spawn(move || run_compress_producer(reader, &cfg_arc, pool_ref));
        let written = run_writer(&mut out, pool_ref, cancel);
        let produced = handle.join().expect("producer thread panicked");
        (produced, written)
    });
    pool.shutdown();
    produced?;
    written?;

    std::io::Write::write_all(&mut out, &container::encode_trailer())?;
    std::io::Write::flush(&mut out)?;

    if cancel.load(Ordering::SeqCst) {
        return Err(PcompressError::ConfigInvalid("run was cancelled".into()));
    }
    Ok(())
}

fn run_decompress(cfg: &PipelineConfig, req: &RunRequest, temp_path: &Path, cancel: &Arc<AtomicBool>) -> Result<()> {
    let mut reader = BufReader::new(File::open(&req.input)?);
    let mut probe = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut probe)?;

    let decoded = container::decode_file_header(&probe)?;
    if decoded.fields.version > crate::config::CURRENT_VERSION
        || decoded.fields.version < crate::config::MIN_SUPPORTED_VERSION
    {
        return Err(PcompressError::VersionUnsupported {
            found: decoded.fields.version,
            current: crate::config::CURRENT_VERSION,
            min: crate::config::MIN_SUPPORTED_VERSION,
        });
    }

    let crypto = if decoded.fields.crypto_algo.is_enabled() {
        let password = req.password.as_deref().ok_or_else(|| {
            PcompressError::PasswordUnavailable("file is encrypted but no password was given".into())
        })?;
        let key = crypto::derive_key(password, &decoded.fields.salt)?;
        container::verify_file_header(&decoded, Some(&key))?;
        let mut nonce_base = [0u8; crypto::NONCE_LEN];
        nonce_base.copy_from_slice(&decoded.fields.nonce);
        Some(CryptoContext::new(decoded.fields.crypto_algo, key, nonce_base))
    } else {
        container::verify_file_header(&decoded, None)?;
        None
    };

    let mut effective = cfg.clone();
    effective.algo = decoded.fields.algo;
    effective.version = decoded.fields.version;
    effective.checksum_kind = decoded.fields.checksum_kind;
    effective.chunk_size = decoded.fields.chunk_size;
    effective.level = decoded.fields.level as i32;
    effective.crypto_algo = decoded.fields.crypto_algo;
    effective.single_chunk = decoded.fields.single_chunk;
    effective.dedup = decode_dedup_mode(&decoded.fields);

    let cfg_arc = Arc::new(effective);
    let crypto_arc = crypto.map(Arc::new);
    let pool = WorkerPool::spawn(Arc::clone(&cfg_arc), crypto_arc, Arc::clone(cancel));
    let pool_ref = &pool;

    let body = &probe[decoded.total_len..];
    let cksum_bytes = cfg_arc.cksum_bytes();
    let mac_bytes = cfg_arc.mac_bytes();

    let mut out = BufWriter::new(File::create(temp_path)?);
    // Same concurrent Producer/Writer arrangement as the compress path.
    let (produced, written) = std::thread::scope(|scope| {
        let handle = scope.spawn(move || run_decompress_producer(body, cksum_bytes, mac_bytes, pool_ref));
        let written = run_writer(&mut out, pool_ref, cancel);
        let produced = handle.join().expect("producer thread panicked");
        (produced, written)
    });
    pool.shutdown();
    produced?;
    written?;
    std::io::Write::flush(&mut out)?;

    if cancel.load(Ordering::SeqCst) {
        return Err(PcompressError::ConfigInvalid("run was cancelled".into()));
    }
    Ok(())
}

fn decode_dedup_mode(fields: &FileHeaderFields) -> crate::config::DedupMode {
    use crate::config::DedupMode;
    if !fields.dedup_enabled {
        DedupMode::None
    } else if fields.dedup_global {
        DedupMode::Global { delta_similarity: None }
    } else if fields.dedup_fixed {
        DedupMode::Fixed
    } else {
        DedupMode::Rabin { delta_similarity: None }
    }
}
