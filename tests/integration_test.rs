//! End-to-end round trips through [`pcompress::controller::run`] against
//! real temp files, covering the testable properties this format commits to:
//! round-trip fidelity, thread-count order invariance, authentication
//! sensitivity, the version gate, and fallback-to-raw-storage on
//! incompressible input.

use std::fs;

use pcompress::checksum::ChecksumKind;
use pcompress::codec::CodecId;
use pcompress::config::{BlockSizeIndex, CryptoAlgo, DedupMode, Direction, PipelineConfig, PreprocessConfig};
use pcompress::controller::{self, RunRequest};
use pcompress::error::PcompressError;

fn base_config(direction: Direction, algo: CodecId, chunk_size: u64, nthreads: usize) -> PipelineConfig {
    PipelineConfig {
        direction,
        algo,
        level: 6,
        chunk_size,
        nthreads,
        version: pcompress::config::CURRENT_VERSION,
        checksum_kind: ChecksumKind::Crc32,
        dedup: DedupMode::None,
        block_size: BlockSizeIndex::clamped(3),
        preprocess: PreprocessConfig::default(),
        crypto_algo: CryptoAlgo::None,
        key_len: 32,
        single_chunk: false,
        show_memory: false,
        show_stats: false,
    }
}

fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

#[test]
fn round_trip_lz4_repeated_text() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"Hello, world!\n".repeat(100_000);
    let input = write_temp(&dir, "input.txt", &data);
    let output = dir.path().join("input.txt.pz");

    let cfg = base_config(Direction::Compress, CodecId::Lz4, 1024 * 1024, 4);
    controller::run(
        cfg,
        RunRequest { input: input.clone(), output: output.clone(), password: None },
    )
    .unwrap();
    assert!(output.exists());

    let restored = dir.path().join("input.txt.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 1024 * 1024, 4);
    controller::run(
        dcfg,
        RunRequest { input: output, output: restored.clone(), password: None },
    )
    .unwrap();

    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn round_trip_zlib_random_bytes_two_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = vec![0u8; 7 * 1024 * 1024];
    let mut x: u64 = 0x1234_5678_9abc_def1;
    for b in data.iter_mut() {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *b = x as u8;
    }
    let input = write_temp(&dir, "rand.bin", &data);
    let output = dir.path().join("rand.bin.pz");

    let cfg = base_config(Direction::Compress, CodecId::Zlib, 5 * 1024 * 1024, 2);
    controller::run(cfg, RunRequest { input, output: output.clone(), password: None }).unwrap();

    let restored = dir.path().join("rand.bin.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 5 * 1024 * 1024, 2);
    controller::run(dcfg, RunRequest { input: output, output: restored.clone(), password: None }).unwrap();

    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn order_invariance_across_thread_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = Vec::new();
    for i in 0..200_000u32 {
        data.extend_from_slice(&i.to_le_bytes());
    }
    let input = write_temp(&dir, "seq.bin", &data);

    let mut outputs = Vec::new();
    for nthreads in [1usize, 2, 8] {
        let output = dir.path().join(format!("seq.bin.{nthreads}.pz"));
        let cfg = base_config(Direction::Compress, CodecId::Zlib, 256 * 1024, nthreads);
        controller::run(cfg, RunRequest { input: input.clone(), output: output.clone(), password: None }).unwrap();
        outputs.push(fs::read(output).unwrap());
    }
    for w in outputs.windows(2) {
        assert_eq!(w[0], w[1], "compressed output must not depend on thread count");
    }
}

#[test]
fn wrong_password_fails_authentication_before_any_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"top secret payload".repeat(500);
    let input = write_temp(&dir, "secret.bin", &data);
    let output = dir.path().join("secret.bin.pz");

    let mut cfg = base_config(Direction::Compress, CodecId::Lzma, 1024 * 1024, 2);
    cfg.crypto_algo = CryptoAlgo::Aes;
    controller::run(
        cfg,
        RunRequest { input, output: output.clone(), password: Some("correct horse".into()) },
    )
    .unwrap();

    let restored = dir.path().join("secret.bin.restored");
    let mut dcfg = base_config(Direction::Decompress, CodecId::None, 1024 * 1024, 2);
    dcfg.crypto_algo = CryptoAlgo::Aes;
    let err = controller::run(
        dcfg,
        RunRequest { input: output, output: restored.clone(), password: Some("wrong password".into()) },
    )
    .unwrap_err();
    assert!(matches!(err, PcompressError::Container(_) | PcompressError::AuthMismatch { .. }));
    assert!(!restored.exists(), "no plaintext should be written on auth failure");
}

#[test]
fn tampering_a_chunk_byte_fails_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"the quick brown fox jumps over the lazy dog ".repeat(1000);
    let input = write_temp(&dir, "tamper.bin", &data);
    let output = dir.path().join("tamper.bin.pz");

    let cfg = base_config(Direction::Compress, CodecId::Zlib, 1024 * 1024, 1);
    controller::run(cfg, RunRequest { input, output: output.clone(), password: None }).unwrap();

    let mut bytes = fs::read(&output).unwrap();
    let last = bytes.len() - 16;
    bytes[last] ^= 0xff;
    fs::write(&output, &bytes).unwrap();

    let restored = dir.path().join("tamper.bin.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 1024 * 1024, 1);
    let err = controller::run(dcfg, RunRequest { input: output, output: restored.clone(), password: None }).unwrap_err();
    assert!(matches!(err, PcompressError::Container(_) | PcompressError::AuthMismatch { .. }));
    assert!(!restored.exists());
}

#[test]
fn incompressible_input_round_trips_via_raw_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = vec![0u8; 256 * 1024];
    let mut x: u64 = 0xDEAD_BEEF_CAFE_F00D;
    for b in data.iter_mut() {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *b = x as u8;
    }
    let input = write_temp(&dir, "noise.bin", &data);
    let output = dir.path().join("noise.bin.pz");

    let cfg = base_config(Direction::Compress, CodecId::Lzma, 1024 * 1024, 1);
    controller::run(cfg, RunRequest { input, output: output.clone(), password: None }).unwrap();

    let restored = dir.path().join("noise.bin.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 1024 * 1024, 1);
    controller::run(dcfg, RunRequest { input: output, output: restored.clone(), password: None }).unwrap();

    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn dedup_round_trips_with_repeated_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let block = b"ABCDEFGHIJKLMNOP".repeat(256);
    let mut data = Vec::new();
    for _ in 0..20 {
        data.extend_from_slice(&block);
    }
    data.extend_from_slice(b"unique tail content that differs from the rest");
    let input = write_temp(&dir, "dup.bin", &data);
    let output = dir.path().join("dup.bin.pz");

    let mut cfg = base_config(Direction::Compress, CodecId::Zlib, 1024 * 1024, 2);
    cfg.dedup = DedupMode::Fixed;
    controller::run(cfg, RunRequest { input, output: output.clone(), password: None }).unwrap();

    let restored = dir.path().join("dup.bin.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 1024 * 1024, 2);
    controller::run(dcfg, RunRequest { input: output, output: restored.clone(), password: None }).unwrap();

    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn single_chunk_flag_set_for_small_input() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"small file body".to_vec();
    let input = write_temp(&dir, "small.bin", &data);
    let output = dir.path().join("small.bin.pz");

    let cfg = base_config(Direction::Compress, CodecId::Zlib, 4 * 1024 * 1024, 2);
    controller::run(cfg, RunRequest { input, output: output.clone(), password: None }).unwrap();

    let bytes = fs::read(&output).unwrap();
    let decoded = pcompress::container::decode_file_header(&bytes).unwrap();
    assert!(decoded.fields.single_chunk);

    let restored = dir.path().join("small.bin.restored");
    let dcfg = base_config(Direction::Decompress, CodecId::None, 4 * 1024 * 1024, 2);
    controller::run(dcfg, RunRequest { input: output, output: restored.clone(), password: None }).unwrap();
    assert_eq!(fs::read(restored).unwrap(), data);
}

#[test]
fn missing_output_collision_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"data".to_vec();
    let input = write_temp(&dir, "x.bin", &data);
    let output = write_temp(&dir, "x.bin.pz", b"already here");

    let cfg = base_config(Direction::Compress, CodecId::Zlib, 1024 * 1024, 1);
    let err = controller::run(cfg, RunRequest { input, output, password: None }).unwrap_err();
    assert!(matches!(err, PcompressError::ConfigInvalid(_)));
}

#[test]
fn empty_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_temp(&dir, "empty.bin", b"");
    let output = dir.path().join("empty.bin.pz");

    let cfg = base_config(Direction::Compress, CodecId::Zlib, 1024 * 1024, 1);
    let err = controller::run(cfg, RunRequest { input, output, password: None }).unwrap_err();
    assert!(matches!(err, PcompressError::ConfigInvalid(_)));
}
