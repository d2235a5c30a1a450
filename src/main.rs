use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use pcompress::checksum::ChecksumKind;
use pcompress::codec::CodecId;
use pcompress::config::{
    BlockSizeIndex, CryptoAlgo, DedupMode, DeltaSimilarity, Direction, PipelineConfig,
    PreprocessConfig, CURRENT_VERSION, DEFAULT_CHUNK_SIZE, DEFAULT_LEVEL,
};
use pcompress::controller::{self, RunRequest};

/// Parallel chunked compression with dedup, preprocessing, and authenticated encryption.
#[derive(Parser, Debug)]
#[command(name = "pcompress", version = "1.0.0", about = "Parallel chunked compression pipeline")]
struct Cli {
    /// Compress with the given backend: lzfx, lz4, zlib, lzma, lzmaMt, bzip2, ppmd, libbsc, adapt, adapt2, none
    #[arg(short = 'c', long = "compress", value_name = "ALGO")]
    compress: Option<String>,

    /// Decompress
    #[arg(short = 'd', long = "decompress")]
    decompress: bool,

    /// Chunk size, accepts g/m/k suffixes
    #[arg(short = 's', long = "chunk-size", value_name = "SIZE")]
    chunk_size: Option<String>,

    /// Compression level 0..14
    #[arg(short = 'l', long = "level", default_value_t = DEFAULT_LEVEL)]
    level: i32,

    /// Worker thread count, 1..256
    #[arg(short = 't', long = "threads")]
    threads: Option<usize>,

    /// Rabin content-defined dedup
    #[arg(short = 'D', long = "dedup")]
    dedup: bool,

    /// Global dedup index shared across the whole file
    #[arg(short = 'G', long = "global-dedup")]
    global_dedup: bool,

    /// Fixed-block dedup (mutually exclusive with -D/-E)
    #[arg(short = 'F', long = "fixed-dedup")]
    fixed_dedup: bool,

    /// Delta encoding at 60% similarity threshold; implies -D
    #[arg(short = 'E', long = "delta", conflicts_with = "delta_aggressive")]
    delta: bool,

    /// Delta encoding at 40% similarity threshold; implies -D
    #[arg(long = "delta-aggressive")]
    delta_aggressive: bool,

    /// Do not split chunks at rabin boundaries
    #[arg(short = 'r', long = "no-rabin-split")]
    no_rabin_split: bool,

    /// LZP preprocessing
    #[arg(short = 'L', long = "lzp")]
    lzp: bool,

    /// Delta2 preprocessing
    #[arg(short = 'P', long = "delta2")]
    delta2: bool,

    /// Checksum kind: crc32, blake3, sha256
    #[arg(short = 'S', long = "checksum", value_name = "CKNAME")]
    checksum: Option<String>,

    /// Average dedup block size index 1..5
    #[arg(short = 'B', long = "block-size-index")]
    block_size_index: Option<u8>,

    /// Encrypt chunks: AES or SALSA20
    #[arg(short = 'e', long = "encrypt", value_name = "ALGO")]
    encrypt: Option<String>,

    /// Password file (zeroed after read)
    #[arg(short = 'w', long = "password-file", value_name = "PATH")]
    password_file: Option<PathBuf>,

    /// Key length in bytes: 16 or 32
    #[arg(short = 'k', long = "key-len", default_value_t = 32)]
    key_len: u32,

    /// Show memory usage
    #[arg(short = 'M', long = "show-memory")]
    show_memory: bool,

    /// Show compression statistics
    #[arg(short = 'C', long = "show-stats")]
    show_stats: bool,

    /// Source file
    input: PathBuf,
}

fn parse_chunk_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        _ => (s, 1),
    };
    let n: u64 = digits.parse().with_context(|| format!("invalid chunk size '{s}'"))?;
    Ok(n * mult)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.compress.is_some() == cli.decompress {
        bail!("exactly one of -c <algo> or -d must be given");
    }
    if cli.fixed_dedup && (cli.dedup || cli.delta || cli.delta_aggressive) {
        bail!("-F is mutually exclusive with -D/-E/-EE");
    }
    if cli.global_dedup && (cli.delta || cli.delta_aggressive) {
        bail!("-G is incompatible with delta encoding");
    }

    let direction = if cli.decompress { Direction::Decompress } else { Direction::Compress };

    let algo = match &cli.compress {
        Some(name) => CodecId::from_name(name).with_context(|| format!("unknown codec '{name}'"))?,
        None => CodecId::None,
    };

    let chunk_size = match &cli.chunk_size {
        Some(s) => parse_chunk_size(s)?,
        None => DEFAULT_CHUNK_SIZE,
    };
    let total_memory = total_memory_bytes();
    PipelineConfig::validate_chunk_size(chunk_size, total_memory)?;

    let checksum_kind = match &cli.checksum {
        Some(s) => ChecksumKind::from_name(s).with_context(|| format!("unknown checksum kind '{s}'"))?,
        None => ChecksumKind::Crc32,
    };

    let delta_similarity = if cli.delta_aggressive {
        Some(DeltaSimilarity::Aggressive)
    } else if cli.delta {
        Some(DeltaSimilarity::Moderate)
    } else {
        None
    };
    let dedup = if cli.fixed_dedup {
        DedupMode::Fixed
    } else if cli.global_dedup {
        DedupMode::Global { delta_similarity }
    } else if cli.dedup || delta_similarity.is_some() {
        DedupMode::Rabin { delta_similarity }
    } else {
        DedupMode::None
    };
    let _ = cli.no_rabin_split; // chunk-boundary-vs-rabin tradeoff is a Producer-level tuning knob, not yet exposed

    let crypto_algo = match cli.encrypt.as_deref() {
        Some("AES") | Some("aes") => CryptoAlgo::Aes,
        Some("SALSA20") | Some("salsa20") => CryptoAlgo::Salsa20,
        Some(other) => bail!("unknown encryption algorithm '{other}'"),
        None => CryptoAlgo::None,
    };
    if crypto_algo.is_enabled() && cli.key_len != 16 && cli.key_len != 32 {
        bail!("-k must be 16 or 32");
    }

    let password = match &cli.password_file {
        Some(path) => Some(pcompress::crypto::get_pw_string(path)?.to_string()),
        None if crypto_algo.is_enabled() => {
            Some(prompt_password().context("reading password from terminal")?)
        }
        None => None,
    };

    let nthreads = cli.threads.unwrap_or_else(num_cpus::get).clamp(1, 256);

    let cfg = PipelineConfig {
        direction,
        algo,
        level: cli.level.clamp(0, 14),
        chunk_size,
        nthreads,
        version: CURRENT_VERSION,
        checksum_kind,
        dedup,
        block_size: BlockSizeIndex::clamped(cli.block_size_index.unwrap_or(3)),
        preprocess: PreprocessConfig { lzp: cli.lzp, delta2: cli.delta2 },
        crypto_algo,
        key_len: cli.key_len as usize,
        single_chunk: false,
        show_memory: cli.show_memory,
        show_stats: cli.show_stats,
    };

    let output = match direction {
        Direction::Compress => {
            let mut name = cli.input.clone().into_os_string();
            name.push(".pz");
            PathBuf::from(name)
        }
        Direction::Decompress => {
            let name = cli.input.to_string_lossy();
            match name.strip_suffix(".pz") {
                Some(stripped) => PathBuf::from(stripped),
                None => bail!("'{name}' does not end in .pz; pass the archive produced by -c"),
            }
        }
    };

    let req = RunRequest { input: cli.input.clone(), output: output.clone(), password };
    controller::run(cfg, req)?;

    if cli.show_stats {
        let in_size = std::fs::metadata(&cli.input)?.len();
        let out_size = std::fs::metadata(&output)?.len();
        log::info!(
            "{} -> {} ({} -> {} bytes)",
            cli.input.display(),
            output.display(),
            in_size,
            out_size
        );
    }

    Ok(())
}

/// `-w` covers the unattended case; this is the interactive fallback when
/// encryption is requested without one, reading a single line from stdin.
fn prompt_password() -> anyhow::Result<String> {
    use std::io::Write;
    eprint!("Password: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

fn total_memory_bytes() -> u64 {
    // Conservative fallback when the platform call is unavailable: treat the
    // limit as unenforced (`validate_chunk_size` skips the ceiling at 0).
    #[cfg(target_os = "linux")]
    {
        if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().unwrap_or(0);
                    return kb * 1024;
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
