//! Frozen C ABI for codec plugins (§4.1.1).
//!
//! A plugin is a shared library that exports one symbol:
//!
//! ```c
//! const PcompressCodecPlugin *pcompress_codec_register(void);
//! ```
//!
//! The returned pointer is **static** — the host never frees it. Backends
//! named in the CLI table but out of scope for this crate's own codec set
//! (`lzfx`, `ppmd`, `libbsc`) resolve only through a registered plugin; there
//! is no in-crate fallback implementation for any of them.
//!
//! # Stability contract
//! - `PLUGIN_ABI_VERSION` is **monotonically increasing and never decremented**.
//! - New fields are appended **at the end** of `PcompressCodecPlugin` only.
//! - Existing field offsets and calling conventions are frozen forever.
//! - A plugin compiled against ABI version N is compatible with any host ≥ N.
//!
//! # Thread safety
//! Both `compress` and `decompress` MUST be safe to call concurrently from
//! multiple threads on different buffer pairs. The plugin MUST NOT use any
//! global mutable state of its own; all memory is owned by the caller and
//! passed via explicit length-annotated buffers.
//!
//! # Memory model
//! The plugin never allocates or frees memory on behalf of the host. The
//! host pre-allocates the output buffer using the upper bound returned by
//! `compress_bound`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use super::CodecId;

/// ABI version of this header. Written into `PcompressCodecPlugin::abi_version`.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Return codes from plugin compress/decompress functions.
pub mod rc {
    /// Success — `*out_len` contains the number of bytes written.
    pub const OK: i32 = 0;
    /// Output buffer too small — caller must retry with a larger buffer.
    pub const OVERFLOW: i32 = -1;
    /// Input data is corrupt or truncated.
    pub const CORRUPT: i32 = -2;
    /// Codec-internal error (OOM, bad level, etc.).
    pub const INTERNAL: i32 = -3;
}

/// Frozen C ABI descriptor for a codec plugin.
///
/// # Safety
/// All function pointers are `unsafe extern "C"` because they cross an FFI
/// boundary. The Rust wrapper ([`PluginCodec`]) enforces the safety
/// invariants documented on each field before delegating to the raw pointer.
///
/// # Layout
/// `#[repr(C)]` is mandatory. Do not reorder fields. New fields go at the
/// end only.
#[repr(C)]
pub struct PcompressCodecPlugin {
    /// 8-byte ASCII tag this plugin answers for (`"lzfx"`, `"ppmd"`,
    /// `"libbsc"`, zero-padded), matching the on-wire `FileHeader.algo` tag.
    pub tag: [u8; 8],

    /// Must equal `PLUGIN_ABI_VERSION`. The host rejects plugins with a
    /// higher `abi_version` than it was compiled against.
    pub abi_version: u32,

    /// Compress `in_len` bytes from `in_buf` into `out_buf`.
    ///
    /// On entry, `*out_len` is the capacity of `out_buf` in bytes. On
    /// `rc::OK`, `*out_len` is set to the number of bytes written.
    ///
    /// Thread safety: reentrant — safe to call from multiple threads
    /// simultaneously with non-overlapping buffer pairs.
    ///
    /// # Safety
    /// - `in_buf[0..in_len]` must be a valid readable region.
    /// - `out_buf[0..*out_len]` must be a valid writable region.
    /// - The two regions must not overlap.
    /// - Neither pointer is null.
    pub compress: Option<
        unsafe extern "C" fn(
            in_buf: *const u8,
            in_len: u32,
            out_buf: *mut u8,
            out_len: *mut u32,
            level: i32,
        ) -> i32,
    >,

    /// Decompress `in_len` bytes from `in_buf` into `out_buf`.
    ///
    /// Same buffer and thread-safety contract as `compress`.
    pub decompress: Option<
        unsafe extern "C" fn(in_buf: *const u8, in_len: u32, out_buf: *mut u8, out_len: *mut u32) -> i32,
    >,

    /// Returns a guaranteed upper bound on the compressed output size for
    /// `in_len` bytes of input at any level. Used by the host to pre-allocate
    /// the `out_buf` passed to `compress`.
    ///
    /// MUST be a pure function: deterministic, no side effects, no I/O, no
    /// global state reads. Safe to call from any thread at any time.
    pub compress_bound: Option<unsafe extern "C" fn(in_len: u32) -> u32>,
}

// Safety: the ABI contract declares all fn pointers reentrant.
unsafe impl Send for PcompressCodecPlugin {}
unsafe impl Sync for PcompressCodecPlugin {}

/// Safe Rust wrapper around a loaded [`PcompressCodecPlugin`].
pub struct PluginCodec {
    desc: &'static PcompressCodecPlugin,
}

impl PluginCodec {
    /// Wrap a static plugin descriptor after validating the ABI version.
    pub fn new(desc: &'static PcompressCodecPlugin) -> Result<Self, String> {
        if desc.abi_version > PLUGIN_ABI_VERSION {
            return Err(format!(
                "plugin ABI version {} is newer than host ABI version {}",
                desc.abi_version, PLUGIN_ABI_VERSION,
            ));
        }
        Ok(Self { desc })
    }

    pub fn tag(&self) -> &[u8; 8] { &self.desc.tag }

    pub fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, String> {
        let f = self.desc.compress.ok_or("plugin missing compress fn")?;
        let bound_fn = self.desc.compress_bound.ok_or("plugin missing compress_bound fn")?;
        let cap = unsafe { bound_fn(data.len() as u32) } as usize;
        let mut out = vec![0u8; cap];
        let mut out_len = cap as u32;
        let rc = unsafe { f(data.as_ptr(), data.len() as u32, out.as_mut_ptr(), &mut out_len, level) };
        if rc != rc::OK {
            return Err(format!("plugin compress returned error code {rc}"));
        }
        out.truncate(out_len as usize);
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8], orig_size: usize) -> Result<Vec<u8>, String> {
        let f = self.desc.decompress.ok_or("plugin missing decompress fn")?;
        let mut out = vec![0u8; orig_size];
        let mut out_len = orig_size as u32;
        let rc = unsafe { f(data.as_ptr(), data.len() as u32, out.as_mut_ptr(), &mut out_len) };
        if rc != rc::OK {
            return Err(format!("plugin decompress returned error code {rc}"));
        }
        out.truncate(out_len as usize);
        Ok(out)
    }
}

/// A plugin's declared output bound doesn't tell us the original size on
/// decode, so plugin-backed chunks carry their decompressed length in the
/// chunk header the same as every other codec (§6.2 `len_orig`); the
/// adapter below stores it alongside the descriptor for `Codec::decompress`
/// to use before the container layer even gets involved.
struct RegisteredPlugin {
    codec: PluginCodec,
}

static PLUGIN_REGISTRY: OnceLock<Mutex<HashMap<CodecId, RegisteredPlugin>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<CodecId, RegisteredPlugin>> {
    PLUGIN_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a plugin descriptor for one of the out-of-scope codec ids
/// (`Lzfx`, `Ppmd`, `Libbsc`). Overwrites any previous registration for the
/// same id.
pub fn register_plugin(id: CodecId, desc: &'static PcompressCodecPlugin) -> Result<(), String> {
    let codec = PluginCodec::new(desc)?;
    registry().lock().unwrap().insert(id, RegisteredPlugin { codec });
    Ok(())
}

struct PluginCodecAdapter {
    id: CodecId,
}

impl super::Codec for PluginCodecAdapter {
    fn id(&self) -> CodecId { self.id }

    fn compress(&self, src: &[u8], level: i32, _nthreads: usize) -> Result<Vec<u8>, super::CodecError> {
        let reg = registry().lock().unwrap();
        let plugin = reg
            .get(&self.id)
            .ok_or_else(|| super::CodecError::Unavailable(self.id.tag().to_owned()))?;
        let mut out = plugin.codec.compress(src, level).map_err(super::CodecError::Compression)?;
        // Prepend the original length so `decompress` knows how large a
        // buffer to hand back to the plugin (plugins are stateless, and the
        // ABI gives decompress no way to query it otherwise).
        let mut framed = Vec::with_capacity(out.len() + 4);
        framed.extend_from_slice(&(src.len() as u32).to_le_bytes());
        framed.append(&mut out);
        Ok(framed)
    }

    fn decompress(&self, src: &[u8]) -> Result<Vec<u8>, super::CodecError> {
        if src.len() < 4 {
            return Err(super::CodecError::Decompression("plugin frame too short".into()));
        }
        let orig_len = u32::from_le_bytes(src[0..4].try_into().unwrap()) as usize;
        let reg = registry().lock().unwrap();
        let plugin = reg
            .get(&self.id)
            .ok_or_else(|| super::CodecError::Unavailable(self.id.tag().to_owned()))?;
        plugin
            .codec
            .decompress(&src[4..], orig_len)
            .map_err(super::CodecError::Decompression)
    }
}

pub(super) fn resolve_plugin(id: CodecId) -> Option<Box<dyn super::Codec>> {
    if registry().lock().unwrap().contains_key(&id) {
        Some(Box::new(PluginCodecAdapter { id }))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn noop_bound(in_len: u32) -> u32 { in_len + 16 }

    unsafe extern "C" fn passthrough_compress(
        in_buf: *const u8,
        in_len: u32,
        out_buf: *mut u8,
        out_len: *mut u32,
        _level: i32,
    ) -> i32 {
        std::ptr::copy_nonoverlapping(in_buf, out_buf, in_len as usize);
        *out_len = in_len;
        rc::OK
    }

    unsafe extern "C" fn passthrough_decompress(
        in_buf: *const u8,
        in_len: u32,
        out_buf: *mut u8,
        out_len: *mut u32,
    ) -> i32 {
        std::ptr::copy_nonoverlapping(in_buf, out_buf, in_len as usize);
        *out_len = in_len;
        rc::OK
    }

    static TEST_PLUGIN: PcompressCodecPlugin = PcompressCodecPlugin {
        tag: *b"lzfx\0\0\0\0",
        abi_version: PLUGIN_ABI_VERSION,
        compress: Some(passthrough_compress),
        decompress: Some(passthrough_decompress),
        compress_bound: Some(noop_bound),
    };

    #[test]
    fn registered_plugin_round_trips_through_codec_trait() {
        use super::super::Codec;
        register_plugin(CodecId::Lzfx, &TEST_PLUGIN).unwrap();
        let codec = resolve_plugin(CodecId::Lzfx).expect("plugin should now resolve");
        let data = b"plugin payload".to_vec();
        let compressed = codec.compress(&data, 6, 1).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
