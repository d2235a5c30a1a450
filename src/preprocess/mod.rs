//! Reversible preprocessing filters run ahead of the codec backend (§4.2
//! step 4, `-L`/`-P`). Neither filter changes the byte count; both are
//! simple frame-tagged transforms in the same spirit as the reference
//! implementation's run-length pre-filter (`perf::rle_encode`/`rle_decode`):
//! a small, fully reversible, allocation-light pass that either helps the
//! downstream entropy coder or — when it doesn't — costs almost nothing.

pub mod delta2;
pub mod lzp;

pub use delta2::{delta2_decode, delta2_encode};
pub use lzp::{lzp_decode, lzp_encode};
