//! Delta2: a stride-2 byte delta filter.
//!
//! Many chunk payloads are arrays of small fixed-width samples (16-bit audio,
//! sensor logs, already-transposed numeric columns from the dedup index
//! table) where adjacent-but-one bytes are close in value. Subtracting each
//! byte from the one two positions back turns smooth sequences into small
//! signed residues that compress better than the raw bytes, and is its own
//! exact inverse given the same stride. [`crate::codec::CodecProps::delta2_span`]
//! tells the pipeline whether a given backend's prior behavior suggests this
//! is worth trying.

const STRIDE: usize = 2;

pub fn delta2_encode(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data.len()];
    for i in 0..data.len() {
        let prev = if i >= STRIDE { data[i - STRIDE] } else { 0 };
        out[i] = data[i].wrapping_sub(prev);
    }
    out
}

pub fn delta2_decode(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data.len()];
    for i in 0..data.len() {
        let prev = if i >= STRIDE { out[i - STRIDE] } else { 0 };
        out[i] = data[i].wrapping_add(prev);
    }
    out
}
