use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pcompress::codec::{Codec, Lz4Codec, LzmaCodec, ZlibCodec};

fn bench_compression(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024];
    let zlib = ZlibCodec;
    let lz4 = Lz4Codec;
    let lzma = LzmaCodec;
    c.bench_function("zlib_compress_1mb", |b| b.iter(|| zlib.compress(black_box(&data), 6, 1)));
    c.bench_function("lz4_compress_1mb", |b| b.iter(|| lz4.compress(black_box(&data), 0, 1)));
    c.bench_function("lzma_compress_1mb", |b| b.iter(|| lzma.compress(black_box(&data), 6, 1)));
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
