//! Criterion benchmarks for the secure channel codec and gesture encoding.
//!
//! Run with:
//! ```bash
//! cargo bench --package ark-core --bench codec_bench
//! ```

use ark_core::domain::gesture::{encode_commands, multi_touch, swipe, tap, Contact, RawPoint};
use ark_core::{decode_frame, encode_frame, TokenCipher};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    for size in [256usize, 64 * 1024, 512 * 1024] {
        let payload = vec![0x5Au8; size];
        let framed = encode_frame(&payload).unwrap();
        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, p| {
            b.iter(|| encode_frame(black_box(p)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &framed, |b, f| {
            b.iter(|| decode_frame(black_box(f)).unwrap().len())
        });
    }
    group.finish();
}

fn bench_cipher(c: &mut Criterion) {
    let cipher = TokenCipher::from_key([7; 32]);
    // Roughly the size of a base64 JPEG screen sample.
    let plaintext = vec![b'A'; 120 * 1024];
    let token = cipher.encrypt(&plaintext);

    c.bench_function("cipher/encrypt_120k", |b| {
        b.iter(|| cipher.encrypt(black_box(&plaintext)))
    });
    c.bench_function("cipher/decrypt_120k", |b| {
        b.iter(|| cipher.decrypt(black_box(&token)).unwrap())
    });
}

fn bench_gestures(c: &mut Criterion) {
    let from = RawPoint { x: 100, y: 3000 };
    let to = RawPoint { x: 100, y: 500 };
    let contacts: Vec<Contact> = (0..10u8)
        .map(|i| Contact {
            id: i,
            point: RawPoint {
                x: u32::from(i) * 300,
                y: 1000,
            },
        })
        .collect();

    c.bench_function("gesture/tap", |b| {
        b.iter(|| encode_commands(&tap(black_box(from), 100, 50)))
    });
    c.bench_function("gesture/swipe_10", |b| {
        b.iter(|| encode_commands(&swipe(black_box(from), to, 100, 200, 10).unwrap()))
    });
    c.bench_function("gesture/multi_touch_10", |b| {
        b.iter(|| encode_commands(&multi_touch(black_box(&contacts), 100, 50).unwrap()))
    });
}

criterion_group!(benches, bench_frame, bench_cipher, bench_gestures);
criterion_main!(benches);
