//! Secure channel envelope seal/open throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rootlink::crypto::{
    derive_channel_keys, derive_channel_secret, ChannelCipher, ChannelKind, Direction,
};

fn data_cipher() -> ChannelCipher {
    let secret = derive_channel_secret(b"bench-psk", &[1; 32], &[2; 32]).expect("secret");
    let keys = derive_channel_keys(&secret, &[3; 32], 1).expect("keys");
    ChannelCipher::new(keys.data, ChannelKind::Data)
}

const SIZES: [(&str, usize); 3] = [("small", 64), ("frame", 64 * 1024), ("large", 1024 * 1024)];

fn bench_seal(c: &mut Criterion) {
    let cipher = data_cipher();
    let mut group = c.benchmark_group("envelope_seal");

    for (name, size) in SIZES {
        let payload = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", name), &payload, |b, p| {
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                cipher.seal(Direction::ClientToServer, 1, seq, black_box(p))
            })
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let cipher = data_cipher();
    let mut group = c.benchmark_group("envelope_open");

    for (name, size) in SIZES {
        let envelope = cipher
            .seal(Direction::ServerToClient, 1, 1, &vec![0xa5u8; size])
            .expect("seal failed");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", name), &envelope, |b, env| {
            b.iter(|| cipher.open(black_box(env)))
        });
    }
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    c.bench_function("derive_channel_keys", |b| {
        let secret = derive_channel_secret(b"bench-psk", &[1; 32], &[2; 32]).expect("secret");
        let mut generation = 0u32;
        b.iter(|| {
            generation = generation.wrapping_add(1);
            derive_channel_keys(black_box(&secret), &[3; 32], generation)
        })
    });
}

criterion_group!(benches, bench_seal, bench_open, bench_key_derivation);
criterion_main!(benches);
