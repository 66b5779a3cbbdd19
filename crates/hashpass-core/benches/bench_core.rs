// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BENCHMARK SUITE — hashpass-core
//
// Measures the verification hot path: Argon2 hashing at several memory
// costs, zero-bit counting, and invite minting.
// Run: cargo bench -p hashpass-core
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hashpass_core::verifier::{compute_pow_hash, leading_zero_bits, PowParams};
use hashpass_core::{mint_invite_code, ServerSecret};

fn bench_pow_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("verifier/argon2d");
    group.sample_size(10);

    // Production is 65536 KiB; smaller costs chart the memory scaling curve.
    for memory_kib in [1_024u32, 8_192, 65_536] {
        let params = PowParams {
            time_cost: 1,
            memory_cost_kib: memory_kib,
            parallelism: 1,
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}KiB", memory_kib)),
            &params,
            |b, params| {
                b.iter(|| {
                    black_box(
                        compute_pow_hash(
                            black_box(123_456),
                            "0123456789abcdef0123456789abcdef",
                            "bench-fingerprint",
                            "ip=203.0.113.7\nts=1700000000\n",
                            params,
                        )
                        .unwrap(),
                    )
                })
            },
        );
    }
    group.finish();
}

fn bench_leading_zero_bits(c: &mut Criterion) {
    let hash = [0u8, 0, 0x1F, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE].repeat(4);
    c.bench_function("verifier/leading_zero_bits", |b| {
        b.iter(|| black_box(leading_zero_bits(black_box(&hash))))
    });
}

fn bench_mint_invite_code(c: &mut Criterion) {
    let secret = ServerSecret::generate();
    c.bench_function("invite/mint", |b| {
        b.iter(|| {
            black_box(
                mint_invite_code(
                    &secret,
                    black_box("bench-fingerprint"),
                    black_box(987_654_321),
                    "0123456789abcdef0123456789abcdef",
                )
                .unwrap(),
            )
        })
    });
}

criterion_group!(
    benches,
    bench_pow_hash,
    bench_leading_zero_bits,
    bench_mint_invite_code
);
criterion_main!(benches);
