use criterion::{Criterion, Throughput};
use libflash::nand::ecc;

fn sample_block() -> [u8; ecc::BYTES_PER_ECC_BLOCK] {
    let mut data = [0u8; ecc::BYTES_PER_ECC_BLOCK];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(73).wrapping_add(19);
    }
    data
}

pub fn bench_compute(c: &mut Criterion) {
    let data = sample_block();
    let mut group = c.benchmark_group("ecc");
    group.throughput(Throughput::Bytes(ecc::BYTES_PER_ECC_BLOCK as u64));
    group.bench_function("compute", |b| {
        b.iter(|| ecc::compute(std::hint::black_box(&data)));
    });
    group.finish();
}

pub fn bench_apply_clean(c: &mut Criterion) {
    let mut data = sample_block();
    let code = ecc::compute(&data);
    let mut group = c.benchmark_group("ecc");
    group.throughput(Throughput::Bytes(ecc::BYTES_PER_ECC_BLOCK as u64));
    group.bench_function("apply_clean", |b| {
        b.iter(|| ecc::apply(std::hint::black_box(&mut data), code));
    });
    group.finish();
}

pub fn bench_apply_single_bit(c: &mut Criterion) {
    let reference = sample_block();
    let code = ecc::compute(&reference);
    let mut group = c.benchmark_group("ecc");
    group.throughput(Throughput::Bytes(ecc::BYTES_PER_ECC_BLOCK as u64));
    group.bench_function("apply_single_bit", |b| {
        b.iter_batched_ref(
            || {
                let mut data = reference;
                data[97] ^= 0x20;
                data
            },
            |data| ecc::apply(data, code),
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}
