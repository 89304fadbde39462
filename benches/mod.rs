use criterion::{criterion_group, criterion_main};

mod nand;
mod nor;

criterion_group!(
    benches,
    nand::ecc::bench_compute,
    nand::ecc::bench_apply_clean,
    nand::ecc::bench_apply_single_bit,
    nand::spare::bench_sector_ecc,
    nor::headers::bench_classify_slot
);
criterion_main!(benches);
