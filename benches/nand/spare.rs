use criterion::{Criterion, Throughput};
use libflash::nand::spare;

pub fn bench_sector_ecc(c: &mut Criterion) {
    let mut data = vec![0u8; 2048];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    let mut spare_area = vec![0xFFu8; 64];
    spare::compute_sector_ecc(&data, &mut spare_area);
    let mut group = c.benchmark_group("spare");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("compute_sector_ecc", |b| {
        b.iter(|| {
            let mut out = [0xFFu8; 64];
            spare::compute_sector_ecc(std::hint::black_box(&data), &mut out);
        });
    });
    group.bench_function("apply_sector_ecc", |b| {
        b.iter(|| spare::apply_sector_ecc(std::hint::black_box(&mut data), &spare_area));
    });
    group.finish();
}
