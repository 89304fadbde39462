use criterion::Criterion;
use libflash::nor::headers::{HeaderLayout, Lsh, LOG_SECTOR_ID_BIAS};

pub fn bench_classify_slot(c: &mut Criterion) {
    let layout = HeaderLayout { line_size: 1, rewrite: true };
    let lsh = Lsh {
        id: LOG_SECTOR_ID_BIAS + 1234,
        data_stat: 0xFE,
        is_erasable: 0xFF,
    };
    let mut group = c.benchmark_group("headers");
    group.bench_function("classify_slot", |b| {
        b.iter(|| layout.classify_slot(std::hint::black_box(&lsh), false, 4096));
    });
    group.bench_function("encode_decode_lsh", |b| {
        b.iter(|| {
            let mut raw = [0xFFu8; 16];
            layout.encode_lsh(std::hint::black_box(&lsh), &mut raw);
            layout.decode_lsh(&raw)
        });
    });
    group.finish();
}
