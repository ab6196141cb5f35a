use candle_core::{DType, Device, Tensor};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{NormKind, ResnetBlock, ResnetBlockConfig};

fn bench_resnet_blocks(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 4usize;
    let dims = &[64usize, 128, 256];
    let norms = &[NormKind::Instance, NormKind::Batch];

    for &norm in norms {
        let mut group = c.benchmark_group(format!("resnet_block/{}", norm.as_str()));
        for &dim in dims {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let block = ResnetBlock::new(dim, ResnetBlockConfig::new(norm), vb).expect("block");
            let input = Tensor::randn(0f32, 1.0, (batch, dim, 32, 32), &device).expect("input");

            group.throughput(Throughput::Elements((batch * dim * 32 * 32) as u64));
            group.bench_with_input(BenchmarkId::new("forward", dim), &input, |b, input| {
                b.iter(|| {
                    let out = block.forward_t(black_box(input), false).expect("forward");
                    black_box(out);
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_resnet_blocks);
criterion_main!(benches);
