//! Criterion benchmarks comparing GPU and host convolution.
//!
//! To run the benchmarks use `cargo bench`.  The GPU bench reuses one
//! translator, so after the first iteration it measures binding, the
//! partitioned submissions and their blocking waits, but not pipeline
//! compilation.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use wgpu::BufferUsages;

use gpgpu_dispatch::{
    conv2d_host, ConvTranslator, GpuBuffer, GpuContext, KernelBlob, OperandStore, Operation, OperationType,
    ScalarValue, Shape, TuningConfig,
};

fn conv_benchmark(c: &mut Criterion) {
    let _ = env_logger::try_init();
    // Establish a single GPU context up front so that device creation is
    // not included in the benchmark.
    let context = Arc::new(GpuContext::new_blocking().expect("failed to initialise GPU context"));

    let input_shape = Shape::new(1, 64, 64, 4);
    let filter_shape = Shape::new(16, 3, 3, 4);
    let mut rng = StdRng::seed_from_u64(7);
    let input: Vec<f32> = (0..input_shape.element_count()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let filter: Vec<f32> = (0..filter_shape.element_count()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let bias: Vec<f32> = (0..16).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut store = OperandStore::new();
    let i = store.add_buffer(input_shape, GpuBuffer::from_slice(&context, &input, BufferUsages::empty()));
    let f = store.add_buffer(filter_shape, GpuBuffer::from_slice(&context, &filter, BufferUsages::empty()));
    let b = store.add_buffer(Shape::new(1, 1, 1, 16), GpuBuffer::from_slice(&context, &bias, BufferUsages::empty()));
    let same = store.add_scalar(ScalarValue::UInt32(1));
    let stride = store.add_scalar(ScalarValue::UInt32(1));
    let relu = store.add_scalar(ScalarValue::UInt32(1));
    let o = store.add_buffer(
        Shape::new(1, 64, 64, 16),
        GpuBuffer::new_output(&context, 64 * 64 * 16, BufferUsages::empty()),
    );
    let op = Operation::new(OperationType::Conv2d, vec![i, f, b, same, stride, stride, relu], vec![o]);

    let mut conv = ConvTranslator::new(context.clone(), "bench_conv", KernelBlob::conv2d(), TuningConfig::default());
    let (geometry, _) = conv.prepare(&op, &store).expect("invalid benchmark model");

    c.bench_function("gpu conv2d 64x64x4 -> 16", |bencher| {
        bencher.iter(|| {
            conv.execute(&op, &mut store).expect("dispatch failed");
        });
    });
    c.bench_function("host conv2d 64x64x4 -> 16", |bencher| {
        bencher.iter(|| conv2d_host(&geometry, &input, &filter, &bias));
    });
}

criterion_group!(benches, conv_benchmark);
criterion_main!(benches);
