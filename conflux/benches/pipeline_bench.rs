//! Benchmarks for channel and pipeline throughput.

use conflux::channel::{Capacity, Channel, OverflowPolicy};
use conflux::pipeline::{LinkOptions, PipelineBuilder};
use conflux::stage::{FnTransform, Stage, StageConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn channel_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("channel_write_read_64", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ch = Channel::new(Capacity::bounded(64), OverflowPolicy::Wait);
                for i in 0..64u64 {
                    ch.write(black_box(i)).await.unwrap();
                }
                for _ in 0..64 {
                    black_box(ch.read().await.unwrap());
                }
            });
        });
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("two_stage_pipeline_256", |b| {
        b.iter(|| {
            rt.block_on(async {
                let config = StageConfig::serial(Capacity::bounded(32), OverflowPolicy::Wait);
                let double = Arc::new(Stage::new(
                    "double",
                    config.clone(),
                    FnTransform::new(|x: u64| Ok(x * 2)),
                ));
                let add = Arc::new(Stage::new(
                    "add",
                    config,
                    FnTransform::new(|x: u64| Ok(x + 1)),
                ));
                let double_out = double.output();
                let add_in = add.input();
                let ingress = double.input();
                let egress = add.output();
                let pipeline = PipelineBuilder::new("bench")
                    .add_stage(double)
                    .add_stage(add)
                    .link(&double_out, &add_in, LinkOptions::propagate_all())
                    .encapsulate(&ingress, &egress)
                    .unwrap();
                pipeline.start();

                let producer = pipeline.ingress();
                let feeder = tokio::spawn(async move {
                    for i in 0..256u64 {
                        producer.write(i).await.unwrap();
                    }
                    producer.complete();
                });

                let consumer = pipeline.egress();
                let mut total = 0u64;
                while let Ok(value) = consumer.read().await {
                    total += value;
                }
                feeder.await.unwrap();
                black_box(total);
            });
        });
    });
}

criterion_group!(benches, channel_benchmark, pipeline_benchmark);
criterion_main!(benches);
