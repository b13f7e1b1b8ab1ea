use criterion::{black_box, criterion_group, criterion_main, Criterion};
use resnet_replica::aggregate;
use resnet_replica::data::{BatchSource, SyntheticImages};
use resnet_replica::distributed::LocalCollective;
use resnet_replica::model::{ModelConfig, ResNet};
use resnet_replica::registry::{ParamStore, Scope, ScopeId};

fn benchmark_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiny_resnet");
    group.sample_size(20);

    let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
    let model = ResNet::new(
        &mut store,
        &Scope::device(0),
        &ModelConfig::tiny(),
        [3, 32, 32],
        10,
    )
    .unwrap();
    let mut source = SyntheticImages::new(8, [3, 32, 32], 10, 0);
    let batch = BatchSource::<f32>::next_batch(&mut source).unwrap();

    group.bench_function("forward_b8_32x32", |b| {
        b.iter(|| {
            black_box(
                model
                    .evaluate(&store, &batch.images, &batch.labels)
                    .unwrap(),
            );
        })
    });

    group.bench_function("forward_backward_average_b8_32x32", |b| {
        b.iter(|| {
            let (_, trace) = model
                .forward(&store, batch.images.clone(), &batch.labels)
                .unwrap();
            let bundle = model.backward(&store, &trace).unwrap();
            black_box(aggregate::all_reduce_average(bundle, &LocalCollective).unwrap());
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_step);
criterion_main!(benches);
