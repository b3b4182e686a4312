use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use multichain_rs::{
    toy::ToyRuntime, Model, ModelSettings, ModuleRegistry, SampleOptions,
};

const MODEL: &str = "model {
    mu[20] ~ dnorm(0, 0.01)
    p[20] ~ dunif(0, 1)
    x[50] ~ dbern(0.3)
}";

fn make_model(registry: &ModuleRegistry<ToyRuntime>, chains_per_instance: usize) -> Model<ToyRuntime> {
    let settings = ModelSettings {
        text: Some(MODEL.to_string()),
        chains: 8,
        tune: 0,
        chains_per_instance: Some(chains_per_instance),
        progress_bar: false,
        seed: Some(42),
        ..Default::default()
    };
    Model::new(registry, settings).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let registry = ModuleRegistry::new(ToyRuntime::with_seed(42));

    c.bench_function("create model 8 chains", |b| {
        b.iter(|| make_model(&registry, black_box(2)))
    });

    for chains_per_instance in [8, 2] {
        let name = format!("sample 2000, {} chains per instance", chains_per_instance);
        c.bench_function(&name, |b| {
            b.iter_batched(
                || make_model(&registry, chains_per_instance),
                |mut model| {
                    let samples = model.sample(2000, &SampleOptions::default()).unwrap();
                    assert_eq!(samples["x"].shape(), &[50, 2000, 8]);
                },
                BatchSize::SmallInput,
            )
        });
    }

    let mut model = make_model(&registry, 4);
    c.bench_function("update 1000, 2 instances", |b| {
        b.iter(|| model.update(black_box(1000)).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
