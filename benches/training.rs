use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dagshield_train::model::tree::{DecisionTree, TreeParams};
use dagshield_train::model::{BoostingParams, Classifier, ForestParams, ModelSpec};
use dagshield_train::preprocess::preprocess;
use dagshield_train::synth::generate_records;
use dagshield_train::utils::FeatureTable;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn bench_generation(c: &mut Criterion) {
    c.bench_function("generate_records n=10000", |bch| {
        bch.iter(|| generate_records(black_box(10_000), black_box(42)))
    });
}

fn bench_fitting(c: &mut Criterion) {
    let (records, _) = generate_records(2_000, 42);
    let data = preprocess(&FeatureTable::from_records(&records)).expect("preprocess");
    let n_classes = data.encoder.n_classes();

    let samples: Vec<usize> = (0..data.y.len()).collect();
    let params = TreeParams::with_depth(10);
    c.bench_function("decision_tree depth=10 n=2000", |bch| {
        bch.iter(|| {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            DecisionTree::fit_classifier(
                black_box(data.x.view()),
                black_box(&data.y),
                n_classes,
                &samples,
                &params,
                &mut rng,
            )
        })
    });

    let mut group = c.benchmark_group("ensembles n=2000");
    group.sample_size(10);
    group.bench_function("random_forest trees=20", |bch| {
        let spec = ModelSpec::RandomForest(ForestParams {
            n_estimators: 20,
            max_depth: 10,
            bootstrap: true,
            seed: 42,
        });
        bch.iter(|| {
            let mut model = spec.build();
            model.fit(data.x.view(), &data.y, n_classes).expect("fit");
            model
        })
    });
    group.bench_function("gradient_boosting stages=10", |bch| {
        let spec = ModelSpec::GradientBoosting(BoostingParams {
            n_estimators: 10,
            max_depth: 6,
            learning_rate: 0.1,
            seed: 42,
        });
        bch.iter(|| {
            let mut model = spec.build();
            model.fit(data.x.view(), &data.y, n_classes).expect("fit");
            model
        })
    });
    group.finish();
}

criterion_group!(benches, bench_generation, bench_fitting);
criterion_main!(benches);
