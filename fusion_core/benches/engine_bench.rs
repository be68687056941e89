use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fusion_core::{
    association::DataAssociation,
    config::{ChannelConfig, EngineConfig},
    engine::{MemorySink, TrackerEngine},
    gating::AssociationConfig,
    geometry::Transform2D,
    processor::TrackProcessor,
    transform::TransformBuffer,
    types::{ChannelId, ClassDistribution, DetectedObject, DetectionBatch, Kinematics, ObjectClass, Shape},
};
use std::collections::BTreeMap;

/// `n` cars on a grid, 10 m apart, drifting forward with time.
fn make_batch(n: usize, t: f64) -> DetectionBatch {
    let side = (n as f64).sqrt().ceil() as usize;
    let objects = (0..n)
        .map(|i| {
            let x = (i % side) as f64 * 10.0 + 5.0 * t;
            let y = (i / side) as f64 * 10.0;
            let mut kinematics = Kinematics::new(x, y, 0.0);
            kinematics.velocity = Some(5.0);
            kinematics.velocity_var = 1.0;
            DetectedObject {
                kinematics,
                shape: Shape::bounding_box(4.5, 1.9, 1.6),
                classification: ClassDistribution::certain(ObjectClass::Car),
                existence_probability: 0.9,
            }
        })
        .collect();
    DetectionBatch {
        channel: ChannelId(0),
        timestamp: t,
        frame_id: "base_link".into(),
        objects,
    }
}

fn bench_association(c: &mut Criterion) {
    let mut group = c.benchmark_group("association");
    let association = DataAssociation::new(&AssociationConfig::default()).unwrap();

    for n in [50, 200, 1000] {
        let mut processor = TrackProcessor::new(Default::default(), BTreeMap::new(), 1, "map");
        processor.spawn(&make_batch(n, 0.0), &BTreeMap::new());
        processor.predict(0.1);
        let batch = make_batch(n, 0.1);
        group.bench_function(format!("{n}_objects"), |b| {
            b.iter(|| {
                let matrix = association.calc_score_matrix(&batch.objects, processor.tracks());
                black_box(association.assign(&matrix))
            });
        });
    }
    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");

    for n in [50, 200, 1000] {
        group.bench_function(format!("{n}_objects"), |b| {
            b.iter(|| {
                let config = EngineConfig::default().with_channel("lidar", ChannelConfig::new("/lidar"));
                let mut tf = TransformBuffer::new(0.0);
                tf.set_static("map", "base_link", Transform2D::identity());
                let mut engine = TrackerEngine::new(config, tf, Box::new(MemorySink::new())).unwrap();
                // warm up with one batch to create tracks
                engine.on_detections(0, make_batch(n, 0.0), 0.0).unwrap();
                engine.on_detections(0, make_batch(n, 0.1), 0.1).unwrap();
                black_box(engine.stats().tracks_spawned)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_association, bench_engine);
criterion_main!(benches);
