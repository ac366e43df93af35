//! Snapshot encoding benchmarks
//!
//! Measures full and delta snapshot construction at various entity and
//! client counts.
//!
//! Run with: cargo bench --bench delta

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use snapwire_server::snapshot::delta::encode_snapshot;
use snapwire_server::snapshot::entity::EntityState;
use snapwire_server::snapshot::history::{ClientFrames, SnapshotHistory};

const PACKET_BACKUP: usize = 32;
const MAX_ENTITIES: usize = 1024;

/// Entities spread over a 4096 unit square
fn create_world(count: usize) -> Vec<EntityState> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|number| {
            let mut entity = EntityState::new(number as u16);
            entity.origin = [
                rng.gen_range(-2048.0..2048.0),
                rng.gen_range(-2048.0..2048.0),
                rng.gen_range(0.0..512.0),
            ];
            entity.model_index = rng.gen_range(1..64);
            entity
        })
        .collect()
}

/// Move roughly a tenth of the world, like a typical tick
fn step_world(world: &mut [EntityState]) {
    let mut rng = rand::thread_rng();
    for entity in world.iter_mut() {
        if rng.gen_bool(0.1) {
            entity.origin[0] += rng.gen_range(-16.0..16.0);
            entity.origin[1] += rng.gen_range(-16.0..16.0);
        }
    }
}

fn new_history() -> SnapshotHistory {
    SnapshotHistory::new(128, MAX_ENTITIES * 128, MAX_ENTITIES)
}

fn bench_full_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_snapshot");
    group.sample_size(50);

    for count in [64, 256, 1024] {
        let world = create_world(count);
        let mut history = new_history();
        history.record_frame(0, &world).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            let mut frames = ClientFrames::new(PACKET_BACKUP, MAX_ENTITIES);
            let mut sequence = 0u32;
            b.iter(|| {
                sequence = sequence.wrapping_add(1);
                black_box(encode_snapshot(
                    &history,
                    &mut frames,
                    sequence,
                    None,
                    |_| true,
                    MAX_ENTITIES,
                    0,
                ))
            });
        });
    }

    group.finish();
}

fn bench_delta_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_snapshot");
    group.sample_size(50);

    for count in [64, 256, 1024] {
        let mut world = create_world(count);
        let mut history = new_history();
        history.record_frame(0, &world).unwrap();

        let mut frames = ClientFrames::new(PACKET_BACKUP, MAX_ENTITIES);
        encode_snapshot(&history, &mut frames, 1, None, |_| true, MAX_ENTITIES, 0).unwrap();
        frames.mark_acked(1, 50);

        step_world(&mut world);
        history.record_frame(50, &world).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            // Re-encoding message 2 against the acked baseline each iteration
            b.iter(|| {
                black_box(encode_snapshot(
                    &history,
                    &mut frames,
                    2,
                    Some(1),
                    |_| true,
                    MAX_ENTITIES,
                    50,
                ))
            });
        });
    }

    group.finish();
}

fn bench_tick_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_fanout");
    group.sample_size(30);

    let mut world = create_world(512);
    let mut history = new_history();
    let baseline_frame = history.record_frame(0, &world).unwrap();
    step_world(&mut world);
    history.record_frame(50, &world).unwrap();

    for clients in [8, 32, 64] {
        let mut all_frames: Vec<ClientFrames> = (0..clients)
            .map(|_| {
                let mut frames = ClientFrames::new(PACKET_BACKUP, MAX_ENTITIES);
                frames.start(1, baseline_frame);
                frames.mark_acked(1, 50);
                frames
            })
            .collect();

        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.iter(|| {
                for (client, frames) in all_frames.iter_mut().enumerate() {
                    // Each client sees a different half of the world
                    let visible = |e: &EntityState| (e.number as usize + client) % 2 == 0;
                    black_box(encode_snapshot(
                        &history,
                        frames,
                        2,
                        Some(1),
                        visible,
                        MAX_ENTITIES,
                        50,
                    ));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_full_snapshot,
    bench_delta_snapshot,
    bench_tick_fanout,
);
criterion_main!(benches);
