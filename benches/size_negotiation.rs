//! Benchmark for size negotiation
//!
//! Covers the DRBD metadata arithmetic on its own and full descend/ascend
//! passes over typical stacks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use layerstack::domain::{StoragePool, StoragePoolRegistry};
use layerstack::tree::VolumeSpec;
use layerstack::{
    DeviceLayerKind, DeviceProviderKind, LayerStackSpec, LayerTree, LayerTreeBuilder, MdLayout,
    MdSizeMode, SatelliteConfig, SizeNegotiator, SizingConfig,
};
use std::sync::Arc;

const GIB: u64 = 1 << 20;

fn bench_md_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("drbd_md");
    group.throughput(Throughput::Elements(1));

    let layout = MdLayout::new(7, 1, 32);

    group.bench_function("gross_size", |b| {
        let mut net = 0u64;
        b.iter(|| {
            net = (net + 4096) % (16 * 1024 * GIB);
            let _ = layout.gross_size(black_box(net + GIB));
        });
    });

    group.bench_function("net_size", |b| {
        let mut gross = 0u64;
        b.iter(|| {
            gross = (gross + 4096) % (16 * 1024 * GIB);
            let _ = layout.net_size(black_box(gross + GIB));
        });
    });

    group.bench_function("internal_md_size", |b| {
        b.iter(|| {
            let _ = layout.internal_md_size(MdSizeMode::Gross, black_box(512 * GIB));
        });
    });

    group.finish();
}

fn builder() -> LayerTreeBuilder {
    let pools = Arc::new(StoragePoolRegistry::with_pools([StoragePool {
        name: "lvm".into(),
        provider: DeviceProviderKind::Lvm,
        backing_name: "vg0".into(),
        granularity_kib: None,
        total_kib: 1 << 40,
        free_kib: 1 << 40,
    }]));
    LayerTreeBuilder::new(pools, &SatelliteConfig::default())
}

fn stack(layers: Vec<DeviceLayerKind>, volumes: u32) -> LayerStackSpec {
    let mut spec: LayerStackSpec =
        serde_yaml::from_str("resource: bench\nlayers: []\nvolumes: []\n")
            .expect("minimal stack description");
    spec.layers = layers;
    spec.volumes = (0..volumes)
        .map(|number| VolumeSpec {
            number,
            size_kib: 10 * GIB + u64::from(number) * 1024,
            storage_pool: "lvm".into(),
            meta_pool: None,
            minor: Some(1000 + number),
        })
        .collect();
    spec.luks.key_ref = Some("bench".into());
    spec
}

fn bench_negotiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_negotiation");
    let builder = builder();
    let negotiator = SizeNegotiator::new(SizingConfig::default());

    let stacks = [
        ("storage", vec![DeviceLayerKind::Storage]),
        (
            "drbd_storage",
            vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
        ),
        (
            "drbd_luks_storage",
            vec![
                DeviceLayerKind::Drbd,
                DeviceLayerKind::Luks,
                DeviceLayerKind::Storage,
            ],
        ),
    ];

    for (name, layers) in stacks {
        let tree: LayerTree = builder
            .build(&stack(layers, 8))
            .expect("stack description builds");
        group.throughput(Throughput::Elements(8));
        group.bench_function(name, |b| {
            b.iter_batched(
                || tree.clone(),
                |mut tree| {
                    let _ = negotiator.negotiate(black_box(&mut tree));
                    tree
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_md_layout, bench_negotiate);
criterion_main!(benches);
