//! Benchmarks for graph composition.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qsmflow::bids::{ReconstructionUnit, VolumeHeader};
use qsmflow::params::{ParameterResolver, PartialRunParameters};
use qsmflow::workflows::ReconstructionComposer;

fn unit(echoes: usize) -> ReconstructionUnit {
    let header = VolumeHeader::axial([256, 256, 128], [1.0, 1.0, 1.0]);
    let mut ru = ReconstructionUnit::new("1", "MEGRE").with_field_strength(3.0);
    for i in 0..echoes {
        ru = ru
            .with_echo(format!("/bids/echo-{}_part-phase.nii", i + 1), 0.004 * (i + 1) as f64, header.clone())
            .with_magnitude(format!("/bids/echo-{}_part-mag.nii", i + 1), header.clone());
    }
    ru
}

fn composition_benchmark(c: &mut Criterion) {
    let resolver = ParameterResolver::new();
    for echoes in [1, 4, 8] {
        let ru = unit(echoes);
        let resolution = resolver
            .resolve(&PartialRunParameters::new(), &ru)
            .unwrap_or_else(|e| panic!("resolve failed: {e}"));
        c.bench_function(&format!("compose_two_pass_{echoes}_echoes"), |b| {
            b.iter(|| black_box(ReconstructionComposer::new(&ru, &resolution).compose()));
        });
    }

    let ru = unit(4);
    c.bench_function("resolve_4_echoes", |b| {
        b.iter(|| black_box(resolver.resolve(&PartialRunParameters::new(), &ru)));
    });
}

criterion_group!(benches, composition_benchmark);
criterion_main!(benches);
