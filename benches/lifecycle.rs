use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use nrnscope::{ContextConfig, InitOptions, MemoryKernel, NetConParams, Simulator};

/// Builds a small network: `cells` sections with hh, one synapse each, driven
/// by a shared stimulus, with the soma of each cell recorded.
fn build_network(ctx: &nrnscope::Context, cells: usize) {
    let stim = ctx.create_artificial_cell("NetStim").unwrap();
    for i in 0..cells {
        let soma = ctx.create_named_section(&format!("soma_{i}")).unwrap();
        soma.set_nseg(3).unwrap();
        soma.insert("hh").unwrap();
        let seg = soma.at(0.5).unwrap();
        let syn = ctx.point_process("ExpSyn").at(&seg).build().unwrap();
        ctx.create_netcon(&stim, Some(syn.as_mechanism()), NetConParams::default())
            .unwrap();
        ctx.record(&seg.v().unwrap()).unwrap();
    }
}

fn bench_build_and_finish(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.throughput(Throughput::Elements(64));

    group.bench_function("lifecycle/build_finish_64_cells", |b| {
        let sim = Simulator::new(Arc::new(MemoryKernel::new()));
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let ctx = sim
                    .create_context(ContextConfig::default().with_keep_recorders(false))
                    .unwrap();
                build_network(&ctx, 64);
                ctx.finish().unwrap();
            }
            start.elapsed()
        })
    });

    group.finish();
}

fn bench_run(c: &mut Criterion) {
    c.bench_function("lifecycle/run_16_cells_10ms", |b| {
        let sim = Simulator::new(Arc::new(MemoryKernel::new()));
        b.iter_custom(|iters| {
            let ctx = sim
                .create_context(ContextConfig::default().with_tstop(10.0))
                .unwrap();
            build_network(&ctx, 16);

            let start = Instant::now();
            for _ in 0..iters {
                ctx.init(InitOptions::new()).unwrap();
                ctx.run(InitOptions::new()).unwrap();
            }
            let elapsed = start.elapsed();
            ctx.finish().unwrap();
            elapsed
        })
    });
}

fn bench_segment_lookup(c: &mut Criterion) {
    c.bench_function("lifecycle/segment_lookup", |b| {
        let sim = Simulator::new(Arc::new(MemoryKernel::new()));
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        let soma = ctx.create_named_section("soma").unwrap();
        soma.set_nseg(11).unwrap();
        soma.insert("pas").unwrap();
        b.iter(|| {
            let seg = soma.at(0.5).unwrap();
            seg.mechanism("pas").unwrap().get("g").unwrap()
        });
    });
}

criterion_group!(lifecycle, bench_build_and_finish, bench_run, bench_segment_lookup);
criterion_main!(lifecycle);
