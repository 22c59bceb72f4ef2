use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use nrnscope::{
    ContextConfig, InitOptions, Kernel, LifecycleError, Managed, MemoryKernel, NetConParams, NrnError,
    Simulator,
};

fn setup() -> (Arc<MemoryKernel>, Simulator) {
    let kernel = Arc::new(MemoryKernel::new());
    let sim = Simulator::new(kernel.clone());
    (kernel, sim)
}

#[test]
fn only_one_context_is_active_at_a_time() {
    let (_kernel, sim) = setup();
    let first = sim.create_context(ContextConfig::default()).unwrap();

    let Err(NrnError::Lifecycle(LifecycleError::ConcurrentContext { active })) =
        sim.create_context(ContextConfig::default())
    else {
        panic!("expected ConcurrentContext");
    };
    assert_eq!(active, first.id());
    assert!(first.is_active());

    first.finish().unwrap();
    let second = sim.create_context(ContextConfig::default()).unwrap();
    assert!(second.is_active());
}

#[test]
fn simulators_sharing_a_kernel_share_the_active_slot() {
    let kernel = Arc::new(MemoryKernel::new());
    let sim_a = Simulator::new(kernel.clone());
    let sim_b = Simulator::new(kernel.clone());
    let first = sim_a.create_context(ContextConfig::default()).unwrap();
    first.create_named_section("soma").unwrap();

    let Err(NrnError::Lifecycle(LifecycleError::ConcurrentContext { active })) =
        sim_b.create_context(ContextConfig::default().with_preflight_check(false))
    else {
        panic!("expected ConcurrentContext");
    };
    assert_eq!(active, first.id());
    assert!(sim_b.active_context().unwrap().is_none());
    first.verify().unwrap();

    first.finish().unwrap();
    let second = sim_b.create_context(ContextConfig::default()).unwrap();
    assert!(second.is_active());
    drop(second);

    // Dropping a simulator releases the claim of its active context.
    let implicit = sim_b.current_context().unwrap();
    drop(sim_b);
    assert!(implicit.is_finished());
    let third = sim_a.create_context(ContextConfig::default()).unwrap();
    assert!(third.is_active());
}

#[test]
fn preflight_rejects_dirty_kernel() {
    let (kernel, sim) = setup();
    kernel.create_section("stray").unwrap();

    let Err(NrnError::Lifecycle(LifecycleError::DirtyKernelState { census })) =
        sim.create_context(ContextConfig::default())
    else {
        panic!("expected DirtyKernelState");
    };
    assert_eq!(census.sections, 1);
    assert_eq!(census.connections, 0);
    assert!(sim.active_context().unwrap().is_none());

    let ctx = sim
        .create_context(ContextConfig::default().with_preflight_check(false))
        .unwrap();
    assert!(ctx.is_active());
}

#[test]
fn preflight_counts_event_objects() {
    let (kernel, sim) = setup();
    kernel.create_object("NetStim").unwrap();
    let Err(NrnError::Lifecycle(LifecycleError::DirtyKernelState { census })) =
        sim.create_context(ContextConfig::default())
    else {
        panic!("expected DirtyKernelState");
    };
    assert_eq!(census.event_objects, 1);
}

#[test]
fn run_advances_to_tstop_and_records() {
    let (_kernel, sim) = setup();
    let ctx = sim
        .create_context(ContextConfig::default().with_dt(0.25).with_tstop(1.0))
        .unwrap();
    let soma = ctx.create_named_section("soma").unwrap();
    let trace = ctx.record(&soma.at(0.5).unwrap().v().unwrap()).unwrap();

    ctx.run(InitOptions::new()).unwrap();
    assert!(ctx.is_initialized());
    assert!((ctx.t().unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(trace.len().unwrap(), 5);
    assert!(trace.to_vec().unwrap().iter().all(|v| *v == -65.0));

    let Err(NrnError::Lifecycle(LifecycleError::AlreadyInitialized { .. })) =
        ctx.run(InitOptions::new().with_tstop(3.0))
    else {
        panic!("expected AlreadyInitialized");
    };

    ctx.set_tstop(2.0).unwrap();
    ctx.run(InitOptions::new()).unwrap();
    assert!((ctx.t().unwrap() - 2.0).abs() < 1e-9);
    assert_eq!(trace.len().unwrap(), 9);
}

#[test]
fn parameters_freeze_after_init() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    ctx.init(InitOptions::new().with_dt(0.1).with_celsius(6.3)).unwrap();
    assert_eq!(kernel.global(nrnscope::kernel::Global::Dt).unwrap(), 0.1);
    assert_eq!(kernel.global(nrnscope::kernel::Global::Celsius).unwrap(), 6.3);

    let Err(NrnError::Lifecycle(LifecycleError::ImmutableAfterInit { field })) = ctx.set_celsius(37.0) else {
        panic!("expected ImmutableAfterInit");
    };
    assert_eq!(field, "celsius");
    assert!(ctx.init(InitOptions::new().with_dt(0.5)).is_err());
    assert_eq!(ctx.dt().unwrap(), 0.1);
}

#[test]
fn advance_without_finit_keeps_start_time() {
    let (_kernel, sim) = setup();
    let ctx = sim
        .create_context(ContextConfig::default().with_dt(0.5))
        .unwrap();
    ctx.init(InitOptions::new().without_finit().with_start_time(10.0)).unwrap();
    ctx.advance().unwrap();
    assert!((ctx.t().unwrap() - 10.5).abs() < 1e-9);
    assert!(!ctx.is_initialized());
}

#[test]
fn finish_releases_everything_but_recorders() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let soma = ctx.create_named_section("soma").unwrap();
    soma.insert("hh").unwrap();
    let seg = soma.at(0.5).unwrap();
    let syn = ctx.point_process("ExpSyn").at(&seg).build().unwrap();
    let stim = ctx.create_artificial_cell("NetStim").unwrap();
    let nc = ctx
        .create_netcon(&stim, Some(syn.as_mechanism()), NetConParams::default())
        .unwrap();
    let trace = ctx.record(&seg.v().unwrap()).unwrap();
    let hh = seg.mechanism("hh").unwrap();

    let report = ctx.context().finish().unwrap();
    assert_eq!(report.context, ctx.id());
    assert_eq!(report.destroyed, 4);
    assert_eq!(report.kept, 1);
    assert_eq!(report.failed, 0);
    assert!(report.finished_at >= report.started_at);

    for destroyed in [soma.handle(), seg.handle(), syn.handle(), stim.handle(), nc.handle(), hh.handle()] {
        assert!(destroyed.is_destroyed(), "{destroyed:?} should be gone");
    }
    assert!(!trace.is_destroyed());
    assert!(trace.to_vec().is_ok());
    assert!(ctx.kernel_census().unwrap().is_clean());
    assert_eq!(kernel.connection_count().unwrap(), 0);
    assert!(ctx.is_finished());
    assert!(sim.active_context().unwrap().is_none());

    let Err(err) = soma.nseg() else {
        panic!("expected UseAfterDestroy");
    };
    assert!(err.is_use_after_destroy());
}

#[test]
fn finish_can_drop_recorders() {
    let (_kernel, sim) = setup();
    let ctx = sim
        .create_context(ContextConfig::default().with_keep_recorders(false))
        .unwrap();
    let buffer = ctx.create_vector(&[1.0, 2.0]).unwrap();
    let report = ctx.finish().unwrap();
    assert_eq!(report.kept, 0);
    assert_eq!(report.destroyed, 1);
    assert!(buffer.is_destroyed());
}

#[test]
fn finish_is_idempotent() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    ctx.create_section().unwrap();
    let first = ctx.context().finish().unwrap();
    assert_eq!(first.destroyed, 1);
    let second = ctx.context().finish().unwrap();
    assert_eq!(second.destroyed, 0);
    assert_eq!(second.context, first.context);
}

#[test]
fn verify_detects_sections_created_behind_the_context() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    ctx.create_named_section("soma").unwrap();
    ctx.verify().unwrap();

    let rogue = kernel.create_section("rogue").unwrap();
    let Err(NrnError::Lifecycle(LifecycleError::Consistency {
        unknown_to_context,
        unknown_to_kernel,
    })) = ctx.verify()
    else {
        panic!("expected Consistency");
    };
    assert_eq!(unknown_to_context, vec!["rogue".to_string()]);
    assert!(unknown_to_kernel.is_empty());

    kernel.delete_section(rogue).unwrap();
    ctx.verify().unwrap();
}

#[test]
fn verify_detects_sections_deleted_behind_the_context() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let dend = ctx.create_named_section("dend").unwrap();
    let key = kernel
        .live_sections()
        .unwrap()
        .into_iter()
        .find(|info| info.name == "dend")
        .unwrap()
        .key;
    kernel.delete_section(key).unwrap();

    let Err(NrnError::Lifecycle(LifecycleError::Consistency { unknown_to_kernel, .. })) = ctx.verify() else {
        panic!("expected Consistency");
    };
    assert_eq!(unknown_to_kernel, vec!["dend".to_string()]);

    let err = ctx.context().finish().unwrap_err();
    assert!(err.is_kernel());
    assert!(!ctx.is_active());
    assert!(!ctx.is_finished());
    assert!(!dend.is_destroyed());

    for result in [dend.insert("pas").map(|_| ()), dend.remove("pas").map(|_| ())] {
        let Err(NrnError::Lifecycle(LifecycleError::InactiveContext { .. })) = result else {
            panic!("expected InactiveContext, got {result:?}");
        };
    }
}

#[test]
fn guard_drop_finishes_context() {
    let (kernel, sim) = setup();
    {
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        ctx.create_named_section("soma").unwrap();
    }
    assert!(sim.active_context().unwrap().is_none());
    assert!(kernel.live_sections().unwrap().is_empty());
}

#[test]
fn scoped_returns_value_and_finishes() {
    let (kernel, sim) = setup();
    let count = sim
        .scoped(ContextConfig::default(), |ctx| {
            ctx.create_section()?;
            ctx.create_section()?;
            ctx.member_count()
        })
        .unwrap();
    assert_eq!(count, 2);
    assert!(kernel.live_sections().unwrap().is_empty());
    assert!(sim.active_context().unwrap().is_none());
}

#[test]
fn scoped_error_finishes_unless_kept() {
    let (kernel, sim) = setup();
    let err = sim
        .scoped(ContextConfig::default(), |ctx| {
            ctx.create_named_section("soma")?;
            ctx.create_named_section("soma")?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_validation());
    assert!(sim.active_context().unwrap().is_none());
    assert!(kernel.live_sections().unwrap().is_empty());

    let err = sim
        .scoped(ContextConfig::default().with_keep_on_error(true), |ctx| {
            ctx.create_named_section("kept")?;
            ctx.create_named_section("bad name")?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_validation());
    let kept = sim.active_context().unwrap().unwrap();
    assert!(kept.section("kept").unwrap().is_some());
    kept.finish().unwrap();
}

#[test]
fn panic_with_keep_on_error_leaves_context_for_inspection() {
    let (_kernel, sim) = setup();
    let result = catch_unwind(AssertUnwindSafe(|| {
        let ctx = sim
            .create_context(ContextConfig::default().with_keep_on_error(true))
            .unwrap();
        ctx.create_named_section("soma").unwrap();
        panic!("model failed");
    }));
    assert!(result.is_err());

    let ctx = sim.active_context().unwrap().unwrap();
    assert!(ctx.section("soma").unwrap().is_some());
    ctx.finish().unwrap();
}

#[test]
fn catalog_is_read_once_per_simulator() {
    let (kernel, sim) = setup();
    for _ in 0..3 {
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        ctx.finish().unwrap();
    }
    sim.catalog().unwrap();
    assert_eq!(kernel.catalog_queries(), 1);
}

#[test]
fn current_context_is_created_on_demand() {
    let (_kernel, sim) = setup();
    let ctx = sim.current_context().unwrap();
    assert_eq!(sim.current_context().unwrap(), ctx);
    ctx.finish().unwrap();
    assert_ne!(sim.current_context().unwrap(), ctx);
}

#[test]
fn dropping_simulator_finishes_active_context() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap().into_context();
    ctx.create_named_section("soma").unwrap();
    drop(sim);
    assert!(ctx.is_finished());
    assert!(kernel.live_sections().unwrap().is_empty());
}

#[test]
fn enter_requires_active_context() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap().into_context();
    {
        let guard = ctx.enter().unwrap();
        guard.create_section().unwrap();
    }
    assert!(ctx.is_finished());
    assert!(ctx.enter().is_err());
}
