use std::sync::Arc;

use nrnscope::{
    ContextConfig, Kernel, LifecycleError, Managed, MemoryKernel, MemoryMechanism, NetConParams, NetConSource,
    NrnError, Simulator, ValidationError,
};

fn catalog() -> Vec<MemoryMechanism> {
    vec![
        MemoryMechanism::distributed("pas").parameter("g", 0.001).parameter("e", -70.0),
        MemoryMechanism::point_process("IClamp").parameter("amp", 0.0),
        MemoryMechanism::point_process("ExpSyn")
            .netcon_target(1)
            .parameter("tau", 0.1)
            .state("g"),
        MemoryMechanism::point_process("Multi").netcon_target(3).parameter("tau", 1.0),
        MemoryMechanism::artificial_cell("NetStim")
            .netcon_target(1)
            .parameter("interval", 10.0),
    ]
}

fn setup() -> (Arc<MemoryKernel>, Simulator) {
    let kernel = Arc::new(MemoryKernel::with_catalog(catalog()));
    let sim = Simulator::new(kernel.clone());
    (kernel, sim)
}

fn assert_invalid_target<T: std::fmt::Debug>(result: Result<T, NrnError>) {
    let Err(NrnError::Validation(ValidationError::InvalidConnectionTarget { .. })) = result else {
        panic!("expected InvalidConnectionTarget, got {result:?}");
    };
}

#[test]
fn weight_vector_follows_target() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let seg = ctx.create_named_section("soma").unwrap().at(0.5).unwrap();
    let multi = ctx.point_process("Multi").at(&seg).build().unwrap();
    let syn = ctx.point_process("ExpSyn").at(&seg).build().unwrap();

    let nc = ctx
        .create_netcon(&seg.v().unwrap(), None, NetConParams::default())
        .unwrap();
    assert_eq!(nc.weight_count().unwrap(), 1);
    assert!(nc.target().unwrap().is_none());

    nc.set_target(Some(multi.as_mechanism())).unwrap();
    assert_eq!(nc.weight_count().unwrap(), 3);
    nc.set_weights(&[0.1, 0.2, 0.3]).unwrap();
    assert_eq!(nc.weights().unwrap(), vec![0.1, 0.2, 0.3]);
    assert_eq!(nc.target().unwrap().as_ref(), Some(multi.as_mechanism()));

    nc.set_target(Some(syn.as_mechanism())).unwrap();
    assert_eq!(nc.weight_count().unwrap(), 1);
    nc.set_target(None).unwrap();
    assert_eq!(nc.weight_count().unwrap(), 1);
    assert!(nc.target().unwrap().is_none());
}

#[test]
fn weight_access_is_bounds_checked() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let stim = ctx.create_artificial_cell("NetStim").unwrap();
    let nc = ctx
        .create_netcon(&stim, None, NetConParams { weight: 0.5, ..NetConParams::default() })
        .unwrap();
    assert_eq!(nc.weight(0).unwrap(), 0.5);
    let Err(NrnError::Validation(ValidationError::IndexOutOfBounds { index, len, .. })) = nc.weight(4) else {
        panic!("expected IndexOutOfBounds");
    };
    assert_eq!((index, len), (4, 1));
    assert!(nc.set_weights(&[1.0, 2.0]).unwrap_err().is_validation());
    nc.fill_weights(0.7).unwrap();
    assert_eq!(nc.weights().unwrap(), vec![0.7]);
}

#[test]
fn delay_must_be_non_negative() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let stim = ctx.create_artificial_cell("NetStim").unwrap();

    let Err(NrnError::Validation(ValidationError::OutOfRange { field, value, .. })) =
        ctx.create_netcon(&stim, None, NetConParams { delay: -1.0, ..NetConParams::default() })
    else {
        panic!("expected OutOfRange");
    };
    assert_eq!(field, "delay");
    assert_eq!(value, -1.0);

    let nc = ctx.create_netcon(&stim, None, NetConParams::default()).unwrap();
    assert_eq!(nc.delay().unwrap(), 1.0);
    assert!(nc.set_delay(-0.1).is_err());
    nc.set_delay(0.0).unwrap();
    assert_eq!(nc.delay().unwrap(), 0.0);
    nc.set_threshold(-20.0).unwrap();
    assert_eq!(nc.threshold().unwrap(), -20.0);
}

#[test]
fn targets_must_receive_events() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let soma = ctx.create_named_section("soma").unwrap();
    soma.insert("pas").unwrap();
    let seg = soma.at(0.5).unwrap();
    let stim = ctx.create_artificial_cell("NetStim").unwrap();
    let clamp = ctx.point_process("IClamp").at(&seg).build().unwrap();
    let floating = ctx.point_process("ExpSyn").build().unwrap();
    let pas = seg.mechanism("pas").unwrap();

    assert_invalid_target(ctx.create_netcon(&stim, Some(&pas), NetConParams::default()));
    assert_invalid_target(ctx.create_netcon(&stim, Some(clamp.as_mechanism()), NetConParams::default()));
    assert_invalid_target(ctx.create_netcon(&stim, Some(floating.as_mechanism()), NetConParams::default()));

    floating.attach(&seg).unwrap();
    let nc = ctx
        .create_netcon(&stim, Some(floating.as_mechanism()), NetConParams::default())
        .unwrap();
    assert!(nc.valid().unwrap());
    assert_invalid_target(nc.set_target(Some(clamp.as_mechanism())));
    assert_eq!(nc.target().unwrap().as_ref(), Some(floating.as_mechanism()));
}

#[test]
fn artificial_cell_source_round_trips() {
    let (kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let source = ctx.create_artificial_cell("NetStim").unwrap();
    let sink = ctx.create_artificial_cell("NetStim").unwrap();
    let nc = ctx
        .create_netcon(&source, Some(sink.as_mechanism()), NetConParams::default())
        .unwrap();
    assert_eq!(kernel.connection_count().unwrap(), 1);

    let NetConSource::Cell(found) = nc.source().unwrap() else {
        panic!("expected a cell source");
    };
    assert_eq!(found, source);
    assert!(nc.valid().unwrap());

    sink.destroy().unwrap();
    assert!(!nc.valid().unwrap());
    assert!(nc.target().unwrap().is_none());

    source.destroy().unwrap();
    assert!(nc.source().unwrap_err().is_use_after_destroy());
    nc.destroy().unwrap();
    assert_eq!(kernel.connection_count().unwrap(), 0);
    assert!(nc.delay().unwrap_err().is_use_after_destroy());
}

#[test]
fn variable_source_keeps_provenance() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let soma = ctx.create_named_section("soma").unwrap();
    let seg = soma.at(0.5).unwrap();
    let syn = ctx.point_process("ExpSyn").at(&seg).build().unwrap();
    let nc = ctx
        .create_netcon(seg.v().unwrap(), Some(syn.as_mechanism()), NetConParams::default())
        .unwrap();

    let NetConSource::Variable(var) = nc.source().unwrap() else {
        panic!("expected a variable source");
    };
    assert_eq!(var.attribute(), "v");
    assert_eq!(var, -65.0);
    assert_eq!(var.source().handle(), seg.handle());

    soma.destroy().unwrap();
    assert!(!nc.valid().unwrap());
    assert!(nc.source().is_err());
}

#[test]
fn events_and_activity() {
    let (_kernel, sim) = setup();
    let ctx = sim.create_context(ContextConfig::default()).unwrap();
    let stim = ctx.create_artificial_cell("NetStim").unwrap();
    let nc = ctx.create_netcon(&stim, None, NetConParams::default()).unwrap();
    assert!(nc.active().unwrap());
    nc.set_active(false).unwrap();
    assert!(!nc.active().unwrap());
    nc.event(5.0, None).unwrap();
    nc.event(6.0, Some(1.0)).unwrap();
    assert!(nc.event(f64::NAN, None).unwrap_err().is_validation());
}

#[test]
fn sources_from_another_context_are_rejected() {
    let sim_a = Simulator::new(Arc::new(MemoryKernel::with_catalog(catalog())));
    let sim_b = Simulator::new(Arc::new(MemoryKernel::with_catalog(catalog())));
    let ctx_a = sim_a.create_context(ContextConfig::default()).unwrap();
    let ctx_b = sim_b.create_context(ContextConfig::default()).unwrap();
    let foreign = ctx_b.create_artificial_cell("NetStim").unwrap();

    let Err(NrnError::Lifecycle(LifecycleError::ContextMismatch { .. })) =
        ctx_a.create_netcon(&foreign, None, NetConParams::default())
    else {
        panic!("expected ContextMismatch");
    };
    let local = ctx_a.create_artificial_cell("NetStim").unwrap();
    assert_invalid_target(ctx_a.create_netcon(&local, Some(foreign.as_mechanism()), NetConParams::default()));
}
