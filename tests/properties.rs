//! Property tests: attribute mangling and the section registry stay consistent
//! under arbitrary inputs.

use std::collections::BTreeSet;
use std::sync::Arc;

use nrnscope::{demangle, mangle, ContextConfig, Kernel, Managed, MemoryKernel, Simulator};
use proptest::prelude::*;

fn arb_keyword() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("type"),
        Just("fn"),
        Just("loop"),
        Just("self"),
        Just("match"),
        Just("yield"),
        Just("box"),
    ]
    .prop_map(str::to_string)
}

fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9]{0,8}_{0,2}",
        (arb_keyword(), 0usize..3).prop_map(|(kw, n)| format!("{kw}{}", "_".repeat(n))),
    ]
}

proptest! {
    /// Demangling undoes mangling for every variable name.
    #[test]
    fn mangle_round_trips(name in arb_name()) {
        prop_assert_eq!(demangle(&mangle(&name)), name);
    }

    /// Distinct kernel names never collapse to one attribute.
    #[test]
    fn mangle_is_injective(a in arb_name(), b in arb_name()) {
        prop_assume!(a != b);
        prop_assert_ne!(mangle(&a), mangle(&b));
    }

    /// Keyword stems always come out with a trailing underscore.
    #[test]
    fn keywords_never_survive(kw in arb_keyword()) {
        prop_assert_eq!(mangle(&kw), format!("{kw}_"));
    }

    /// After any mix of creations and destructions, registered sections and
    /// kernel sections match by name.
    #[test]
    fn section_names_stay_in_bijection(ops in prop::collection::vec((any::<bool>(), 0usize..6), 1..30)) {
        let kernel = Arc::new(MemoryKernel::new());
        let sim = Simulator::new(kernel.clone());
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        let mut live = Vec::new();

        for (create, pick) in ops {
            if create || live.is_empty() {
                live.push(ctx.create_section().unwrap());
            } else {
                let section = live.remove(pick % live.len());
                section.destroy().unwrap();
                prop_assert!(section.is_destroyed());
            }
        }

        let ours: BTreeSet<String> = ctx.sections().unwrap().iter().map(|s| s.name().unwrap()).collect();
        let theirs: BTreeSet<String> = kernel.live_sections().unwrap().into_iter().map(|s| s.name).collect();
        prop_assert_eq!(ours.len(), live.len());
        prop_assert_eq!(&ours, &theirs);
        prop_assert!(ctx.verify().is_ok());

        ctx.finish().unwrap();
        prop_assert!(kernel.live_sections().unwrap().is_empty());
    }
}
