//! Simulation contexts.
//!
//! A [`Simulator`] wraps one kernel and hands out at most one active
//! [`Context`] at a time. The context owns every kernel-backed entity created
//! through it and releases them in bulk on [`Context::finish`]; scoped use via
//! [`ContextGuard`] or [`Simulator::scoped`] guarantees that release on every
//! exit path.

mod config;

pub use config::{ContextConfig, DEBUG_ENV_VAR};

use config::debug_env_enabled;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, NrnError, NrnResult};
use crate::handle::{destroy_member, Handle};
use crate::kernel::{Global, Kernel, KernelCensus, SectionKey};
use crate::mechanism::{ArtificialCell, Mechanism, PointProcessBuilder};
use crate::netcon::{NetCon, NetConParams, NetConSource};
use crate::reference::FloatVar;
use crate::registry::{HandleId, HandleKind, MemberBody, Registry};
use crate::schema::MechanismCatalog;
use crate::section::Section;
use crate::vector::Vector;

/// `run()` stops once the time is within this distance of `tstop` (ms).
const TIME_TOLERANCE: f64 = 1e-9;

fn lock_err(context: &'static str) -> NrnError {
    NrnError::internal(format!("poisoned lock: {context}"))
}

/// Kernels that currently host an active context, keyed by address. Shared by
/// every simulator in the process, so two simulators over clones of one kernel
/// `Arc` still see each other's claim.
fn claimed_kernels() -> NrnResult<MutexGuard<'static, HashMap<usize, ContextId>>> {
    static CLAIMS: OnceLock<Mutex<HashMap<usize, ContextId>>> = OnceLock::new();
    CLAIMS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|_| lock_err("kernel claims"))
}

fn kernel_address(kernel: &Arc<dyn Kernel>) -> usize {
    Arc::as_ptr(kernel).cast::<()>() as usize
}

/// Stable identifier for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Create a new random context ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for [`Context::init`] and [`Context::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitOptions {
    /// Timestep override (ms).
    pub dt: Option<f64>,
    /// Temperature override (°C).
    pub celsius: Option<f64>,
    /// Stop time override (ms).
    pub tstop: Option<f64>,
    /// Run the kernel's state initialization.
    pub finit: bool,
    /// Explicit start time; only valid without `finit`.
    pub start_time: Option<f64>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            dt: None,
            celsius: None,
            tstop: None,
            finit: true,
            start_time: None,
        }
    }
}

impl InitOptions {
    /// Defaults: state initialization, no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the timestep.
    #[must_use]
    pub const fn with_dt(mut self, dt: f64) -> Self {
        self.dt = Some(dt);
        self
    }

    /// Override the temperature.
    #[must_use]
    pub const fn with_celsius(mut self, celsius: f64) -> Self {
        self.celsius = Some(celsius);
        self
    }

    /// Override the stop time.
    #[must_use]
    pub const fn with_tstop(mut self, tstop: f64) -> Self {
        self.tstop = Some(tstop);
        self
    }

    /// Skip state initialization.
    #[must_use]
    pub const fn without_finit(mut self) -> Self {
        self.finit = false;
        self
    }

    /// Set the kernel time directly (requires [`InitOptions::without_finit`]).
    #[must_use]
    pub const fn with_start_time(mut self, t: f64) -> Self {
        self.start_time = Some(t);
        self
    }

    /// True when any parameter override is present.
    #[must_use]
    pub const fn has_overrides(&self) -> bool {
        self.dt.is_some() || self.celsius.is_some() || self.tstop.is_some() || self.start_time.is_some()
    }
}

/// Outcome of [`Context::finish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Context that was finished.
    pub context: ContextId,
    /// Members destroyed by the teardown (sections count once, with their
    /// segments and mechanisms).
    pub destroyed: usize,
    /// Recorders left alive.
    pub kept: usize,
    /// Members whose destruction failed.
    pub failed: usize,
    /// Teardown start.
    pub started_at: DateTime<Utc>,
    /// Teardown end.
    pub finished_at: DateTime<Utc>,
}

struct TeardownOutcome {
    destroyed: usize,
    kept: usize,
    failed: usize,
    first_error: Option<NrnError>,
}

#[derive(Debug)]
struct RunState {
    dt: f64,
    celsius: f64,
    tstop: f64,
    t: f64,
    initialized: bool,
    active: bool,
    finished: bool,
}

impl RunState {
    fn check_dt(&self, dt: f64) -> NrnResult<()> {
        if self.initialized {
            return Err(LifecycleError::ImmutableAfterInit { field: "dt" }.into());
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(NrnError::out_of_range("dt", dt, "> 0"));
        }
        Ok(())
    }

    fn check_celsius(&self, celsius: f64) -> NrnResult<()> {
        if self.initialized {
            return Err(LifecycleError::ImmutableAfterInit { field: "celsius" }.into());
        }
        if !celsius.is_finite() {
            return Err(NrnError::out_of_range("celsius", celsius, "finite"));
        }
        Ok(())
    }

    fn check_tstop(tstop: f64) -> NrnResult<()> {
        if !(tstop.is_finite() && tstop >= 0.0) {
            return Err(NrnError::out_of_range("tstop", tstop, ">= 0"));
        }
        Ok(())
    }
}

/// State shared by a context and every wrapper created through it.
pub(crate) struct ContextShared {
    pub(crate) id: ContextId,
    created_at: DateTime<Utc>,
    config: ContextConfig,
    kernel: Arc<dyn Kernel>,
    catalog: Arc<MechanismCatalog>,
    simulator: Weak<SimulatorShared>,
    section_counter: Arc<AtomicU64>,
    registry: Mutex<Registry>,
    run: Mutex<RunState>,
}

impl fmt::Debug for ContextShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextShared")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContextShared {
    pub(crate) fn registry(&self) -> NrnResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| lock_err("context.registry"))
    }

    fn run_state(&self) -> NrnResult<MutexGuard<'_, RunState>> {
        self.run.lock().map_err(|_| lock_err("context.run"))
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub(crate) fn catalog(&self) -> &MechanismCatalog {
        &self.catalog
    }

    pub(crate) fn ensure_active(&self) -> NrnResult<()> {
        if self.run_state()?.active {
            Ok(())
        } else {
            Err(LifecycleError::InactiveContext { context: self.id }.into())
        }
    }

    /// Add a member to the table. `label` receives the id the member will get.
    pub(crate) fn register(
        self: &Arc<Self>,
        kind: HandleKind,
        label: impl FnOnce(HandleId) -> String,
        body: MemberBody,
    ) -> NrnResult<Handle> {
        let mut registry = self.registry()?;
        let label: Arc<str> = Arc::from(label(registry.next_id()));
        let id = registry.register(kind, Arc::clone(&label), body);
        drop(registry);
        debug!(context = %self.id, handle = %id, kind = %kind, label = %label, "registered member");
        Ok(Handle::new(Arc::clone(self), id, kind, label))
    }

    pub(crate) fn generate_section_name(&self) -> NrnResult<String> {
        let registry = self.registry()?;
        loop {
            let n = self.section_counter.fetch_add(1, Ordering::AcqRel);
            let name = format!("section_{n}");
            if registry.section_by_name(&name).is_none() {
                return Ok(name);
            }
        }
    }

    fn refresh_time(&self) -> NrnResult<f64> {
        let t = self.kernel.global(Global::Time)?;
        self.run_state()?.t = t;
        Ok(t)
    }

    /// Destroy members phase by phase: connections, recorders (unless kept),
    /// point processes and artificial cells, sections. Every member is
    /// attempted; the first error is kept.
    fn teardown(&self, keep_recorders: bool) -> TeardownOutcome {
        let mut outcome = TeardownOutcome {
            destroyed: 0,
            kept: 0,
            failed: 0,
            first_error: None,
        };
        let mut phases = vec![HandleKind::NetCon];
        if !keep_recorders {
            phases.push(HandleKind::Vector);
        }
        phases.extend([HandleKind::PointProcess, HandleKind::ArtificialCell, HandleKind::Section]);

        for kind in phases {
            let ids = match self.registry() {
                Ok(registry) => registry.ids_of(kind),
                Err(err) => {
                    outcome.first_error.get_or_insert(err);
                    return outcome;
                }
            };
            for id in ids {
                match destroy_member(self, id) {
                    Ok(()) => outcome.destroyed += 1,
                    Err(err) => {
                        warn!(context = %self.id, handle = %id, kind = %kind, error = %err, "failed to destroy member during teardown");
                        outcome.failed += 1;
                        outcome.first_error.get_or_insert(err);
                    }
                }
            }
        }
        if keep_recorders {
            outcome.kept = self.registry().map_or(0, |registry| registry.count_of(HandleKind::Vector));
        }
        outcome
    }

    fn release_kernel(&self) -> NrnResult<()> {
        let mut claims = claimed_kernels()?;
        let address = kernel_address(&self.kernel);
        if claims.get(&address) == Some(&self.id) {
            claims.remove(&address);
        }
        Ok(())
    }

    fn finish(&self) -> NrnResult<TeardownReport> {
        let started_at = Utc::now();
        {
            let mut run = self.run_state()?;
            if run.finished {
                return Ok(TeardownReport {
                    context: self.id,
                    destroyed: 0,
                    kept: 0,
                    failed: 0,
                    started_at,
                    finished_at: started_at,
                });
            }
            run.active = false;
        }

        let outcome = self.teardown(self.config.keep_recorders);

        if let Some(simulator) = self.simulator.upgrade() {
            let mut slot = simulator.active.lock().map_err(|_| lock_err("simulator.active"))?;
            if slot.as_ref().is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), self)) {
                *slot = None;
            }
        }
        self.release_kernel()?;

        let report = TeardownReport {
            context: self.id,
            destroyed: outcome.destroyed,
            kept: outcome.kept,
            failed: outcome.failed,
            started_at,
            finished_at: Utc::now(),
        };
        match outcome.first_error {
            None => {
                self.run_state()?.finished = true;
                info!(context = %self.id, destroyed = report.destroyed, kept = report.kept, "context finished");
                Ok(report)
            }
            Some(err) => {
                warn!(context = %self.id, failed = report.failed, error = %err, "context teardown incomplete");
                Err(err)
            }
        }
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        if let Err(err) = self.release_kernel() {
            warn!(context = %self.id, error = %err, "failed to release kernel claim on drop");
        }
        let remaining = match self.registry.get_mut() {
            Ok(registry) => registry.len(),
            Err(_) => return,
        };
        if remaining == 0 {
            return;
        }
        let outcome = self.teardown(false);
        match outcome.first_error {
            None => debug!(context = %self.id, released = outcome.destroyed, "released remaining context resources"),
            Some(err) => warn!(context = %self.id, error = %err, "failed to release context resources on drop"),
        }
    }
}

fn census(kernel: &dyn Kernel, catalog: &MechanismCatalog) -> NrnResult<KernelCensus> {
    let mut event_objects = 0;
    for mtype in catalog.iter().filter(|mtype| mtype.is_event_capable()) {
        event_objects += kernel.object_count(mtype.name())?;
    }
    Ok(KernelCensus {
        sections: kernel.live_sections()?.len(),
        connections: kernel.connection_count()?,
        event_objects,
    })
}

/// Handle to one simulation scope.
///
/// Cloning is cheap; every clone refers to the same context. Wrappers created
/// through a context keep it alive.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("active", &self.is_active())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    /// Context identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Configuration the context was created with.
    #[must_use]
    pub fn config(&self) -> ContextConfig {
        self.shared.config
    }

    fn flag(&self, read: impl FnOnce(&RunState) -> bool) -> bool {
        self.shared.run_state().map_or(false, |run| read(&*run))
    }

    /// True until `finish()` starts.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flag(|run| run.active)
    }

    /// True once state initialization has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.flag(|run| run.initialized)
    }

    /// True after a clean `finish()`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flag(|run| run.finished)
    }

    /// Scoped use of an already active context.
    pub fn enter(&self) -> NrnResult<ContextGuard> {
        self.shared.ensure_active()?;
        Ok(ContextGuard::new(self.clone()))
    }

    /// Timestep (ms).
    pub fn dt(&self) -> NrnResult<f64> {
        Ok(self.shared.run_state()?.dt)
    }

    /// Temperature (°C).
    pub fn celsius(&self) -> NrnResult<f64> {
        Ok(self.shared.run_state()?.celsius)
    }

    /// Stop time (ms).
    pub fn tstop(&self) -> NrnResult<f64> {
        Ok(self.shared.run_state()?.tstop)
    }

    /// Simulation time as of the last kernel interaction (ms).
    pub fn t(&self) -> NrnResult<f64> {
        Ok(self.shared.run_state()?.t)
    }

    /// Set the timestep. Not allowed after initialization.
    pub fn set_dt(&self, dt: f64) -> NrnResult<()> {
        let mut run = self.shared.run_state()?;
        run.check_dt(dt)?;
        run.dt = dt;
        Ok(())
    }

    /// Set the temperature. Not allowed after initialization.
    pub fn set_celsius(&self, celsius: f64) -> NrnResult<()> {
        let mut run = self.shared.run_state()?;
        run.check_celsius(celsius)?;
        run.celsius = celsius;
        Ok(())
    }

    /// Set the stop time. Allowed at any point.
    pub fn set_tstop(&self, tstop: f64) -> NrnResult<()> {
        RunState::check_tstop(tstop)?;
        self.shared.run_state()?.tstop = tstop;
        Ok(())
    }

    fn push_parameters(&self) -> NrnResult<()> {
        let (dt, celsius) = {
            let run = self.shared.run_state()?;
            (run.dt, run.celsius)
        };
        let kernel = self.shared.kernel();
        kernel.set_global(Global::Dt, dt)?;
        kernel.set_global(Global::Celsius, celsius)?;
        Ok(())
    }

    /// Push parameters into the kernel and, with `finit`, initialize state.
    ///
    /// Overrides are all checked before any of them is applied.
    pub fn init(&self, options: InitOptions) -> NrnResult<()> {
        self.shared.ensure_active()?;
        if options.finit && options.start_time.is_some() {
            return Err(NrnError::invalid_argument(
                "finit and an explicit start time cannot be combined",
            ));
        }
        {
            let mut run = self.shared.run_state()?;
            if let Some(dt) = options.dt {
                run.check_dt(dt)?;
            }
            if let Some(celsius) = options.celsius {
                run.check_celsius(celsius)?;
            }
            if let Some(tstop) = options.tstop {
                RunState::check_tstop(tstop)?;
            }
            if let Some(dt) = options.dt {
                run.dt = dt;
            }
            if let Some(celsius) = options.celsius {
                run.celsius = celsius;
            }
            if let Some(tstop) = options.tstop {
                run.tstop = tstop;
            }
        }
        self.push_parameters()?;

        let kernel = self.shared.kernel();
        if options.finit {
            kernel.finitialize()?;
            self.shared.run_state()?.initialized = true;
        } else if let Some(t) = options.start_time {
            kernel.set_global(Global::Time, t)?;
        }
        let t = self.shared.refresh_time()?;
        info!(context = %self.shared.id, finit = options.finit, t, "context initialized");
        Ok(())
    }

    /// Advance by one timestep. The cached time is refreshed even when the
    /// step fails.
    pub fn advance(&self) -> NrnResult<()> {
        self.shared.ensure_active()?;
        self.push_parameters()?;
        let stepped = self.shared.kernel().fadvance();
        let refreshed = self.shared.refresh_time();
        stepped?;
        refreshed?;
        Ok(())
    }

    /// Initialize if needed, then advance until `tstop`.
    ///
    /// Overrides are only accepted before initialization.
    pub fn run(&self, options: InitOptions) -> NrnResult<()> {
        self.shared.ensure_active()?;
        if self.is_initialized() {
            if options.has_overrides() {
                return Err(LifecycleError::AlreadyInitialized {
                    context: self.shared.id,
                }
                .into());
            }
        } else {
            self.init(options)?;
        }

        let stepped = (|| -> NrnResult<()> {
            loop {
                let (t, tstop) = {
                    let run = self.shared.run_state()?;
                    (run.t, run.tstop)
                };
                if t + TIME_TOLERANCE >= tstop {
                    return Ok(());
                }
                self.advance()?;
            }
        })();
        let refreshed = self.shared.refresh_time();
        stepped?;
        let t = refreshed?;
        info!(context = %self.shared.id, t, "run complete");
        Ok(())
    }

    /// Tear down every member and release the active slot.
    ///
    /// A second call after a clean teardown is a no-op. After a failed
    /// teardown the context stays inactive and `finish()` can be retried.
    pub fn finish(&self) -> NrnResult<TeardownReport> {
        self.shared.finish()
    }

    /// Check that the kernel's live sections and the registered sections
    /// match one to one.
    pub fn verify(&self) -> NrnResult<()> {
        let live = self.shared.kernel().live_sections()?;
        let registry = self.shared.registry()?;

        let mut unknown_to_context: Vec<String> = live
            .iter()
            .filter(|section| registry.section_by_key(section.key).is_none())
            .map(|section| section.name.clone())
            .collect();
        let kernel_keys: HashSet<SectionKey> = live.iter().map(|section| section.key).collect();
        let mut unknown_to_kernel: Vec<String> = registry
            .section_keys()
            .filter(|(key, _)| !kernel_keys.contains(*key))
            .map(|(_, id)| registry.section(*id).map_or_else(|| id.to_string(), |s| s.name.clone()))
            .collect();

        if unknown_to_context.is_empty() && unknown_to_kernel.is_empty() {
            return Ok(());
        }
        unknown_to_context.sort();
        unknown_to_kernel.sort();
        warn!(context = %self.shared.id, ?unknown_to_context, ?unknown_to_kernel, "registry and kernel disagree");
        Err(LifecycleError::Consistency {
            unknown_to_context,
            unknown_to_kernel,
        }
        .into())
    }

    /// Live kernel entities that a new context's preflight check would see.
    pub fn kernel_census(&self) -> NrnResult<KernelCensus> {
        census(self.shared.kernel(), self.shared.catalog())
    }

    /// Number of live members.
    pub fn member_count(&self) -> NrnResult<usize> {
        Ok(self.shared.registry()?.len())
    }

    /// Mechanism catalog.
    #[must_use]
    pub fn catalog(&self) -> &MechanismCatalog {
        self.shared.catalog()
    }

    /// Create a section with a generated name.
    pub fn create_section(&self) -> NrnResult<Section> {
        Section::create(&self.shared, None)
    }

    /// Create a named section. Names must be unique.
    pub fn create_named_section(&self, name: &str) -> NrnResult<Section> {
        Section::create(&self.shared, Some(name))
    }

    /// Registered section by name.
    pub fn section(&self, name: &str) -> NrnResult<Option<Section>> {
        let id = self.shared.registry()?.section_by_name(name);
        match id {
            Some(id) => Ok(Handle::resolve(&self.shared, id)?.map(Section::from_handle)),
            None => Ok(None),
        }
    }

    /// All registered sections, in creation order.
    pub fn sections(&self) -> NrnResult<Vec<Section>> {
        let ids = self.shared.registry()?.ids_of(HandleKind::Section);
        let mut sections = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = Handle::resolve(&self.shared, id)? {
                sections.push(Section::from_handle(handle));
            }
        }
        Ok(sections)
    }

    /// Start building a point process.
    #[must_use]
    pub fn point_process(&self, mechanism: &str) -> PointProcessBuilder {
        PointProcessBuilder::new(Arc::clone(&self.shared), mechanism)
    }

    /// Create an artificial cell.
    pub fn create_artificial_cell(&self, mechanism: &str) -> NrnResult<ArtificialCell> {
        ArtificialCell::create(&self.shared, mechanism)
    }

    /// Create an event connection.
    pub fn create_netcon(
        &self,
        source: impl Into<NetConSource>,
        target: Option<&Mechanism>,
        params: NetConParams,
    ) -> NrnResult<NetCon> {
        NetCon::create(&self.shared, source.into(), target, params)
    }

    /// Create a buffer holding `values`.
    pub fn create_vector(&self, values: &[f64]) -> NrnResult<Vector> {
        Vector::create(&self.shared, values)
    }

    /// Create an empty buffer recording `var`.
    pub fn record(&self, var: &FloatVar) -> NrnResult<Vector> {
        let vector = Vector::create(&self.shared, &[])?;
        if let Err(err) = vector.record(var) {
            destroy_member(&self.shared, crate::handle::Managed::handle(&vector).id())?;
            return Err(err);
        }
        Ok(vector)
    }
}

/// The debug environment override is read at every scope exit, so it also
/// applies to contexts created from an explicit configuration.
fn keeps_on_error(config: &ContextConfig) -> bool {
    config.keep_on_error || debug_env_enabled()
}

/// Scoped ownership of an active context.
///
/// Dropping the guard finishes the context, except while panicking with
/// `keep_on_error` set. Dereferences to [`Context`].
#[must_use = "dropping the guard finishes the context"]
pub struct ContextGuard {
    context: Context,
    armed: bool,
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("context", &self.context)
            .field("armed", &self.armed)
            .finish()
    }
}

impl ContextGuard {
    const fn new(context: Context) -> Self {
        Self { context, armed: true }
    }

    /// The guarded context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Finish the context now and report the teardown.
    pub fn finish(mut self) -> NrnResult<TeardownReport> {
        self.armed = false;
        self.context.finish()
    }

    /// Give up scoped ownership; the context stays active until finished
    /// explicitly or the simulator is dropped.
    #[must_use]
    pub fn into_context(mut self) -> Context {
        self.armed = false;
        self.context.clone()
    }
}

impl Deref for ContextGuard {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() && keeps_on_error(&self.context.config()) {
            warn!(context = %self.context.id(), "keeping context alive for inspection after panic");
            return;
        }
        if let Err(err) = self.context.finish() {
            warn!(context = %self.context.id(), error = %err, "context teardown on scope exit failed");
        }
    }
}

pub(crate) struct SimulatorShared {
    kernel: Arc<dyn Kernel>,
    catalog: OnceLock<Arc<MechanismCatalog>>,
    active: Mutex<Option<Arc<ContextShared>>>,
    section_counter: Arc<AtomicU64>,
}

impl Drop for SimulatorShared {
    fn drop(&mut self) {
        let active = match self.active.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(context) = active {
            if let Err(err) = context.finish() {
                warn!(context = %context.id, error = %err, "finishing active context on simulator drop failed");
            }
        }
    }
}

/// Entry point: owns one kernel and its only active-context slot.
#[derive(Clone)]
pub struct Simulator {
    shared: Arc<SimulatorShared>,
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("catalog_loaded", &self.shared.catalog.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Wrap a kernel.
    #[must_use]
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            shared: Arc::new(SimulatorShared {
                kernel,
                catalog: OnceLock::new(),
                active: Mutex::new(None),
                section_counter: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Mechanism catalog, read from the kernel on first use and cached.
    pub fn catalog(&self) -> NrnResult<Arc<MechanismCatalog>> {
        if let Some(catalog) = self.shared.catalog.get() {
            return Ok(Arc::clone(catalog));
        }
        let descriptors = self.shared.kernel.mechanism_catalog()?;
        let catalog = Arc::new(MechanismCatalog::from_descriptors(&descriptors));
        debug!(mechanisms = catalog.len(), "loaded mechanism catalog");
        Ok(Arc::clone(self.shared.catalog.get_or_init(|| catalog)))
    }

    /// Create and activate a context.
    ///
    /// Fails with `ConcurrentContext` while another context is active on the
    /// same kernel, through this simulator or any other one, and,
    /// with `preflight_check`, with `DirtyKernelState` while the kernel still
    /// holds live entities. On failure no context becomes active.
    pub fn create_context(&self, config: ContextConfig) -> NrnResult<ContextGuard> {
        config.validate()?;
        let catalog = self.catalog()?;
        let mut slot = self.shared.active.lock().map_err(|_| lock_err("simulator.active"))?;
        if let Some(active) = slot.as_ref() {
            return Err(LifecycleError::ConcurrentContext { active: active.id }.into());
        }
        let mut claims = claimed_kernels()?;
        let address = kernel_address(&self.shared.kernel);
        if let Some(active) = claims.get(&address) {
            return Err(LifecycleError::ConcurrentContext { active: *active }.into());
        }

        let kernel = self.shared.kernel.as_ref();
        if config.preflight_check {
            let census = census(kernel, &catalog)?;
            if !census.is_clean() {
                warn!(%census, "refusing to create context on a dirty kernel");
                return Err(LifecycleError::DirtyKernelState { census }.into());
            }
        }
        kernel.set_global(Global::Dt, config.dt)?;
        kernel.set_global(Global::Celsius, config.celsius)?;
        let t = kernel.global(Global::Time)?;

        let shared = Arc::new(ContextShared {
            id: ContextId::new(),
            created_at: Utc::now(),
            config,
            kernel: Arc::clone(&self.shared.kernel),
            catalog,
            simulator: Arc::downgrade(&self.shared),
            section_counter: Arc::clone(&self.shared.section_counter),
            registry: Mutex::new(Registry::default()),
            run: Mutex::new(RunState {
                dt: config.dt,
                celsius: config.celsius,
                tstop: config.tstop,
                t,
                initialized: false,
                active: true,
                finished: false,
            }),
        });
        claims.insert(address, shared.id);
        drop(claims);
        *slot = Some(Arc::clone(&shared));
        info!(context = %shared.id, dt = config.dt, celsius = config.celsius, tstop = config.tstop, "context created");
        Ok(ContextGuard::new(Context { shared }))
    }

    /// The active context, if any.
    pub fn active_context(&self) -> NrnResult<Option<Context>> {
        let slot = self.shared.active.lock().map_err(|_| lock_err("simulator.active"))?;
        Ok(slot.as_ref().map(|shared| Context::from_shared(Arc::clone(shared))))
    }

    /// The active context, creating a default one (configured from the
    /// environment) when none is active. An implicitly created context lives
    /// until finished or until the simulator is dropped.
    pub fn current_context(&self) -> NrnResult<Context> {
        if let Some(context) = self.active_context()? {
            return Ok(context);
        }
        Ok(self.create_context(ContextConfig::from_env())?.into_context())
    }

    /// Run `f` inside a fresh context and finish it afterwards.
    ///
    /// When `f` fails and `keep_on_error` is set, the context is left active
    /// for inspection.
    pub fn scoped<T>(&self, config: ContextConfig, f: impl FnOnce(&Context) -> NrnResult<T>) -> NrnResult<T> {
        let guard = self.create_context(config)?;
        match f(guard.context()) {
            Ok(value) => {
                guard.finish()?;
                Ok(value)
            }
            Err(err) => {
                if keeps_on_error(&guard.config()) {
                    warn!(context = %guard.id(), error = %err, "scope failed; keeping context for inspection");
                    let _context = guard.into_context();
                } else if let Err(teardown) = guard.finish() {
                    warn!(error = %teardown, "teardown after failed scope also failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;

    fn simulator() -> Simulator {
        Simulator::new(Arc::new(MemoryKernel::new()))
    }

    #[test]
    fn context_id_is_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
    }

    #[test]
    fn init_options_overrides() {
        assert!(!InitOptions::new().has_overrides());
        assert!(!InitOptions::new().without_finit().has_overrides());
        assert!(InitOptions::new().with_tstop(5.0).has_overrides());
    }

    #[test]
    fn create_applies_config() {
        let sim = simulator();
        let ctx = sim
            .create_context(ContextConfig::default().with_dt(0.1).with_tstop(2.0))
            .unwrap();
        assert!(ctx.is_active());
        assert_eq!(ctx.dt().unwrap(), 0.1);
        assert_eq!(ctx.celsius().unwrap(), 25.0);
        assert_eq!(ctx.tstop().unwrap(), 2.0);
        assert_eq!(sim.active_context().unwrap().unwrap(), *ctx);
    }

    #[test]
    fn guard_drop_finishes() {
        let sim = simulator();
        let ctx = {
            let guard = sim.create_context(ContextConfig::default()).unwrap();
            guard.context().clone()
        };
        assert!(!ctx.is_active());
        assert!(ctx.is_finished());
        assert!(sim.active_context().unwrap().is_none());
    }

    #[test]
    fn setters_locked_after_init() {
        let sim = simulator();
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        ctx.set_dt(0.05).unwrap();
        ctx.init(InitOptions::new()).unwrap();
        let Err(NrnError::Lifecycle(LifecycleError::ImmutableAfterInit { field })) = ctx.set_dt(0.1) else {
            panic!("expected ImmutableAfterInit");
        };
        assert_eq!(field, "dt");
        assert!(ctx.set_celsius(30.0).is_err());
        ctx.set_tstop(20.0).unwrap();
        assert_eq!(ctx.tstop().unwrap(), 20.0);
    }

    #[test]
    fn setters_validate_values() {
        let sim = simulator();
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        assert!(ctx.set_dt(0.0).is_err());
        assert!(ctx.set_tstop(-1.0).is_err());
        assert!(ctx.set_celsius(f64::NAN).is_err());
    }

    #[test]
    fn init_overrides_apply_all_or_nothing() {
        let sim = simulator();
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        let err = ctx
            .init(InitOptions::new().with_dt(0.05).with_celsius(6.3).with_tstop(-1.0))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(ctx.dt().unwrap(), 0.025);
        assert_eq!(ctx.celsius().unwrap(), 25.0);
        assert_eq!(ctx.tstop().unwrap(), 10.0);
        assert!(!ctx.is_initialized());

        ctx.init(InitOptions::new().with_dt(0.05).with_tstop(3.0)).unwrap();
        assert_eq!(ctx.dt().unwrap(), 0.05);
        assert_eq!(ctx.tstop().unwrap(), 3.0);
    }

    #[test]
    fn finit_and_start_time_conflict() {
        let sim = simulator();
        let ctx = sim.create_context(ContextConfig::default()).unwrap();
        let err = ctx.init(InitOptions::new().with_start_time(5.0)).unwrap_err();
        assert!(err.is_validation());

        ctx.init(InitOptions::new().without_finit().with_start_time(5.0)).unwrap();
        assert_eq!(ctx.t().unwrap(), 5.0);
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn inactive_context_rejects_work() {
        let sim = simulator();
        let guard = sim.create_context(ContextConfig::default()).unwrap();
        let ctx = guard.into_context();
        ctx.finish().unwrap();
        let Err(NrnError::Lifecycle(LifecycleError::InactiveContext { .. })) = ctx.advance() else {
            panic!("expected InactiveContext");
        };
        assert!(ctx.create_section().is_err());
        assert!(ctx.enter().is_err());
    }
}
