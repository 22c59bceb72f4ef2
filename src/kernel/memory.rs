//! In-memory kernel backend.
//!
//! This module provides a thread-safe in-memory implementation of [`Kernel`].
//! It is intended for tests, embedded usage and as a reference for real
//! bindings. It keeps the full entity bookkeeping of a compartmental kernel
//! (sections, segments, mechanisms, point processes, connections, buffers) but
//! does not integrate membrane equations: `fadvance` moves time forward,
//! applies playback and samples recordings.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tracing::warn;

use super::{
    BufferKey, ConnectionField, ConnectionKey, ConnectionParams, EventSource, Global, Kernel,
    KernelError, MechanismDescriptor, MechanismKind, ObjectKey, ParentLink, SectionInfo,
    SectionKey, SectionProperty, VarPointer, VariableDescriptor, VariableGroup,
};

const DEFAULT_LENGTH: f64 = 100.0;
const DEFAULT_RA: f64 = 35.4;
const DEFAULT_DIAM: f64 = 500.0;
const DEFAULT_CM: f64 = 1.0;
const V_INIT: f64 = -65.0;

fn lock_err(context: &'static str) -> KernelError {
    KernelError::Backend(format!("poisoned lock: {context}"))
}

fn not_found<K: Into<u64>>(kind: &'static str, key: K) -> KernelError {
    KernelError::NotFound {
        kind,
        key: key.into(),
    }
}

fn segment_index(nseg: usize, x: f64) -> Result<usize, KernelError> {
    if !(0.0..=1.0).contains(&x) {
        return Err(KernelError::InvalidArgument(format!(
            "location {x} is outside [0, 1]"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let idx = (x * nseg as f64).floor() as usize;
    Ok(idx.min(nseg.saturating_sub(1)))
}

#[allow(clippy::cast_precision_loss)]
fn segment_center(nseg: usize, idx: usize) -> f64 {
    (idx as f64 + 0.5) / nseg as f64
}

/// Catalog entry served by [`MemoryKernel`], with default values for every
/// variable and the weight-vector length used by connections targeting it.
#[derive(Debug, Clone)]
pub struct MemoryMechanism {
    descriptor: MechanismDescriptor,
    defaults: Vec<(String, f64)>,
    weight_count: usize,
}

impl MemoryMechanism {
    fn with_kind(name: &str, kind: MechanismKind) -> Self {
        Self {
            descriptor: MechanismDescriptor {
                name: name.to_string(),
                kind,
                netcon_target: false,
                has_net_event: false,
                internal_type: 0,
                variables: Vec::new(),
            },
            defaults: Vec::new(),
            weight_count: 1,
        }
    }

    /// A distributed mechanism. Variable names get the `_<name>` suffix.
    #[must_use]
    pub fn distributed(name: &str) -> Self {
        Self::with_kind(name, MechanismKind::Distributed)
    }

    /// A point process.
    #[must_use]
    pub fn point_process(name: &str) -> Self {
        Self::with_kind(name, MechanismKind::PointProcess)
    }

    /// An artificial cell; always able to emit events.
    #[must_use]
    pub fn artificial_cell(name: &str) -> Self {
        let mut mech = Self::with_kind(name, MechanismKind::ArtificialCell);
        mech.descriptor.has_net_event = true;
        mech
    }

    /// Mark as an event target whose connections carry `weight_count` weights.
    #[must_use]
    pub fn netcon_target(mut self, weight_count: usize) -> Self {
        self.descriptor.netcon_target = true;
        self.weight_count = weight_count.max(1);
        self
    }

    /// Mark as an event source.
    #[must_use]
    pub fn net_event(mut self) -> Self {
        self.descriptor.has_net_event = true;
        self
    }

    /// Add a variable with its resting value.
    #[must_use]
    pub fn variable(mut self, group: VariableGroup, name: &str, default: f64) -> Self {
        let name = if self.descriptor.kind == MechanismKind::Distributed {
            format!("{name}_{}", self.descriptor.name)
        } else {
            name.to_string()
        };
        if group != VariableGroup::Global {
            self.defaults.push((name.clone(), default));
        }
        self.descriptor.variables.push(VariableDescriptor {
            name,
            group,
            size: 1,
        });
        self
    }

    /// Shorthand for a parameter variable.
    #[must_use]
    pub fn parameter(self, name: &str, default: f64) -> Self {
        self.variable(VariableGroup::Parameter, name, default)
    }

    /// Shorthand for an assigned variable.
    #[must_use]
    pub fn assigned(self, name: &str) -> Self {
        self.variable(VariableGroup::Assigned, name, 0.0)
    }

    /// Shorthand for a state variable.
    #[must_use]
    pub fn state(self, name: &str) -> Self {
        self.variable(VariableGroup::State, name, 0.0)
    }

    /// The catalog descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &MechanismDescriptor {
        &self.descriptor
    }
}

/// Catalog modeled on the mechanisms every stock kernel build ships with.
fn default_catalog() -> Vec<MemoryMechanism> {
    vec![
        MemoryMechanism::distributed("pas")
            .parameter("g", 0.001)
            .parameter("e", -70.0)
            .assigned("i"),
        MemoryMechanism::distributed("hh")
            .parameter("gnabar", 0.12)
            .parameter("gkbar", 0.036)
            .parameter("gl", 0.0003)
            .parameter("el", -54.3)
            .assigned("gna")
            .assigned("gk")
            .assigned("il")
            .state("m")
            .state("h")
            .state("n"),
        MemoryMechanism::point_process("IClamp")
            .parameter("del", 0.0)
            .parameter("dur", 0.0)
            .parameter("amp", 0.0)
            .assigned("i"),
        MemoryMechanism::point_process("AlphaSynapse")
            .parameter("onset", 0.0)
            .parameter("tau", 0.1)
            .parameter("gmax", 0.0)
            .parameter("e", 0.0)
            .assigned("i")
            .assigned("g"),
        MemoryMechanism::point_process("ExpSyn")
            .netcon_target(1)
            .parameter("tau", 0.1)
            .parameter("e", 0.0)
            .assigned("i")
            .state("g"),
        MemoryMechanism::point_process("Exp2Syn")
            .netcon_target(1)
            .parameter("tau1", 0.1)
            .parameter("tau2", 10.0)
            .parameter("e", 0.0)
            .assigned("i")
            .assigned("g")
            .state("A")
            .state("B"),
        MemoryMechanism::artificial_cell("NetStim")
            .netcon_target(1)
            .parameter("interval", 10.0)
            .parameter("number", 10.0)
            .parameter("start", 50.0)
            .parameter("noise", 0.0),
        MemoryMechanism::artificial_cell("IntFire1")
            .netcon_target(1)
            .parameter("tau", 10.0)
            .parameter("refrac", 5.0)
            .assigned("m"),
    ]
}

#[derive(Debug)]
struct SectionData {
    name: String,
    length: f64,
    ra: f64,
    parent: Option<ParentLink>,
    children: Vec<SectionKey>,
    mechanisms: Vec<String>,
    segments: Vec<HashMap<String, f64>>,
}

impl SectionData {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            length: DEFAULT_LENGTH,
            ra: DEFAULT_RA,
            parent: None,
            children: Vec::new(),
            mechanisms: Vec::new(),
            segments: vec![Self::fresh_segment()],
        }
    }

    fn fresh_segment() -> HashMap<String, f64> {
        HashMap::from([
            ("v".to_string(), V_INIT),
            ("diam".to_string(), DEFAULT_DIAM),
            ("cm".to_string(), DEFAULT_CM),
        ])
    }

    fn nseg(&self) -> usize {
        self.segments.len()
    }
}

#[derive(Debug)]
struct ObjectData {
    mechanism: String,
    vars: HashMap<String, f64>,
    location: Option<(SectionKey, f64)>,
}

#[derive(Debug)]
struct ConnectionData {
    source: EventSource,
    target: Option<ObjectKey>,
    threshold: f64,
    delay: f64,
    weights: Vec<f64>,
    active: bool,
    events: Vec<(f64, Option<f64>)>,
}

#[derive(Debug)]
struct Playback {
    pointer: VarPointer,
    dt: f64,
}

#[derive(Debug, Default)]
struct BufferData {
    data: Vec<f64>,
    record: Option<VarPointer>,
    play: Option<Playback>,
}

#[derive(Debug)]
struct KernelState {
    next_key: u64,
    sections: BTreeMap<SectionKey, SectionData>,
    objects: BTreeMap<ObjectKey, ObjectData>,
    connections: BTreeMap<ConnectionKey, ConnectionData>,
    buffers: BTreeMap<BufferKey, BufferData>,
    dt: f64,
    celsius: f64,
    t0: f64,
    steps: u64,
}

impl Default for KernelState {
    fn default() -> Self {
        Self {
            next_key: 1,
            sections: BTreeMap::new(),
            objects: BTreeMap::new(),
            connections: BTreeMap::new(),
            buffers: BTreeMap::new(),
            dt: 0.025,
            celsius: 6.3,
            t0: 0.0,
            steps: 0,
        }
    }
}

impl KernelState {
    fn allocate(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    #[allow(clippy::cast_precision_loss)]
    fn time(&self) -> f64 {
        self.t0 + self.steps as f64 * self.dt
    }

    fn section(&self, key: SectionKey) -> Result<&SectionData, KernelError> {
        self.sections.get(&key).ok_or_else(|| not_found("section", key))
    }

    fn section_mut(&mut self, key: SectionKey) -> Result<&mut SectionData, KernelError> {
        self.sections
            .get_mut(&key)
            .ok_or_else(|| not_found("section", key))
    }

    fn object(&self, key: ObjectKey) -> Result<&ObjectData, KernelError> {
        self.objects.get(&key).ok_or_else(|| not_found("object", key))
    }

    fn object_mut(&mut self, key: ObjectKey) -> Result<&mut ObjectData, KernelError> {
        self.objects
            .get_mut(&key)
            .ok_or_else(|| not_found("object", key))
    }

    fn connection(&self, key: ConnectionKey) -> Result<&ConnectionData, KernelError> {
        self.connections
            .get(&key)
            .ok_or_else(|| not_found("netcon", key))
    }

    fn connection_mut(&mut self, key: ConnectionKey) -> Result<&mut ConnectionData, KernelError> {
        self.connections
            .get_mut(&key)
            .ok_or_else(|| not_found("netcon", key))
    }

    fn buffer_mut(&mut self, key: BufferKey) -> Result<&mut BufferData, KernelError> {
        self.buffers
            .get_mut(&key)
            .ok_or_else(|| not_found("buffer", key))
    }

    fn read(&self, pointer: &VarPointer) -> Result<f64, KernelError> {
        match pointer {
            VarPointer::Range { section, x, name } => {
                let data = self.section(*section)?;
                let idx = segment_index(data.nseg(), *x)?;
                data.segments[idx]
                    .get(name)
                    .copied()
                    .ok_or_else(|| KernelError::UnknownVariable { name: name.clone() })
            }
            VarPointer::Object { object, name } => self
                .object(*object)?
                .vars
                .get(name)
                .copied()
                .ok_or_else(|| KernelError::UnknownVariable { name: name.clone() }),
        }
    }

    fn write(&mut self, pointer: &VarPointer, value: f64) -> Result<(), KernelError> {
        let slot = match pointer {
            VarPointer::Range { section, x, name } => {
                let data = self.section_mut(*section)?;
                let idx = segment_index(data.nseg(), *x)?;
                data.segments[idx].get_mut(name)
            }
            VarPointer::Object { object, name } => self.object_mut(*object)?.vars.get_mut(name),
        };
        let name = match pointer {
            VarPointer::Range { name, .. } | VarPointer::Object { name, .. } => name,
        };
        let slot = slot.ok_or_else(|| KernelError::UnknownVariable { name: name.clone() })?;
        *slot = value;
        Ok(())
    }

    fn sample_recordings(&mut self) {
        let samples: Vec<(BufferKey, f64)> = self
            .buffers
            .iter()
            .filter_map(|(key, buf)| {
                let pointer = buf.record.as_ref()?;
                // Pointers into deleted entities stop producing samples.
                self.read(pointer).ok().map(|value| (*key, value))
            })
            .collect();
        for (key, value) in samples {
            if let Some(buf) = self.buffers.get_mut(&key) {
                buf.data.push(value);
            }
        }
    }

    /// Playback into a target that no longer exists is detached.
    fn apply_playback(&mut self) {
        let t = self.time();
        let writes: Vec<(BufferKey, VarPointer, f64)> = self
            .buffers
            .iter()
            .filter_map(|(key, buf)| {
                let play = buf.play.as_ref()?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let idx = (t / play.dt + 0.5).floor() as usize;
                buf.data.get(idx).map(|value| (*key, play.pointer.clone(), *value))
            })
            .collect();
        for (key, pointer, value) in writes {
            if let Err(err) = self.write(&pointer, value) {
                warn!(buffer = %key, error = %err, "playback target is gone; detaching playback");
                if let Some(buf) = self.buffers.get_mut(&key) {
                    buf.play = None;
                }
            }
        }
    }

    fn is_descendant(&self, candidate: SectionKey, ancestor: SectionKey) -> bool {
        let mut current = Some(candidate);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = self
                .sections
                .get(&key)
                .and_then(|data| data.parent.map(|link| link.parent));
        }
        false
    }

    fn source_valid(&self, source: &EventSource) -> bool {
        match source {
            EventSource::Variable(pointer) => self.read(pointer).is_ok(),
            EventSource::Object(object) => self.objects.contains_key(object),
        }
    }
}

/// Thread-safe in-memory kernel.
#[derive(Debug)]
pub struct MemoryKernel {
    catalog: Vec<MemoryMechanism>,
    state: RwLock<KernelState>,
    catalog_queries: AtomicUsize,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::with_catalog(default_catalog())
    }
}

impl MemoryKernel {
    /// Create a kernel with the stock mechanism catalog
    /// (`pas`, `hh`, `IClamp`, `AlphaSynapse`, `ExpSyn`, `Exp2Syn`, `NetStim`, `IntFire1`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a kernel serving a custom catalog.
    #[must_use]
    pub fn with_catalog(mechanisms: Vec<MemoryMechanism>) -> Self {
        let catalog = mechanisms
            .into_iter()
            .enumerate()
            .map(|(idx, mut mech)| {
                mech.descriptor.internal_type = i32::try_from(idx + 1).unwrap_or(i32::MAX);
                mech
            })
            .collect();
        Self {
            catalog,
            state: RwLock::new(KernelState::default()),
            catalog_queries: AtomicUsize::new(0),
        }
    }

    /// How many times the catalog has been enumerated.
    #[must_use]
    pub fn catalog_queries(&self) -> usize {
        self.catalog_queries.load(Ordering::Acquire)
    }

    /// Events queued on a connection through [`Kernel::deliver_event`].
    pub fn queued_events(&self, connection: ConnectionKey) -> Result<Vec<(f64, Option<f64>)>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("kernel.queued_events"))?;
        Ok(state.connection(connection)?.events.clone())
    }

    fn mechanism(&self, name: &str) -> Result<&MemoryMechanism, KernelError> {
        self.catalog
            .iter()
            .find(|mech| mech.descriptor.name == name)
            .ok_or_else(|| KernelError::UnknownMechanism {
                name: name.to_string(),
            })
    }

    fn weight_count_for(&self, state: &KernelState, target: Option<ObjectKey>) -> Result<usize, KernelError> {
        match target {
            None => Ok(1),
            Some(object) => {
                let mech = &state.object(object)?.mechanism;
                Ok(self.mechanism(mech)?.weight_count)
            }
        }
    }

    fn check_target(&self, state: &KernelState, target: Option<ObjectKey>) -> Result<(), KernelError> {
        let Some(object) = target else {
            return Ok(());
        };
        let data = state.object(object)?;
        if !self.mechanism(&data.mechanism)?.descriptor.netcon_target {
            return Err(KernelError::InvalidArgument(format!(
                "{} cannot receive events",
                data.mechanism
            )));
        }
        Ok(())
    }
}

impl Kernel for MemoryKernel {
    fn mechanism_catalog(&self) -> Result<Vec<MechanismDescriptor>, KernelError> {
        self.catalog_queries.fetch_add(1, Ordering::AcqRel);
        Ok(self.catalog.iter().map(|mech| mech.descriptor.clone()).collect())
    }

    fn create_section(&self, name: &str) -> Result<SectionKey, KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("section.create"))?;
        if state.sections.values().any(|data| data.name == name) {
            return Err(KernelError::InvalidArgument(format!(
                "section name '{name}' already exists"
            )));
        }
        let key = SectionKey(state.allocate());
        state.sections.insert(key, SectionData::new(name));
        Ok(key)
    }

    fn delete_section(&self, section: SectionKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("section.delete"))?;
        let data = state
            .sections
            .remove(&section)
            .ok_or_else(|| not_found("section", section))?;

        if let Some(link) = data.parent {
            if let Some(parent) = state.sections.get_mut(&link.parent) {
                parent.children.retain(|child| *child != section);
            }
        }
        for child in data.children {
            if let Some(child) = state.sections.get_mut(&child) {
                child.parent = None;
            }
        }
        for object in state.objects.values_mut() {
            if matches!(object.location, Some((key, _)) if key == section) {
                object.location = None;
            }
        }
        Ok(())
    }

    fn live_sections(&self) -> Result<Vec<SectionInfo>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("section.live"))?;
        Ok(state
            .sections
            .iter()
            .map(|(key, data)| SectionInfo {
                key: *key,
                name: data.name.clone(),
            })
            .collect())
    }

    fn section_property(&self, section: SectionKey, property: SectionProperty) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("section.property"))?;
        let data = state.section(section)?;
        Ok(match property {
            SectionProperty::Length => data.length,
            SectionProperty::AxialResistivity => data.ra,
        })
    }

    fn set_section_property(
        &self,
        section: SectionKey,
        property: SectionProperty,
        value: f64,
    ) -> Result<(), KernelError> {
        if !(value.is_finite() && value > 0.0) {
            return Err(KernelError::InvalidArgument(format!(
                "{property:?} must be positive (got {value})"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("section.set_property"))?;
        let data = state.section_mut(section)?;
        match property {
            SectionProperty::Length => data.length = value,
            SectionProperty::AxialResistivity => data.ra = value,
        }
        Ok(())
    }

    fn nseg(&self, section: SectionKey) -> Result<usize, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("section.nseg"))?;
        Ok(state.section(section)?.nseg())
    }

    fn set_nseg(&self, section: SectionKey, nseg: usize) -> Result<(), KernelError> {
        if nseg == 0 {
            return Err(KernelError::InvalidArgument("nseg must be >= 1".to_string()));
        }
        let mut state = self.state.write().map_err(|_| lock_err("section.set_nseg"))?;
        let data = state.section_mut(section)?;
        let old = data.nseg();
        let mut resampled = Vec::with_capacity(nseg);
        for idx in 0..nseg {
            let src = segment_index(old, segment_center(nseg, idx))?;
            resampled.push(data.segments[src].clone());
        }
        data.segments = resampled;

        // Point processes move to the center of the segment now containing them.
        for object in state.objects.values_mut() {
            if let Some((key, x)) = object.location {
                if key == section {
                    let idx = segment_index(nseg, x)?;
                    object.location = Some((key, segment_center(nseg, idx)));
                }
            }
        }
        Ok(())
    }

    fn connect(
        &self,
        child: SectionKey,
        parent: SectionKey,
        parent_x: f64,
        child_end: f64,
    ) -> Result<(), KernelError> {
        if !(0.0..=1.0).contains(&parent_x) {
            return Err(KernelError::InvalidArgument(format!(
                "parent_x {parent_x} is outside [0, 1]"
            )));
        }
        if child_end != 0.0 && child_end != 1.0 {
            return Err(KernelError::InvalidArgument(format!(
                "child_end must be 0 or 1 (got {child_end})"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("section.connect"))?;
        state.section(parent)?;
        if state.section(child)?.parent.is_some() {
            return Err(KernelError::InvalidArgument(format!(
                "{child} already has a parent"
            )));
        }
        if state.is_descendant(parent, child) {
            return Err(KernelError::InvalidArgument(format!(
                "connecting {child} to {parent} would create a loop"
            )));
        }
        state.section_mut(child)?.parent = Some(ParentLink {
            parent,
            parent_x,
            child_end,
        });
        state.section_mut(parent)?.children.push(child);
        Ok(())
    }

    fn disconnect(&self, child: SectionKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("section.disconnect"))?;
        let Some(link) = state.section_mut(child)?.parent.take() else {
            return Err(KernelError::InvalidArgument(format!("{child} has no parent")));
        };
        if let Some(parent) = state.sections.get_mut(&link.parent) {
            parent.children.retain(|key| *key != child);
        }
        Ok(())
    }

    fn parent_link(&self, section: SectionKey) -> Result<Option<ParentLink>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("section.parent"))?;
        Ok(state.section(section)?.parent)
    }

    fn children(&self, section: SectionKey) -> Result<Vec<SectionKey>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("section.children"))?;
        Ok(state.section(section)?.children.clone())
    }

    fn insert_mechanism(&self, section: SectionKey, mechanism: &str) -> Result<(), KernelError> {
        let mech = self.mechanism(mechanism)?;
        if mech.descriptor.kind != MechanismKind::Distributed {
            return Err(KernelError::InvalidArgument(format!(
                "{mechanism} is not a distributed mechanism"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("mechanism.insert"))?;
        let data = state.section_mut(section)?;
        if data.mechanisms.iter().any(|name| name == mechanism) {
            return Err(KernelError::InvalidArgument(format!(
                "{mechanism} is already inserted in {section}"
            )));
        }
        data.mechanisms.push(mechanism.to_string());
        for segment in &mut data.segments {
            for (name, value) in &mech.defaults {
                segment.insert(name.clone(), *value);
            }
        }
        Ok(())
    }

    fn remove_mechanism(&self, section: SectionKey, mechanism: &str) -> Result<(), KernelError> {
        let mech = self.mechanism(mechanism)?;
        let mut state = self.state.write().map_err(|_| lock_err("mechanism.remove"))?;
        let data = state.section_mut(section)?;
        let before = data.mechanisms.len();
        data.mechanisms.retain(|name| name != mechanism);
        if data.mechanisms.len() == before {
            return Err(KernelError::InvalidArgument(format!(
                "{mechanism} is not inserted in {section}"
            )));
        }
        for segment in &mut data.segments {
            for (name, _) in &mech.defaults {
                segment.remove(name);
            }
        }
        Ok(())
    }

    fn inserted_mechanisms(&self, section: SectionKey) -> Result<Vec<String>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("mechanism.list"))?;
        Ok(state.section(section)?.mechanisms.clone())
    }

    fn range_value(&self, section: SectionKey, x: f64, name: &str) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("range.get"))?;
        state.read(&VarPointer::Range {
            section,
            x,
            name: name.to_string(),
        })
    }

    fn set_range_value(&self, section: SectionKey, x: f64, name: &str, value: f64) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("range.set"))?;
        state.write(
            &VarPointer::Range {
                section,
                x,
                name: name.to_string(),
            },
            value,
        )
    }

    fn create_object(&self, mechanism: &str) -> Result<ObjectKey, KernelError> {
        let mech = self.mechanism(mechanism)?;
        if mech.descriptor.kind == MechanismKind::Distributed {
            return Err(KernelError::InvalidArgument(format!(
                "{mechanism} is a distributed mechanism"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("object.create"))?;
        let key = ObjectKey(state.allocate());
        state.objects.insert(
            key,
            ObjectData {
                mechanism: mechanism.to_string(),
                vars: mech.defaults.iter().cloned().collect(),
                location: None,
            },
        );
        Ok(key)
    }

    fn destroy_object(&self, object: ObjectKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("object.destroy"))?;
        state
            .objects
            .remove(&object)
            .ok_or_else(|| not_found("object", object))?;
        for conn in state.connections.values_mut() {
            if conn.target == Some(object) {
                conn.target = None;
            }
        }
        Ok(())
    }

    fn object_count(&self, mechanism: &str) -> Result<usize, KernelError> {
        self.mechanism(mechanism)?;
        let state = self.state.read().map_err(|_| lock_err("object.count"))?;
        Ok(state
            .objects
            .values()
            .filter(|data| data.mechanism == mechanism)
            .count())
    }

    fn object_value(&self, object: ObjectKey, name: &str) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("object.get"))?;
        state.read(&VarPointer::Object {
            object,
            name: name.to_string(),
        })
    }

    fn set_object_value(&self, object: ObjectKey, name: &str, value: f64) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("object.set"))?;
        state.write(
            &VarPointer::Object {
                object,
                name: name.to_string(),
            },
            value,
        )
    }

    fn attach_object(&self, object: ObjectKey, section: SectionKey, x: f64) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("object.attach"))?;
        let mechanism = state.object(object)?.mechanism.clone();
        if self.mechanism(&mechanism)?.descriptor.kind != MechanismKind::PointProcess {
            return Err(KernelError::InvalidArgument(format!(
                "{mechanism} cannot be attached to a section"
            )));
        }
        let nseg = state.section(section)?.nseg();
        let center = segment_center(nseg, segment_index(nseg, x)?);
        state.object_mut(object)?.location = Some((section, center));
        Ok(())
    }

    fn object_location(&self, object: ObjectKey) -> Result<Option<(SectionKey, f64)>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("object.location"))?;
        Ok(state.object(object)?.location)
    }

    fn create_connection(
        &self,
        source: &EventSource,
        target: Option<ObjectKey>,
        params: ConnectionParams,
    ) -> Result<ConnectionKey, KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.create"))?;
        match source {
            EventSource::Variable(pointer) => {
                state.read(pointer)?;
            }
            EventSource::Object(object) => {
                let mech = &state.object(*object)?.mechanism;
                if !self.mechanism(mech)?.descriptor.has_net_event {
                    return Err(KernelError::InvalidArgument(format!(
                        "{mech} cannot emit events"
                    )));
                }
            }
        }
        self.check_target(&state, target)?;
        let mut weights = vec![0.0; self.weight_count_for(&state, target)?];
        weights[0] = params.weight;

        let key = ConnectionKey(state.allocate());
        state.connections.insert(
            key,
            ConnectionData {
                source: source.clone(),
                target,
                threshold: params.threshold,
                delay: params.delay,
                weights,
                active: true,
                events: Vec::new(),
            },
        );
        Ok(key)
    }

    fn destroy_connection(&self, connection: ConnectionKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.destroy"))?;
        state
            .connections
            .remove(&connection)
            .map(|_| ())
            .ok_or_else(|| not_found("netcon", connection))
    }

    fn connection_count(&self) -> Result<usize, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.count"))?;
        Ok(state.connections.len())
    }

    fn set_connection_target(&self, connection: ConnectionKey, target: Option<ObjectKey>) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.set_target"))?;
        self.check_target(&state, target)?;
        let count = self.weight_count_for(&state, target)?;
        let conn = state.connection_mut(connection)?;
        conn.target = target;
        conn.weights.resize(count, 0.0);
        Ok(())
    }

    fn connection_field(&self, connection: ConnectionKey, field: ConnectionField) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.field"))?;
        let conn = state.connection(connection)?;
        Ok(match field {
            ConnectionField::Threshold => conn.threshold,
            ConnectionField::Delay => conn.delay,
        })
    }

    fn set_connection_field(
        &self,
        connection: ConnectionKey,
        field: ConnectionField,
        value: f64,
    ) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.set_field"))?;
        let conn = state.connection_mut(connection)?;
        match field {
            ConnectionField::Threshold => conn.threshold = value,
            ConnectionField::Delay => {
                if value < 0.0 {
                    return Err(KernelError::InvalidArgument(format!(
                        "delay must be >= 0 (got {value})"
                    )));
                }
                conn.delay = value;
            }
        }
        Ok(())
    }

    fn weight_count(&self, connection: ConnectionKey) -> Result<usize, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.weight_count"))?;
        Ok(state.connection(connection)?.weights.len())
    }

    fn weight(&self, connection: ConnectionKey, index: usize) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.weight"))?;
        state
            .connection(connection)?
            .weights
            .get(index)
            .copied()
            .ok_or_else(|| KernelError::InvalidArgument(format!("weight index {index} out of range")))
    }

    fn set_weight(&self, connection: ConnectionKey, index: usize, value: f64) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.set_weight"))?;
        let slot = state
            .connection_mut(connection)?
            .weights
            .get_mut(index)
            .ok_or_else(|| KernelError::InvalidArgument(format!("weight index {index} out of range")))?;
        *slot = value;
        Ok(())
    }

    fn connection_active(&self, connection: ConnectionKey) -> Result<bool, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.active"))?;
        Ok(state.connection(connection)?.active)
    }

    fn set_connection_active(&self, connection: ConnectionKey, active: bool) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.set_active"))?;
        state.connection_mut(connection)?.active = active;
        Ok(())
    }

    fn connection_valid(&self, connection: ConnectionKey) -> Result<bool, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("netcon.valid"))?;
        let conn = state.connection(connection)?;
        let target_live = conn
            .target
            .is_some_and(|target| state.objects.contains_key(&target));
        Ok(target_live && state.source_valid(&conn.source))
    }

    fn deliver_event(&self, connection: ConnectionKey, time: f64, flag: Option<f64>) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("netcon.event"))?;
        state.connection_mut(connection)?.events.push((time, flag));
        Ok(())
    }

    fn create_buffer(&self, values: &[f64]) -> Result<BufferKey, KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("buffer.create"))?;
        let key = BufferKey(state.allocate());
        state.buffers.insert(
            key,
            BufferData {
                data: values.to_vec(),
                ..BufferData::default()
            },
        );
        Ok(key)
    }

    fn destroy_buffer(&self, buffer: BufferKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("buffer.destroy"))?;
        state
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| not_found("buffer", buffer))
    }

    fn buffer_data(&self, buffer: BufferKey) -> Result<Vec<f64>, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("buffer.data"))?;
        state
            .buffers
            .get(&buffer)
            .map(|buf| buf.data.clone())
            .ok_or_else(|| not_found("buffer", buffer))
    }

    fn record(&self, buffer: BufferKey, pointer: &VarPointer) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("buffer.record"))?;
        state.read(pointer)?;
        state.buffer_mut(buffer)?.record = Some(pointer.clone());
        Ok(())
    }

    fn play(&self, buffer: BufferKey, pointer: &VarPointer, dt: f64) -> Result<(), KernelError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(KernelError::InvalidArgument(format!(
                "playback dt must be positive (got {dt})"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("buffer.play"))?;
        state.read(pointer)?;
        state.buffer_mut(buffer)?.play = Some(Playback {
            pointer: pointer.clone(),
            dt,
        });
        Ok(())
    }

    fn play_remove(&self, buffer: BufferKey) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("buffer.play_remove"))?;
        state.buffer_mut(buffer)?.play = None;
        Ok(())
    }

    fn global(&self, global: Global) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("global.get"))?;
        Ok(match global {
            Global::Dt => state.dt,
            Global::Celsius => state.celsius,
            Global::Time => state.time(),
        })
    }

    fn set_global(&self, global: Global, value: f64) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("global.set"))?;
        match global {
            Global::Dt => {
                if !(value.is_finite() && value > 0.0) {
                    return Err(KernelError::InvalidArgument(format!(
                        "dt must be positive (got {value})"
                    )));
                }
                // Keep time continuous when the step size changes mid-run.
                state.t0 = state.time();
                state.steps = 0;
                state.dt = value;
            }
            Global::Celsius => state.celsius = value,
            Global::Time => {
                state.t0 = value;
                state.steps = 0;
            }
        }
        Ok(())
    }

    fn finitialize(&self) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("kernel.finitialize"))?;
        state.t0 = 0.0;
        state.steps = 0;
        for data in state.sections.values_mut() {
            for segment in &mut data.segments {
                segment.insert("v".to_string(), V_INIT);
            }
        }
        for buf in state.buffers.values_mut() {
            if buf.record.is_some() {
                buf.data.clear();
            }
        }
        state.apply_playback();
        state.sample_recordings();
        Ok(())
    }

    fn fadvance(&self) -> Result<(), KernelError> {
        let mut state = self.state.write().map_err(|_| lock_err("kernel.fadvance"))?;
        state.steps += 1;
        state.apply_playback();
        state.sample_recordings();
        Ok(())
    }

    fn read_pointer(&self, pointer: &VarPointer) -> Result<f64, KernelError> {
        let state = self.state.read().map_err(|_| lock_err("kernel.read_pointer"))?;
        state.read(pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_counted() {
        let kernel = MemoryKernel::new();
        assert_eq!(kernel.catalog_queries(), 0);
        let catalog = kernel.mechanism_catalog().unwrap();
        assert!(catalog.iter().any(|m| m.name == "hh"));
        assert_eq!(kernel.catalog_queries(), 1);
    }

    #[test]
    fn distributed_variables_carry_suffix() {
        let kernel = MemoryKernel::new();
        let catalog = kernel.mechanism_catalog().unwrap();
        let hh = catalog.iter().find(|m| m.name == "hh").unwrap();
        assert!(hh.variables.iter().any(|v| v.name == "gkbar_hh"));
        let iclamp = catalog.iter().find(|m| m.name == "IClamp").unwrap();
        assert!(iclamp.variables.iter().any(|v| v.name == "del"));
    }

    #[test]
    fn range_values_are_per_segment() {
        let kernel = MemoryKernel::new();
        let sec = kernel.create_section("s").unwrap();
        kernel.set_nseg(sec, 4).unwrap();
        kernel.insert_mechanism(sec, "pas").unwrap();
        kernel.set_range_value(sec, 0.1, "g_pas", 2.0).unwrap();
        assert_eq!(kernel.range_value(sec, 0.2, "g_pas").unwrap(), 2.0);
        assert_eq!(kernel.range_value(sec, 0.3, "g_pas").unwrap(), 0.001);
        assert!(kernel.range_value(sec, 0.3, "gkbar_hh").is_err());
    }

    #[test]
    fn nseg_change_resamples_and_snaps_objects() {
        let kernel = MemoryKernel::new();
        let sec = kernel.create_section("s").unwrap();
        kernel.set_nseg(sec, 2).unwrap();
        let ic = kernel.create_object("IClamp").unwrap();
        kernel.attach_object(ic, sec, 0.1).unwrap();
        assert_eq!(kernel.object_location(ic).unwrap(), Some((sec, 0.25)));

        kernel.set_nseg(sec, 1).unwrap();
        assert_eq!(kernel.object_location(ic).unwrap(), Some((sec, 0.5)));
    }

    #[test]
    fn deleting_section_detaches_objects_and_children() {
        let kernel = MemoryKernel::new();
        let parent = kernel.create_section("p").unwrap();
        let child = kernel.create_section("c").unwrap();
        kernel.connect(child, parent, 1.0, 0.0).unwrap();
        let ic = kernel.create_object("IClamp").unwrap();
        kernel.attach_object(ic, parent, 0.5).unwrap();

        kernel.delete_section(parent).unwrap();
        assert_eq!(kernel.object_location(ic).unwrap(), None);
        assert_eq!(kernel.parent_link(child).unwrap(), None);
        assert_eq!(kernel.live_sections().unwrap().len(), 1);
    }

    #[test]
    fn connect_rejects_loops() {
        let kernel = MemoryKernel::new();
        let a = kernel.create_section("a").unwrap();
        let b = kernel.create_section("b").unwrap();
        kernel.connect(b, a, 1.0, 0.0).unwrap();
        assert!(kernel.connect(a, b, 1.0, 0.0).is_err());
    }

    #[test]
    fn recording_samples_initial_value_and_each_step() {
        let kernel = MemoryKernel::new();
        let sec = kernel.create_section("s").unwrap();
        let buf = kernel.create_buffer(&[]).unwrap();
        let v = VarPointer::Range {
            section: sec,
            x: 0.5,
            name: "v".to_string(),
        };
        kernel.record(buf, &v).unwrap();
        kernel.set_global(Global::Dt, 0.1).unwrap();
        kernel.finitialize().unwrap();
        for _ in 0..10 {
            kernel.fadvance().unwrap();
        }
        assert_eq!(kernel.buffer_data(buf).unwrap().len(), 11);
        assert!((kernel.global(Global::Time).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn playback_into_deleted_section_is_detached() {
        let kernel = MemoryKernel::new();
        let sec = kernel.create_section("s").unwrap();
        let buf = kernel.create_buffer(&[1.0, 2.0, 3.0]).unwrap();
        let v = VarPointer::Range {
            section: sec,
            x: 0.5,
            name: "v".to_string(),
        };
        kernel.play(buf, &v, 0.1).unwrap();
        kernel.delete_section(sec).unwrap();

        kernel.finitialize().unwrap();
        kernel.fadvance().unwrap();
        let state = kernel.state.read().unwrap();
        assert!(state.buffers[&buf].play.is_none());
        assert_eq!(state.buffers[&buf].data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn playback_writes_into_variable() {
        let kernel = MemoryKernel::new();
        let sec = kernel.create_section("s").unwrap();
        let buf = kernel.create_buffer(&[1.0, 2.0, 3.0]).unwrap();
        let v = VarPointer::Range {
            section: sec,
            x: 0.5,
            name: "v".to_string(),
        };
        kernel.play(buf, &v, 0.1).unwrap();
        kernel.set_global(Global::Dt, 0.1).unwrap();
        kernel.finitialize().unwrap();
        assert_eq!(kernel.read_pointer(&v).unwrap(), 1.0);
        kernel.fadvance().unwrap();
        assert_eq!(kernel.read_pointer(&v).unwrap(), 2.0);
        kernel.play_remove(buf).unwrap();
        kernel.fadvance().unwrap();
        assert_eq!(kernel.read_pointer(&v).unwrap(), 2.0);
    }

    #[test]
    fn connection_weights_follow_target() {
        let kernel = MemoryKernel::with_catalog(vec![
            MemoryMechanism::artificial_cell("Src"),
            MemoryMechanism::point_process("Syn2").netcon_target(2),
        ]);
        let src = kernel.create_object("Src").unwrap();
        let syn = kernel.create_object("Syn2").unwrap();
        let params = ConnectionParams {
            threshold: 0.0,
            delay: 1.0,
            weight: 0.5,
        };
        let nc = kernel
            .create_connection(&EventSource::Object(src), None, params)
            .unwrap();
        assert_eq!(kernel.weight_count(nc).unwrap(), 1);
        assert!(!kernel.connection_valid(nc).unwrap());

        kernel.set_connection_target(nc, Some(syn)).unwrap();
        assert_eq!(kernel.weight_count(nc).unwrap(), 2);
        assert_eq!(kernel.weight(nc, 0).unwrap(), 0.5);
        assert!(kernel.connection_valid(nc).unwrap());

        kernel.destroy_object(syn).unwrap();
        assert!(!kernel.connection_valid(nc).unwrap());
    }
}
