//! Mechanism wrappers: distributed instances, point processes and
//! artificial cells.
//!
//! Variables are addressed by attribute name through the type's
//! [`MechanismType`] table. Reads return a [`FloatVar`]; writes go straight
//! to the kernel.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::context::ContextShared;
use crate::error::{LifecycleError, NrnError, NrnResult};
use crate::handle::{destroy_member, Handle, Managed};
use crate::kernel::{MechanismKind, ObjectKey, SectionKey, VarPointer};
use crate::reference::{FloatVar, VarSource};
use crate::registry::{HandleId, HandleKind, MemberBody};
use crate::schema::MechanismType;
use crate::section::Section;
use crate::segment::{self, Segment};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum MechanismSite {
    Distributed {
        segment: HandleId,
        section: SectionKey,
        x: f64,
    },
    PointProcess {
        object: ObjectKey,
    },
    ArtificialCell {
        object: ObjectKey,
    },
}

#[derive(Debug)]
pub(crate) struct MechanismState {
    pub(crate) mtype: Arc<MechanismType>,
    pub(crate) site: MechanismSite,
    pub(crate) label: Option<String>,
}

fn write_pointer(ctx: &ContextShared, pointer: &VarPointer, value: f64) -> NrnResult<()> {
    let kernel = ctx.kernel();
    match pointer {
        VarPointer::Range { section, x, name } => kernel.set_range_value(*section, *x, name, value)?,
        VarPointer::Object { object, name } => kernel.set_object_value(*object, name, value)?,
    }
    Ok(())
}

/// Any mechanism instance.
#[derive(Clone)]
pub struct Mechanism {
    handle: Handle,
    mtype: Arc<MechanismType>,
}

impl PartialEq for Mechanism {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Mechanism {}

impl std::hash::Hash for Mechanism {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.mtype.name(), self.handle.label())
    }
}

impl Managed for Mechanism {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Mechanism {
    /// Wrapper of a live mechanism member.
    pub(crate) fn resolve(ctx: &Arc<ContextShared>, id: HandleId) -> NrnResult<Option<Self>> {
        let mtype = {
            let registry = ctx.registry()?;
            match registry.mechanism(id) {
                Some(state) => Arc::clone(&state.mtype),
                None => return Ok(None),
            }
        };
        Ok(Handle::resolve(ctx, id)?.map(|handle| Self { handle, mtype }))
    }

    /// All live point processes of a context, in creation order.
    pub(crate) fn point_processes_of(ctx: &Arc<ContextShared>) -> NrnResult<Vec<PointProcess>> {
        let ids = ctx.registry()?.ids_of(HandleKind::PointProcess);
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mechanism) = Self::resolve(ctx, id)? {
                found.push(PointProcess(mechanism));
            }
        }
        Ok(found)
    }

    fn ctx(&self) -> &Arc<ContextShared> {
        self.handle.shared()
    }

    pub(crate) fn site(&self) -> NrnResult<MechanismSite> {
        let registry = self.ctx().registry()?;
        registry
            .mechanism(self.handle.id())
            .map(|state| state.site)
            .ok_or_else(|| NrnError::use_after_destroy(self.handle.label().to_string()))
    }

    pub(crate) fn object_key(&self) -> NrnResult<Option<ObjectKey>> {
        Ok(match self.site()? {
            MechanismSite::Distributed { .. } => None,
            MechanismSite::PointProcess { object } | MechanismSite::ArtificialCell { object } => Some(object),
        })
    }

    /// Type descriptor.
    #[must_use]
    pub fn mechanism_type(&self) -> &MechanismType {
        &self.mtype
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.mtype.name()
    }

    /// Mechanism kind.
    #[must_use]
    pub fn kind(&self) -> MechanismKind {
        self.mtype.kind()
    }

    /// Whether this instance can receive connection events.
    #[must_use]
    pub fn is_netcon_target(&self) -> bool {
        self.mtype.is_netcon_target()
    }

    /// Whether this instance can emit connection events.
    #[must_use]
    pub fn has_net_event(&self) -> bool {
        self.mtype.has_net_event()
    }

    /// Kernel pointer to one of this mechanism's variables.
    pub(crate) fn variable_pointer(&self, attribute: &str, kernel_name: &str) -> NrnResult<VarPointer> {
        match self.site()? {
            MechanismSite::Distributed { section, x, .. } => Ok(VarPointer::Range {
                section,
                x,
                name: kernel_name.to_string(),
            }),
            MechanismSite::PointProcess { object } => {
                if self.ctx().kernel().object_location(object)?.is_none() {
                    return Err(LifecycleError::AttachmentRequired {
                        mechanism: self.handle.label().to_string(),
                        attribute: attribute.to_string(),
                    }
                    .into());
                }
                Ok(VarPointer::Object {
                    object,
                    name: kernel_name.to_string(),
                })
            }
            MechanismSite::ArtificialCell { object } => Ok(VarPointer::Object {
                object,
                name: kernel_name.to_string(),
            }),
        }
    }

    /// Read a variable.
    pub fn get(&self, attribute: &str) -> NrnResult<FloatVar> {
        self.check_destroyed()?;
        let spec = self.mtype.resolve(attribute)?;
        let pointer = self.variable_pointer(&spec.attribute, &spec.kernel_name)?;
        let value = self.ctx().kernel().read_pointer(&pointer)?;
        Ok(FloatVar::new(
            value,
            &spec.attribute,
            &spec.kernel_name,
            VarSource::Mechanism(self.clone()),
        ))
    }

    /// Write a variable.
    pub fn set(&self, attribute: &str, value: f64) -> NrnResult<()> {
        self.check_destroyed()?;
        let spec = self.mtype.resolve(attribute)?;
        let pointer = self.variable_pointer(&spec.attribute, &spec.kernel_name)?;
        write_pointer(self.ctx(), &pointer, value)
    }

    /// Current values of every variable, in catalog order.
    pub fn variables(&self) -> NrnResult<Vec<FloatVar>> {
        self.mtype
            .variables()
            .iter()
            .map(|spec| self.get(&spec.attribute))
            .collect()
    }

    /// Segment hosting this instance: the owning segment of a distributed
    /// mechanism, the attachment segment of a point process, `None` for
    /// artificial cells and unattached point processes.
    pub fn segment(&self) -> NrnResult<Option<Segment>> {
        match self.site()? {
            MechanismSite::Distributed { segment, .. } => {
                Ok(Handle::resolve(self.ctx(), segment)?.map(Segment::from_handle))
            }
            MechanismSite::PointProcess { object } => {
                let Some((section, x)) = self.ctx().kernel().object_location(object)? else {
                    return Ok(None);
                };
                let section = Section::for_key(self.ctx(), section)?;
                let nseg = section.nseg()?;
                Ok(Some(section.at(segment::center(nseg, segment::index_of(nseg, x)))?))
            }
            MechanismSite::ArtificialCell { .. } => Ok(None),
        }
    }

    /// View as a point process.
    #[must_use]
    pub fn as_point_process(&self) -> Option<PointProcess> {
        self.mtype.is_point_process().then(|| PointProcess(self.clone()))
    }

    /// View as an artificial cell.
    #[must_use]
    pub fn as_artificial_cell(&self) -> Option<ArtificialCell> {
        self.mtype.is_artificial_cell().then(|| ArtificialCell(self.clone()))
    }
}

/// A point process: created on its own and attached to one segment.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PointProcess(Mechanism);

impl fmt::Debug for PointProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl Deref for PointProcess {
    type Target = Mechanism;

    fn deref(&self) -> &Mechanism {
        &self.0
    }
}

impl Managed for PointProcess {
    fn handle(&self) -> &Handle {
        &self.0.handle
    }
}

impl PointProcess {
    fn object(&self) -> NrnResult<ObjectKey> {
        self.0
            .object_key()?
            .ok_or_else(|| NrnError::internal(format!("{self:?} has no kernel object")))
    }

    /// Attach to (or move onto) a segment. The kernel snaps the location to
    /// the segment center.
    pub fn attach(&self, segment: &Segment) -> NrnResult<()> {
        let object = self.object()?;
        self.0.handle.check_same_context(segment.handle())?;
        let (section, x) = segment.location()?;
        self.0.ctx().kernel().attach_object(object, section, x)?;
        debug!(context = %self.0.ctx().id, point_process = %self.0.handle.label(), segment = %segment.handle().label(), "attached point process");
        Ok(())
    }

    /// Kernel location (section key and snapped position).
    pub(crate) fn location(&self) -> NrnResult<Option<(SectionKey, f64)>> {
        let object = self.object()?;
        Ok(self.0.ctx().kernel().object_location(object)?)
    }

    /// True while attached to a section.
    pub fn is_attached(&self) -> NrnResult<bool> {
        Ok(self.location()?.is_some())
    }

    /// Host section.
    pub fn section(&self) -> NrnResult<Option<Section>> {
        match self.location()? {
            Some((key, _)) => Ok(Some(Section::for_key(self.0.ctx(), key)?)),
            None => Ok(None),
        }
    }

    /// Optional user label.
    pub fn label(&self) -> NrnResult<Option<String>> {
        let registry = self.0.ctx().registry()?;
        registry
            .mechanism(self.0.handle.id())
            .map(|state| state.label.clone())
            .ok_or_else(|| NrnError::use_after_destroy(self.0.handle.label().to_string()))
    }

    /// The underlying mechanism wrapper.
    #[must_use]
    pub fn as_mechanism(&self) -> &Mechanism {
        &self.0
    }
}

/// An artificial cell: an event source or sink with no membrane location.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ArtificialCell(Mechanism);

impl fmt::Debug for ArtificialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl Deref for ArtificialCell {
    type Target = Mechanism;

    fn deref(&self) -> &Mechanism {
        &self.0
    }
}

impl Managed for ArtificialCell {
    fn handle(&self) -> &Handle {
        &self.0.handle
    }
}

impl ArtificialCell {
    pub(crate) fn create(ctx: &Arc<ContextShared>, mechanism: &str) -> NrnResult<Self> {
        let mechanism = create_object(ctx, mechanism, MechanismKind::ArtificialCell, None)?;
        Ok(Self(mechanism))
    }

    pub(crate) fn object(&self) -> NrnResult<ObjectKey> {
        self.0
            .object_key()?
            .ok_or_else(|| NrnError::internal(format!("{self:?} has no kernel object")))
    }

    /// The underlying mechanism wrapper.
    #[must_use]
    pub fn as_mechanism(&self) -> &Mechanism {
        &self.0
    }
}

fn create_object(
    ctx: &Arc<ContextShared>,
    mechanism: &str,
    kind: MechanismKind,
    label: Option<String>,
) -> NrnResult<Mechanism> {
    ctx.ensure_active()?;
    let mtype = ctx.catalog().resolve(mechanism)?;
    if mtype.kind() != kind {
        return Err(NrnError::invalid_argument(format!(
            "{mechanism} is a {:?} mechanism, not a {kind:?}",
            mtype.kind()
        )));
    }
    let object = ctx.kernel().create_object(mechanism)?;
    let (handle_kind, site) = match kind {
        MechanismKind::ArtificialCell => (HandleKind::ArtificialCell, MechanismSite::ArtificialCell { object }),
        MechanismKind::PointProcess | MechanismKind::Distributed => {
            (HandleKind::PointProcess, MechanismSite::PointProcess { object })
        }
    };
    let display = label.clone();
    let state = MechanismState {
        mtype: Arc::clone(&mtype),
        site,
        label,
    };
    let handle = ctx.register(
        handle_kind,
        |id| match &display {
            Some(label) => format!("{mechanism}[{label}]"),
            None => format!("{mechanism}{id}"),
        },
        MemberBody::Mechanism(state),
    )?;
    debug!(context = %ctx.id, handle = %handle.label(), object = %object, "created mechanism object");
    Ok(Mechanism { handle, mtype })
}

/// Builder for point processes.
///
/// Initial parameters are written after attachment and need a location, like
/// any other variable access. When any of them is rejected the half-built
/// instance is destroyed again.
#[derive(Debug)]
pub struct PointProcessBuilder {
    ctx: Arc<ContextShared>,
    mechanism: String,
    label: Option<String>,
    segment: Option<Segment>,
    params: Vec<(String, f64)>,
}

impl PointProcessBuilder {
    pub(crate) fn new(ctx: Arc<ContextShared>, mechanism: &str) -> Self {
        Self {
            ctx,
            mechanism: mechanism.to_string(),
            label: None,
            segment: None,
            params: Vec::new(),
        }
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach to `segment` on creation.
    #[must_use]
    pub fn at(mut self, segment: &Segment) -> Self {
        self.segment = Some(segment.clone());
        self
    }

    /// Initial value of a variable.
    #[must_use]
    pub fn param(mut self, attribute: impl Into<String>, value: f64) -> Self {
        self.params.push((attribute.into(), value));
        self
    }

    /// Create the point process.
    pub fn build(self) -> NrnResult<PointProcess> {
        let mechanism = create_object(&self.ctx, &self.mechanism, MechanismKind::PointProcess, self.label)?;
        let pp = PointProcess(mechanism);
        let configured = (|| -> NrnResult<()> {
            if let Some(segment) = &self.segment {
                pp.attach(segment)?;
            }
            for (attribute, value) in &self.params {
                pp.as_mechanism().set(attribute, *value)?;
            }
            Ok(())
        })();

        if let Err(err) = configured {
            destroy_member(&self.ctx, pp.handle().id())?;
            return Err(err);
        }
        Ok(pp)
    }
}

