//! Sections (compartments) and their topology.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use crate::context::ContextShared;
use crate::error::{NrnError, NrnResult, ValidationError};
use crate::handle::{destroy_member, Handle, Managed};
use crate::kernel::{SectionKey, SectionProperty};
use crate::mechanism::{Mechanism, PointProcess};
use crate::registry::{HandleId, HandleKind, MemberBody};
use crate::segment::{self, Segment};

static SECTION_NAME_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

fn section_name_regex() -> Option<&'static Regex> {
    SECTION_NAME_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\[[0-9]+\])?$").ok())
        .as_ref()
}

pub(crate) fn validate_section_name(name: &str) -> NrnResult<()> {
    let Some(regex) = section_name_regex() else {
        return Err(NrnError::internal("section name pattern failed to compile"));
    };
    if regex.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            name: name.to_string(),
        }
        .into())
    }
}

/// Normalized position used as the segment cache key. `0` and `-0.0` map to
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PositionKey(u64);

impl PositionKey {
    pub(crate) fn new(x: f64) -> NrnResult<(Self, f64)> {
        if !(0.0..=1.0).contains(&x) {
            return Err(NrnError::out_of_range("x", x, "within [0, 1]"));
        }
        let x = if x == 0.0 { 0.0 } else { x };
        Ok((Self(x.to_bits()), x))
    }
}

#[derive(Debug)]
pub(crate) struct SectionState {
    pub(crate) key: SectionKey,
    pub(crate) name: String,
    pub(crate) segments: BTreeMap<PositionKey, HandleId>,
}

/// How a section is attached to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Parent section.
    pub parent: Section,
    /// Position along the parent.
    pub parent_x: f64,
    /// Attached end of the child (0 or 1).
    pub child_end: f64,
}

/// A named compartment.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Section {
    handle: Handle,
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Section({})", self.handle.label())
    }
}

impl Managed for Section {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Section {
    pub(crate) fn create(ctx: &Arc<ContextShared>, name: Option<&str>) -> NrnResult<Self> {
        ctx.ensure_active()?;
        let name = match name {
            Some(name) => {
                validate_section_name(name)?;
                name.to_string()
            }
            None => ctx.generate_section_name()?,
        };
        if ctx.registry()?.section_by_name(&name).is_some() {
            return Err(ValidationError::DuplicateName { name }.into());
        }

        let key = ctx.kernel().create_section(&name)?;
        let state = SectionState {
            key,
            name: name.clone(),
            segments: BTreeMap::new(),
        };
        let handle = ctx.register(HandleKind::Section, |_| name.clone(), MemberBody::Section(state))?;
        debug!(context = %ctx.id, section = %name, key = %key, "created section");
        Ok(Self { handle })
    }

    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Wrapper of the registered section behind a kernel key.
    pub(crate) fn for_key(ctx: &Arc<ContextShared>, key: SectionKey) -> NrnResult<Self> {
        let id = ctx.registry()?.section_by_key(key);
        let handle = match id {
            Some(id) => Handle::resolve(ctx, id)?,
            None => None,
        };
        handle.map(Self::from_handle).ok_or_else(|| {
            crate::error::LifecycleError::Consistency {
                unknown_to_context: vec![key.to_string()],
                unknown_to_kernel: Vec::new(),
            }
            .into()
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&SectionState) -> T) -> NrnResult<T> {
        let registry = self.handle.shared().registry()?;
        registry
            .section(self.handle.id())
            .map(f)
            .ok_or_else(|| NrnError::use_after_destroy(self.handle.label().to_string()))
    }

    pub(crate) fn key(&self) -> NrnResult<SectionKey> {
        self.with_state(|state| state.key)
    }

    fn ctx(&self) -> &Arc<ContextShared> {
        self.handle.shared()
    }

    /// Section name.
    pub fn name(&self) -> NrnResult<String> {
        self.with_state(|state| state.name.clone())
    }

    /// Length in µm.
    pub fn length(&self) -> NrnResult<f64> {
        let key = self.key()?;
        Ok(self.ctx().kernel().section_property(key, SectionProperty::Length)?)
    }

    /// Set the length (µm, > 0).
    pub fn set_length(&self, length: f64) -> NrnResult<()> {
        let key = self.key()?;
        if !(length.is_finite() && length > 0.0) {
            return Err(NrnError::out_of_range("L", length, "> 0"));
        }
        Ok(self.ctx().kernel().set_section_property(key, SectionProperty::Length, length)?)
    }

    /// Axial resistivity in Ω·cm.
    pub fn ra(&self) -> NrnResult<f64> {
        let key = self.key()?;
        Ok(self.ctx().kernel().section_property(key, SectionProperty::AxialResistivity)?)
    }

    /// Set the axial resistivity (Ω·cm, > 0).
    pub fn set_ra(&self, ra: f64) -> NrnResult<()> {
        let key = self.key()?;
        if !(ra.is_finite() && ra > 0.0) {
            return Err(NrnError::out_of_range("Ra", ra, "> 0"));
        }
        Ok(self
            .ctx()
            .kernel()
            .set_section_property(key, SectionProperty::AxialResistivity, ra)?)
    }

    /// Number of segments.
    pub fn nseg(&self) -> NrnResult<usize> {
        let key = self.key()?;
        Ok(self.ctx().kernel().nseg(key)?)
    }

    /// Change the number of segments (>= 1).
    ///
    /// Every segment obtained from this section so far is destroyed first,
    /// together with its mechanism wrappers.
    pub fn set_nseg(&self, nseg: usize) -> NrnResult<()> {
        let key = self.key()?;
        if nseg == 0 {
            return Err(NrnError::out_of_range("nseg", 0.0, ">= 1"));
        }
        let cached: Vec<HandleId> = self.with_state(|state| state.segments.values().copied().collect())?;
        for segment in cached {
            destroy_member(self.ctx(), segment)?;
        }
        self.ctx().kernel().set_nseg(key, nseg)?;
        Ok(())
    }

    /// Segment at position `x`. Repeated calls with equal positions return the
    /// same segment.
    pub fn at(&self, x: impl Into<f64>) -> NrnResult<Segment> {
        let (pos, x) = PositionKey::new(x.into())?;
        let (key, name, cached) = self.with_state(|state| (state.key, state.name.clone(), state.segments.get(&pos).copied()))?;
        if let Some(id) = cached {
            if let Some(handle) = Handle::resolve(self.ctx(), id)? {
                return Ok(Segment::from_handle(handle));
            }
        }
        Segment::create(self.ctx(), self.handle.id(), key, &name, pos, x)
    }

    /// Segments at their centers `(i + 0.5) / nseg`.
    pub fn segments(&self) -> NrnResult<Vec<Segment>> {
        let nseg = self.nseg()?;
        (0..nseg).map(|i| self.at(segment::center(nseg, i))).collect()
    }

    /// Locations `i / nseg` for `i` in `0..=nseg`, including both ends.
    pub fn nodes(&self) -> NrnResult<Vec<Segment>> {
        let nseg = self.nseg()?;
        #[allow(clippy::cast_precision_loss)]
        (0..=nseg).map(|i| self.at(i as f64 / nseg as f64)).collect()
    }

    /// Attach this section's `child_end` to `parent` at `parent_x`.
    pub fn connect(&self, parent: &Self, parent_x: f64, child_end: f64) -> NrnResult<()> {
        let key = self.key()?;
        let parent_key = parent.key()?;
        if self.handle.check_same_context(&parent.handle).is_err() {
            return Err(invalid_topology(format!("{parent:?} belongs to another context")));
        }
        if !(0.0..=1.0).contains(&parent_x) {
            return Err(invalid_topology(format!("parent_x must be within [0, 1] (got {parent_x})")));
        }
        if child_end != 0.0 && child_end != 1.0 {
            return Err(invalid_topology(format!("child_end must be 0 or 1 (got {child_end})")));
        }
        if self == parent {
            return Err(invalid_topology(format!("{self:?} cannot be its own parent")));
        }
        let kernel = self.ctx().kernel();
        if kernel.parent_link(key)?.is_some() {
            return Err(invalid_topology(format!(
                "{self:?} is already connected; disconnect it first"
            )));
        }
        let mut ancestor = Some(parent_key);
        while let Some(current) = ancestor {
            if current == key {
                return Err(invalid_topology(format!(
                    "connecting {self:?} to {parent:?} would create a loop"
                )));
            }
            ancestor = kernel.parent_link(current)?.map(|link| link.parent);
        }

        kernel.connect(key, parent_key, parent_x, child_end)?;
        debug!(context = %self.ctx().id, child = %self.handle.label(), parent = %parent.handle.label(), parent_x, child_end, "connected sections");
        Ok(())
    }

    /// Detach from the parent.
    pub fn disconnect(&self) -> NrnResult<()> {
        let key = self.key()?;
        let kernel = self.ctx().kernel();
        if kernel.parent_link(key)?.is_none() {
            return Err(invalid_topology(format!("{self:?} has no parent")));
        }
        kernel.disconnect(key)?;
        Ok(())
    }

    /// Parent attachment, if any.
    pub fn attachment(&self) -> NrnResult<Option<Attachment>> {
        let key = self.key()?;
        let Some(link) = self.ctx().kernel().parent_link(key)? else {
            return Ok(None);
        };
        Ok(Some(Attachment {
            parent: Self::for_key(self.ctx(), link.parent)?,
            parent_x: link.parent_x,
            child_end: link.child_end,
        }))
    }

    /// Direct parent.
    pub fn parent(&self) -> NrnResult<Option<Self>> {
        Ok(self.attachment()?.map(|attachment| attachment.parent))
    }

    /// Nearest ancestor that is not reached through a zero-length attachment.
    ///
    /// While the child sits on the parent at the very point where the parent
    /// itself is attached, the walk continues with the grandparent.
    #[allow(clippy::float_cmp)]
    pub fn trueparent(&self) -> NrnResult<Option<Self>> {
        let Some(attachment) = self.attachment()? else {
            return Ok(None);
        };
        let mut parent = attachment.parent;
        let mut x = attachment.parent_x;
        while let Some(up) = parent.attachment()? {
            if x != up.child_end {
                break;
            }
            x = up.parent_x;
            parent = up.parent;
        }
        Ok(Some(parent))
    }

    /// Root of the tree this section belongs to (itself when unconnected).
    pub fn root(&self) -> NrnResult<Self> {
        let mut current = self.clone();
        while let Some(parent) = current.parent()? {
            current = parent;
        }
        Ok(current)
    }

    /// Number of children.
    pub fn nchild(&self) -> NrnResult<usize> {
        let key = self.key()?;
        Ok(self.ctx().kernel().children(key)?.len())
    }

    /// Child by index, in attachment order.
    pub fn child(&self, index: usize) -> NrnResult<Self> {
        let children = self.children()?;
        let len = children.len();
        children.into_iter().nth(index).ok_or_else(|| {
            ValidationError::IndexOutOfBounds {
                what: "children",
                index,
                len,
            }
            .into()
        })
    }

    /// All children, in attachment order.
    pub fn children(&self) -> NrnResult<Vec<Self>> {
        let key = self.key()?;
        self.ctx()
            .kernel()
            .children(key)?
            .into_iter()
            .map(|child| Self::for_key(self.ctx(), child))
            .collect()
    }

    /// Insert a distributed mechanism into every segment of the section.
    pub fn insert(&self, mechanism: &str) -> NrnResult<&Self> {
        let key = self.key()?;
        self.ctx().ensure_active()?;
        let mtype = self.ctx().catalog().resolve(mechanism)?;
        if !mtype.is_distributed() {
            return Err(NrnError::invalid_argument(format!(
                "{mechanism} is not a distributed mechanism; create it as a point process or artificial cell"
            )));
        }
        let kernel = self.ctx().kernel();
        if kernel.inserted_mechanisms(key)?.iter().any(|name| name == mechanism) {
            return Err(NrnError::invalid_argument(format!(
                "{mechanism} is already inserted in {self:?}"
            )));
        }
        kernel.insert_mechanism(key, mechanism)?;
        self.sync_segments()?;
        debug!(context = %self.ctx().id, section = %self.handle.label(), mechanism, "inserted mechanism");
        Ok(self)
    }

    /// Remove a distributed mechanism. Its wrappers on every segment are
    /// destroyed; the segments stay.
    pub fn remove(&self, mechanism: &str) -> NrnResult<&Self> {
        let key = self.key()?;
        self.ctx().ensure_active()?;
        let kernel = self.ctx().kernel();
        if !kernel.inserted_mechanisms(key)?.iter().any(|name| name == mechanism) {
            return Err(NrnError::invalid_argument(format!(
                "{mechanism} is not inserted in {self:?}"
            )));
        }
        kernel.remove_mechanism(key, mechanism)?;
        self.sync_segments()?;
        debug!(context = %self.ctx().id, section = %self.handle.label(), mechanism, "removed mechanism");
        Ok(self)
    }

    fn sync_segments(&self) -> NrnResult<()> {
        let cached: Vec<HandleId> = self.with_state(|state| state.segments.values().copied().collect())?;
        for segment in cached {
            segment::sync_mechanisms(self.ctx(), segment)?;
        }
        Ok(())
    }

    /// True when the distributed mechanism is inserted.
    pub fn has_mechanism(&self, mechanism: &str) -> NrnResult<bool> {
        let key = self.key()?;
        Ok(self
            .ctx()
            .kernel()
            .inserted_mechanisms(key)?
            .iter()
            .any(|name| name == mechanism))
    }

    /// Names of the inserted distributed mechanisms.
    pub fn mechanisms(&self) -> NrnResult<Vec<String>> {
        let key = self.key()?;
        Ok(self.ctx().kernel().inserted_mechanisms(key)?)
    }

    /// Point processes attached anywhere on this section.
    pub fn point_processes(&self) -> NrnResult<Vec<PointProcess>> {
        let key = self.key()?;
        let mut found = Vec::new();
        for pp in Mechanism::point_processes_of(self.ctx())? {
            if matches!(pp.location()?, Some((section, _)) if section == key) {
                found.push(pp);
            }
        }
        Ok(found)
    }
}

fn invalid_topology(reason: String) -> NrnError {
    ValidationError::InvalidTopology { reason }.into()
}
