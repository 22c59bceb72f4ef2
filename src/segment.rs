//! Segments: fixed positions on a section and the mechanisms living there.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::context::ContextShared;
use crate::error::{NrnError, NrnResult, ValidationError};
use crate::handle::{destroy_member, Handle, Managed};
use crate::kernel::{SectionKey, SectionProperty, VarPointer};
use crate::mechanism::{Mechanism, MechanismSite, MechanismState, PointProcess};
use crate::reference::{FloatVar, VarSource};
use crate::registry::{HandleId, HandleKind, MemberBody};
use crate::section::{PositionKey, Section};

/// Center of segment `index` on a section with `nseg` segments.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn center(nseg: usize, index: usize) -> f64 {
    (index as f64 + 0.5) / nseg as f64
}

/// Index of the segment containing `x`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub(crate) fn index_of(nseg: usize, x: f64) -> usize {
    ((x * nseg as f64).floor() as usize).min(nseg.saturating_sub(1))
}

#[derive(Debug)]
pub(crate) struct SegmentState {
    pub(crate) section: HandleId,
    pub(crate) section_key: SectionKey,
    pub(crate) x: f64,
    pub(crate) mechanisms: BTreeMap<String, HandleId>,
}

/// Bring a segment's mechanism map in line with the mechanisms inserted in
/// its section.
pub(crate) fn sync_mechanisms(ctx: &Arc<ContextShared>, segment: HandleId) -> NrnResult<()> {
    let (key, x, label, present) = {
        let registry = ctx.registry()?;
        let Some(member) = registry.get(segment) else {
            return Ok(());
        };
        let Some(state) = registry.segment(segment) else {
            return Ok(());
        };
        (state.section_key, state.x, Arc::clone(&member.label), state.mechanisms.clone())
    };
    let inserted = ctx.kernel().inserted_mechanisms(key)?;

    for (name, id) in &present {
        if !inserted.contains(name) {
            destroy_member(ctx, *id)?;
        }
    }
    for name in inserted.iter().filter(|name| !present.contains_key(*name)) {
        let mtype = ctx.catalog().resolve(name)?;
        let state = MechanismState {
            mtype,
            site: MechanismSite::Distributed { segment, section: key, x },
            label: None,
        };
        let handle = ctx.register(HandleKind::Mechanism, |_| format!("{name}@{label}"), MemberBody::Mechanism(state))?;
        if let Some(owner) = ctx.registry()?.segment_mut(segment) {
            owner.mechanisms.insert(name.clone(), handle.id());
        }
    }
    Ok(())
}

/// A fixed position on a section.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    handle: Handle,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({})", self.handle.label())
    }
}

impl Managed for Segment {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Segment {
    pub(crate) fn create(
        ctx: &Arc<ContextShared>,
        section: HandleId,
        section_key: SectionKey,
        section_name: &str,
        pos: PositionKey,
        x: f64,
    ) -> NrnResult<Self> {
        let state = SegmentState {
            section,
            section_key,
            x,
            mechanisms: BTreeMap::new(),
        };
        let handle = ctx.register(
            HandleKind::Segment,
            |_| format!("{section_name}({x})"),
            MemberBody::Segment(state),
        )?;
        if let Some(owner) = ctx.registry()?.section_mut(section) {
            owner.segments.insert(pos, handle.id());
        }
        sync_mechanisms(ctx, handle.id())?;
        debug!(context = %ctx.id, segment = %handle.label(), "materialized segment");
        Ok(Self { handle })
    }

    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    fn ctx(&self) -> &Arc<ContextShared> {
        self.handle.shared()
    }

    fn with_state<T>(&self, f: impl FnOnce(&SegmentState) -> T) -> NrnResult<T> {
        let registry = self.ctx().registry()?;
        registry
            .segment(self.handle.id())
            .map(f)
            .ok_or_else(|| NrnError::use_after_destroy(self.handle.label().to_string()))
    }

    pub(crate) fn location(&self) -> NrnResult<(SectionKey, f64)> {
        self.with_state(|state| (state.section_key, state.x))
    }

    /// Position along the section.
    pub fn x(&self) -> NrnResult<f64> {
        self.with_state(|state| state.x)
    }

    /// Display name, `section(x)`.
    pub fn name(&self) -> NrnResult<String> {
        self.check_destroyed()?;
        Ok(self.handle.label().to_string())
    }

    /// Owning section.
    pub fn section(&self) -> NrnResult<Section> {
        let owner = self.with_state(|state| state.section)?;
        Handle::resolve(self.ctx(), owner)?
            .map(Section::from_handle)
            .ok_or_else(|| NrnError::use_after_destroy(format!("section of {}", self.handle.label())))
    }

    pub(crate) fn range_pointer(&self, kernel_name: &str) -> NrnResult<VarPointer> {
        let (section, x) = self.location()?;
        Ok(VarPointer::Range {
            section,
            x,
            name: kernel_name.to_string(),
        })
    }

    fn range(&self, name: &str) -> NrnResult<FloatVar> {
        let pointer = self.range_pointer(name)?;
        let value = self.ctx().kernel().read_pointer(&pointer)?;
        Ok(FloatVar::new(value, name, name, VarSource::Segment(self.clone())))
    }

    fn set_range(&self, name: &str, value: f64) -> NrnResult<()> {
        let (section, x) = self.location()?;
        Ok(self.ctx().kernel().set_range_value(section, x, name, value)?)
    }

    /// Membrane potential (mV).
    pub fn v(&self) -> NrnResult<FloatVar> {
        self.range("v")
    }

    /// Set the membrane potential.
    pub fn set_v(&self, value: f64) -> NrnResult<()> {
        self.set_range("v", value)
    }

    /// Diameter (µm).
    pub fn diam(&self) -> NrnResult<FloatVar> {
        self.range("diam")
    }

    /// Set the diameter (µm, > 0).
    pub fn set_diam(&self, value: f64) -> NrnResult<()> {
        if !(value.is_finite() && value > 0.0) {
            return Err(NrnError::out_of_range("diam", value, "> 0"));
        }
        self.set_range("diam", value)
    }

    /// Specific membrane capacitance (µF/cm²).
    pub fn cm(&self) -> NrnResult<FloatVar> {
        self.range("cm")
    }

    /// Set the specific membrane capacitance.
    pub fn set_cm(&self, value: f64) -> NrnResult<()> {
        if !(value.is_finite() && value >= 0.0) {
            return Err(NrnError::out_of_range("cm", value, ">= 0"));
        }
        self.set_range("cm", value)
    }

    fn geometry(&self) -> NrnResult<(f64, f64, f64, usize)> {
        let (section, _) = self.location()?;
        let kernel = self.ctx().kernel();
        let diam = self.diam()?.value();
        let length = kernel.section_property(section, SectionProperty::Length)?;
        let ra = kernel.section_property(section, SectionProperty::AxialResistivity)?;
        let nseg = kernel.nseg(section)?;
        Ok((diam, length, ra, nseg))
    }

    /// Membrane area of the segment (µm²).
    #[allow(clippy::cast_precision_loss)]
    pub fn area(&self) -> NrnResult<f64> {
        let (diam, length, _, nseg) = self.geometry()?;
        Ok(PI * diam * length / nseg as f64)
    }

    /// Axial resistance from the segment center to its parent-side end (MΩ).
    #[allow(clippy::cast_precision_loss)]
    pub fn ri(&self) -> NrnResult<f64> {
        let (diam, length, ra, nseg) = self.geometry()?;
        let radius = diam / 2.0;
        Ok(0.01 * ra * (length / (2.0 * nseg as f64)) / (PI * radius * radius))
    }

    /// Distributed mechanism instance on this segment.
    pub fn mechanism(&self, name: &str) -> NrnResult<Mechanism> {
        sync_mechanisms(self.ctx(), self.handle.id())?;
        let id = self.with_state(|state| state.mechanisms.get(name).copied())?;
        match id {
            Some(id) => Mechanism::resolve(self.ctx(), id)?
                .ok_or_else(|| NrnError::internal(format!("mechanism {name} vanished from {}", self.handle.label()))),
            None if self.ctx().catalog().get(name).is_none() => Err(ValidationError::UnknownMechanism {
                name: name.to_string(),
            }
            .into()),
            None => Err(NrnError::invalid_argument(format!(
                "{name} is not inserted in {}",
                self.handle.label()
            ))),
        }
    }

    /// All distributed mechanism instances on this segment.
    pub fn mechanisms(&self) -> NrnResult<Vec<Mechanism>> {
        sync_mechanisms(self.ctx(), self.handle.id())?;
        let ids: Vec<HandleId> = self.with_state(|state| state.mechanisms.values().copied().collect())?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mechanism) = Mechanism::resolve(self.ctx(), id)? {
                found.push(mechanism);
            }
        }
        Ok(found)
    }

    /// Names of the distributed mechanisms on this segment.
    pub fn mechanism_names(&self) -> NrnResult<Vec<String>> {
        sync_mechanisms(self.ctx(), self.handle.id())?;
        self.with_state(|state| state.mechanisms.keys().cloned().collect())
    }

    /// Point processes attached within this segment.
    pub fn point_processes(&self) -> NrnResult<Vec<PointProcess>> {
        let (section, x) = self.location()?;
        let nseg = self.ctx().kernel().nseg(section)?;
        let index = index_of(nseg, x);
        let mut found = Vec::new();
        for pp in Mechanism::point_processes_of(self.ctx())? {
            if let Some((at_section, at_x)) = pp.location()? {
                if at_section == section && index_of(nseg, at_x) == index {
                    found.push(pp);
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centers_and_indexes() {
        assert_eq!(center(1, 0), 0.5);
        assert_eq!(center(4, 3), 0.875);
        assert_eq!(index_of(4, 0.0), 0);
        assert_eq!(index_of(4, 0.25), 1);
        assert_eq!(index_of(4, 1.0), 3);
        for nseg in 1..20 {
            for i in 0..nseg {
                assert_eq!(index_of(nseg, center(nseg, i)), i);
            }
        }
    }
}
