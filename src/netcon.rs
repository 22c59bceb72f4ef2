//! Event connections (NetCon).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ContextShared;
use crate::error::{NrnError, NrnResult, ValidationError};
use crate::handle::{Handle, Managed};
use crate::kernel::{ConnectionField, ConnectionKey, ConnectionParams, EventSource, ObjectKey};
use crate::mechanism::{ArtificialCell, Mechanism};
use crate::reference::{FloatVar, VarSource};
use crate::registry::{HandleId, HandleKind, MemberBody};
use crate::segment::Segment;

#[derive(Debug)]
pub(crate) enum SourceRef {
    Variable {
        owner: HandleId,
        owner_label: Arc<str>,
        attribute: String,
        kernel_name: String,
        value: f64,
    },
    Cell(HandleId),
}

#[derive(Debug)]
pub(crate) struct NetConState {
    pub(crate) key: ConnectionKey,
    source: SourceRef,
    target: Option<HandleId>,
    weight_len: Option<usize>,
}

/// What a connection watches.
#[derive(Debug, Clone)]
pub enum NetConSource {
    /// Threshold detector on a variable.
    Variable(FloatVar),
    /// Artificial cell emitting events.
    Cell(ArtificialCell),
}

impl From<FloatVar> for NetConSource {
    fn from(var: FloatVar) -> Self {
        Self::Variable(var)
    }
}

impl From<&FloatVar> for NetConSource {
    fn from(var: &FloatVar) -> Self {
        Self::Variable(var.clone())
    }
}

impl From<ArtificialCell> for NetConSource {
    fn from(cell: ArtificialCell) -> Self {
        Self::Cell(cell)
    }
}

impl From<&ArtificialCell> for NetConSource {
    fn from(cell: &ArtificialCell) -> Self {
        Self::Cell(cell.clone())
    }
}

/// Initial connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConParams {
    /// Source threshold (mV for variable sources).
    pub threshold: f64,
    /// Delivery delay in ms (>= 0).
    pub delay: f64,
    /// Initial first weight.
    pub weight: f64,
}

impl Default for NetConParams {
    fn default() -> Self {
        Self {
            threshold: 10.0,
            delay: 1.0,
            weight: 0.0,
        }
    }
}

fn check_delay(delay: f64) -> NrnResult<()> {
    if delay.is_finite() && delay >= 0.0 {
        Ok(())
    } else {
        Err(NrnError::out_of_range("delay", delay, "a finite value >= 0"))
    }
}

fn invalid_target(reason: String) -> NrnError {
    ValidationError::InvalidConnectionTarget { reason }.into()
}

/// Validate a target and return its kernel object and member id.
fn resolve_target(ctx: &Arc<ContextShared>, target: Option<&Mechanism>) -> NrnResult<Option<(ObjectKey, HandleId)>> {
    let Some(target) = target else {
        return Ok(None);
    };
    target.check_destroyed()?;
    if !Arc::ptr_eq(ctx, target.handle().shared()) {
        return Err(invalid_target(format!("{target:?} belongs to another context")));
    }
    if target.mechanism_type().is_distributed() {
        return Err(invalid_target(format!(
            "{target:?} is a distributed mechanism and cannot receive events"
        )));
    }
    if !target.is_netcon_target() {
        return Err(invalid_target(format!("{target:?} cannot receive events")));
    }
    if let Some(pp) = target.as_point_process() {
        if !pp.is_attached()? {
            return Err(invalid_target(format!("{target:?} must be attached to a section first")));
        }
    }
    let object = target
        .object_key()?
        .ok_or_else(|| NrnError::internal(format!("{target:?} has no kernel object")))?;
    Ok(Some((object, target.handle().id())))
}

/// A thresholded event link from a source to an optional target.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NetCon {
    handle: Handle,
}

impl fmt::Debug for NetCon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.handle.label())
    }
}

impl Managed for NetCon {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl NetCon {
    pub(crate) fn create(
        ctx: &Arc<ContextShared>,
        source: NetConSource,
        target: Option<&Mechanism>,
        params: NetConParams,
    ) -> NrnResult<Self> {
        ctx.ensure_active()?;
        check_delay(params.delay)?;

        let (event_source, source_ref) = match &source {
            NetConSource::Variable(var) => {
                let owner = var.source().handle();
                if !Arc::ptr_eq(ctx, owner.shared()) {
                    return Err(crate::error::LifecycleError::ContextMismatch {
                        handle: owner.label().to_string(),
                    }
                    .into());
                }
                let pointer = var.reference()?;
                (
                    EventSource::Variable(pointer),
                    SourceRef::Variable {
                        owner: owner.id(),
                        owner_label: Arc::from(owner.label()),
                        attribute: var.attribute().to_string(),
                        kernel_name: var.kernel_name().to_string(),
                        value: var.value(),
                    },
                )
            }
            NetConSource::Cell(cell) => {
                let object = cell.object()?;
                if !Arc::ptr_eq(ctx, cell.handle().shared()) {
                    return Err(crate::error::LifecycleError::ContextMismatch {
                        handle: cell.handle().label().to_string(),
                    }
                    .into());
                }
                if !cell.has_net_event() {
                    return Err(NrnError::invalid_argument(format!("{cell:?} cannot emit events")));
                }
                (EventSource::Object(object), SourceRef::Cell(cell.handle().id()))
            }
        };
        let target = resolve_target(ctx, target)?;

        let key = ctx.kernel().create_connection(
            &event_source,
            target.map(|(object, _)| object),
            ConnectionParams {
                threshold: params.threshold,
                delay: params.delay,
                weight: params.weight,
            },
        )?;
        let state = NetConState {
            key,
            source: source_ref,
            target: target.map(|(_, id)| id),
            weight_len: None,
        };
        let handle = ctx.register(HandleKind::NetCon, |id| format!("NetCon{id}"), MemberBody::NetCon(state))?;
        debug!(context = %ctx.id, netcon = %handle.label(), key = %key, "created connection");
        Ok(Self { handle })
    }

    fn ctx(&self) -> &Arc<ContextShared> {
        self.handle.shared()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetConState) -> T) -> NrnResult<T> {
        let mut registry = self.ctx().registry()?;
        registry
            .netcon_mut(self.handle.id())
            .map(f)
            .ok_or_else(|| NrnError::use_after_destroy(self.handle.label().to_string()))
    }

    fn key(&self) -> NrnResult<ConnectionKey> {
        self.with_state(|state| state.key)
    }

    /// Source the connection watches.
    pub fn source(&self) -> NrnResult<NetConSource> {
        enum Owner {
            Variable(HandleId, Arc<str>, String, String, f64),
            Cell(HandleId),
        }
        let owner = self.with_state(|state| match &state.source {
            SourceRef::Variable {
                owner,
                owner_label,
                attribute,
                kernel_name,
                value,
            } => Owner::Variable(*owner, Arc::clone(owner_label), attribute.clone(), kernel_name.clone(), *value),
            SourceRef::Cell(id) => Owner::Cell(*id),
        })?;

        match owner {
            Owner::Variable(id, label, attribute, kernel_name, value) => {
                let handle = Handle::resolve(self.ctx(), id)?.ok_or_else(|| NrnError::use_after_destroy(label.to_string()))?;
                let source = if handle.kind() == HandleKind::Segment {
                    VarSource::Segment(Segment::from_handle(handle))
                } else {
                    let mechanism = Mechanism::resolve(self.ctx(), id)?
                        .ok_or_else(|| NrnError::use_after_destroy(label.to_string()))?;
                    VarSource::Mechanism(mechanism)
                };
                Ok(NetConSource::Variable(FloatVar::new(value, &attribute, &kernel_name, source)))
            }
            Owner::Cell(id) => Mechanism::resolve(self.ctx(), id)?
                .and_then(|mechanism| mechanism.as_artificial_cell())
                .map(NetConSource::Cell)
                .ok_or_else(|| NrnError::use_after_destroy(format!("source of {}", self.handle.label()))),
        }
    }

    /// Current target, if any.
    pub fn target(&self) -> NrnResult<Option<Mechanism>> {
        match self.with_state(|state| state.target)? {
            Some(id) => Mechanism::resolve(self.ctx(), id),
            None => Ok(None),
        }
    }

    /// Replace the target. The cached weight count is recomputed on next use.
    pub fn set_target(&self, target: Option<&Mechanism>) -> NrnResult<()> {
        let key = self.key()?;
        let target = resolve_target(self.ctx(), target)?;
        self.ctx()
            .kernel()
            .set_connection_target(key, target.map(|(object, _)| object))?;
        self.with_state(|state| {
            state.target = target.map(|(_, id)| id);
            state.weight_len = None;
        })
    }

    /// Length of the weight vector.
    pub fn weight_count(&self) -> NrnResult<usize> {
        let (key, cached) = self.with_state(|state| (state.key, state.weight_len))?;
        if let Some(len) = cached {
            return Ok(len);
        }
        let len = self.ctx().kernel().weight_count(key)?;
        self.with_state(|state| state.weight_len = Some(len))?;
        Ok(len)
    }

    fn check_weight_index(&self, index: usize) -> NrnResult<()> {
        let len = self.weight_count()?;
        if index < len {
            Ok(())
        } else {
            Err(ValidationError::IndexOutOfBounds {
                what: "weights",
                index,
                len,
            }
            .into())
        }
    }

    /// One weight.
    pub fn weight(&self, index: usize) -> NrnResult<f64> {
        self.check_weight_index(index)?;
        let key = self.key()?;
        Ok(self.ctx().kernel().weight(key, index)?)
    }

    /// Set one weight.
    pub fn set_weight(&self, index: usize, value: f64) -> NrnResult<()> {
        self.check_weight_index(index)?;
        let key = self.key()?;
        Ok(self.ctx().kernel().set_weight(key, index, value)?)
    }

    /// All weights.
    pub fn weights(&self) -> NrnResult<Vec<f64>> {
        let len = self.weight_count()?;
        let key = self.key()?;
        let kernel = self.ctx().kernel();
        (0..len).map(|i| Ok(kernel.weight(key, i)?)).collect()
    }

    /// Replace all weights; the slice length must match [`NetCon::weight_count`].
    pub fn set_weights(&self, values: &[f64]) -> NrnResult<()> {
        let len = self.weight_count()?;
        if values.len() != len {
            return Err(NrnError::invalid_argument(format!(
                "{} expects {len} weight(s), got {}",
                self.handle.label(),
                values.len()
            )));
        }
        let key = self.key()?;
        let kernel = self.ctx().kernel();
        for (i, value) in values.iter().enumerate() {
            kernel.set_weight(key, i, *value)?;
        }
        Ok(())
    }

    /// Set every weight to `value`.
    pub fn fill_weights(&self, value: f64) -> NrnResult<()> {
        let len = self.weight_count()?;
        self.set_weights(&vec![value; len])
    }

    /// Source threshold.
    pub fn threshold(&self) -> NrnResult<f64> {
        let key = self.key()?;
        Ok(self.ctx().kernel().connection_field(key, ConnectionField::Threshold)?)
    }

    /// Set the source threshold.
    pub fn set_threshold(&self, threshold: f64) -> NrnResult<()> {
        let key = self.key()?;
        Ok(self
            .ctx()
            .kernel()
            .set_connection_field(key, ConnectionField::Threshold, threshold)?)
    }

    /// Delivery delay (ms).
    pub fn delay(&self) -> NrnResult<f64> {
        let key = self.key()?;
        Ok(self.ctx().kernel().connection_field(key, ConnectionField::Delay)?)
    }

    /// Set the delivery delay (ms, >= 0).
    pub fn set_delay(&self, delay: f64) -> NrnResult<()> {
        let key = self.key()?;
        check_delay(delay)?;
        Ok(self.ctx().kernel().set_connection_field(key, ConnectionField::Delay, delay)?)
    }

    /// Whether events are delivered.
    pub fn active(&self) -> NrnResult<bool> {
        let key = self.key()?;
        Ok(self.ctx().kernel().connection_active(key)?)
    }

    /// Enable or disable event delivery.
    pub fn set_active(&self, active: bool) -> NrnResult<()> {
        let key = self.key()?;
        Ok(self.ctx().kernel().set_connection_active(key, active)?)
    }

    /// True when both source and target are live in the kernel.
    pub fn valid(&self) -> NrnResult<bool> {
        let key = self.key()?;
        Ok(self.ctx().kernel().connection_valid(key)?)
    }

    /// Deliver an event to the target at time `time` (ms), optionally with a
    /// flag value.
    pub fn event(&self, time: f64, flag: Option<f64>) -> NrnResult<()> {
        let key = self.key()?;
        if !time.is_finite() {
            return Err(NrnError::out_of_range("time", time, "finite"));
        }
        Ok(self.ctx().kernel().deliver_event(key, time, flag)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params() {
        let params = NetConParams::default();
        assert_eq!(params.threshold, 10.0);
        assert_eq!(params.delay, 1.0);
        assert_eq!(params.weight, 0.0);
    }

    #[test]
    fn delay_must_be_non_negative() {
        check_delay(0.0).unwrap();
        check_delay(2.5).unwrap();
        let Err(NrnError::Validation(ValidationError::OutOfRange { field, .. })) = check_delay(-0.5) else {
            panic!("expected OutOfRange");
        };
        assert_eq!(field, "delay");
        assert!(check_delay(f64::INFINITY).is_err());
    }
}
