//! Recording buffers.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::context::ContextShared;
use crate::error::{LifecycleError, NrnError, NrnResult};
use crate::handle::{Handle, Managed};
use crate::kernel::BufferKey;
use crate::reference::FloatVar;
use crate::registry::{HandleKind, MemberBody};

#[derive(Debug)]
pub(crate) struct VectorState {
    pub(crate) key: BufferKey,
}

/// Kernel-side buffer of values. It can sample a variable at every step or
/// play its contents back into one.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Vector {
    handle: Handle,
}

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.handle.label())
    }
}

impl Managed for Vector {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Vector {
    pub(crate) fn create(ctx: &Arc<ContextShared>, values: &[f64]) -> NrnResult<Self> {
        ctx.ensure_active()?;
        let key = ctx.kernel().create_buffer(values)?;
        let handle = ctx.register(
            HandleKind::Vector,
            |id| format!("Vector{id}"),
            MemberBody::Vector(VectorState { key }),
        )?;
        debug!(context = %ctx.id, vector = %handle.label(), len = values.len(), "created vector");
        Ok(Self { handle })
    }

    fn ctx(&self) -> &Arc<ContextShared> {
        self.handle.shared()
    }

    fn key(&self) -> NrnResult<BufferKey> {
        let registry = self.ctx().registry()?;
        registry
            .vector(self.handle.id())
            .map(|state| state.key)
            .ok_or_else(|| NrnError::use_after_destroy(self.handle.label().to_string()))
    }

    fn check_var(&self, var: &FloatVar) -> NrnResult<()> {
        let owner = var.source().handle();
        if Arc::ptr_eq(self.ctx(), owner.shared()) {
            Ok(())
        } else {
            Err(LifecycleError::ContextMismatch {
                handle: owner.label().to_string(),
            }
            .into())
        }
    }

    /// Sample `var` at initialization and after every step.
    pub fn record(&self, var: &FloatVar) -> NrnResult<()> {
        let key = self.key()?;
        self.ctx().ensure_active()?;
        self.check_var(var)?;
        let pointer = var.reference()?;
        self.ctx().kernel().record(key, &pointer)?;
        debug!(vector = %self.handle.label(), source = %var.source().handle().label(), attribute = var.attribute(), "recording");
        Ok(())
    }

    /// Play the buffer into `var`, one value every `dt` ms.
    pub fn play(&self, var: &FloatVar, dt: f64) -> NrnResult<()> {
        let key = self.key()?;
        self.ctx().ensure_active()?;
        if !(dt.is_finite() && dt > 0.0) {
            return Err(NrnError::out_of_range("dt", dt, "> 0"));
        }
        self.check_var(var)?;
        let pointer = var.reference()?;
        Ok(self.ctx().kernel().play(key, &pointer, dt)?)
    }

    /// Stop playback.
    pub fn play_remove(&self) -> NrnResult<()> {
        let key = self.key()?;
        Ok(self.ctx().kernel().play_remove(key)?)
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> NrnResult<Vec<f64>> {
        let key = self.key()?;
        Ok(self.ctx().kernel().buffer_data(key)?)
    }

    /// Number of values.
    pub fn len(&self) -> NrnResult<usize> {
        Ok(self.to_vec()?.len())
    }

    /// True when empty.
    pub fn is_empty(&self) -> NrnResult<bool> {
        Ok(self.len()? == 0)
    }
}
