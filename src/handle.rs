//! Managed handles and the destroy protocol.
//!
//! A [`Handle`] ties a wrapper to its owning context and to one entry of the
//! context's member table. Destroying a member:
//! 1. returns immediately when the member is already gone
//! 2. destroys owned members first (segments of a section, mechanisms of a segment)
//! 3. releases the kernel resource; point processes, artificial cells and
//!    connections must observe the kernel live count drop
//! 4. removes the member from the table
//!
//! A failed kernel release leaves the member registered so it can be retried.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::debug;

use crate::context::{Context, ContextShared};
use crate::error::{LifecycleError, NrnError, NrnResult};
use crate::kernel::{BufferKey, ConnectionKey, ObjectKey, SectionKey};
use crate::mechanism::MechanismSite;
use crate::registry::{HandleId, HandleKind, MemberBody};

/// Link between a wrapper and its member-table entry.
#[derive(Clone)]
pub struct Handle {
    ctx: Arc<ContextShared>,
    id: HandleId,
    kind: HandleKind,
    label: Arc<str>,
}

impl Handle {
    pub(crate) fn new(ctx: Arc<ContextShared>, id: HandleId, kind: HandleKind, label: Arc<str>) -> Self {
        Self { ctx, id, kind, label }
    }

    /// Rebuild the handle of a live member.
    pub(crate) fn resolve(ctx: &Arc<ContextShared>, id: HandleId) -> NrnResult<Option<Self>> {
        let registry = ctx.registry()?;
        Ok(registry
            .get(id)
            .map(|member| Self::new(Arc::clone(ctx), id, member.kind, Arc::clone(&member.label))))
    }

    /// Member id within the owning context.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Member kind.
    #[must_use]
    pub const fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Human-readable description used in errors and logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> Context {
        Context::from_shared(Arc::clone(&self.ctx))
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.ctx
    }

    /// True once the member has been destroyed. A poisoned member table counts
    /// as destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.ctx.registry().map_or(true, |registry| !registry.contains(self.id))
    }

    /// Fail with `UseAfterDestroy` when the member is gone.
    pub fn check_destroyed(&self) -> NrnResult<()> {
        if self.is_destroyed() {
            return Err(NrnError::use_after_destroy(self.label.to_string()));
        }
        Ok(())
    }

    /// Fail with `ContextMismatch` when `other` lives in a different context.
    pub(crate) fn check_same_context(&self, other: &Self) -> NrnResult<()> {
        if Arc::ptr_eq(&self.ctx, &other.ctx) {
            Ok(())
        } else {
            Err(LifecycleError::ContextMismatch {
                handle: other.label.to_string(),
            }
            .into())
        }
    }

    /// Run the destroy protocol for this member.
    pub fn destroy(&self) -> NrnResult<()> {
        destroy_member(&self.ctx, self.id)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx) && self.id == other.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ctx.id.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("context", &self.ctx.id)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

/// Common lifecycle contract of every kernel-backed wrapper.
pub trait Managed {
    /// The wrapper's handle.
    fn handle(&self) -> &Handle;

    /// Destroy the member. A second call is a no-op.
    fn destroy(&self) -> NrnResult<()> {
        self.handle().destroy()
    }

    /// True once destroyed.
    fn is_destroyed(&self) -> bool {
        self.handle().is_destroyed()
    }

    /// Fail with `UseAfterDestroy` when destroyed.
    fn check_destroyed(&self) -> NrnResult<()> {
        self.handle().check_destroyed()
    }

    /// Owning context.
    fn context(&self) -> Context {
        self.handle().context()
    }
}

enum Release {
    Section { key: SectionKey, segments: Vec<HandleId> },
    Segment { mechanisms: Vec<HandleId> },
    Nothing,
    Object { key: ObjectKey, mechanism: String },
    Connection(ConnectionKey),
    Buffer(BufferKey),
}

pub(crate) fn destroy_member(ctx: &ContextShared, id: HandleId) -> NrnResult<()> {
    let (kind, label, release) = {
        let registry = ctx.registry()?;
        let Some(member) = registry.get(id) else {
            return Ok(());
        };
        let release = match &member.body {
            MemberBody::Section(section) => Release::Section {
                key: section.key,
                segments: section.segments.values().copied().collect(),
            },
            MemberBody::Segment(segment) => Release::Segment {
                mechanisms: segment.mechanisms.values().copied().collect(),
            },
            MemberBody::Mechanism(mechanism) => match mechanism.site {
                MechanismSite::Distributed { .. } => Release::Nothing,
                MechanismSite::PointProcess { object } | MechanismSite::ArtificialCell { object } => {
                    Release::Object {
                        key: object,
                        mechanism: mechanism.mtype.name().to_string(),
                    }
                }
            },
            MemberBody::NetCon(netcon) => Release::Connection(netcon.key),
            MemberBody::Vector(vector) => Release::Buffer(vector.key),
        };
        (member.kind, Arc::clone(&member.label), release)
    };

    let kernel = ctx.kernel();
    let mut count_check = Ok(());
    match release {
        Release::Section { key, segments } => {
            for segment in segments {
                destroy_member(ctx, segment)?;
            }
            kernel.delete_section(key)?;
        }
        Release::Segment { mechanisms } => {
            for mechanism in mechanisms {
                destroy_member(ctx, mechanism)?;
            }
        }
        Release::Nothing => {}
        Release::Object { key, mechanism } => {
            let before = kernel.object_count(&mechanism)?;
            kernel.destroy_object(key)?;
            let after = kernel.object_count(&mechanism)?;
            if after >= before {
                count_check = Err(NrnError::internal(format!(
                    "live count of {mechanism} did not decrease when destroying {label} ({before} -> {after})"
                )));
            }
        }
        Release::Connection(key) => {
            let before = kernel.connection_count()?;
            kernel.destroy_connection(key)?;
            let after = kernel.connection_count()?;
            if after >= before {
                count_check = Err(NrnError::internal(format!(
                    "connection count did not decrease when destroying {label} ({before} -> {after})"
                )));
            }
        }
        Release::Buffer(key) => kernel.destroy_buffer(key)?,
    }

    // The kernel resource is gone either way; keep the table in step with it.
    ctx.registry()?.unregister(id);
    debug!(context = %ctx.id, handle = %id, kind = %kind, label = %label, "destroyed member");
    count_check
}
