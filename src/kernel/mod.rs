//! Abstract simulation-kernel interface.
//!
//! Every interaction with the external compartmental simulation kernel goes
//! through the [`Kernel`] trait. Wrappers in this crate never hand kernel keys
//! to callers; the trait exists so that:
//! - the in-memory [`MemoryKernel`] can back tests and embedded use
//! - bindings to a real simulator can be plugged in without touching the
//!   lifecycle layer

mod memory;

pub use memory::{MemoryKernel, MemoryMechanism};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! kernel_key {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(key: $name) -> Self {
                key.0
            }
        }
    };
}

kernel_key!(
    /// Opaque kernel identifier of a section.
    SectionKey,
    "section"
);
kernel_key!(
    /// Opaque kernel identifier of a point process or artificial cell instance.
    ObjectKey,
    "object"
);
kernel_key!(
    /// Opaque kernel identifier of an event connection.
    ConnectionKey,
    "netcon"
);
kernel_key!(
    /// Opaque kernel identifier of a recording buffer.
    BufferKey,
    "buffer"
);

/// Errors reported by a kernel backend.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The referenced kernel entity does not exist.
    #[error("Kernel {kind} {key} does not exist")]
    NotFound {
        /// Entity kind ("section", "object", ...).
        kind: &'static str,
        /// Raw key value.
        key: u64,
    },

    /// The mechanism name is not part of the kernel catalog.
    #[error("Unknown mechanism: {name}")]
    UnknownMechanism {
        /// Mechanism name.
        name: String,
    },

    /// The variable does not exist at the addressed location.
    #[error("Unknown variable: {name}")]
    UnknownVariable {
        /// Kernel-side variable name.
        name: String,
    },

    /// The kernel rejected an argument.
    #[error("Invalid kernel argument: {0}")]
    InvalidArgument(String),

    /// Backend failure.
    #[error("Kernel backend error: {0}")]
    Backend(String),
}

/// Kind of mechanism as reported by the kernel catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    /// Inserted into whole sections; one instance per segment.
    Distributed,
    /// Created independently and attached to one location.
    PointProcess,
    /// Event-only source/sink with no membrane location.
    ArtificialCell,
}

/// Variable group within a mechanism description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableGroup {
    /// Global (per-type) variable.
    Global,
    /// User-settable parameter.
    Parameter,
    /// Computed (assigned) variable.
    Assigned,
    /// State variable.
    State,
}

/// A single variable entry in the kernel catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    /// Kernel-side name (distributed mechanisms carry a `_<mech>` suffix).
    pub name: String,
    /// Group the variable belongs to.
    pub group: VariableGroup,
    /// Array size (1 for scalars).
    pub size: usize,
}

/// Raw catalog entry for one mechanism type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanismDescriptor {
    /// Mechanism name.
    pub name: String,
    /// Mechanism kind.
    pub kind: MechanismKind,
    /// Whether instances can receive connection events.
    pub netcon_target: bool,
    /// Whether instances can emit connection events.
    pub has_net_event: bool,
    /// Kernel internal type index.
    pub internal_type: i32,
    /// Variables in catalog order.
    pub variables: Vec<VariableDescriptor>,
}

/// Section-level scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionProperty {
    /// Length in µm.
    Length,
    /// Axial resistivity in Ω·cm.
    AxialResistivity,
}

/// Connection scalar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionField {
    /// Source threshold.
    Threshold,
    /// Delivery delay in ms.
    Delay,
}

/// Global simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Global {
    /// Integration timestep (ms).
    Dt,
    /// Temperature (°C).
    Celsius,
    /// Current simulation time (ms).
    Time,
}

/// A live section as enumerated by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Kernel key.
    pub key: SectionKey,
    /// Kernel name.
    pub name: String,
}

/// How a section hangs off its parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParentLink {
    /// Parent section.
    pub parent: SectionKey,
    /// Position along the parent.
    pub parent_x: f64,
    /// End of the child that is attached (0 or 1).
    pub child_end: f64,
}

/// Pointer to a kernel variable, used to record, play back or monitor it.
#[derive(Debug, Clone, PartialEq)]
pub enum VarPointer {
    /// Range variable at a section location.
    Range {
        /// Section holding the variable.
        section: SectionKey,
        /// Location along the section.
        x: f64,
        /// Kernel-side variable name.
        name: String,
    },
    /// Variable of a point process or artificial cell.
    Object {
        /// Owning object.
        object: ObjectKey,
        /// Kernel-side variable name.
        name: String,
    },
}

/// Event source for a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSource {
    /// Threshold detector on a variable.
    Variable(VarPointer),
    /// Object that emits events on its own (artificial cells).
    Object(ObjectKey),
}

/// Initial parameters of a connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionParams {
    /// Source threshold.
    pub threshold: f64,
    /// Delivery delay in ms.
    pub delay: f64,
    /// Initial value of the first weight.
    pub weight: f64,
}

/// Counts of live kernel entities that would leak into a new context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelCensus {
    /// Live sections.
    pub sections: usize,
    /// Live connections.
    pub connections: usize,
    /// Live point processes and artificial cells that can send or receive events.
    pub event_objects: usize,
}

impl KernelCensus {
    /// Returns true when nothing is live.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.sections == 0 && self.connections == 0 && self.event_objects == 0
    }
}

impl fmt::Display for KernelCensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} section(s), {} connection(s), {} event-capable object(s)",
            self.sections, self.connections, self.event_objects
        )
    }
}

/// Contract a simulation kernel backend must implement.
///
/// The lifecycle layer is single-threaded; `Send + Sync` is required so a
/// kernel can be shared behind an `Arc` like any other backend.
pub trait Kernel: Send + Sync {
    /// Enumerate every mechanism type known to the kernel.
    ///
    /// Callers query this once and cache it: some kernels report different
    /// metadata after simulation objects have been created.
    fn mechanism_catalog(&self) -> Result<Vec<MechanismDescriptor>, KernelError>;

    /// Create a section with a unique name.
    fn create_section(&self, name: &str) -> Result<SectionKey, KernelError>;

    /// Delete a section. Children are disconnected and point processes located
    /// on it are detached.
    fn delete_section(&self, section: SectionKey) -> Result<(), KernelError>;

    /// Enumerate all live sections.
    fn live_sections(&self) -> Result<Vec<SectionInfo>, KernelError>;

    /// Read a section-level field.
    fn section_property(&self, section: SectionKey, property: SectionProperty) -> Result<f64, KernelError>;

    /// Write a section-level field.
    fn set_section_property(
        &self,
        section: SectionKey,
        property: SectionProperty,
        value: f64,
    ) -> Result<(), KernelError>;

    /// Number of segments.
    fn nseg(&self, section: SectionKey) -> Result<usize, KernelError>;

    /// Change the number of segments.
    fn set_nseg(&self, section: SectionKey, nseg: usize) -> Result<(), KernelError>;

    /// Attach `child` to `parent`.
    fn connect(
        &self,
        child: SectionKey,
        parent: SectionKey,
        parent_x: f64,
        child_end: f64,
    ) -> Result<(), KernelError>;

    /// Detach `child` from its parent.
    fn disconnect(&self, child: SectionKey) -> Result<(), KernelError>;

    /// Parent attachment of a section, if any.
    fn parent_link(&self, section: SectionKey) -> Result<Option<ParentLink>, KernelError>;

    /// Children in attachment order.
    fn children(&self, section: SectionKey) -> Result<Vec<SectionKey>, KernelError>;

    /// Insert a distributed mechanism into a whole section.
    fn insert_mechanism(&self, section: SectionKey, mechanism: &str) -> Result<(), KernelError>;

    /// Remove a distributed mechanism from a section.
    fn remove_mechanism(&self, section: SectionKey, mechanism: &str) -> Result<(), KernelError>;

    /// Names of the distributed mechanisms inserted in a section.
    fn inserted_mechanisms(&self, section: SectionKey) -> Result<Vec<String>, KernelError>;

    /// Read a range variable at a location.
    fn range_value(&self, section: SectionKey, x: f64, name: &str) -> Result<f64, KernelError>;

    /// Write a range variable at a location.
    fn set_range_value(&self, section: SectionKey, x: f64, name: &str, value: f64) -> Result<(), KernelError>;

    /// Create a point process or artificial cell instance.
    fn create_object(&self, mechanism: &str) -> Result<ObjectKey, KernelError>;

    /// Destroy a point process or artificial cell instance.
    fn destroy_object(&self, object: ObjectKey) -> Result<(), KernelError>;

    /// Number of live instances of a mechanism type.
    fn object_count(&self, mechanism: &str) -> Result<usize, KernelError>;

    /// Read an instance variable.
    fn object_value(&self, object: ObjectKey, name: &str) -> Result<f64, KernelError>;

    /// Write an instance variable.
    fn set_object_value(&self, object: ObjectKey, name: &str, value: f64) -> Result<(), KernelError>;

    /// Attach a point process at a location, replacing any previous attachment.
    fn attach_object(&self, object: ObjectKey, section: SectionKey, x: f64) -> Result<(), KernelError>;

    /// Current attachment (section and snapped position) of a point process.
    fn object_location(&self, object: ObjectKey) -> Result<Option<(SectionKey, f64)>, KernelError>;

    /// Create an event connection.
    fn create_connection(
        &self,
        source: &EventSource,
        target: Option<ObjectKey>,
        params: ConnectionParams,
    ) -> Result<ConnectionKey, KernelError>;

    /// Destroy an event connection.
    fn destroy_connection(&self, connection: ConnectionKey) -> Result<(), KernelError>;

    /// Number of live connections.
    fn connection_count(&self) -> Result<usize, KernelError>;

    /// Replace the target of a connection.
    fn set_connection_target(&self, connection: ConnectionKey, target: Option<ObjectKey>) -> Result<(), KernelError>;

    /// Read a connection scalar.
    fn connection_field(&self, connection: ConnectionKey, field: ConnectionField) -> Result<f64, KernelError>;

    /// Write a connection scalar.
    fn set_connection_field(
        &self,
        connection: ConnectionKey,
        field: ConnectionField,
        value: f64,
    ) -> Result<(), KernelError>;

    /// Length of the weight vector (depends on the target type).
    fn weight_count(&self, connection: ConnectionKey) -> Result<usize, KernelError>;

    /// Read one weight.
    fn weight(&self, connection: ConnectionKey, index: usize) -> Result<f64, KernelError>;

    /// Write one weight.
    fn set_weight(&self, connection: ConnectionKey, index: usize, value: f64) -> Result<(), KernelError>;

    /// Whether the connection delivers events.
    fn connection_active(&self, connection: ConnectionKey) -> Result<bool, KernelError>;

    /// Enable or disable event delivery.
    fn set_connection_active(&self, connection: ConnectionKey, active: bool) -> Result<(), KernelError>;

    /// Whether both ends of the connection are live.
    fn connection_valid(&self, connection: ConnectionKey) -> Result<bool, KernelError>;

    /// Queue an event for delivery to the connection's target.
    fn deliver_event(&self, connection: ConnectionKey, time: f64, flag: Option<f64>) -> Result<(), KernelError>;

    /// Create a buffer seeded with `values`.
    fn create_buffer(&self, values: &[f64]) -> Result<BufferKey, KernelError>;

    /// Destroy a buffer.
    fn destroy_buffer(&self, buffer: BufferKey) -> Result<(), KernelError>;

    /// Copy of the buffer contents.
    fn buffer_data(&self, buffer: BufferKey) -> Result<Vec<f64>, KernelError>;

    /// Sample `pointer` into the buffer on initialization and after every step.
    fn record(&self, buffer: BufferKey, pointer: &VarPointer) -> Result<(), KernelError>;

    /// Play buffer values into `pointer`, one value per `dt`.
    fn play(&self, buffer: BufferKey, pointer: &VarPointer, dt: f64) -> Result<(), KernelError>;

    /// Stop playback from the buffer.
    fn play_remove(&self, buffer: BufferKey) -> Result<(), KernelError>;

    /// Read a global parameter.
    fn global(&self, global: Global) -> Result<f64, KernelError>;

    /// Write a global parameter.
    fn set_global(&self, global: Global, value: f64) -> Result<(), KernelError>;

    /// Initialize simulation state (time to zero, states to resting values).
    fn finitialize(&self) -> Result<(), KernelError>;

    /// Advance by one timestep.
    fn fadvance(&self) -> Result<(), KernelError>;

    /// Read the current value behind a pointer.
    fn read_pointer(&self, pointer: &VarPointer) -> Result<f64, KernelError>;
}
