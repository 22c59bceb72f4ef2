//! # nrnscope - Scoped lifecycle management for compartmental simulations
//!
//! nrnscope wraps a compartmental neural simulation kernel and gives every
//! kernel-backed entity a single owner: the [`Context`] it was created in.
//! Entities are reached through lightweight handles that go stale, rather
//! than dangling, once the underlying resource is released.
//!
//! ## Core Concepts
//!
//! - **Simulator**: owns one kernel and at most one active context
//! - **Context**: simulation scope holding parameters and every live member
//! - **Section / Segment**: cable compartments and positions along them
//! - **Mechanism**: distributed mechanisms, point processes and artificial cells
//! - **NetCon**: event connections between sources and targets
//! - **Vector**: recording and playback buffers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nrnscope::{ContextConfig, InitOptions, MemoryKernel, Simulator};
//!
//! let sim = Simulator::new(Arc::new(MemoryKernel::new()));
//! sim.scoped(ContextConfig::default().with_tstop(5.0), |ctx| {
//!     let soma = ctx.create_named_section("soma")?;
//!     soma.insert("hh")?;
//!     let trace = ctx.record(&soma.at(0.5)?.v()?)?;
//!     ctx.run(InitOptions::new())?;
//!     println!("{:?}", trace.to_vec()?);
//!     Ok(())
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod mechanism;
pub mod netcon;
pub mod reference;
pub mod registry;
pub mod schema;
pub mod section;
pub mod segment;
pub mod vector;

pub use context::{
    Context, ContextConfig, ContextGuard, ContextId, InitOptions, Simulator, TeardownReport, DEBUG_ENV_VAR,
};
pub use error::{LifecycleError, NrnError, NrnResult, ValidationError};
pub use handle::{Handle, Managed};
pub use kernel::{Kernel, KernelCensus, KernelError, MechanismKind, MemoryKernel, MemoryMechanism};
pub use mechanism::{ArtificialCell, Mechanism, PointProcess, PointProcessBuilder};
pub use netcon::{NetCon, NetConParams, NetConSource};
pub use reference::{FloatVar, VarSource};
pub use registry::{HandleId, HandleKind};
pub use schema::{demangle, mangle, MechanismCatalog, MechanismType, VariableSpec};
pub use section::{Attachment, Section};
pub use segment::Segment;
pub use vector::Vector;
