//! Captured variable values that can be turned back into kernel references.

use std::fmt;

use crate::error::NrnResult;
use crate::handle::{Handle, Managed};
use crate::kernel::VarPointer;
use crate::mechanism::Mechanism;
use crate::segment::Segment;

/// Wrapper a [`FloatVar`] was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarSource {
    /// Range variable of a segment (`v`, `diam`, `cm`).
    Segment(Segment),
    /// Mechanism variable.
    Mechanism(Mechanism),
}

impl VarSource {
    /// Handle of the source wrapper.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        match self {
            Self::Segment(segment) => segment.handle(),
            Self::Mechanism(mechanism) => mechanism.handle(),
        }
    }
}

/// A kernel value captured at read time, with provenance.
///
/// The value does not follow later kernel updates; call [`FloatVar::refresh`]
/// for a new reading or [`FloatVar::reference`] to address the live variable
/// (for recording, playback or connection sources).
#[derive(Debug, Clone)]
pub struct FloatVar {
    value: f64,
    attribute: String,
    kernel_name: String,
    source: VarSource,
}

impl FloatVar {
    pub(crate) fn new(value: f64, attribute: &str, kernel_name: &str, source: VarSource) -> Self {
        Self {
            value,
            attribute: attribute.to_string(),
            kernel_name: kernel_name.to_string(),
            source,
        }
    }

    /// Value at capture time.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Attribute name the value was read through.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Kernel-side variable name.
    #[must_use]
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Source wrapper.
    #[must_use]
    pub const fn source(&self) -> &VarSource {
        &self.source
    }

    /// Live kernel pointer to the variable.
    ///
    /// Fails with `UseAfterDestroy` once the source is gone, and with
    /// `AttachmentRequired` for a point process that is no longer attached.
    pub fn reference(&self) -> NrnResult<VarPointer> {
        match &self.source {
            VarSource::Segment(segment) => segment.range_pointer(&self.kernel_name),
            VarSource::Mechanism(mechanism) => mechanism.variable_pointer(&self.attribute, &self.kernel_name),
        }
    }

    /// Read the variable again.
    pub fn refresh(&self) -> NrnResult<Self> {
        let pointer = self.reference()?;
        let value = self.source.handle().shared().kernel().read_pointer(&pointer)?;
        Ok(Self {
            value,
            ..self.clone()
        })
    }
}

impl From<&FloatVar> for f64 {
    fn from(var: &FloatVar) -> Self {
        var.value
    }
}

impl From<FloatVar> for f64 {
    fn from(var: FloatVar) -> Self {
        var.value
    }
}

impl PartialEq<f64> for FloatVar {
    fn eq(&self, other: &f64) -> bool {
        self.value == *other
    }
}

impl PartialOrd<f64> for FloatVar {
    fn partial_cmp(&self, other: &f64) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(other)
    }
}

impl fmt::Display for FloatVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}
