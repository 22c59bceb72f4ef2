//! Mechanism schema built from the kernel catalog.
//!
//! The kernel describes every mechanism type at runtime. The catalog is read
//! once per [`crate::Simulator`] and turned into [`MechanismType`] tables that
//! map attribute names to kernel variable names.
//!
//! Attribute names follow two rules:
//! - distributed mechanism variables drop their `_<mechanism>` suffix
//!   (`gkbar_hh` is exposed as `gkbar`)
//! - names that collide with Rust keywords get a trailing `_`
//!   (see [`mangle`] and [`demangle`])

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{NrnResult, ValidationError};
use crate::kernel::{MechanismDescriptor, MechanismKind, VariableGroup};

const RUST_KEYWORDS: &[&str] = &[
    // strict
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum", "extern",
    "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub",
    "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while",
    // reserved
    "abstract", "become", "box", "do", "final", "gen", "macro", "override", "priv", "try",
    "typeof", "unsized", "virtual", "yield",
];

fn is_keyword(name: &str) -> bool {
    RUST_KEYWORDS.contains(&name)
}

/// Map a kernel variable name to its attribute name.
///
/// A name whose stem (trailing underscores removed) is a keyword gets one
/// extra trailing underscore, so `type` becomes `type_` and `type_` becomes
/// `type__`. Every other name is unchanged.
#[must_use]
pub fn mangle(name: &str) -> String {
    if is_keyword(name.trim_end_matches('_')) {
        format!("{name}_")
    } else {
        name.to_string()
    }
}

/// Inverse of [`mangle`].
#[must_use]
pub fn demangle(attribute: &str) -> String {
    match attribute.strip_suffix('_') {
        Some(stripped) if is_keyword(attribute.trim_end_matches('_')) => stripped.to_string(),
        _ => attribute.to_string(),
    }
}

/// One user-visible variable of a mechanism type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSpec {
    /// Attribute name (suffix stripped, mangled).
    pub attribute: String,
    /// Name the kernel knows the variable by.
    pub kernel_name: String,
    /// Variable group.
    pub group: VariableGroup,
    /// Array size.
    pub size: usize,
}

/// Attribute table of one mechanism type.
#[derive(Debug, Clone, Serialize)]
pub struct MechanismType {
    name: String,
    kind: MechanismKind,
    netcon_target: bool,
    has_net_event: bool,
    internal_type: i32,
    globals: Vec<String>,
    variables: Vec<VariableSpec>,
    #[serde(skip)]
    by_attribute: HashMap<String, usize>,
}

impl MechanismType {
    /// Build the attribute table for one catalog entry.
    #[must_use]
    pub fn from_descriptor(descriptor: &MechanismDescriptor) -> Self {
        let suffix = format!("_{}", descriptor.name);
        let mut globals = Vec::new();
        let mut variables = Vec::new();
        for var in &descriptor.variables {
            if var.group == VariableGroup::Global {
                globals.push(var.name.clone());
                continue;
            }
            let stem = match descriptor.kind {
                MechanismKind::Distributed => var.name.strip_suffix(&suffix).unwrap_or(var.name.as_str()),
                MechanismKind::PointProcess | MechanismKind::ArtificialCell => var.name.as_str(),
            };
            variables.push(VariableSpec {
                attribute: mangle(stem),
                kernel_name: var.name.clone(),
                group: var.group,
                size: var.size,
            });
        }
        let by_attribute = variables
            .iter()
            .enumerate()
            .map(|(idx, var)| (var.attribute.clone(), idx))
            .collect();

        Self {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            netcon_target: descriptor.netcon_target,
            has_net_event: descriptor.has_net_event,
            internal_type: descriptor.internal_type,
            globals,
            variables,
            by_attribute,
        }
    }

    /// Mechanism name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mechanism kind.
    #[must_use]
    pub const fn kind(&self) -> MechanismKind {
        self.kind
    }

    /// True for distributed mechanisms.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.kind == MechanismKind::Distributed
    }

    /// True for point processes.
    #[must_use]
    pub fn is_point_process(&self) -> bool {
        self.kind == MechanismKind::PointProcess
    }

    /// True for artificial cells.
    #[must_use]
    pub fn is_artificial_cell(&self) -> bool {
        self.kind == MechanismKind::ArtificialCell
    }

    /// Whether instances can receive connection events.
    #[must_use]
    pub const fn is_netcon_target(&self) -> bool {
        self.netcon_target
    }

    /// Whether instances can emit connection events.
    #[must_use]
    pub const fn has_net_event(&self) -> bool {
        self.has_net_event
    }

    /// Kernel internal type index.
    #[must_use]
    pub const fn internal_type(&self) -> i32 {
        self.internal_type
    }

    /// Kernel names of per-type globals (not exposed as attributes).
    #[must_use]
    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    /// Attribute table in catalog order.
    #[must_use]
    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    /// Look up an attribute.
    #[must_use]
    pub fn variable(&self, attribute: &str) -> Option<&VariableSpec> {
        self.by_attribute.get(attribute).map(|idx| &self.variables[*idx])
    }

    /// Look up an attribute, failing with `UnknownVariable`.
    pub fn resolve(&self, attribute: &str) -> NrnResult<&VariableSpec> {
        self.variable(attribute).ok_or_else(|| {
            ValidationError::UnknownVariable {
                mechanism: self.name.clone(),
                attribute: attribute.to_string(),
            }
            .into()
        })
    }

    /// Point processes and artificial cells that take part in event delivery.
    /// These are the types counted by the preflight census.
    #[must_use]
    pub fn is_event_capable(&self) -> bool {
        !self.is_distributed() && (self.netcon_target || self.has_net_event || self.is_artificial_cell())
    }
}

/// All mechanism types known to a kernel.
#[derive(Debug, Clone, Default)]
pub struct MechanismCatalog {
    types: Vec<Arc<MechanismType>>,
    by_name: HashMap<String, usize>,
}

impl MechanismCatalog {
    /// Build the catalog from raw kernel descriptors.
    #[must_use]
    pub fn from_descriptors(descriptors: &[MechanismDescriptor]) -> Self {
        let types: Vec<Arc<MechanismType>> = descriptors
            .iter()
            .map(|d| Arc::new(MechanismType::from_descriptor(d)))
            .collect();
        let by_name = types
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.name.clone(), idx))
            .collect();
        Self { types, by_name }
    }

    /// Look up a type by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<MechanismType>> {
        self.by_name.get(name).map(|idx| &self.types[*idx])
    }

    /// Look up a type, failing with `UnknownMechanism`.
    pub fn resolve(&self, name: &str) -> NrnResult<Arc<MechanismType>> {
        self.get(name).cloned().ok_or_else(|| {
            ValidationError::UnknownMechanism {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Iterate types in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MechanismType>> {
        self.types.iter()
    }

    /// Type names in catalog order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.types.iter().map(|t| t.name()).collect()
    }

    /// Number of types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when the kernel reported no mechanisms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NrnError;
    use crate::kernel::VariableDescriptor;

    fn var(name: &str, group: VariableGroup) -> VariableDescriptor {
        VariableDescriptor {
            name: name.to_string(),
            group,
            size: 1,
        }
    }

    fn descriptor(name: &str, kind: MechanismKind, vars: Vec<VariableDescriptor>) -> MechanismDescriptor {
        MechanismDescriptor {
            name: name.to_string(),
            kind,
            netcon_target: false,
            has_net_event: false,
            internal_type: 3,
            variables: vars,
        }
    }

    #[test]
    fn mangle_keywords_only() {
        assert_eq!(mangle("type"), "type_");
        assert_eq!(mangle("type_"), "type__");
        assert_eq!(mangle("in"), "in_");
        assert_eq!(mangle("gkbar"), "gkbar");
        assert_eq!(mangle("x_"), "x_");
        assert_eq!(demangle("type_"), "type");
        assert_eq!(demangle("type__"), "type_");
        assert_eq!(demangle("x_"), "x_");
    }

    #[test]
    fn distributed_suffix_is_stripped() {
        let mech = MechanismType::from_descriptor(&descriptor(
            "kd",
            MechanismKind::Distributed,
            vec![
                var("gbar_kd", VariableGroup::Parameter),
                var("in_kd", VariableGroup::Assigned),
                var("q10_kd", VariableGroup::Global),
            ],
        ));
        let names: Vec<_> = mech.variables().iter().map(|v| v.attribute.as_str()).collect();
        assert_eq!(names, vec!["gbar", "in_"]);
        assert_eq!(mech.resolve("in_").unwrap().kernel_name, "in_kd");
        assert_eq!(mech.globals(), ["q10_kd".to_string()]);
        assert!(mech.variable("q10").is_none());
    }

    #[test]
    fn point_process_names_are_kept() {
        let mech = MechanismType::from_descriptor(&descriptor(
            "Syn",
            MechanismKind::PointProcess,
            vec![var("tau_Syn", VariableGroup::Parameter)],
        ));
        assert_eq!(mech.variables()[0].attribute, "tau_Syn");
    }

    #[test]
    fn unknown_attribute_names_type() {
        let mech = MechanismType::from_descriptor(&descriptor("pas", MechanismKind::Distributed, vec![]));
        let Err(NrnError::Validation(ValidationError::UnknownVariable { mechanism, attribute })) =
            mech.resolve("nope")
        else {
            panic!("expected UnknownVariable");
        };
        assert_eq!(mechanism, "pas");
        assert_eq!(attribute, "nope");
    }

    #[test]
    fn catalog_lookup() {
        let catalog = MechanismCatalog::from_descriptors(&[
            descriptor("pas", MechanismKind::Distributed, vec![]),
            descriptor("NetStim", MechanismKind::ArtificialCell, vec![]),
        ]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.names(), vec!["pas", "NetStim"]);
        assert!(catalog.get("NetStim").unwrap().is_event_capable());
        assert!(!catalog.get("pas").unwrap().is_event_capable());
        assert!(catalog.resolve("hh").is_err());
    }
}
