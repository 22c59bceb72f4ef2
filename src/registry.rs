//! Per-context member table.
//!
//! Every wrapper is a lightweight `(context, HandleId)` pair; the data it
//! stands for lives here. A handle is live exactly while its id is present in
//! the table, which makes back-references plain id lookups: resolving the id
//! of a destroyed owner yields `None` instead of extending its lifetime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kernel::SectionKey;
use crate::mechanism::{MechanismSite, MechanismState};
use crate::netcon::NetConState;
use crate::section::SectionState;
use crate::segment::SegmentState;
use crate::vector::VectorState;

/// Identifier of a member within its context. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    /// Raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a managed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Compartment.
    Section,
    /// Position on a section.
    Segment,
    /// Distributed mechanism instance on one segment.
    Mechanism,
    /// Point process.
    PointProcess,
    /// Artificial cell.
    ArtificialCell,
    /// Event connection.
    NetCon,
    /// Recording buffer.
    Vector,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Section => "Section",
            Self::Segment => "Segment",
            Self::Mechanism => "Mechanism",
            Self::PointProcess => "PointProcess",
            Self::ArtificialCell => "ArtificialCell",
            Self::NetCon => "NetCon",
            Self::Vector => "Vector",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum MemberBody {
    Section(SectionState),
    Segment(SegmentState),
    Mechanism(MechanismState),
    NetCon(NetConState),
    Vector(VectorState),
}

#[derive(Debug)]
pub(crate) struct Member {
    pub(crate) kind: HandleKind,
    pub(crate) label: Arc<str>,
    pub(crate) body: MemberBody,
}

macro_rules! body_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub(crate) fn $get(&self, id: HandleId) -> Option<&$ty> {
            match self.members.get(&id).map(|m| &m.body) {
                Some(MemberBody::$variant(state)) => Some(state),
                _ => None,
            }
        }

        #[allow(dead_code)]
        pub(crate) fn $get_mut(&mut self, id: HandleId) -> Option<&mut $ty> {
            match self.members.get_mut(&id).map(|m| &mut m.body) {
                Some(MemberBody::$variant(state)) => Some(state),
                _ => None,
            }
        }
    };
}

/// Member table of one context.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    members: BTreeMap<HandleId, Member>,
    section_names: HashMap<String, HandleId>,
    section_keys: HashMap<SectionKey, HandleId>,
}

impl Registry {
    /// Id the next registered member will get.
    pub(crate) const fn next_id(&self) -> HandleId {
        HandleId(self.next_id + 1)
    }

    pub(crate) fn register(&mut self, kind: HandleKind, label: Arc<str>, body: MemberBody) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        if let MemberBody::Section(section) = &body {
            self.section_names.insert(section.name.clone(), id);
            self.section_keys.insert(section.key, id);
        }
        self.members.insert(id, Member { kind, label, body });
        id
    }

    /// Remove a member and detach it from the owner caches that point at it.
    pub(crate) fn unregister(&mut self, id: HandleId) -> Option<Member> {
        let member = self.members.remove(&id)?;
        match &member.body {
            MemberBody::Section(section) => {
                self.section_names.remove(&section.name);
                self.section_keys.remove(&section.key);
            }
            MemberBody::Segment(segment) => {
                if let Some(owner) = self.section_mut(segment.section) {
                    owner.segments.retain(|_, seg| *seg != id);
                }
            }
            MemberBody::Mechanism(MechanismState {
                site: MechanismSite::Distributed { segment, .. },
                mtype,
                ..
            }) => {
                let name = mtype.name().to_string();
                if let Some(owner) = self.segment_mut(*segment) {
                    if owner.mechanisms.get(&name) == Some(&id) {
                        owner.mechanisms.remove(&name);
                    }
                }
            }
            MemberBody::Mechanism(_) | MemberBody::NetCon(_) | MemberBody::Vector(_) => {}
        }
        Some(member)
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.members.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Ids of one kind, in creation order.
    pub(crate) fn ids_of(&self, kind: HandleKind) -> Vec<HandleId> {
        self.members
            .iter()
            .filter(|(_, m)| m.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn count_of(&self, kind: HandleKind) -> usize {
        self.members.values().filter(|m| m.kind == kind).count()
    }

    pub(crate) fn section_by_name(&self, name: &str) -> Option<HandleId> {
        self.section_names.get(name).copied()
    }

    pub(crate) fn section_by_key(&self, key: SectionKey) -> Option<HandleId> {
        self.section_keys.get(&key).copied()
    }

    pub(crate) fn section_keys(&self) -> impl Iterator<Item = (&SectionKey, &HandleId)> {
        self.section_keys.iter()
    }

    body_accessors!(section, section_mut, Section, SectionState);
    body_accessors!(segment, segment_mut, Segment, SegmentState);
    body_accessors!(mechanism, mechanism_mut, Mechanism, MechanismState);
    body_accessors!(netcon, netcon_mut, NetCon, NetConState);
    body_accessors!(vector, vector_mut, Vector, VectorState);
}
