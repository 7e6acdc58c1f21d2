use serde::{Deserialize, Serialize};

use crate::model::{AttrMap, EntityKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    /// Only emitted when unchanged records are logged.
    NoChange,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SyncAction::Create => write!(f, "create"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
            SyncAction::NoChange => write!(f, "no-change"),
        }
    }
}

/// One step of the reconciliation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub action: SyncAction,
    pub entity_type: String,
    pub unique_id: String,
    pub identifiers: AttrMap,
    /// Full attribute set on create, changed attributes on update.
    pub attributes: AttrMap,
    /// Target-side values of the changed attributes.
    #[serde(default)]
    pub before: AttrMap,
    /// Structural parent in the source graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityKey>,
}

impl Instruction {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.unique_id.clone())
    }
}

/// Ordered instruction stream: creates and updates parents first, then
/// deletes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    instructions: Vec<Instruction>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// True when anything besides no-op entries would be applied.
    pub fn has_changes(&self) -> bool {
        self.instructions
            .iter()
            .any(|i| i.action != SyncAction::NoChange)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }
}

impl IntoIterator for Diff {
    type Item = Instruction;
    type IntoIter = std::vec::IntoIter<Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}
