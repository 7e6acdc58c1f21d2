use log::debug;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ConfigurationError, SchemaError};
use crate::model::{Entity, GlobalFlags, ModelFlags, SchemaRegistry};

/// Run-wide and per-type flags, validated before anything is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagController {
    global: GlobalFlags,
    model: HashMap<String, ModelFlags>,
}

impl FlagController {
    pub fn new<G, M, N>(global: G, model: M, schema: &SchemaRegistry) -> Result<Self, ConfigurationError>
    where
        G: IntoIterator,
        G::Item: AsRef<str>,
        M: IntoIterator<Item = (String, N)>,
        N: IntoIterator,
        N::Item: AsRef<str>,
    {
        let global = GlobalFlags::from_names(global)?;
        let mut per_type = HashMap::new();
        for (entity_type, names) in model {
            if schema.get(&entity_type).is_none() {
                return Err(SchemaError::UnknownType(entity_type).into());
            }
            let flags = ModelFlags::from_names(names)?;
            *per_type.entry(entity_type).or_insert(ModelFlags::NONE) |= flags;
        }
        Ok(Self { global, model: per_type })
    }

    pub fn global(&self) -> GlobalFlags {
        self.global
    }

    pub fn has_global(&self, flag: GlobalFlags) -> bool {
        self.global.contains(flag)
    }

    /// Flags configured for a whole type.
    pub fn type_flags(&self, entity_type: &str) -> ModelFlags {
        self.model.get(entity_type).copied().unwrap_or_default()
    }

    /// Model flags named by record tags. Tags are plain strings or objects
    /// with a `name`; anything that is not a model flag is ignored.
    pub fn tag_flags(tags: &Value) -> ModelFlags {
        let Value::Array(tags) = tags else {
            return ModelFlags::NONE;
        };
        tags.iter()
            .filter_map(|tag| match tag {
                Value::String(name) => Some(name.as_str()),
                Value::Object(map) => map.get("name").and_then(Value::as_str),
                _ => None,
            })
            .fold(ModelFlags::NONE, |acc, name| match ModelFlags::from_name(name) {
                Ok(flag) => acc | flag,
                Err(_) => {
                    debug!("tag `{name}` is not a model flag, ignoring");
                    acc
                }
            })
    }

    pub fn apply_tags(entity: &mut Entity, tags: &Value) {
        entity.model_flags |= Self::tag_flags(tags);
    }

    /// Type flags combined with the entity's own.
    pub fn effective(&self, entity: &Entity) -> ModelFlags {
        self.type_flags(&entity.entity_type) | entity.model_flags
    }

    pub fn skips_creates(&self, entity: &Entity) -> bool {
        self.has_global(GlobalFlags::SKIP_UNMATCHED_SRC)
            || self.effective(entity).contains(ModelFlags::SKIP_UNMATCHED_SRC)
    }

    pub fn skips_deletes(&self, entity: &Entity) -> bool {
        self.has_global(GlobalFlags::SKIP_UNMATCHED_DST)
            || self.effective(entity).contains(ModelFlags::SKIP_UNMATCHED_DST)
    }
}
