use crate::context::Context;
use crate::cursor::Cursor;
use crate::error::{Result, StrataError};
use crate::registry::ModelRegistry;
use crate::schema::FieldType;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Request-scoped record cache: (model, id) → resolved field values.
/// Never shared across units of work and carries no synchronization; all
/// mutation of the underlying rows goes through the store, which tells the
/// cache what to forget.
#[derive(Default)]
pub struct RecordCache {
    data: RefCell<HashMap<String, HashMap<i64, Map<String, Value>>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        RecordCache::default()
    }

    /// Make the cache aware of a record so later prefetches include it.
    pub fn register(&self, model: &str, id: i64) {
        self.data
            .borrow_mut()
            .entry(model.to_string())
            .or_default()
            .entry(id)
            .or_default();
    }

    pub fn cached(&self, model: &str, id: i64, field: &str) -> Option<Value> {
        self.data
            .borrow()
            .get(model)
            .and_then(|rows| rows.get(&id))
            .and_then(|row| row.get(field))
            .cloned()
    }

    /// Registered ids of `model` that do not have `field` resolved yet:
    /// the prefetch set for one missing-field access.
    pub fn ids_missing(&self, model: &str, field: &str) -> Vec<i64> {
        self.data
            .borrow()
            .get(model)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| !row.contains_key(field))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn store_row(&self, model: &str, id: i64, values: Map<String, Value>) {
        let mut data = self.data.borrow_mut();
        let row = data
            .entry(model.to_string())
            .or_default()
            .entry(id)
            .or_default();
        for (k, v) in values {
            row.insert(k, v);
        }
    }

    // ── Invalidation ─────────────────────────────────────────────────

    /// Forget specific fields on specific rows (a write touched them).
    pub fn invalidate(&self, model: &str, ids: &[i64], fields: &[String]) {
        let mut data = self.data.borrow_mut();
        if let Some(rows) = data.get_mut(model) {
            for id in ids {
                if let Some(row) = rows.get_mut(id) {
                    for field in fields {
                        row.remove(field);
                    }
                }
            }
        }
    }

    /// Drop whole rows (written or unlinked).
    pub fn evict(&self, model: &str, ids: &[i64]) {
        let mut data = self.data.borrow_mut();
        if let Some(rows) = data.get_mut(model) {
            for id in ids {
                rows.remove(id);
            }
        }
    }

    /// Drop every cached row of a model (dependent recomputation may have
    /// touched any of them).
    pub fn invalidate_model(&self, model: &str) {
        self.data.borrow_mut().remove(model);
    }

    pub fn clear(&self) {
        self.data.borrow_mut().clear();
    }
}

/// A lazy reference to one record: a (cache, model, id) triple plus the
/// plumbing needed to fault values in. Equality and hashing depend only on
/// (model, id), so handles from different cache instances compare equal.
pub struct Handle<'a, 'c> {
    cache: &'a RecordCache,
    registry: &'a ModelRegistry,
    cr: &'a Cursor<'c>,
    uid: i64,
    ctx: &'a Context,
    model: String,
    id: i64,
}

/// A relational field resolved through a handle.
pub enum Resolved<'a, 'c> {
    Value(Value),
    Record(Option<Handle<'a, 'c>>),
    Records(Vec<Handle<'a, 'c>>),
}

impl<'a, 'c> Handle<'a, 'c> {
    pub fn new(
        cache: &'a RecordCache,
        registry: &'a ModelRegistry,
        cr: &'a Cursor<'c>,
        uid: i64,
        ctx: &'a Context,
        model: &str,
        id: i64,
    ) -> Self {
        cache.register(model, id);
        Handle {
            cache,
            registry,
            cr,
            uid,
            ctx,
            model: model.to_string(),
            id,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn sibling(&self, model: &str, id: i64) -> Handle<'a, 'c> {
        Handle::new(
            self.cache,
            self.registry,
            self.cr,
            self.uid,
            self.ctx,
            model,
            id,
        )
    }

    /// Raw field value, resolved on first access and memoized in the
    /// owning cache. Requesting a prefetchable field faults in the whole
    /// classic group for every registered sibling still missing it, so N
    /// handle accesses cost O(N / chunk) reads instead of N.
    pub fn value(&self, name: &str) -> Result<Value> {
        if name == "id" {
            return Ok(Value::Number(self.id.into()));
        }
        if let Some(v) = self.cache.cached(&self.model, self.id, name) {
            return Ok(v);
        }

        let record = self.registry.model(&self.model)?;
        let field = record.field_def(name)?;

        let (ids, fields) = if field.prefetch() {
            let mut ids = self.cache.ids_missing(&self.model, name);
            if !ids.contains(&self.id) {
                ids.push(self.id);
            }
            (ids, record.prefetch_group())
        } else {
            (vec![self.id], vec![name.to_string()])
        };

        log::debug!(
            "cache fault on {}.{name}: fetching {} field(s) for {} id(s)",
            self.model,
            fields.len(),
            ids.len()
        );
        let rows = record.read(self.cr, self.uid, &ids, Some(&fields), self.ctx)?;
        for row in rows {
            let id = row.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
            self.cache.store_row(&self.model, id, row);
        }

        self.cache
            .cached(&self.model, self.id, name)
            .ok_or(StrataError::NotFound {
                model: self.model.clone(),
                id: self.id,
            })
    }

    /// Field access with relational resolution: many2one and reference
    /// fields become nested handles, x2many fields become handle lists
    /// sharing this cache instance.
    pub fn get(&self, name: &str) -> Result<Resolved<'a, 'c>> {
        let record = self.registry.model(&self.model)?;
        let field = record.field_def(name)?.clone();
        let value = self.value(name)?;

        match field.kind {
            FieldType::Many2one => {
                let target = field.relation.clone().ok_or_else(|| {
                    StrataError::Schema(format!("many2one '{name}' has no relation"))
                })?;
                Ok(Resolved::Record(
                    value.as_i64().map(|id| self.sibling(&target, id)),
                ))
            }
            FieldType::Reference => match value.as_str() {
                Some(text) => {
                    let (model, id) = text.split_once(',').ok_or_else(|| {
                        StrataError::Other(format!("malformed reference value '{text}'"))
                    })?;
                    let id: i64 = id
                        .trim()
                        .parse()
                        .map_err(|_| StrataError::Other(format!("malformed reference id '{text}'")))?;
                    Ok(Resolved::Record(Some(self.sibling(model, id))))
                }
                None => Ok(Resolved::Record(None)),
            },
            FieldType::One2many | FieldType::Many2many => {
                let target = field.relation.clone().ok_or_else(|| {
                    StrataError::Schema(format!("x2many '{name}' has no relation"))
                })?;
                let ids = value
                    .as_array()
                    .map(|items| items.iter().filter_map(|v| v.as_i64()).collect::<Vec<_>>())
                    .unwrap_or_default();
                Ok(Resolved::Records(
                    ids.into_iter().map(|id| self.sibling(&target, id)).collect(),
                ))
            }
            _ => Ok(Resolved::Value(value)),
        }
    }
}

impl PartialEq for Handle<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        (self.model.as_str(), self.id) == (other.model.as_str(), other.id)
    }
}

impl Eq for Handle<'_, '_> {}

impl Hash for Handle<'_, '_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Handle<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}, {})", self.model, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_missing_tracking() {
        let cache = RecordCache::new();
        cache.register("res.partner", 1);
        cache.register("res.partner", 2);

        let mut missing = cache.ids_missing("res.partner", "name");
        missing.sort();
        assert_eq!(missing, vec![1, 2]);

        let mut row = Map::new();
        row.insert("name".to_string(), Value::String("Alice".into()));
        cache.store_row("res.partner", 1, row);

        assert_eq!(cache.ids_missing("res.partner", "name"), vec![2]);
        assert_eq!(
            cache.cached("res.partner", 1, "name"),
            Some(Value::String("Alice".into()))
        );
    }

    #[test]
    fn test_invalidation() {
        let cache = RecordCache::new();
        let mut row = Map::new();
        row.insert("name".to_string(), Value::String("Alice".into()));
        row.insert("city".to_string(), Value::String("Girona".into()));
        cache.store_row("res.partner", 1, row);

        cache.invalidate("res.partner", &[1], &["name".to_string()]);
        assert!(cache.cached("res.partner", 1, "name").is_none());
        assert!(cache.cached("res.partner", 1, "city").is_some());

        cache.evict("res.partner", &[1]);
        assert!(cache.cached("res.partner", 1, "city").is_none());

        cache.store_row("res.partner", 2, Map::new());
        cache.invalidate_model("res.partner");
        assert!(cache.ids_missing("res.partner", "name").is_empty());
    }
}
