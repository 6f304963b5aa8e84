use crate::access::{
    AccessControl, AllowAll, DefaultOverrides, NoOverrides, NoTranslations, RowSecurity,
    Translations, Unrestricted,
};
use crate::context::Context;
use crate::cursor::Cursor;
use crate::depends::{self, TriggerTable};
use crate::error::{Result, StrataError};
use crate::inherits::{self, DelegatedCatalogue};
use crate::reconcile;
use crate::schema::{DefaultSpec, FieldType, ModelDefinition};
use crate::store::Model;
use crate::tree;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Computes a batch of field values: (cursor, registry, uid, owner ids,
/// fields of the co-computed group, context) → id → field → value. Single
/// field computes return one-entry maps per id.
pub type ComputeFn = Arc<
    dyn Fn(&Cursor, &ModelRegistry, i64, &[i64], &[String], &Context) -> Result<HashMap<i64, Map<String, Value>>>
        + Send
        + Sync,
>;

/// Maps changed trigger-model ids to the owner ids whose stored value
/// depends on them.
pub type TriggerMapFn =
    Arc<dyn Fn(&Cursor, &ModelRegistry, i64, &[i64], &Context) -> Result<Vec<i64>> + Send + Sync>;

/// Record-level constraint predicate; false means the constraint failed
/// for at least one of the ids.
pub type ConstraintFn =
    Arc<dyn Fn(&Cursor, &ModelRegistry, i64, &[i64]) -> Result<bool> + Send + Sync>;

/// Computes a default value at create time.
pub type DefaultFn = Arc<dyn Fn(&Cursor, &ModelRegistry, i64, &Context) -> Result<Value> + Send + Sync>;

/// Custom write-through for a computed field: (cursor, registry, uid,
/// record id, field, value, context). Runs after the row exists.
pub type SetterFn =
    Arc<dyn Fn(&Cursor, &ModelRegistry, i64, i64, &str, &Value, &Context) -> Result<()> + Send + Sync>;

/// The model pool. One registry per process (or per test), passed by
/// reference into everything that needs model metadata; no global state.
///
/// Initialization order is fixed: register definitions and callables,
/// then `setup` once with a cursor, which resolves any remaining
/// inheritance closures, reconciles the physical schema, backfills
/// freshly stored columns and rebuilds new tree indexes.
pub struct ModelRegistry {
    defs: HashMap<String, ModelDefinition>,
    delegated: HashMap<String, DelegatedCatalogue>,
    order: Vec<String>,
    store_triggers: TriggerTable,
    computes: HashMap<String, ComputeFn>,
    trigger_maps: HashMap<String, TriggerMapFn>,
    constraint_fns: HashMap<String, ConstraintFn>,
    default_fns: HashMap<String, DefaultFn>,
    setters: HashMap<String, SetterFn>,
    access: Box<dyn AccessControl>,
    rules: Box<dyn RowSecurity>,
    translations: Box<dyn Translations>,
    overrides: Box<dyn DefaultOverrides>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        ModelRegistry {
            defs: HashMap::new(),
            delegated: HashMap::new(),
            order: Vec::new(),
            store_triggers: TriggerTable::new(),
            computes: HashMap::new(),
            trigger_maps: HashMap::new(),
            constraint_fns: HashMap::new(),
            default_fns: HashMap::new(),
            setters: HashMap::new(),
            access: Box::new(AllowAll),
            rules: Box::new(Unrestricted),
            translations: Box::new(NoTranslations),
            overrides: Box::new(NoOverrides),
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register (or re-register) a model definition. The dependency
    /// registry is rebuilt incrementally; the inheritance closure is
    /// resolved right away when every delegation target is already known,
    /// and the change fans out to all models delegating to this one.
    pub fn register(&mut self, def: ModelDefinition) -> Result<()> {
        self.validate_definition(&def)?;
        let name = def.name.clone();
        depends::register_model(&mut self.store_triggers, &def);
        if !self.defs.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.defs.insert(name.clone(), def);

        let resolvable = self.defs[&name]
            .inherits
            .keys()
            .all(|t| self.defs.contains_key(t));
        if resolvable {
            self.resolve_from(&name)?;
        }
        Ok(())
    }

    fn validate_definition(&self, def: &ModelDefinition) -> Result<()> {
        if def.name.is_empty() {
            return Err(StrataError::Schema("model name must not be empty".into()));
        }
        if let Some(parent) = &def.parent_field {
            match def.fields.get(parent) {
                Some(f) if f.kind == FieldType::Many2one => {
                    if f.relation.as_deref() != Some(def.name.as_str()) {
                        return Err(StrataError::Schema(format!(
                            "parent field '{}.{parent}' must point back at '{}'",
                            def.name, def.name
                        )));
                    }
                }
                _ => {
                    return Err(StrataError::Schema(format!(
                        "model '{}' declares parent field '{parent}' which is not a many2one",
                        def.name
                    )))
                }
            }
        }
        for (target, link) in &def.inherits {
            match def.fields.get(link) {
                Some(f) if f.kind == FieldType::Many2one => {
                    if f.relation.as_deref() != Some(target.as_str()) {
                        return Err(StrataError::Schema(format!(
                            "delegation link '{}.{link}' must target '{target}'",
                            def.name
                        )));
                    }
                }
                _ => {
                    return Err(StrataError::Schema(format!(
                        "delegation link '{}.{link}' must be a declared many2one",
                        def.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Re-resolve the inheritance closure of `name`, then of every model
    /// that (transitively) delegates to it: a reverse-dependency walk,
    /// not a pool rescan.
    fn resolve_from(&mut self, name: &str) -> Result<()> {
        let mut todo = vec![name.to_string()];
        todo.extend(inherits::dependents(&self.defs, name));
        for model in todo {
            if self.defs[&model]
                .inherits
                .keys()
                .any(|t| !self.defs.contains_key(t))
            {
                continue;
            }
            let catalogue = inherits::resolve(&self.defs, &self.delegated, &self.defs[&model])?;
            self.delegated.insert(model, catalogue);
        }
        Ok(())
    }

    /// Finish initialization against a live store: resolve closures that
    /// were deferred (delegation targets registered later), reconcile
    /// every model's physical schema in registration order, then run the
    /// queued stored-field backfills by ascending priority and rebuild any
    /// tree index that just appeared.
    pub fn setup(&mut self, cr: &Cursor, uid: i64) -> Result<()> {
        for name in self.order.clone() {
            if !self.delegated.contains_key(&name) {
                let catalogue = inherits::resolve(&self.defs, &self.delegated, &self.defs[&name])?;
                self.delegated.insert(name, catalogue);
            }
        }

        let ctx = Context::default();
        let mut backfills: Vec<(i32, String, String)> = Vec::new();
        let mut rebuilds: Vec<String> = Vec::new();
        for name in &self.order {
            let outcome = reconcile::reconcile(cr, self, uid, &self.defs[name])?;
            backfills.extend(outcome.backfills);
            if outcome.tree_rebuild || (outcome.created && self.defs[name].parent_field.is_some()) {
                rebuilds.push(name.clone());
            }
        }

        for name in rebuilds {
            tree::rebuild(cr, &self.defs[&name])?;
        }
        backfills.sort_by(|a, b| (a.0, &a.1, &a.2).cmp(&(b.0, &b.1, &b.2)));
        for (_, model, field) in backfills {
            depends::backfill(cr, self, uid, &model, &field, &ctx)?;
        }
        Ok(())
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub fn def(&self, name: &str) -> Result<&ModelDefinition> {
        self.defs
            .get(name)
            .ok_or_else(|| StrataError::Schema(format!("model '{name}' is not registered")))
    }

    pub fn delegated_catalogue(&self, name: &str) -> Result<&DelegatedCatalogue> {
        self.delegated.get(name).ok_or_else(|| {
            StrataError::Schema(format!(
                "inheritance closure of '{name}' is not resolved; register its delegation \
                 targets or run setup"
            ))
        })
    }

    /// Handle for record operations on one model.
    pub fn model(&self, name: &str) -> Result<Model<'_>> {
        let def = self.def(name)?;
        let delegated = self.delegated_catalogue(name)?;
        Ok(Model::new(self, def, delegated))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    /// Physical table of a model; falls back to the name-derived table for
    /// models that are not registered yet (forward references in DDL).
    pub fn table_of(&self, name: &str) -> String {
        self.defs
            .get(name)
            .map(|d| d.table_name())
            .unwrap_or_else(|| name.replace('.', "_"))
    }

    pub fn has_tree_index(&self, name: &str) -> bool {
        self.defs
            .get(name)
            .map(|d| d.parent_field.is_some())
            .unwrap_or(false)
    }

    pub fn store_triggers(&self) -> &TriggerTable {
        &self.store_triggers
    }

    // ── Callables ────────────────────────────────────────────────────

    pub fn register_compute<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Cursor, &ModelRegistry, i64, &[i64], &[String], &Context) -> Result<HashMap<i64, Map<String, Value>>>
            + Send
            + Sync
            + 'static,
    {
        self.computes.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_trigger_map<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Cursor, &ModelRegistry, i64, &[i64], &Context) -> Result<Vec<i64>>
            + Send
            + Sync
            + 'static,
    {
        self.trigger_maps.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_constraint<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Cursor, &ModelRegistry, i64, &[i64]) -> Result<bool> + Send + Sync + 'static,
    {
        self.constraint_fns.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_default<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Cursor, &ModelRegistry, i64, &Context) -> Result<Value> + Send + Sync + 'static,
    {
        self.default_fns.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_setter<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Cursor, &ModelRegistry, i64, i64, &str, &Value, &Context) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.setters.insert(name.to_string(), Arc::new(f));
    }

    pub fn compute(&self, name: &str) -> Result<ComputeFn> {
        self.computes
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::Schema(format!("compute function '{name}' is not registered")))
    }

    pub fn trigger_map(&self, name: &str) -> Result<TriggerMapFn> {
        self.trigger_maps
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::Schema(format!("trigger map '{name}' is not registered")))
    }

    pub fn constraint_fn(&self, name: &str) -> Result<ConstraintFn> {
        self.constraint_fns
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::Schema(format!("constraint '{name}' is not registered")))
    }

    pub fn setter(&self, name: &str) -> Result<SetterFn> {
        self.setters
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::Schema(format!("setter '{name}' is not registered")))
    }

    /// Resolve a model's declared default for one field, if any.
    pub fn resolve_default(
        &self,
        cr: &Cursor,
        uid: i64,
        def: &ModelDefinition,
        field: &str,
    ) -> Result<Option<Value>> {
        match def.defaults.get(field) {
            None => Ok(None),
            Some(DefaultSpec::Value(v)) => Ok(Some(v.clone())),
            Some(DefaultSpec::Function(name)) => {
                let f = self.default_fns.get(name).ok_or_else(|| {
                    StrataError::Schema(format!("default function '{name}' is not registered"))
                })?;
                f(cr, self, uid, &Context::default()).map(Some)
            }
        }
    }

    // ── Collaborators ────────────────────────────────────────────────

    pub fn set_access_control(&mut self, access: Box<dyn AccessControl>) {
        self.access = access;
    }

    pub fn set_row_security(&mut self, rules: Box<dyn RowSecurity>) {
        self.rules = rules;
    }

    pub fn set_translations(&mut self, translations: Box<dyn Translations>) {
        self.translations = translations;
    }

    pub fn set_default_overrides(&mut self, overrides: Box<dyn DefaultOverrides>) {
        self.overrides = overrides;
    }

    pub fn access_control(&self) -> &dyn AccessControl {
        self.access.as_ref()
    }

    pub fn row_security(&self) -> &dyn RowSecurity {
        self.rules.as_ref()
    }

    pub fn translations(&self) -> &dyn Translations {
        self.translations.as_ref()
    }

    pub fn default_overrides(&self) -> &dyn DefaultOverrides {
        self.overrides.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;

    #[test]
    fn test_register_validates_parent_field() {
        let mut registry = ModelRegistry::new();
        let bad = ModelDefinition::new("cat").tree("parent_id");
        assert!(matches!(
            registry.register(bad),
            Err(StrataError::Schema(_))
        ));

        let good = ModelDefinition::new("cat")
            .field("name", FieldDefinition::char(64))
            .field("parent_id", FieldDefinition::many2one("cat"))
            .tree("parent_id");
        assert!(registry.register(good).is_ok());
        assert!(registry.has_tree_index("cat"));
    }

    #[test]
    fn test_deferred_inheritance_resolution() {
        let mut registry = ModelRegistry::new();
        // Delegating model registered before its target: resolution waits.
        let invoice = ModelDefinition::new("invoice")
            .field("partner_id", FieldDefinition::many2one("partner"))
            .delegate("partner", "partner_id");
        registry.register(invoice).unwrap();
        assert!(registry.delegated_catalogue("invoice").is_err());

        let partner =
            ModelDefinition::new("partner").field("name", FieldDefinition::char(64));
        registry.register(partner).unwrap();
        // Registering the target fans the resolution out to the dependent.
        let catalogue = registry.delegated_catalogue("invoice").unwrap();
        assert_eq!(catalogue["name"].target, "partner");
    }

    #[test]
    fn test_unknown_model_lookup_fails() {
        let registry = ModelRegistry::new();
        assert!(registry.def("nope").is_err());
        assert_eq!(registry.table_of("a.b"), "a_b");
    }
}
