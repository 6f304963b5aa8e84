use crate::context::Context;
use crate::cursor::{column_param, Cursor, IN_MAX};
use crate::error::Result;
use crate::registry::ModelRegistry;
use crate::schema::{ModelDefinition, StoreTrigger};
use rusqlite::types::Value as SqlValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One registered stored-field trigger: when `trigger model` rows change,
/// `field` on `owner_model` must be recomputed for the owner ids produced
/// by `map_ids`.
#[derive(Debug, Clone)]
pub struct StoredField {
    pub owner_model: String,
    pub field: String,
    pub map_ids: Option<String>,
    pub dep_fields: Vec<String>,
    pub priority: i32,
}

/// The process-wide trigger table: trigger model → prioritized entries.
pub type TriggerTable = HashMap<String, Vec<StoredField>>;

/// A batch of owner rows whose stored fields need recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct Recompute {
    pub priority: i32,
    pub model: String,
    pub ids: Vec<i64>,
    pub fields: Vec<String>,
}

/// Rebuild the table entries contributed by one model. Any previous
/// entries owned by it are dropped first, so re-registration cannot leave
/// triggers behind for fields that are no longer stored.
pub fn register_model(table: &mut TriggerTable, def: &ModelDefinition) {
    for entries in table.values_mut() {
        entries.retain(|e| e.owner_model != def.name);
    }

    for (field_name, field) in &def.fields {
        let spec = match &field.compute {
            Some(spec) => spec,
            None => continue,
        };
        let stored = match &spec.stored {
            Some(stored) => stored,
            None => continue,
        };

        // An empty trigger list means "my own rows", identity-mapped.
        let self_trigger = [StoreTrigger {
            model: def.name.clone(),
            map_ids: None,
            fields: Vec::new(),
            priority: 10,
        }];
        let triggers: &[StoreTrigger] = if stored.triggers.is_empty() {
            &self_trigger
        } else {
            &stored.triggers
        };

        for trigger in triggers {
            let trigger_model = if trigger.model.is_empty() {
                def.name.clone()
            } else {
                trigger.model.clone()
            };
            let entries = table.entry(trigger_model).or_default();
            let candidate = StoredField {
                owner_model: def.name.clone(),
                field: field_name.clone(),
                map_ids: trigger.map_ids.clone(),
                dep_fields: trigger.fields.clone(),
                priority: trigger.priority,
            };
            let duplicate = entries.iter().any(|e| {
                e.owner_model == candidate.owner_model
                    && e.field == candidate.field
                    && e.dep_fields == candidate.dep_fields
                    && e.priority == candidate.priority
            });
            if !duplicate {
                entries.push(candidate);
                entries.sort_by_key(|e| e.priority);
            }
        }
    }
}

/// Given changed rows of `trigger_model`, work out which stored fields on
/// which owner rows must be refreshed. `changed` of None means any field
/// may have changed (unlink). Each (owner model, field set) pair appears
/// at most once in the result, ordered by ascending priority so that
/// fields other stored fields read are recomputed first.
pub fn targets(
    cr: &Cursor,
    registry: &ModelRegistry,
    uid: i64,
    trigger_model: &str,
    ids: &[i64],
    changed: Option<&[String]>,
    ctx: &Context,
) -> Result<Vec<Recompute>> {
    let entries = match registry.store_triggers().get(trigger_model) {
        Some(entries) if !ids.is_empty() => entries,
        _ => return Ok(Vec::new()),
    };

    // owner model → owner id → indexes of the entries that hit it
    let mut hits: HashMap<String, BTreeMap<i64, BTreeSet<usize>>> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        if let Some(changed) = changed {
            let relevant = entry.dep_fields.is_empty()
                || entry.dep_fields.iter().any(|f| changed.contains(f));
            if !relevant {
                continue;
            }
        }

        let owner_ids = match &entry.map_ids {
            None => ids.to_vec(),
            Some(name) => {
                let map_fn = registry.trigger_map(name)?;
                map_fn(cr, registry, uid, ids, ctx)?
            }
        };
        let per_owner = hits.entry(entry.owner_model.clone()).or_default();
        for id in owner_ids.into_iter().filter(|id| *id > 0) {
            per_owner.entry(id).or_default().insert(idx);
        }
    }

    // Group owner ids that share the same entry set, then merge groups that
    // resolve to the same (model, fields) pair.
    let mut merged: BTreeMap<(String, Vec<String>), (i32, Vec<i64>)> = BTreeMap::new();
    for (owner_model, per_owner) in hits {
        let mut by_entry_set: BTreeMap<Vec<usize>, Vec<i64>> = BTreeMap::new();
        for (id, idxs) in per_owner {
            by_entry_set
                .entry(idxs.into_iter().collect())
                .or_default()
                .push(id);
        }
        for (idxs, group_ids) in by_entry_set {
            // Entries are priority-sorted at registration, so walking the
            // indexes keeps prerequisite fields ahead of their dependents.
            let mut fields: Vec<String> = Vec::new();
            for i in &idxs {
                if !fields.contains(&entries[*i].field) {
                    fields.push(entries[*i].field.clone());
                }
            }
            let priority = idxs.iter().map(|i| entries[*i].priority).min().unwrap_or(10);

            let slot = merged
                .entry((owner_model.clone(), fields))
                .or_insert((priority, Vec::new()));
            slot.0 = slot.0.min(priority);
            for id in group_ids {
                if !slot.1.contains(&id) {
                    slot.1.push(id);
                }
            }
        }
    }

    let mut result: Vec<Recompute> = merged
        .into_iter()
        .map(|((model, fields), (priority, ids))| Recompute {
            priority,
            model,
            ids,
            fields,
        })
        .collect();
    result.sort_by(|a, b| (a.priority, &a.model).cmp(&(b.priority, &b.model)));
    Ok(result)
}

/// Recompute and persist stored fields for a batch of owner rows. Fields
/// sharing a `multi` group are computed in one call; each compute call
/// covers at most IN_MAX ids, and every returned row becomes one UPDATE.
/// A failing compute chunk is logged and skipped; it never aborts the
/// triggering operation or the remaining chunks.
pub fn materialize(
    cr: &Cursor,
    registry: &ModelRegistry,
    uid: i64,
    model: &str,
    ids: &[i64],
    fields: &[String],
    ctx: &Context,
) -> Result<()> {
    let def = registry.def(model)?;
    let table = def.table_name();

    // multi key (or one group per solo field) → fields of the group
    let mut groups: Vec<(Option<String>, Vec<String>)> = Vec::new();
    for field_name in fields {
        let field = match def.fields.get(field_name) {
            Some(f) => f,
            None => continue,
        };
        let spec = match &field.compute {
            Some(spec) => spec,
            None => continue,
        };
        match &spec.multi {
            Some(multi) => {
                if let Some(group) = groups
                    .iter_mut()
                    .find(|(k, _)| k.as_deref() == Some(multi))
                {
                    group.1.push(field_name.clone());
                } else {
                    groups.push((Some(multi.clone()), vec![field_name.clone()]));
                }
            }
            None => groups.push((None, vec![field_name.clone()])),
        }
    }

    for (_, group_fields) in groups {
        let function = match def.fields[&group_fields[0]].compute.as_ref() {
            Some(spec) => spec.function.clone(),
            None => continue,
        };
        let compute = registry.compute(&function)?;

        for chunk in ids.chunks(IN_MAX) {
            let values = match compute(cr, registry, uid, chunk, &group_fields, ctx) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!(
                        "compute '{function}' failed for {model} ids {chunk:?}: {e}; skipping"
                    );
                    continue;
                }
            };

            for (id, row) in values {
                let mut assigns = Vec::new();
                let mut params: Vec<SqlValue> = Vec::new();
                for field_name in &group_fields {
                    let value = match row.get(field_name) {
                        Some(v) => v,
                        None => continue,
                    };
                    assigns.push(format!("\"{field_name}\"=?"));
                    params.push(column_param(def.fields[field_name].kind, value));
                }
                if assigns.is_empty() {
                    continue;
                }
                params.push(SqlValue::Integer(id));
                cr.execute(
                    &format!("UPDATE \"{table}\" SET {} WHERE id=?", assigns.join(",")),
                    &params,
                )?;
            }
        }
    }

    Ok(())
}

/// Backfill a freshly created stored-field column over the whole table.
/// Used once per field when reconciliation introduces its column.
pub fn backfill(
    cr: &Cursor,
    registry: &ModelRegistry,
    uid: i64,
    model: &str,
    field: &str,
    ctx: &Context,
) -> Result<()> {
    let def = registry.def(model)?;
    let ids = cr.query_ids(&format!("SELECT id FROM \"{}\"", def.table_name()), &[])?;
    if ids.is_empty() {
        return Ok(());
    }
    log::info!(
        "storing computed values of '{}.{}' for {} rows",
        model,
        field,
        ids.len()
    );
    materialize(cr, registry, uid, model, &ids, &[field.to_string()], ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ComputeSpec, FieldDefinition, FieldType};

    fn stored_model() -> ModelDefinition {
        ModelDefinition::new("sale.order").field(
            "total",
            FieldDefinition::new(FieldType::Float).computed(ComputeSpec::stored(
                "compute_total",
                vec![
                    StoreTrigger::new("sale.order.line", Some("lines_to_orders"), &["price"], 10),
                    StoreTrigger::new("sale.order", None, &[], 20),
                ],
            )),
        )
    }

    #[test]
    fn test_register_model_builds_trigger_rows() {
        let mut table = TriggerTable::new();
        register_model(&mut table, &stored_model());

        let by_line = &table["sale.order.line"];
        assert_eq!(by_line.len(), 1);
        assert_eq!(by_line[0].owner_model, "sale.order");
        assert_eq!(by_line[0].field, "total");
        assert_eq!(by_line[0].dep_fields, vec!["price".to_string()]);

        let by_self = &table["sale.order"];
        assert_eq!(by_self[0].priority, 20);
    }

    #[test]
    fn test_reregistration_replaces_entries() {
        let mut table = TriggerTable::new();
        register_model(&mut table, &stored_model());
        register_model(&mut table, &stored_model());
        assert_eq!(table["sale.order.line"].len(), 1);

        // A model that no longer stores the field sheds its triggers.
        let plain =
            ModelDefinition::new("sale.order").field("total", FieldDefinition::new(FieldType::Float));
        register_model(&mut table, &plain);
        assert!(table["sale.order.line"].is_empty());
    }

    #[test]
    fn test_empty_trigger_list_is_self_trigger() {
        let def = ModelDefinition::new("res.partner").field(
            "display",
            FieldDefinition::char(64).computed(ComputeSpec::stored("compute_display", vec![])),
        );
        let mut table = TriggerTable::new();
        register_model(&mut table, &def);
        let entries = &table["res.partner"];
        assert_eq!(entries[0].owner_model, "res.partner");
        assert!(entries[0].map_ids.is_none());
        assert!(entries[0].dep_fields.is_empty());
        assert_eq!(entries[0].priority, 10);
    }
}
