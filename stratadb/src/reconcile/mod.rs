use crate::cursor::{column_param, Cursor};
use crate::error::Result;
use crate::registry::ModelRegistry;
use crate::schema::{FieldDefinition, FieldType, ModelDefinition, OnDelete};
use rusqlite::types::Value as SqlValue;
use std::collections::HashMap;

/// Physical column shape for a declared field: storage affinity plus the
/// DDL fragment used when the column is (re)created.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnType {
    pub affinity: &'static str,
    pub ddl: String,
}

/// Pure mapping from a field definition to its physical column type.
/// None for fields that own no column (one2many, many2many, non-stored
/// computed fields).
pub fn sql_type(field: &FieldDefinition) -> Option<ColumnType> {
    if !field.is_stored() {
        return None;
    }
    let (affinity, ddl) = match field.kind {
        FieldType::Boolean => ("INTEGER", "INTEGER".to_string()),
        FieldType::Integer => ("INTEGER", "INTEGER".to_string()),
        FieldType::Float => match field.digits {
            Some((p, s)) => ("REAL", format!("NUMERIC({p},{s})")),
            None => ("REAL", "REAL".to_string()),
        },
        FieldType::Char => {
            let size = field.size.unwrap_or(64);
            ("TEXT", format!("VARCHAR({size})"))
        }
        FieldType::Text => ("TEXT", "TEXT".to_string()),
        FieldType::Date => ("TEXT", "DATE".to_string()),
        FieldType::Datetime => ("TEXT", "TIMESTAMP".to_string()),
        FieldType::Binary => ("BLOB", "BLOB".to_string()),
        FieldType::Selection => ("TEXT", "VARCHAR(64)".to_string()),
        FieldType::Many2one => ("INTEGER", "INTEGER".to_string()),
        FieldType::Reference => ("TEXT", "VARCHAR(128)".to_string()),
        FieldType::One2many | FieldType::Many2many => return None,
    };
    Some(ColumnType { affinity, ddl })
}

/// What a reconciliation pass left behind for the registry to finish:
/// stored-field columns that need a whole-table backfill (ordered by
/// trigger priority) and whether the tree index must be rebuilt.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub created: bool,
    pub backfills: Vec<(i32, String, String)>,
    pub tree_rebuild: bool,
}

struct LiveColumn {
    decl: String,
    notnull: bool,
}

/// Reconcile one model against the live schema: create the table, add
/// missing columns (back-filled from defaults), apply safe casts, flip
/// indexes, and attach or relax NOT NULL. Nothing is ever dropped because
/// it is undeclared (an unknown column may belong to an extension that is
/// not loaded), but its NOT NULL is relaxed so unrelated writes keep
/// working. Constraint applications that fail against existing data are
/// rolled back to a savepoint, logged and skipped.
pub fn reconcile(
    cr: &Cursor,
    registry: &ModelRegistry,
    uid: i64,
    def: &ModelDefinition,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    let table = def.table_name();

    ensure_catalogue_tables(cr)?;
    register_descriptors(cr, def)?;

    let exists = cr.query_int(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
        &[SqlValue::Text(table.clone())],
    )? > 0;

    if !exists {
        create_table(cr, registry, def, &mut outcome)?;
    } else {
        let live = live_columns(cr, &table)?;
        relax_undeclared(cr, def, &table, &live)?;
        reconcile_columns(cr, registry, uid, def, &table, &live, &mut outcome)?;
        if def.parent_field.is_some()
            && (!live.contains_key("parent_left") || !live.contains_key("parent_right"))
        {
            if !live.contains_key("parent_left") {
                cr.execute(
                    &format!("ALTER TABLE \"{table}\" ADD COLUMN parent_left INTEGER"),
                    &[],
                )?;
            }
            if !live.contains_key("parent_right") {
                cr.execute(
                    &format!("ALTER TABLE \"{table}\" ADD COLUMN parent_right INTEGER"),
                    &[],
                )?;
            }
            outcome.tree_rebuild = true;
        }
        if def.log_access {
            for col in ["create_uid", "write_uid"] {
                if !live.contains_key(col) {
                    cr.execute(
                        &format!("ALTER TABLE \"{table}\" ADD COLUMN {col} INTEGER"),
                        &[],
                    )?;
                }
            }
            for col in ["create_date", "write_date"] {
                if !live.contains_key(col) {
                    cr.execute(
                        &format!("ALTER TABLE \"{table}\" ADD COLUMN {col} TIMESTAMP"),
                        &[],
                    )?;
                }
            }
        }
    }

    reconcile_indexes(cr, def, &table)?;
    create_relation_tables(cr, registry, def)?;

    Ok(outcome)
}

fn create_table(
    cr: &Cursor,
    registry: &ModelRegistry,
    def: &ModelDefinition,
    outcome: &mut ReconcileOutcome,
) -> Result<()> {
    let table = def.table_name();
    let mut columns = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];

    for (name, field) in &def.fields {
        let coltype = match sql_type(field) {
            Some(t) => t,
            None => continue,
        };
        let mut ddl = format!("\"{name}\" {}", coltype.ddl);
        // NOT NULL is safe on a brand-new table; existing-data concerns
        // only arise on the alter path.
        if field.required && field.compute.is_none() {
            ddl.push_str(" NOT NULL");
        }
        if field.kind == FieldType::Many2one {
            if let Some(target) = &field.relation {
                let ref_table = registry.table_of(target);
                let ondelete = field.ondelete.unwrap_or(OnDelete::SetNull);
                ddl.push_str(&format!(
                    " REFERENCES \"{ref_table}\" ON DELETE {}",
                    ondelete.sql()
                ));
            }
        }
        columns.push(ddl);

        if let Some(spec) = &field.compute {
            if let Some(stored) = &spec.stored {
                let priority = stored
                    .triggers
                    .iter()
                    .map(|t| t.priority)
                    .min()
                    .unwrap_or(10);
                outcome
                    .backfills
                    .push((priority, def.name.clone(), name.clone()));
            }
        }
    }

    if def.parent_field.is_some() {
        columns.push("parent_left INTEGER".to_string());
        columns.push("parent_right INTEGER".to_string());
    }
    if def.log_access {
        columns.push("create_uid INTEGER".to_string());
        columns.push("create_date TIMESTAMP".to_string());
        columns.push("write_uid INTEGER".to_string());
        columns.push("write_date TIMESTAMP".to_string());
    }

    cr.execute(
        &format!("CREATE TABLE \"{table}\" ({})", columns.join(", ")),
        &[],
    )?;
    log::info!("created table {table} for model {}", def.name);
    outcome.created = true;
    Ok(())
}

fn live_columns(cr: &Cursor, table: &str) -> Result<HashMap<String, LiveColumn>> {
    let rows = cr.query_rows(&format!("PRAGMA table_info(\"{table}\")"), &[])?;
    let mut map = HashMap::new();
    for row in rows {
        let name = row["name"].as_str().unwrap_or_default().to_string();
        map.insert(
            name,
            LiveColumn {
                decl: row["type"].as_str().unwrap_or_default().to_uppercase(),
                notnull: row["notnull"].as_i64().unwrap_or(0) != 0,
            },
        );
    }
    Ok(map)
}

/// Columns present in storage but absent from the declared catalogue keep
/// their data; only their NOT NULL is relaxed, since the field may belong
/// to a model extension that is not currently loaded.
fn relax_undeclared(
    cr: &Cursor,
    def: &ModelDefinition,
    table: &str,
    live: &HashMap<String, LiveColumn>,
) -> Result<()> {
    let reserved = [
        "id",
        "parent_left",
        "parent_right",
        "create_uid",
        "create_date",
        "write_uid",
        "write_date",
    ];
    for (name, col) in live {
        if reserved.contains(&name.as_str()) {
            continue;
        }
        let declared = def
            .fields
            .get(name)
            .map(|f| f.is_stored())
            .unwrap_or(false);
        if !declared {
            log::debug!(
                "column {name} exists in table {table} but not in model {}",
                def.name
            );
            if col.notnull {
                rebuild_column_guarded(cr, table, name, &col.decl, false, "relax_undeclared")?;
            }
        }
    }
    Ok(())
}

fn reconcile_columns(
    cr: &Cursor,
    registry: &ModelRegistry,
    uid: i64,
    def: &ModelDefinition,
    table: &str,
    live: &HashMap<String, LiveColumn>,
    outcome: &mut ReconcileOutcome,
) -> Result<()> {
    for (name, field) in &def.fields {
        if name == "id" {
            continue;
        }
        let coltype = match sql_type(field) {
            Some(t) => t,
            None => continue,
        };

        match live.get(name) {
            None => {
                let mut ddl = format!("ALTER TABLE \"{table}\" ADD COLUMN \"{name}\" {}", coltype.ddl);
                if field.kind == FieldType::Many2one {
                    if let Some(target) = &field.relation {
                        let ondelete = field.ondelete.unwrap_or(OnDelete::SetNull);
                        ddl.push_str(&format!(
                            " REFERENCES \"{}\" ON DELETE {}",
                            registry.table_of(target),
                            ondelete.sql()
                        ));
                    }
                }
                cr.execute(&ddl, &[])?;
                log::debug!("added column {name} to table {table}");

                if let Some(default) = registry.resolve_default(cr, uid, def, name)? {
                    if !default.is_null() {
                        cr.execute(
                            &format!("UPDATE \"{table}\" SET \"{name}\"=?"),
                            &[column_param(field.kind, &default)],
                        )?;
                        log::debug!("backfilled default for new column {table}.{name}");
                    }
                }
                if let Some(spec) = &field.compute {
                    if let Some(stored) = &spec.stored {
                        let priority = stored
                            .triggers
                            .iter()
                            .map(|t| t.priority)
                            .min()
                            .unwrap_or(10);
                        outcome
                            .backfills
                            .push((priority, def.name.clone(), name.clone()));
                    }
                }
                if field.required && field.compute.is_none() {
                    rebuild_column_guarded(cr, table, name, &coltype.ddl, true, "set_not_null")?;
                }
            }
            Some(col) => {
                let want_notnull = field.required && field.compute.is_none();
                if col.decl != coltype.ddl.to_uppercase() {
                    if apply_cast(cr, table, name, col, &coltype, want_notnull && col.notnull)? {
                        continue;
                    }
                }
                if want_notnull && !col.notnull {
                    // Back-fill NULLs from the default before constraining.
                    if let Some(default) = registry.resolve_default(cr, uid, def, name)? {
                        if !default.is_null() {
                            cr.execute(
                                &format!("UPDATE \"{table}\" SET \"{name}\"=? WHERE \"{name}\" IS NULL"),
                                &[column_param(field.kind, &default)],
                            )?;
                        }
                    }
                    rebuild_column_guarded(cr, table, name, &coltype.ddl, true, "set_not_null")?;
                } else if !want_notnull && col.notnull {
                    rebuild_column_guarded(cr, table, name, &coltype.ddl, false, "drop_not_null")?;
                }
            }
        }
    }
    Ok(())
}

/// Apply a type change when it is on the approved safe-cast list; anything
/// else is logged and left alone. Returns whether a cast was applied.
fn apply_cast(
    cr: &Cursor,
    table: &str,
    name: &str,
    live: &LiveColumn,
    want: &ColumnType,
    keep_notnull: bool,
) -> Result<bool> {
    let from = live.decl.as_str();
    let to = want.ddl.to_uppercase();

    let safe = (from.starts_with("VARCHAR") && to == "TEXT")
        || (from.starts_with("VARCHAR")
            && to.starts_with("VARCHAR")
            && varchar_size(from) < varchar_size(&to))
        || (from == "INTEGER" && (to == "REAL" || to.starts_with("NUMERIC")))
        || (from == "DATE" && to == "TIMESTAMP")
        || (from == "REAL" && to.starts_with("NUMERIC"))
        || (from.starts_with("NUMERIC") && to == "REAL");

    if !safe {
        log::warn!(
            "column '{name}' in table '{table}' has changed type (db={from}, declared={to}) \
             but this change cannot be migrated"
        );
        return Ok(false);
    }

    log::info!("column '{name}' in table '{table}' changed type to {to}");
    rebuild_column_guarded(cr, table, name, &want.ddl, keep_notnull, "safe_cast")?;
    Ok(true)
}

fn varchar_size(decl: &str) -> u32 {
    decl.trim_start_matches("VARCHAR")
        .trim_matches(|c| c == '(' || c == ')')
        .parse()
        .unwrap_or(0)
}

/// SQLite cannot ALTER a column in place; the equivalent is rename to a
/// temp column, add the column back with the new shape, copy, drop the
/// temp. The whole dance runs under a savepoint so a failure (NULLs under
/// a new NOT NULL, an impossible cast) leaves the table untouched.
fn rebuild_column_guarded(
    cr: &Cursor,
    table: &str,
    name: &str,
    ddl: &str,
    notnull: bool,
    label: &str,
) -> Result<()> {
    let savepoint = format!("{table}_{name}_{label}");
    cr.savepoint(&savepoint)?;
    let result = rebuild_column(cr, table, name, ddl, notnull);
    match result {
        Ok(()) => cr.release(&savepoint),
        Err(e) => {
            log::warn!(
                "unable to apply {label} on column {name} of table {table}: {e}; \
                 update the offending rows and reload the model to retry"
            );
            cr.rollback_to(&savepoint)?;
            cr.release(&savepoint)
        }
    }
}

fn rebuild_column(cr: &Cursor, table: &str, name: &str, ddl: &str, notnull: bool) -> Result<()> {
    // SQLite only accepts ADD COLUMN ... NOT NULL with a non-null default;
    // the copy step below then fails (and rolls back) if real NULLs remain.
    let constraint = if notnull {
        format!(" NOT NULL DEFAULT {}", filler(ddl))
    } else {
        String::new()
    };
    // An index would follow the rename and block the temp-column drop; the
    // index pass recreates it afterwards.
    cr.execute(&format!("DROP INDEX IF EXISTS \"{table}_{name}_index\""), &[])?;
    cr.execute(
        &format!("ALTER TABLE \"{table}\" RENAME COLUMN \"{name}\" TO _strata_tmp"),
        &[],
    )?;
    cr.execute(
        &format!("ALTER TABLE \"{table}\" ADD COLUMN \"{name}\" {ddl}{constraint}"),
        &[],
    )?;
    cr.execute(
        &format!("UPDATE \"{table}\" SET \"{name}\"=_strata_tmp"),
        &[],
    )?;
    cr.execute(
        &format!("ALTER TABLE \"{table}\" DROP COLUMN _strata_tmp"),
        &[],
    )?;
    Ok(())
}

fn filler(ddl: &str) -> &'static str {
    let upper = ddl.to_uppercase();
    if upper.contains("INT") || upper.contains("REAL") || upper.contains("NUMERIC") {
        "0"
    } else if upper.contains("BLOB") {
        "x''"
    } else {
        "''"
    }
}

fn reconcile_indexes(cr: &Cursor, def: &ModelDefinition, table: &str) -> Result<()> {
    for (name, field) in &def.fields {
        if sql_type(field).is_none() {
            continue;
        }
        let indexname = format!("{table}_{name}_index");
        let present = cr.query_int(
            "SELECT count(*) FROM sqlite_master WHERE type='index' AND name=?",
            &[SqlValue::Text(indexname.clone())],
        )? > 0;
        if field.select && !present {
            cr.execute(
                &format!("CREATE INDEX \"{indexname}\" ON \"{table}\" (\"{name}\")"),
                &[],
            )?;
        } else if !field.select && present {
            cr.execute(&format!("DROP INDEX \"{indexname}\""), &[])?;
        }
    }

    if def.parent_field.is_some() {
        for col in ["parent_left", "parent_right"] {
            let indexname = format!("{table}_{col}_index");
            cr.execute(
                &format!("CREATE INDEX IF NOT EXISTS \"{indexname}\" ON \"{table}\" ({col})"),
                &[],
            )?;
        }
    }
    Ok(())
}

fn create_relation_tables(cr: &Cursor, registry: &ModelRegistry, def: &ModelDefinition) -> Result<()> {
    let table = def.table_name();
    for (name, field) in &def.fields {
        if field.kind != FieldType::Many2many || field.compute.is_some() {
            continue;
        }
        let target = match &field.relation {
            Some(t) => t,
            None => continue,
        };
        let rel = relation_table(def, name, field);
        let (col1, col2) = relation_columns(def, field);
        let exists = cr.query_int(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
            &[SqlValue::Text(rel.clone())],
        )? > 0;
        if !exists {
            let ref_table = registry.table_of(target);
            cr.execute(
                &format!(
                    "CREATE TABLE \"{rel}\" (\
                     \"{col1}\" INTEGER NOT NULL REFERENCES \"{table}\" ON DELETE CASCADE, \
                     \"{col2}\" INTEGER NOT NULL REFERENCES \"{ref_table}\" ON DELETE CASCADE)"
                ),
                &[],
            )?;
            cr.execute(
                &format!("CREATE INDEX \"{rel}_{col1}_index\" ON \"{rel}\" (\"{col1}\")"),
                &[],
            )?;
            cr.execute(
                &format!("CREATE INDEX \"{rel}_{col2}_index\" ON \"{rel}\" (\"{col2}\")"),
                &[],
            )?;
        }
    }
    Ok(())
}

/// Relation table name for a many2many field.
pub fn relation_table(def: &ModelDefinition, name: &str, field: &FieldDefinition) -> String {
    field
        .rel_table
        .clone()
        .unwrap_or_else(|| format!("{}_{}_rel", def.table_name(), name))
}

/// Column pair (owning side, target side) of a many2many relation table.
pub fn relation_columns(def: &ModelDefinition, field: &FieldDefinition) -> (String, String) {
    let owner = format!("{}_id", def.table_name());
    let target = field
        .relation
        .as_deref()
        .unwrap_or("target")
        .replace('.', "_");
    let mut target = format!("{target}_id");
    if target == owner {
        target = format!("{target}2");
    }
    (owner, target)
}

// ── Descriptor catalogue ─────────────────────────────────────────────

fn ensure_catalogue_tables(cr: &Cursor) -> Result<()> {
    cr.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS strata_model (
            model TEXT PRIMARY KEY,
            name TEXT,
            info TEXT
        );

        CREATE TABLE IF NOT EXISTS strata_model_field (
            model TEXT NOT NULL,
            name TEXT NOT NULL,
            ttype TEXT NOT NULL,
            relation TEXT,
            label TEXT NOT NULL,
            required INTEGER NOT NULL DEFAULT 0,
            readonly INTEGER NOT NULL DEFAULT 0,
            indexed INTEGER NOT NULL DEFAULT 0,
            stored INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (model, name)
        );
        ",
    )
}

/// Register the model's field descriptors for introspection by admin
/// tooling. Idempotent: re-registration replaces the rows in place.
fn register_descriptors(cr: &Cursor, def: &ModelDefinition) -> Result<()> {
    cr.execute(
        "INSERT OR REPLACE INTO strata_model (model, name, info) VALUES (?, ?, ?)",
        &[
            SqlValue::Text(def.name.clone()),
            SqlValue::Text(def.description.clone().unwrap_or_else(|| def.name.clone())),
            SqlValue::Null,
        ],
    )?;
    for (name, field) in &def.fields {
        cr.execute(
            "INSERT OR REPLACE INTO strata_model_field \
             (model, name, ttype, relation, label, required, readonly, indexed, stored) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::Text(def.name.clone()),
                SqlValue::Text(name.clone()),
                SqlValue::Text(field.kind.as_str().to_string()),
                field
                    .relation
                    .clone()
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
                SqlValue::Text(field.label_or(name)),
                SqlValue::Integer(i64::from(field.required)),
                SqlValue::Integer(i64::from(field.readonly)),
                SqlValue::Integer(i64::from(field.select)),
                SqlValue::Integer(i64::from(field.is_stored())),
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ComputeSpec, FieldDefinition};

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(
            sql_type(&FieldDefinition::char(32)).unwrap().ddl,
            "VARCHAR(32)"
        );
        assert_eq!(
            sql_type(&FieldDefinition::new(FieldType::Boolean)).unwrap().ddl,
            "INTEGER"
        );
        assert_eq!(
            sql_type(&FieldDefinition::many2one("res.partner")).unwrap().ddl,
            "INTEGER"
        );
        let mut float = FieldDefinition::new(FieldType::Float);
        float.digits = Some((16, 2));
        assert_eq!(sql_type(&float).unwrap().ddl, "NUMERIC(16,2)");
    }

    #[test]
    fn test_sql_type_skips_columnless_fields() {
        assert!(sql_type(&FieldDefinition::one2many("child", "parent_id")).is_none());
        assert!(sql_type(&FieldDefinition::many2many("tag")).is_none());
        let pure = FieldDefinition::new(FieldType::Float).computed(ComputeSpec::readonly("f"));
        assert!(sql_type(&pure).is_none());
        let stored = FieldDefinition::new(FieldType::Float)
            .computed(ComputeSpec::stored("f", vec![]));
        assert_eq!(sql_type(&stored).unwrap().ddl, "REAL");
    }

    #[test]
    fn test_varchar_size() {
        assert_eq!(varchar_size("VARCHAR(64)"), 64);
        assert_eq!(varchar_size("VARCHAR(8)"), 8);
        assert_eq!(varchar_size("TEXT"), 0);
    }

    #[test]
    fn test_relation_table_naming() {
        let def = ModelDefinition::new("res.partner");
        let field = FieldDefinition::many2many("res.partner.category");
        assert_eq!(relation_table(&def, "category_ids", &field), "res_partner_category_ids_rel");
        let (c1, c2) = relation_columns(&def, &field);
        assert_eq!(c1, "res_partner_id");
        assert_eq!(c2, "res_partner_category_id");
    }
}
