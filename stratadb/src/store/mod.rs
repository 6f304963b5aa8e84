use crate::access::{Operation, RowFilter, TranslationKind};
use crate::cache::{Handle, RecordCache};
use crate::context::Context;
use crate::cursor::{column_param, column_value, json_to_sql, placeholders, Cursor, IN_MAX};
use crate::depends;
use crate::error::{Result, StrataError};
use crate::expr::{self, Condition, Domain, Op};
use crate::inherits::{DelegatedCatalogue, DelegatedField};
use crate::reconcile;
use crate::registry::ModelRegistry;
use crate::schema::{FieldDefinition, FieldType, ModelDefinition};
use crate::tree;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Pseudo-field carrying a row's last modification time; readable through
/// `read` and fed back via `Context::with_timestamp` for optimistic
/// concurrency.
pub const LAST_UPDATE: &str = "__last_update";

fn now_stamp() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Where a field lives: on the model's own table, or reached through a
/// delegation link.
pub enum FieldRef<'a> {
    Own(&'a FieldDefinition),
    Delegated(&'a DelegatedField),
}

/// One relation-list operation, mirroring the classic op-tuple wire form:
/// `[0,0,{vals}]` create, `[1,id,{vals}]` update, `[2,id]` delete,
/// `[3,id]` unlink, `[4,id]` link, `[5]` clear, `[6,0,[ids]]` set. A bare
/// id array is shorthand for one Set.
#[derive(Debug, Clone, PartialEq)]
pub enum RelOp {
    Create(Map<String, Value>),
    Update(i64, Map<String, Value>),
    Delete(i64),
    Unlink(i64),
    Link(i64),
    Clear,
    Set(Vec<i64>),
}

/// Parse a JSON relation value into operations.
pub fn parse_rel_ops(value: &Value) -> Result<Vec<RelOp>> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            return Err(StrataError::Other(format!(
                "relation value must be a list, got {other}"
            )))
        }
    };
    if items.iter().all(|v| v.is_i64()) {
        return Ok(vec![RelOp::Set(
            items.iter().filter_map(|v| v.as_i64()).collect(),
        )]);
    }

    let mut ops = Vec::new();
    for item in items {
        let parts = item
            .as_array()
            .ok_or_else(|| StrataError::Other(format!("malformed relation op {item}")))?;
        let code = parts.first().and_then(|v| v.as_i64()).unwrap_or(-1);
        let id = parts.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
        let vals = parts.get(2).and_then(|v| v.as_object()).cloned();
        let op = match code {
            0 => RelOp::Create(vals.unwrap_or_default()),
            1 => RelOp::Update(id, vals.unwrap_or_default()),
            2 => RelOp::Delete(id),
            3 => RelOp::Unlink(id),
            4 => RelOp::Link(id),
            5 => RelOp::Clear,
            6 => RelOp::Set(
                parts
                    .get(2)
                    .and_then(|v| v.as_array())
                    .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
                    .unwrap_or_default(),
            ),
            _ => return Err(StrataError::Other(format!("unknown relation op {item}"))),
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Record-operation handle for one model, obtained from
/// `ModelRegistry::model`. Carries no state of its own, just the
/// registry, the definition and the resolved delegation catalogue.
pub struct Model<'a> {
    registry: &'a ModelRegistry,
    def: &'a ModelDefinition,
    delegated: &'a DelegatedCatalogue,
}

impl<'a> Model<'a> {
    pub fn new(
        registry: &'a ModelRegistry,
        def: &'a ModelDefinition,
        delegated: &'a DelegatedCatalogue,
    ) -> Self {
        Model {
            registry,
            def,
            delegated,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ModelDefinition {
        self.def
    }

    fn table(&self) -> String {
        self.def.table_name()
    }

    /// Resolve a field name against the flattened catalogue: own fields
    /// shadow delegated ones.
    pub fn field_ref(&self, name: &str) -> Result<FieldRef<'a>> {
        if let Some(field) = self.def.fields.get(name) {
            return Ok(FieldRef::Own(field));
        }
        if let Some(delegated) = self.delegated.get(name) {
            return Ok(FieldRef::Delegated(delegated));
        }
        Err(StrataError::UnknownField {
            model: self.def.name.clone(),
            field: name.to_string(),
        })
    }

    pub fn field_def(&self, name: &str) -> Result<&'a FieldDefinition> {
        match self.field_ref(name)? {
            FieldRef::Own(f) => Ok(f),
            FieldRef::Delegated(d) => Ok(&d.def),
        }
    }

    /// Every accessible field name, own first, then delegated.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.def.fields.keys().cloned().collect();
        for name in self.delegated.keys() {
            if !self.def.fields.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// The "classic" prefetch group: every scalar/many2one field, own or
    /// delegated, not individually excluded from batching.
    pub fn prefetch_group(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .def
            .fields
            .iter()
            .filter(|(_, f)| f.prefetch())
            .map(|(n, _)| n.clone())
            .collect();
        for (name, delegated) in self.delegated.iter() {
            if !self.def.fields.contains_key(name) && delegated.def.prefetch() {
                names.push(name.clone());
            }
        }
        names
    }

    fn check_access(&self, operation: Operation, uid: i64) -> Result<()> {
        self.registry
            .access_control()
            .check(&self.def.name, operation, uid)
    }

    fn row_filter(&self, operation: Operation, uid: i64) -> Option<RowFilter> {
        self.registry
            .row_security()
            .domain(&self.def.name, operation, uid)
    }

    // ── Read ─────────────────────────────────────────────────────────

    /// Flat read: classic columns in chunked SELECTs (row-security
    /// verified), delegated fields batched per target model, pure computed
    /// fields evaluated per group, x2many fields as id lists. Rows come
    /// back in the order of `ids`; missing ids are skipped.
    pub fn read(
        &self,
        cr: &Cursor,
        uid: i64,
        ids: &[i64],
        fields: Option<&[String]>,
        ctx: &Context,
    ) -> Result<Vec<Map<String, Value>>> {
        self.check_access(Operation::Read, uid)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let requested: Vec<String> = match fields {
            Some(fields) => fields.to_vec(),
            None => self.field_names(),
        };
        for name in &requested {
            if name != LAST_UPDATE && name != "id" {
                self.field_ref(name)?;
            }
        }

        // Own stored columns, plus every delegation link (needed to merge
        // the target rows back in).
        let mut columns: Vec<String> = requested
            .iter()
            .filter(|n| {
                self.def
                    .fields
                    .get(*n)
                    .map(|f| f.is_stored())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for link in self.def.inherits.values() {
            if !columns.contains(link) {
                columns.push(link.clone());
            }
        }

        let mut select_parts: Vec<String> = vec!["id".to_string()];
        select_parts.extend(columns.iter().map(|c| format!("\"{c}\"")));
        if requested.iter().any(|n| n == LAST_UPDATE) {
            if self.def.log_access {
                select_parts
                    .push(format!("COALESCE(write_date, create_date) AS \"{LAST_UPDATE}\""));
            } else {
                select_parts.push(format!("CURRENT_TIMESTAMP AS \"{LAST_UPDATE}\""));
            }
        }

        let table = self.table();
        let filter = self.row_filter(Operation::Read, uid);
        let mut by_id: HashMap<i64, Map<String, Value>> = HashMap::new();
        for chunk in ids.chunks(IN_MAX) {
            let mut sql = format!(
                "SELECT {} FROM \"{table}\" WHERE id IN ({})",
                select_parts.join(", "),
                placeholders(chunk.len())
            );
            let mut params: Vec<SqlValue> =
                chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
            if let Some(filter) = &filter {
                sql.push_str(&format!(" AND ({})", filter.clause));
                params.extend(filter.params.iter().map(json_to_sql));
            }
            let rows = cr.query_rows(&sql, &params)?;
            if filter.is_some() {
                let distinct: HashSet<i64> = chunk.iter().copied().collect();
                if rows.len() != distinct.len() {
                    return Err(StrataError::RowSecurityViolation {
                        model: self.def.name.clone(),
                    });
                }
            }
            for row in rows {
                let id = row.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
                by_id.insert(id, row);
            }
        }
        let live_ids: Vec<i64> = ids
            .iter()
            .filter(|id| by_id.contains_key(id))
            .copied()
            .collect();

        // Delegated fields, one batched read per direct target.
        for (target, link) in &self.def.inherits {
            let wanted: Vec<String> = requested
                .iter()
                .filter(|n| !self.def.fields.contains_key(*n))
                .filter(|n| {
                    self.delegated
                        .get(*n)
                        .map(|d| &d.target == target)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let mut link_ids: Vec<i64> = by_id
                .values()
                .filter_map(|row| row.get(link).and_then(|v| v.as_i64()))
                .collect();
            link_ids.sort_unstable();
            link_ids.dedup();

            let target_rows =
                self.registry
                    .model(target)?
                    .read(cr, uid, &link_ids, Some(&wanted), ctx)?;
            let mut target_by_id: HashMap<i64, Map<String, Value>> = HashMap::new();
            for row in target_rows {
                let id = row.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
                target_by_id.insert(id, row);
            }
            for row in by_id.values_mut() {
                let link_id = row.get(link).and_then(|v| v.as_i64());
                if let Some(target_row) = link_id.and_then(|id| target_by_id.get(&id)) {
                    for name in &wanted {
                        if let Some(v) = target_row.get(name) {
                            row.insert(name.clone(), v.clone());
                        }
                    }
                }
            }
        }

        // Pure computed fields, grouped by their multi key.
        let computed: Vec<String> = requested
            .iter()
            .filter(|n| {
                self.def
                    .fields
                    .get(*n)
                    .map(|f| f.compute.is_some() && !f.is_stored())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !computed.is_empty() {
            let mut groups: Vec<(Option<String>, String, Vec<String>)> = Vec::new();
            for name in &computed {
                let spec = self.def.fields[name].compute.as_ref().expect("computed");
                match &spec.multi {
                    Some(multi) => {
                        if let Some(group) = groups
                            .iter_mut()
                            .find(|(k, _, _)| k.as_deref() == Some(multi))
                        {
                            group.2.push(name.clone());
                        } else {
                            groups.push((
                                Some(multi.clone()),
                                spec.function.clone(),
                                vec![name.clone()],
                            ));
                        }
                    }
                    None => groups.push((None, spec.function.clone(), vec![name.clone()])),
                }
            }
            for (_, function, group_fields) in groups {
                let compute = self.registry.compute(&function)?;
                for chunk in live_ids.chunks(IN_MAX) {
                    let values = compute(cr, self.registry, uid, chunk, &group_fields, ctx)?;
                    for id in chunk {
                        let row = by_id.get_mut(id).expect("live id");
                        for name in &group_fields {
                            let v = values
                                .get(id)
                                .and_then(|m| m.get(name))
                                .cloned()
                                .unwrap_or(Value::Null);
                            row.insert(name.clone(), v);
                        }
                    }
                }
            }
        }

        // One2many id lists.
        for name in &requested {
            let field = match self.def.fields.get(name) {
                Some(f) if f.kind == FieldType::One2many && f.compute.is_none() => f,
                _ => continue,
            };
            let (target, inverse) = match (&field.relation, &field.relation_field) {
                (Some(t), Some(i)) => (t.clone(), i.clone()),
                _ => continue,
            };
            let child_table = self.registry.table_of(&target);
            let child_order = self
                .registry
                .def(&target)
                .map(|d| d.order.clone())
                .unwrap_or_else(|_| "id".to_string());
            let mut grouped: HashMap<i64, Vec<Value>> = HashMap::new();
            for chunk in live_ids.chunks(IN_MAX) {
                let params: Vec<SqlValue> =
                    chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                let rows = cr.query_rows(
                    &format!(
                        "SELECT id, \"{inverse}\" AS rel_parent FROM \"{child_table}\" \
                         WHERE \"{inverse}\" IN ({}) ORDER BY {child_order}",
                        placeholders(chunk.len())
                    ),
                    &params,
                )?;
                for row in rows {
                    let parent = row.get("rel_parent").and_then(|v| v.as_i64()).unwrap_or(0);
                    let child = row.get("id").cloned().unwrap_or(Value::Null);
                    grouped.entry(parent).or_default().push(child);
                }
            }
            for (id, row) in by_id.iter_mut() {
                row.insert(
                    name.clone(),
                    Value::Array(grouped.remove(id).unwrap_or_default()),
                );
            }
        }

        // Many2many id lists, in relation-table order.
        for name in &requested {
            let field = match self.def.fields.get(name) {
                Some(f) if f.kind == FieldType::Many2many && f.compute.is_none() => f,
                _ => continue,
            };
            let rel = reconcile::relation_table(self.def, name, field);
            let (col1, col2) = reconcile::relation_columns(self.def, field);
            let mut grouped: HashMap<i64, Vec<Value>> = HashMap::new();
            for chunk in live_ids.chunks(IN_MAX) {
                let params: Vec<SqlValue> =
                    chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                let rows = cr.query_rows(
                    &format!(
                        "SELECT \"{col1}\" AS a, \"{col2}\" AS b FROM \"{rel}\" \
                         WHERE \"{col1}\" IN ({})",
                        placeholders(chunk.len())
                    ),
                    &params,
                )?;
                for row in rows {
                    let parent = row.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                    let child = row.get("b").cloned().unwrap_or(Value::Null);
                    grouped.entry(parent).or_default().push(child);
                }
            }
            for (id, row) in by_id.iter_mut() {
                row.insert(
                    name.clone(),
                    Value::Array(grouped.remove(id).unwrap_or_default()),
                );
            }
        }

        // Normalize: only requested keys plus id survive (the delegation
        // links were fetched for merging, not for the caller), every
        // requested key is present, and booleans come back as booleans.
        let mut result = Vec::with_capacity(live_ids.len());
        for id in &live_ids {
            let mut row = by_id.remove(id).expect("live id");
            let mut out = Map::new();
            out.insert("id".to_string(), Value::Number((*id).into()));
            for name in &requested {
                if name == "id" {
                    continue;
                }
                let kind = self
                    .field_def(name)
                    .map(|f| f.kind)
                    .unwrap_or(FieldType::Char);
                match row.remove(name) {
                    Some(v) => {
                        out.insert(name.clone(), column_value(kind, v));
                    }
                    None if name == LAST_UPDATE => {}
                    None => {
                        let empty = match kind {
                            FieldType::One2many | FieldType::Many2many => {
                                Value::Array(Vec::new())
                            }
                            _ => Value::Null,
                        };
                        out.insert(name.clone(), empty);
                    }
                }
            }
            result.push(out);
        }
        Ok(result)
    }

    // ── Search ───────────────────────────────────────────────────────

    fn search_sql(
        &self,
        cr: &Cursor,
        uid: i64,
        domain: &Domain,
        ctx: &Context,
    ) -> Result<(String, Vec<SqlValue>)> {
        let mut domain = domain.clone();
        if ctx.active_test
            && self.def.fields.contains_key("active")
            && !expr::mentions(&domain, "active")
        {
            domain.insert(0, Condition::new("active", Op::Eq, Value::Bool(true)));
        }

        let compiled = expr::compile(cr, self.registry, &self.def.name, &domain)?;
        let mut clause = compiled.clause;
        let mut params = compiled.params;
        if let Some(filter) = self.row_filter(Operation::Read, uid) {
            if clause.is_empty() {
                clause = format!("({})", filter.clause);
            } else {
                clause = format!("{clause} AND ({})", filter.clause);
            }
            params.extend(filter.params.iter().map(json_to_sql));
        }
        Ok((clause, params))
    }

    /// Ids matching the structured predicate. Inactive rows are filtered
    /// out when the model has an `active` field, unless the domain
    /// mentions it or the context disables the test.
    pub fn search(
        &self,
        cr: &Cursor,
        uid: i64,
        domain: &Domain,
        offset: Option<usize>,
        limit: Option<usize>,
        order: Option<&str>,
        ctx: &Context,
    ) -> Result<Vec<i64>> {
        self.check_access(Operation::Read, uid)?;
        let (clause, params) = self.search_sql(cr, uid, domain, ctx)?;

        let order_by = order.unwrap_or(&self.def.order);
        expr::check_order(order_by)?;

        let mut sql = format!("SELECT id FROM \"{}\"", self.table());
        if !clause.is_empty() {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        sql.push_str(&format!(" ORDER BY {order_by}"));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            if limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        cr.query_ids(&sql, &params)
    }

    pub fn search_count(
        &self,
        cr: &Cursor,
        uid: i64,
        domain: &Domain,
        ctx: &Context,
    ) -> Result<i64> {
        self.check_access(Operation::Read, uid)?;
        let (clause, params) = self.search_sql(cr, uid, domain, ctx)?;
        let mut sql = format!("SELECT count(id) FROM \"{}\"", self.table());
        if !clause.is_empty() {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        cr.query_int(&sql, &params)
    }

    /// Filter the given ids down to those that exist. Holding an id never
    /// implies the row is still there.
    pub fn exists(&self, cr: &Cursor, ids: &[i64]) -> Result<Vec<i64>> {
        let table = self.table();
        let mut alive = Vec::new();
        for chunk in ids.chunks(IN_MAX) {
            let params: Vec<SqlValue> = chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
            let found: HashSet<i64> = cr
                .query_ids(
                    &format!(
                        "SELECT id FROM \"{table}\" WHERE id IN ({})",
                        placeholders(chunk.len())
                    ),
                    &params,
                )?
                .into_iter()
                .collect();
            alive.extend(chunk.iter().filter(|id| found.contains(id)));
        }
        Ok(alive)
    }

    // ── Defaults ─────────────────────────────────────────────────────

    /// Layered default values for the requested fields: delegation
    /// targets' defaults, then the model's own, then the override
    /// collaborator, then context defaults; later layers win.
    pub fn default_get(
        &self,
        cr: &Cursor,
        uid: i64,
        fields: &[String],
        ctx: &Context,
    ) -> Result<Map<String, Value>> {
        let mut values = Map::new();

        for target in self.def.inherits.keys() {
            let target_values = self
                .registry
                .model(target)?
                .default_get(cr, uid, fields, ctx)?;
            for (k, v) in target_values {
                values.insert(k, v);
            }
        }

        for name in fields {
            if let Some(v) = self.registry.resolve_default(cr, uid, self.def, name)? {
                values.insert(name.clone(), v);
            }
        }

        for (name, value) in self
            .registry
            .default_overrides()
            .defaults(&self.def.name, uid)
        {
            if !fields.contains(&name) {
                continue;
            }
            if let Ok(field) = self.field_def(&name) {
                // A stale override pointing at a vanished row is dropped
                // rather than propagated.
                match field.kind {
                    FieldType::Many2one => {
                        if let (Some(target), Some(id)) = (&field.relation, value.as_i64()) {
                            if self.registry.model(target)?.exists(cr, &[id])?.is_empty() {
                                continue;
                            }
                        }
                    }
                    FieldType::Many2many => {
                        if let (Some(target), Some(ids)) = (&field.relation, value.as_array()) {
                            let ids: Vec<i64> =
                                ids.iter().filter_map(|v| v.as_i64()).collect();
                            let alive = self.registry.model(target)?.exists(cr, &ids)?;
                            values.insert(
                                name.clone(),
                                Value::Array(
                                    alive
                                        .into_iter()
                                        .map(|i| Value::Number(i.into()))
                                        .collect(),
                                ),
                            );
                            continue;
                        }
                    }
                    _ => {}
                }
                values.insert(name.clone(), value);
            }
        }

        for (name, value) in &ctx.defaults {
            if fields.contains(name) {
                values.insert(name.clone(), value.clone());
            }
        }

        Ok(values)
    }

    // ── Validation ───────────────────────────────────────────────────

    fn validate_selections(&self, vals: &Map<String, Value>) -> Result<()> {
        for (name, value) in vals {
            let field = match self.def.fields.get(name) {
                Some(f) => f,
                None => continue,
            };
            if value.is_null() {
                continue;
            }
            match field.kind {
                FieldType::Selection => {
                    let text = value.as_str().unwrap_or_default();
                    let ok = field
                        .selection
                        .as_ref()
                        .map(|options| options.iter().any(|(v, _)| v == text))
                        .unwrap_or(false);
                    if !ok {
                        return Err(StrataError::SelectionInvalid {
                            field: name.clone(),
                            value: text.to_string(),
                        });
                    }
                }
                FieldType::Reference => {
                    let text = value.as_str().unwrap_or_default();
                    let model = text.split(',').next().unwrap_or_default();
                    let ok = field
                        .models
                        .as_ref()
                        .map(|models| models.iter().any(|m| m == model))
                        .unwrap_or(false);
                    if !ok {
                        return Err(StrataError::SelectionInvalid {
                            field: name.clone(),
                            value: text.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run every declared constraint over the rows; all failures of the
    /// pass are collected and reported together.
    pub fn validate(&self, cr: &Cursor, uid: i64, ids: &[i64], ctx: &Context) -> Result<()> {
        if self.def.constraints.is_empty() || ids.is_empty() {
            return Ok(());
        }
        let lang = ctx.lang.as_deref().unwrap_or("en_US");
        let mut errors = Vec::new();
        for constraint in &self.def.constraints {
            let check = self.registry.constraint_fn(&constraint.function)?;
            if !check(cr, self.registry, uid, ids)? {
                let labels: Vec<String> = constraint
                    .fields
                    .iter()
                    .map(|f| {
                        self.field_def(f)
                            .map(|d| d.label_or(f))
                            .unwrap_or_else(|_| f.clone())
                    })
                    .collect();
                let message = self
                    .registry
                    .translations()
                    .source(
                        &self.def.name,
                        TranslationKind::Constraint,
                        lang,
                        &constraint.message,
                    )
                    .unwrap_or_else(|| constraint.message.clone());
                if labels.is_empty() {
                    errors.push(message);
                } else {
                    errors.push(format!("{}: {message}", labels.join(", ")));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StrataError::ValidationFailed { errors })
        }
    }

    // ── Concurrency ──────────────────────────────────────────────────

    fn check_concurrency(&self, cr: &Cursor, ids: &[i64], ctx: &Context) -> Result<()> {
        if !self.def.log_access || ctx.timestamps.is_empty() {
            return Ok(());
        }
        let table = self.table();
        let keyed: Vec<(i64, &String)> = ids
            .iter()
            .filter_map(|id| {
                ctx.timestamps
                    .get(&(self.def.name.clone(), *id))
                    .map(|stamp| (*id, stamp))
            })
            .collect();
        for chunk in keyed.chunks(IN_MAX / 2) {
            let clause = vec![
                "(id=? AND ? < COALESCE(write_date, create_date))";
                chunk.len()
            ]
            .join(" OR ");
            let mut params = Vec::new();
            for (id, stamp) in chunk {
                params.push(SqlValue::Integer(*id));
                params.push(SqlValue::Text((*stamp).clone()));
            }
            let stale = cr.query_int(
                &format!("SELECT count(1) FROM \"{table}\" WHERE {clause}"),
                &params,
            )?;
            if stale > 0 {
                return Err(StrataError::ConcurrencyConflict {
                    model: self.def.name.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Create ───────────────────────────────────────────────────────

    /// Insert one record: defaults for everything unsupplied, delegated
    /// values routed to freshly created (or merged) target rows, tree
    /// index extension, relational ops and custom setters after the row
    /// exists, constraint validation, then dependent stored-field
    /// recomputation.
    pub fn create(
        &self,
        cr: &Cursor,
        uid: i64,
        vals: Map<String, Value>,
        ctx: &Context,
    ) -> Result<i64> {
        self.check_access(Operation::Create, uid)?;
        let mut vals = vals;
        for name in vals.keys() {
            self.field_ref(name)?;
        }

        // Delegation targets whose link id arrives in vals are written to,
        // not created.
        let merge_targets: HashSet<String> = self
            .def
            .inherits
            .iter()
            .filter(|(_, link)| vals.get(*link).map(|v| !v.is_null()).unwrap_or(false))
            .map(|(target, _)| target.clone())
            .collect();

        // Defaults for every field not supplied.
        let mut missing: Vec<String> = Vec::new();
        for (name, field) in &self.def.fields {
            if !vals.contains_key(name) && field.compute.is_none() {
                missing.push(name.clone());
            }
        }
        for (name, delegated) in self.delegated.iter() {
            if self.def.fields.contains_key(name) || vals.contains_key(name) {
                continue;
            }
            if merge_targets.contains(&delegated.target) || delegated.def.compute.is_some() {
                continue;
            }
            missing.push(name.clone());
        }
        let defaults = self.default_get(cr, uid, &missing, ctx)?;
        for (name, value) in defaults {
            vals.entry(name).or_insert(value);
        }

        // Untouched booleans become false, keeping searches simple.
        for (name, field) in &self.def.fields {
            if field.kind == FieldType::Boolean
                && field.classic_write()
                && !vals.contains_key(name)
            {
                vals.insert(name.clone(), Value::Bool(false));
            }
        }

        self.validate_selections(&vals)?;

        // Partition: direct columns / delegated / applied-after-insert.
        let mut columns: Vec<(String, SqlValue)> = Vec::new();
        let mut post: Vec<(String, Value)> = Vec::new();
        let mut tocreate: HashMap<String, Map<String, Value>> = HashMap::new();
        for (name, value) in &vals {
            match self.field_ref(name)? {
                FieldRef::Own(field) => {
                    if field.classic_write() && field.setter.is_none() {
                        columns.push((name.clone(), column_param(field.kind, value)));
                    } else if field.setter.is_some()
                        || matches!(field.kind, FieldType::One2many | FieldType::Many2many)
                    {
                        post.push((name.clone(), value.clone()));
                    }
                    // Engine-owned stored computes are silently skipped.
                }
                FieldRef::Delegated(delegated) => {
                    tocreate
                        .entry(delegated.target.clone())
                        .or_default()
                        .insert(name.clone(), value.clone());
                }
            }
        }

        // Create or merge the delegation targets, then store their links.
        for (target, link) in &self.def.inherits {
            let target_vals = tocreate.remove(target).unwrap_or_default();
            let link_id = vals.get(link).and_then(|v| v.as_i64());
            match link_id {
                Some(existing) => {
                    if !target_vals.is_empty() {
                        self.registry
                            .model(target)?
                            .write(cr, uid, &[existing], target_vals, ctx)?;
                    }
                }
                None => {
                    let new_target =
                        self.registry
                            .model(target)?
                            .create(cr, uid, target_vals, ctx)?;
                    columns.retain(|(n, _)| n != link);
                    columns.push((link.clone(), SqlValue::Integer(new_target)));
                }
            }
        }

        if self.def.log_access {
            columns.push(("create_uid".to_string(), SqlValue::Integer(uid)));
            columns.push(("create_date".to_string(), SqlValue::Text(now_stamp())));
        }

        let table = self.table();
        let id = if columns.is_empty() {
            cr.insert(&format!("INSERT INTO \"{table}\" DEFAULT VALUES"), &[])?
        } else {
            let names: Vec<String> = columns.iter().map(|(n, _)| format!("\"{n}\"")).collect();
            let params: Vec<SqlValue> = columns.into_iter().map(|(_, v)| v).collect();
            cr.insert(
                &format!(
                    "INSERT INTO \"{table}\" ({}) VALUES ({})",
                    names.join(", "),
                    placeholders(params.len())
                ),
                &params,
            )?
        };

        if self.def.parent_field.is_some() && !ctx.defer_tree_index {
            let parent = self
                .def
                .parent_field
                .as_ref()
                .and_then(|p| vals.get(p))
                .and_then(|v| v.as_i64());
            tree::on_create(cr, self.def, id, parent)?;
        }

        post.sort_by_key(|(name, _)| (self.def.fields[name].priority, name.clone()));
        for (name, value) in post {
            let field = &self.def.fields[&name];
            if let Some(setter) = &field.setter {
                let set = self.registry.setter(setter)?;
                set(cr, self.registry, uid, id, &name, &value, ctx)?;
            } else {
                self.apply_relational(cr, uid, id, &name, field, &value, ctx)?;
            }
        }

        self.validate(cr, uid, &[id], ctx)?;

        if !ctx.no_recompute {
            let changed: Vec<String> = vals.keys().cloned().collect();
            let targets = depends::targets(
                cr,
                self.registry,
                uid,
                &self.def.name,
                &[id],
                Some(&changed),
                ctx,
            )?;
            for recompute in targets {
                depends::materialize(
                    cr,
                    self.registry,
                    uid,
                    &recompute.model,
                    &recompute.ids,
                    &recompute.fields,
                    ctx,
                )?;
            }
        }

        Ok(id)
    }

    // ── Write ────────────────────────────────────────────────────────

    /// Update records: optimistic concurrency check, row-security-verified
    /// column update, relational ops and setters in priority order,
    /// delegated values fanned out to the distinct target rows, constraint
    /// validation, reparenting for rows whose parent genuinely changed,
    /// then dependent recomputation.
    pub fn write(
        &self,
        cr: &Cursor,
        uid: i64,
        ids: &[i64],
        vals: Map<String, Value>,
        ctx: &Context,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut vals = vals;
        // The interval bounds are engine-owned; direct writes are dropped.
        vals.remove("parent_left");
        vals.remove("parent_right");
        for name in vals.keys() {
            self.field_ref(name)?;
        }

        self.check_concurrency(cr, ids, ctx)?;
        self.check_access(Operation::Write, uid)?;

        let table = self.table();

        // Rows whose parent actually changes; no-ops skip the re-indexing.
        let mut parents_changed: Vec<i64> = Vec::new();
        let mut parent_val: Option<i64> = None;
        if let Some(parent_field) = &self.def.parent_field {
            if let Some(value) = vals.get(parent_field) {
                parent_val = value.as_i64();
                for chunk in ids.chunks(IN_MAX) {
                    let mut params: Vec<SqlValue> =
                        chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                    let sql = match parent_val {
                        Some(p) => {
                            params.push(SqlValue::Integer(p));
                            format!(
                                "SELECT id FROM \"{table}\" WHERE id IN ({}) AND \
                                 (\"{parent_field}\" != ? OR \"{parent_field}\" IS NULL)",
                                placeholders(chunk.len())
                            )
                        }
                        None => format!(
                            "SELECT id FROM \"{table}\" WHERE id IN ({}) AND \
                             \"{parent_field}\" IS NOT NULL",
                            placeholders(chunk.len())
                        ),
                    };
                    parents_changed.extend(cr.query_ids(&sql, &params)?);
                }
            }
        }

        self.validate_selections(&vals)?;

        let mut assigns: Vec<(String, SqlValue)> = Vec::new();
        let mut post: Vec<(String, Value)> = Vec::new();
        let mut delegated_vals: HashMap<String, Map<String, Value>> = HashMap::new();
        for (name, value) in &vals {
            match self.field_ref(name)? {
                FieldRef::Own(field) => {
                    if field.classic_write() && field.setter.is_none() {
                        assigns.push((name.clone(), column_param(field.kind, value)));
                    } else if field.setter.is_some()
                        || matches!(field.kind, FieldType::One2many | FieldType::Many2many)
                    {
                        post.push((name.clone(), value.clone()));
                    }
                }
                FieldRef::Delegated(delegated) => {
                    delegated_vals
                        .entry(delegated.target.clone())
                        .or_default()
                        .insert(name.clone(), value.clone());
                }
            }
        }

        if !assigns.is_empty() || self.def.log_access {
            let mut set_parts: Vec<String> =
                assigns.iter().map(|(n, _)| format!("\"{n}\"=?")).collect();
            let mut set_params: Vec<SqlValue> =
                assigns.into_iter().map(|(_, v)| v).collect();
            if self.def.log_access {
                set_parts.push("write_uid=?".to_string());
                set_params.push(SqlValue::Integer(uid));
                set_parts.push("write_date=?".to_string());
                set_params.push(SqlValue::Text(now_stamp()));
            }

            let filter = self.row_filter(Operation::Write, uid);
            for chunk in ids.chunks(IN_MAX) {
                let distinct: HashSet<i64> = chunk.iter().copied().collect();
                let id_params: Vec<SqlValue> =
                    chunk.iter().map(|i| SqlValue::Integer(*i)).collect();

                let mut select_sql = format!(
                    "SELECT id FROM \"{table}\" WHERE id IN ({})",
                    placeholders(chunk.len())
                );
                let mut select_params = id_params.clone();
                if let Some(filter) = &filter {
                    select_sql.push_str(&format!(" AND ({})", filter.clause));
                    select_params.extend(filter.params.iter().map(json_to_sql));
                }
                let found = cr.query_ids(&select_sql, &select_params)?;
                if found.len() != distinct.len() {
                    if filter.is_some() {
                        return Err(StrataError::RowSecurityViolation {
                            model: self.def.name.clone(),
                        });
                    }
                    let missing = distinct
                        .iter()
                        .find(|id| !found.contains(id))
                        .copied()
                        .unwrap_or(0);
                    return Err(StrataError::NotFound {
                        model: self.def.name.clone(),
                        id: missing,
                    });
                }

                let mut update_sql = format!(
                    "UPDATE \"{table}\" SET {} WHERE id IN ({})",
                    set_parts.join(", "),
                    placeholders(chunk.len())
                );
                let mut update_params = set_params.clone();
                update_params.extend(id_params.iter().cloned());
                if let Some(filter) = &filter {
                    update_sql.push_str(&format!(" AND ({})", filter.clause));
                    update_params.extend(filter.params.iter().map(json_to_sql));
                }
                cr.execute(&update_sql, &update_params)?;
            }
        }

        post.sort_by_key(|(name, _)| (self.def.fields[name].priority, name.clone()));
        for (name, value) in post {
            let field = &self.def.fields[&name];
            for id in ids {
                if let Some(setter) = &field.setter {
                    let set = self.registry.setter(setter)?;
                    set(cr, self.registry, uid, *id, &name, &value, ctx)?;
                } else {
                    self.apply_relational(cr, uid, *id, &name, field, &value, ctx)?;
                }
            }
        }

        for (target, target_vals) in delegated_vals {
            let link = self.def.inherits[&target].clone();
            let mut link_ids = Vec::new();
            for chunk in ids.chunks(IN_MAX) {
                let params: Vec<SqlValue> =
                    chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                link_ids.extend(cr.query_ids(
                    &format!(
                        "SELECT DISTINCT \"{link}\" FROM \"{table}\" \
                         WHERE id IN ({}) AND \"{link}\" IS NOT NULL",
                        placeholders(chunk.len())
                    ),
                    &params,
                )?);
            }
            if !link_ids.is_empty() {
                self.registry
                    .model(&target)?
                    .write(cr, uid, &link_ids, target_vals, ctx)?;
            }
        }

        self.validate(cr, uid, ids, ctx)?;

        if !parents_changed.is_empty() && !ctx.defer_tree_index {
            for id in &parents_changed {
                tree::on_reparent(cr, self.def, *id, parent_val)?;
            }
        }

        if !ctx.no_recompute {
            let changed: Vec<String> = vals.keys().cloned().collect();
            let targets = depends::targets(
                cr,
                self.registry,
                uid,
                &self.def.name,
                ids,
                Some(&changed),
                ctx,
            )?;
            for recompute in targets {
                depends::materialize(
                    cr,
                    self.registry,
                    uid,
                    &recompute.model,
                    &recompute.ids,
                    &recompute.fields,
                    ctx,
                )?;
            }
        }

        Ok(())
    }

    // ── Unlink ───────────────────────────────────────────────────────

    /// Delete records. Dependent recomputation targets are gathered before
    /// the rows vanish (the mapping functions may need them), children of
    /// deleted tree nodes are adopted by their grandparent, and after the
    /// delete the precomputed recomputation runs against surviving rows of
    /// *other* models.
    pub fn unlink(&self, cr: &Cursor, uid: i64, ids: &[i64], ctx: &Context) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let pending = depends::targets(cr, self.registry, uid, &self.def.name, ids, None, ctx)?;

        self.check_concurrency(cr, ids, ctx)?;
        self.check_access(Operation::Unlink, uid)?;

        let pinned = self
            .registry
            .default_overrides()
            .blocks_unlink(&self.def.name, ids);
        if !pinned.is_empty() {
            return Err(StrataError::Other(format!(
                "unable to delete {}{:?}: referenced as a default value",
                self.def.name, pinned
            )));
        }

        tree::adopt_children(cr, self.def, ids)?;

        // Relation-table rows on both sides of any many2many.
        let table = self.table();
        for (name, field) in &self.def.fields {
            if field.kind == FieldType::Many2many && field.compute.is_none() {
                let rel = reconcile::relation_table(self.def, name, field);
                let (col1, _) = reconcile::relation_columns(self.def, field);
                for chunk in ids.chunks(IN_MAX) {
                    let params: Vec<SqlValue> =
                        chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                    cr.execute(
                        &format!(
                            "DELETE FROM \"{rel}\" WHERE \"{col1}\" IN ({})",
                            placeholders(chunk.len())
                        ),
                        &params,
                    )?;
                }
            }
        }
        for other_name in self.registry.model_names() {
            let other = match self.registry.def(other_name) {
                Ok(d) => d,
                Err(_) => continue,
            };
            for (name, field) in &other.fields {
                if field.kind == FieldType::Many2many
                    && field.compute.is_none()
                    && field.relation.as_deref() == Some(self.def.name.as_str())
                {
                    let rel = reconcile::relation_table(other, name, field);
                    let (_, col2) = reconcile::relation_columns(other, field);
                    for chunk in ids.chunks(IN_MAX) {
                        let params: Vec<SqlValue> =
                            chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
                        cr.execute(
                            &format!(
                                "DELETE FROM \"{rel}\" WHERE \"{col2}\" IN ({})",
                                placeholders(chunk.len())
                            ),
                            &params,
                        )?;
                    }
                }
            }
        }

        let filter = self.row_filter(Operation::Unlink, uid);
        for chunk in ids.chunks(IN_MAX) {
            let distinct: HashSet<i64> = chunk.iter().copied().collect();
            let id_params: Vec<SqlValue> =
                chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
            if let Some(filter) = &filter {
                let mut select_params = id_params.clone();
                select_params.extend(filter.params.iter().map(json_to_sql));
                let found = cr.query_int(
                    &format!(
                        "SELECT count(id) FROM \"{table}\" WHERE id IN ({}) AND ({})",
                        placeholders(chunk.len()),
                        filter.clause
                    ),
                    &select_params,
                )?;
                if found as usize != distinct.len() {
                    return Err(StrataError::RowSecurityViolation {
                        model: self.def.name.clone(),
                    });
                }
                let mut delete_params = id_params.clone();
                delete_params.extend(filter.params.iter().map(json_to_sql));
                cr.execute(
                    &format!(
                        "DELETE FROM \"{table}\" WHERE id IN ({}) AND ({})",
                        placeholders(chunk.len()),
                        filter.clause
                    ),
                    &delete_params,
                )?;
            } else {
                cr.execute(
                    &format!(
                        "DELETE FROM \"{table}\" WHERE id IN ({})",
                        placeholders(chunk.len())
                    ),
                    &id_params,
                )?;
            }
        }

        if !ctx.no_recompute {
            for recompute in pending {
                if recompute.model == self.def.name {
                    continue;
                }
                let survivors = self
                    .registry
                    .model(&recompute.model)?
                    .exists(cr, &recompute.ids)?;
                if !survivors.is_empty() {
                    depends::materialize(
                        cr,
                        self.registry,
                        uid,
                        &recompute.model,
                        &survivors,
                        &recompute.fields,
                        ctx,
                    )?;
                }
            }
        }

        Ok(())
    }

    // ── Relational ops ───────────────────────────────────────────────

    fn apply_relational(
        &self,
        cr: &Cursor,
        uid: i64,
        id: i64,
        name: &str,
        field: &FieldDefinition,
        value: &Value,
        ctx: &Context,
    ) -> Result<()> {
        let ops = parse_rel_ops(value)?;
        match field.kind {
            FieldType::One2many => self.apply_one2many(cr, uid, id, field, ops, ctx),
            FieldType::Many2many => self.apply_many2many(cr, uid, id, name, field, ops, ctx),
            _ => Err(StrataError::Other(format!(
                "field '{name}' does not accept relation operations"
            ))),
        }
    }

    fn apply_one2many(
        &self,
        cr: &Cursor,
        uid: i64,
        id: i64,
        field: &FieldDefinition,
        ops: Vec<RelOp>,
        ctx: &Context,
    ) -> Result<()> {
        let target = field
            .relation
            .clone()
            .ok_or_else(|| StrataError::Schema("one2many without relation".into()))?;
        let inverse = field
            .relation_field
            .clone()
            .ok_or_else(|| StrataError::Schema("one2many without relation_field".into()))?;
        let child = self.registry.model(&target)?;

        for op in ops {
            match op {
                RelOp::Create(mut vals) => {
                    vals.insert(inverse.clone(), Value::Number(id.into()));
                    child.create(cr, uid, vals, ctx)?;
                }
                RelOp::Update(cid, vals) => child.write(cr, uid, &[cid], vals, ctx)?,
                RelOp::Delete(cid) => child.unlink(cr, uid, &[cid], ctx)?,
                RelOp::Unlink(cid) => {
                    let mut vals = Map::new();
                    vals.insert(inverse.clone(), Value::Null);
                    child.write(cr, uid, &[cid], vals, ctx)?;
                }
                RelOp::Link(cid) => {
                    let mut vals = Map::new();
                    vals.insert(inverse.clone(), Value::Number(id.into()));
                    child.write(cr, uid, &[cid], vals, ctx)?;
                }
                RelOp::Clear | RelOp::Set(_) => {
                    let keep: Vec<i64> = match &op {
                        RelOp::Set(ids) => ids.clone(),
                        _ => Vec::new(),
                    };
                    let current = child.search(
                        cr,
                        uid,
                        &vec![Condition::new(&inverse, Op::Eq, Value::Number(id.into()))],
                        None,
                        None,
                        None,
                        &ctx.clone().without_active_test(),
                    )?;
                    let drop: Vec<i64> =
                        current.into_iter().filter(|c| !keep.contains(c)).collect();
                    if !drop.is_empty() {
                        let mut vals = Map::new();
                        vals.insert(inverse.clone(), Value::Null);
                        child.write(cr, uid, &drop, vals, ctx)?;
                    }
                    for cid in keep {
                        let mut vals = Map::new();
                        vals.insert(inverse.clone(), Value::Number(id.into()));
                        child.write(cr, uid, &[cid], vals, ctx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_many2many(
        &self,
        cr: &Cursor,
        uid: i64,
        id: i64,
        name: &str,
        field: &FieldDefinition,
        ops: Vec<RelOp>,
        ctx: &Context,
    ) -> Result<()> {
        let target = field
            .relation
            .clone()
            .ok_or_else(|| StrataError::Schema("many2many without relation".into()))?;
        let rel = reconcile::relation_table(self.def, name, field);
        let (col1, col2) = reconcile::relation_columns(self.def, field);
        let other = self.registry.model(&target)?;

        let link = |cid: i64| -> Result<()> {
            let present = cr.query_int(
                &format!(
                    "SELECT count(1) FROM \"{rel}\" WHERE \"{col1}\"=? AND \"{col2}\"=?"
                ),
                &[SqlValue::Integer(id), SqlValue::Integer(cid)],
            )?;
            if present == 0 {
                cr.execute(
                    &format!("INSERT INTO \"{rel}\" (\"{col1}\", \"{col2}\") VALUES (?, ?)"),
                    &[SqlValue::Integer(id), SqlValue::Integer(cid)],
                )?;
            }
            Ok(())
        };

        for op in ops {
            match op {
                RelOp::Create(vals) => {
                    let cid = other.create(cr, uid, vals, ctx)?;
                    link(cid)?;
                }
                RelOp::Update(cid, vals) => other.write(cr, uid, &[cid], vals, ctx)?,
                RelOp::Delete(cid) => other.unlink(cr, uid, &[cid], ctx)?,
                RelOp::Unlink(cid) => {
                    cr.execute(
                        &format!("DELETE FROM \"{rel}\" WHERE \"{col1}\"=? AND \"{col2}\"=?"),
                        &[SqlValue::Integer(id), SqlValue::Integer(cid)],
                    )?;
                }
                RelOp::Link(cid) => link(cid)?,
                RelOp::Clear => {
                    cr.execute(
                        &format!("DELETE FROM \"{rel}\" WHERE \"{col1}\"=?"),
                        &[SqlValue::Integer(id)],
                    )?;
                }
                RelOp::Set(ids) => {
                    cr.execute(
                        &format!("DELETE FROM \"{rel}\" WHERE \"{col1}\"=?"),
                        &[SqlValue::Integer(id)],
                    )?;
                    for cid in ids {
                        link(cid)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Copy ─────────────────────────────────────────────────────────

    /// Snapshot one record for duplication: computed fields and audit
    /// columns are excluded, many2one collapses to the id, one2many
    /// children are deep-copied recursively in id order (so sequence-
    /// correlated post-processing can zip old and new), many2many becomes
    /// a single Set, and delegation links are dropped so fresh target rows
    /// are created.
    pub fn copy_data(
        &self,
        cr: &Cursor,
        uid: i64,
        id: i64,
        default: Option<&Map<String, Value>>,
        ctx: &Context,
    ) -> Result<Map<String, Value>> {
        let links: HashSet<&String> = self.def.inherits.values().collect();
        let wanted: Vec<String> = self
            .field_names()
            .into_iter()
            .filter(|n| {
                self.field_def(n)
                    .map(|f| f.compute.is_none())
                    .unwrap_or(false)
            })
            .filter(|n| !links.contains(n))
            .collect();

        let row = self
            .read(cr, uid, &[id], Some(&wanted), ctx)?
            .into_iter()
            .next()
            .ok_or(StrataError::NotFound {
                model: self.def.name.clone(),
                id,
            })?;

        let mut data = Map::new();
        for (name, value) in row {
            if name == "id" {
                continue;
            }
            if let Some(default) = default {
                if let Some(v) = default.get(&name) {
                    data.insert(name, v.clone());
                    continue;
                }
            }
            let field = match self.field_def(&name) {
                Ok(f) => f,
                Err(_) => continue,
            };
            match field.kind {
                FieldType::One2many => {
                    let child = self
                        .registry
                        .model(field.relation.as_deref().unwrap_or_default())?;
                    let inverse = field.relation_field.clone().unwrap_or_default();
                    let mut child_ids: Vec<i64> = value
                        .as_array()
                        .map(|items| items.iter().filter_map(|v| v.as_i64()).collect())
                        .unwrap_or_default();
                    // Copy in id order; translation copying downstream
                    // relies on zipping old and new sequences pairwise.
                    child_ids.sort_unstable();
                    let mut ops = Vec::new();
                    for child_id in child_ids {
                        let mut child_data = child.copy_data(cr, uid, child_id, None, ctx)?;
                        child_data.remove(&inverse);
                        ops.push(Value::Array(vec![
                            Value::Number(0.into()),
                            Value::Number(0.into()),
                            Value::Object(child_data),
                        ]));
                    }
                    data.insert(name, Value::Array(ops));
                }
                FieldType::Many2many => {
                    let ids = value.as_array().cloned().unwrap_or_default();
                    data.insert(
                        name,
                        Value::Array(vec![Value::Array(vec![
                            Value::Number(6.into()),
                            Value::Number(0.into()),
                            Value::Array(ids),
                        ])]),
                    );
                }
                _ => {
                    data.insert(name, value);
                }
            }
        }
        if let Some(default) = default {
            for (name, value) in default {
                data.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(data)
    }

    pub fn copy(
        &self,
        cr: &Cursor,
        uid: i64,
        id: i64,
        default: Option<&Map<String, Value>>,
        ctx: &Context,
    ) -> Result<i64> {
        let data = self.copy_data(cr, uid, id, default, ctx)?;
        self.create(cr, uid, data, ctx)
    }

    // ── Introspection & naming ───────────────────────────────────────

    /// Field catalogue description: own and delegated fields with type,
    /// relation, selection options, flags, and translated labels.
    pub fn fields_get(
        &self,
        _uid: i64,
        allowed: Option<&[String]>,
        ctx: &Context,
    ) -> Result<Map<String, Value>> {
        let lang = ctx.lang.as_deref().unwrap_or("en_US");
        let mut result = Map::new();
        for name in self.field_names() {
            if let Some(allowed) = allowed {
                if !allowed.contains(&name) {
                    continue;
                }
            }
            let field = self.field_def(&name)?;
            let mut entry = Map::new();
            entry.insert("type".into(), Value::String(field.kind.as_str().to_string()));
            let label_key = format!("{},{name}", self.def.name);
            let label = self
                .registry
                .translations()
                .source(
                    &label_key,
                    TranslationKind::Field,
                    lang,
                    &field.label_or(&name),
                )
                .unwrap_or_else(|| field.label_or(&name));
            entry.insert("label".into(), Value::String(label));
            entry.insert("required".into(), Value::Bool(field.required));
            entry.insert(
                "readonly".into(),
                Value::Bool(field.readonly || field.compute.is_some()),
            );
            entry.insert("store".into(), Value::Bool(field.is_stored()));
            if field.translate {
                entry.insert("translate".into(), Value::Bool(true));
            }
            if let Some(size) = field.size {
                entry.insert("size".into(), Value::Number(size.into()));
            }
            if let Some(options) = &field.selection {
                let translated: Vec<Value> = options
                    .iter()
                    .map(|(value, label)| {
                        let label = self
                            .registry
                            .translations()
                            .source(&label_key, TranslationKind::Selection, lang, label)
                            .unwrap_or_else(|| label.clone());
                        Value::Array(vec![
                            Value::String(value.clone()),
                            Value::String(label),
                        ])
                    })
                    .collect();
                entry.insert("selection".into(), Value::Array(translated));
            }
            if let Some(relation) = &field.relation {
                entry.insert("relation".into(), Value::String(relation.clone()));
            }
            if let Some(inverse) = &field.relation_field {
                entry.insert("relation_field".into(), Value::String(inverse.clone()));
            }
            result.insert(name, Value::Object(entry));
        }
        Ok(result)
    }

    /// (id, display name) pairs from the record-name field.
    pub fn name_get(
        &self,
        cr: &Cursor,
        uid: i64,
        ids: &[i64],
        ctx: &Context,
    ) -> Result<Vec<(i64, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rec_name = if self.field_ref(&self.def.rec_name).is_ok() {
            self.def.rec_name.clone()
        } else {
            "id".to_string()
        };
        let rows = self.read(cr, uid, ids, Some(&[rec_name.clone()]), ctx)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let id = row.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
                let name = match row.get(&rec_name) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                (id, name)
            })
            .collect())
    }

    /// Search on the record-name field, returning name_get pairs.
    pub fn name_search(
        &self,
        cr: &Cursor,
        uid: i64,
        name: &str,
        domain: &Domain,
        limit: Option<usize>,
        ctx: &Context,
    ) -> Result<Vec<(i64, String)>> {
        let mut domain = domain.clone();
        if !name.is_empty() {
            domain.push(Condition::new(
                &self.def.rec_name,
                Op::ILike,
                Value::String(format!("%{name}%")),
            ));
        }
        let ids = self.search(cr, uid, &domain, None, limit, None, ctx)?;
        self.name_get(cr, uid, &ids, ctx)
    }

    /// Audit metadata per row: creator, last writer, and their timestamps.
    pub fn metadata(&self, cr: &Cursor, ids: &[i64]) -> Result<Vec<Map<String, Value>>> {
        let table = self.table();
        let columns = if self.def.log_access {
            "id, create_uid, create_date, write_uid, write_date"
        } else {
            "id"
        };
        let mut result = Vec::new();
        for chunk in ids.chunks(IN_MAX) {
            let params: Vec<SqlValue> = chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
            result.extend(cr.query_rows(
                &format!(
                    "SELECT {columns} FROM \"{table}\" WHERE id IN ({})",
                    placeholders(chunk.len())
                ),
                &params,
            )?);
        }
        Ok(result)
    }

    /// Cycle probe over any self-referencing many2one (the declared parent
    /// field by default).
    pub fn check_recursion(&self, cr: &Cursor, ids: &[i64], parent: Option<&str>) -> Result<()> {
        let field = match parent {
            Some(f) => f.to_string(),
            None => match &self.def.parent_field {
                Some(f) => f.clone(),
                None => return Ok(()),
            },
        };
        tree::check_recursion(cr, self.def, &field, ids)
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// One unit of work: a cursor, an actor, a context and a request-scoped
/// record cache. Mutations routed through the session invalidate the
/// touched parts of the cache, so handles never serve stale values within
/// the same request.
pub struct Session<'a, 'c> {
    registry: &'a ModelRegistry,
    cr: &'a Cursor<'c>,
    uid: i64,
    ctx: Context,
    cache: RecordCache,
}

impl<'a, 'c> Session<'a, 'c> {
    pub fn new(registry: &'a ModelRegistry, cr: &'a Cursor<'c>, uid: i64) -> Self {
        Session {
            registry,
            cr,
            uid,
            ctx: Context::default(),
            cache: RecordCache::new(),
        }
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn model(&self, name: &str) -> Result<Model<'a>> {
        self.registry.model(name)
    }

    pub fn browse(&self, model: &str, ids: &[i64]) -> Result<Vec<Handle<'_, 'c>>> {
        self.registry.def(model)?;
        Ok(ids
            .iter()
            .map(|id| {
                Handle::new(
                    &self.cache,
                    self.registry,
                    self.cr,
                    self.uid,
                    &self.ctx,
                    model,
                    *id,
                )
            })
            .collect())
    }

    pub fn browse_one(&self, model: &str, id: i64) -> Result<Handle<'_, 'c>> {
        Ok(self.browse(model, &[id])?.pop().expect("one handle"))
    }

    pub fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[String]>,
    ) -> Result<Vec<Map<String, Value>>> {
        self.model(model)?
            .read(self.cr, self.uid, ids, fields, &self.ctx)
    }

    pub fn search(&self, model: &str, domain: &Domain) -> Result<Vec<i64>> {
        self.model(model)?
            .search(self.cr, self.uid, domain, None, None, None, &self.ctx)
    }

    pub fn create(&self, model: &str, vals: Map<String, Value>) -> Result<i64> {
        let id = self
            .model(model)?
            .create(self.cr, self.uid, vals, &self.ctx)?;
        self.invalidate_after(model);
        Ok(id)
    }

    pub fn write(&self, model: &str, ids: &[i64], vals: Map<String, Value>) -> Result<()> {
        self.model(model)?
            .write(self.cr, self.uid, ids, vals, &self.ctx)?;
        self.cache.evict(model, ids);
        self.invalidate_after(model);
        Ok(())
    }

    pub fn unlink(&self, model: &str, ids: &[i64]) -> Result<()> {
        self.model(model)?
            .unlink(self.cr, self.uid, ids, &self.ctx)?;
        self.cache.evict(model, ids);
        self.invalidate_after(model);
        Ok(())
    }

    /// After a mutation, dependent stored fields may have changed on other
    /// models, and delegated writes may have touched target rows; drop
    /// whatever the cache holds for them.
    fn invalidate_after(&self, model: &str) {
        if let Some(entries) = self.registry.store_triggers().get(model) {
            let owners: HashSet<&str> =
                entries.iter().map(|e| e.owner_model.as_str()).collect();
            for owner in owners {
                self.cache.invalidate_model(owner);
            }
        }
        if let Ok(def) = self.registry.def(model) {
            for target in def.inherits.keys() {
                self.cache.invalidate_model(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessControl, RowSecurity, Translations};
    use crate::schema::{ComputeSpec, StoreTrigger};
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;

    fn vals(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn build_registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();

        registry
            .register(
                ModelDefinition::new("res.partner.category")
                    .field("name", FieldDefinition::char(64).required()),
            )
            .unwrap();

        registry
            .register(
                ModelDefinition::new("res.partner")
                    .field("name", FieldDefinition::char(64).required())
                    .field("active", FieldDefinition::new(FieldType::Boolean))
                    .field("city", FieldDefinition::char(32))
                    .field(
                        "kind",
                        FieldDefinition::selection_of(&[
                            ("person", "Person"),
                            ("company", "Company"),
                        ]),
                    )
                    .field(
                        "category_ids",
                        FieldDefinition::many2many("res.partner.category"),
                    )
                    .default_value("active", json!(true))
                    .default_value("kind", json!("person")),
            )
            .unwrap();

        registry
            .register(
                ModelDefinition::new("account.invoice")
                    .field(
                        "partner_id",
                        FieldDefinition::many2one("res.partner").required(),
                    )
                    .field("reference", FieldDefinition::char(32))
                    .field(
                        "line_ids",
                        FieldDefinition::one2many("account.invoice.line", "invoice_id"),
                    )
                    .field(
                        "total",
                        FieldDefinition::new(FieldType::Float).computed(ComputeSpec::stored(
                            "invoice_total",
                            vec![StoreTrigger::new(
                                "account.invoice.line",
                                Some("lines_to_invoices"),
                                &["price", "invoice_id"],
                                10,
                            )],
                        )),
                    )
                    .delegate("res.partner", "partner_id"),
            )
            .unwrap();

        registry
            .register(
                ModelDefinition::new("account.invoice.line")
                    .field("invoice_id", FieldDefinition::many2one("account.invoice"))
                    .field("label", FieldDefinition::char(64))
                    .field("price", FieldDefinition::new(FieldType::Float)),
            )
            .unwrap();

        registry
            .register(
                ModelDefinition::new("product.category")
                    .field("name", FieldDefinition::char(64).required())
                    .field("parent_id", FieldDefinition::many2one("product.category"))
                    .tree("parent_id"),
            )
            .unwrap();

        registry
            .register(
                ModelDefinition::new("sale.stat")
                    .field("qty", FieldDefinition::new(FieldType::Integer))
                    .field(
                        "base",
                        FieldDefinition::new(FieldType::Float).computed(ComputeSpec::stored(
                            "stat_base",
                            vec![StoreTrigger::new("sale.stat", None, &["qty"], 5)],
                        )),
                    )
                    .field(
                        "boosted",
                        FieldDefinition::new(FieldType::Float).computed(ComputeSpec::stored(
                            "stat_boosted",
                            vec![StoreTrigger::new("sale.stat", None, &["qty"], 20)],
                        )),
                    ),
            )
            .unwrap();

        registry.register_compute(
            "invoice_total",
            |cr: &Cursor,
             _reg: &ModelRegistry,
             _uid: i64,
             ids: &[i64],
             _fields: &[String],
             _ctx: &Context| {
                let mut out = HashMap::new();
                for id in ids {
                    let rows = cr.query_rows(
                        "SELECT COALESCE(sum(price), 0.0) AS t FROM account_invoice_line \
                         WHERE invoice_id=?",
                        &[SqlValue::Integer(*id)],
                    )?;
                    let total = rows[0]["t"].as_f64().unwrap_or(0.0);
                    let mut row = Map::new();
                    row.insert("total".to_string(), json!(total));
                    out.insert(*id, row);
                }
                Ok(out)
            },
        );
        registry.register_trigger_map(
            "lines_to_invoices",
            |cr: &Cursor, _reg: &ModelRegistry, _uid: i64, ids: &[i64], _ctx: &Context| {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let params: Vec<SqlValue> =
                    ids.iter().map(|i| SqlValue::Integer(*i)).collect();
                cr.query_ids(
                    &format!(
                        "SELECT DISTINCT invoice_id FROM account_invoice_line \
                         WHERE id IN ({}) AND invoice_id IS NOT NULL",
                        placeholders(ids.len())
                    ),
                    &params,
                )
            },
        );
        registry.register_compute(
            "stat_base",
            |cr: &Cursor,
             _reg: &ModelRegistry,
             _uid: i64,
             ids: &[i64],
             _fields: &[String],
             _ctx: &Context| {
                let mut out = HashMap::new();
                for id in ids {
                    let qty = cr.query_int(
                        "SELECT COALESCE(qty, 0) FROM sale_stat WHERE id=?",
                        &[SqlValue::Integer(*id)],
                    )?;
                    let mut row = Map::new();
                    row.insert("base".to_string(), json!(qty as f64 * 2.0));
                    out.insert(*id, row);
                }
                Ok(out)
            },
        );
        registry.register_compute(
            "stat_boosted",
            |cr: &Cursor,
             _reg: &ModelRegistry,
             _uid: i64,
             ids: &[i64],
             _fields: &[String],
             _ctx: &Context| {
                let mut out = HashMap::new();
                for id in ids {
                    // Reads the already-materialized lower-priority column.
                    let rows = cr.query_rows(
                        "SELECT COALESCE(base, 0.0) AS b FROM sale_stat WHERE id=?",
                        &[SqlValue::Integer(*id)],
                    )?;
                    let base = rows[0]["b"].as_f64().unwrap_or(0.0);
                    let mut row = Map::new();
                    row.insert("boosted".to_string(), json!(base + 1.0));
                    out.insert(*id, row);
                }
                Ok(out)
            },
        );

        registry
    }

    fn setup() -> (Connection, ModelRegistry) {
        let conn = Connection::open_in_memory().unwrap();
        let mut registry = build_registry();
        {
            let cr = Cursor::new(&conn);
            registry.setup(&cr, 1).unwrap();
        }
        (conn, registry)
    }

    fn ctx() -> Context {
        Context::default()
    }

    // ── Create / defaults ────────────────────────────────────────────

    #[test]
    fn test_create_applies_defaults() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["name", "active", "kind"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["name"], json!("Acme"));
        assert_eq!(row["active"], json!(true));
        assert_eq!(row["kind"], json!("person"));
    }

    #[test]
    fn test_create_unknown_field_rejected() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let err = partner
            .create(&cr, 1, vals(&[("nope", json!(1))]), &ctx())
            .unwrap_err();
        assert!(matches!(err, StrataError::UnknownField { .. }));
    }

    #[test]
    fn test_selection_value_validated() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let err = partner
            .create(
                &cr,
                1,
                vals(&[("name", json!("Acme")), ("kind", json!("robot"))]),
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, StrataError::SelectionInvalid { .. }));
    }

    #[test]
    fn test_context_default_wins_over_model_default() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let ctx = Context::default().with_default("kind", json!("company"));
        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx)
            .unwrap();
        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["kind"])), &ctx)
            .unwrap()
            .remove(0);
        assert_eq!(row["kind"], json!("company"));
    }

    // ── Delegation ───────────────────────────────────────────────────

    #[test]
    fn test_delegation_round_trip() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let invoice = registry.model("account.invoice").unwrap();
        let partner = registry.model("res.partner").unwrap();

        // Creating an invoice with a partner field creates the partner row.
        let inv = invoice
            .create(
                &cr,
                1,
                vals(&[("name", json!("Acme")), ("reference", json!("INV-1"))]),
                &ctx(),
            )
            .unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["name", "partner_id"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["name"], json!("Acme"));
        let partner_id = row["partner_id"].as_i64().unwrap();
        let direct = partner
            .read(&cr, 1, &[partner_id], Some(&fields(&["name"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(direct["name"], json!("Acme"));

        // Writing through the invoice lands on the partner row.
        invoice
            .write(&cr, 1, &[inv], vals(&[("name", json!("Acme SL"))]), &ctx())
            .unwrap();
        let direct = partner
            .read(&cr, 1, &[partner_id], Some(&fields(&["name"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(direct["name"], json!("Acme SL"));
        let through = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["name"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(through["name"], json!("Acme SL"));
    }

    #[test]
    fn test_delegation_merges_into_supplied_target() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let invoice = registry.model("account.invoice").unwrap();
        let partner = registry.model("res.partner").unwrap();

        let existing = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        let inv = invoice
            .create(
                &cr,
                1,
                vals(&[
                    ("partner_id", json!(existing)),
                    ("city", json!("Girona")),
                    ("reference", json!("INV-2")),
                ]),
                &ctx(),
            )
            .unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["partner_id"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["partner_id"], json!(existing));
        let direct = partner
            .read(&cr, 1, &[existing], Some(&fields(&["city"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(direct["city"], json!("Girona"));
    }

    // ── Tree index ───────────────────────────────────────────────────

    fn bounds(cr: &Cursor, id: i64) -> (i64, i64) {
        let row = cr
            .query_rows(
                "SELECT parent_left, parent_right FROM product_category WHERE id=?",
                &[SqlValue::Integer(id)],
            )
            .unwrap()
            .remove(0);
        (
            row["parent_left"].as_i64().unwrap(),
            row["parent_right"].as_i64().unwrap(),
        )
    }

    fn assert_tree_invariant(cr: &Cursor) {
        let rows = cr
            .query_rows(
                "SELECT id, parent_id, parent_left, parent_right FROM product_category",
                &[],
            )
            .unwrap();
        let nodes: Vec<(i64, Option<i64>, i64, i64)> = rows
            .iter()
            .map(|r| {
                (
                    r["id"].as_i64().unwrap(),
                    r["parent_id"].as_i64(),
                    r["parent_left"].as_i64().unwrap(),
                    r["parent_right"].as_i64().unwrap(),
                )
            })
            .collect();
        let parent_of: HashMap<i64, Option<i64>> =
            nodes.iter().map(|(id, p, _, _)| (*id, *p)).collect();
        let is_ancestor = |a: i64, b: i64| -> bool {
            let mut cursor = parent_of[&b];
            while let Some(p) = cursor {
                if p == a {
                    return true;
                }
                cursor = parent_of[&p];
            }
            false
        };

        for (id, _, left, right) in &nodes {
            assert!(left < right, "node {id} has left {left} >= right {right}");
        }
        for (a, _, al, ar) in &nodes {
            for (b, _, bl, br) in &nodes {
                if a == b {
                    continue;
                }
                assert_eq!(
                    is_ancestor(*a, *b),
                    al < bl && br < ar,
                    "ancestry/containment mismatch between {a} and {b}"
                );
                // Intervals are disjoint or strictly nested, never partial.
                let disjoint = ar < bl || br < al;
                let nested = (al < bl && br < ar) || (bl < al && ar < br);
                assert!(
                    disjoint || nested,
                    "intervals of {a} and {b} partially overlap"
                );
            }
        }
    }

    #[test]
    fn test_tree_create_and_reparent_scenario() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();

        let a = category
            .create(&cr, 1, vals(&[("name", json!("A"))]), &ctx())
            .unwrap();
        let b = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("B")), ("parent_id", json!(a))]),
                &ctx(),
            )
            .unwrap();
        let c = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("C")), ("parent_id", json!(b))]),
                &ctx(),
            )
            .unwrap();
        assert_tree_invariant(&cr);

        let (al, ar) = bounds(&cr, a);
        let (bl, br) = bounds(&cr, b);
        let (cl, crr) = bounds(&cr, c);
        assert!(al < bl && br < ar, "A must contain B");
        assert!(bl < cl && crr < br, "B must contain C");
        let a_width = ar - al;

        // Reparent C directly under A.
        category
            .write(&cr, 1, &[c], vals(&[("parent_id", json!(a))]), &ctx())
            .unwrap();
        assert_tree_invariant(&cr);

        let (al2, ar2) = bounds(&cr, a);
        let (bl2, br2) = bounds(&cr, b);
        let (cl2, cr2) = bounds(&cr, c);
        assert_eq!(ar2 - al2, a_width, "A keeps its total width");
        assert!(bl2 < br2 && !(bl2 < cl2 && cr2 < br2), "B no longer contains C");
        assert!(al2 < cl2 && cr2 < ar2, "C is inside A");
        assert!(cl2 > br2, "C sits after B");
    }

    #[test]
    fn test_reparent_cycle_rejected() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();

        let a = category
            .create(&cr, 1, vals(&[("name", json!("A"))]), &ctx())
            .unwrap();
        let b = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("B")), ("parent_id", json!(a))]),
                &ctx(),
            )
            .unwrap();

        let before_a = bounds(&cr, a);
        let before_b = bounds(&cr, b);
        let err = category
            .write(&cr, 1, &[a], vals(&[("parent_id", json!(b))]), &ctx())
            .unwrap_err();
        assert!(matches!(err, StrataError::RecursionDetected { .. }));
        // Bound arithmetic must not have started.
        assert_eq!(bounds(&cr, a), before_a);
        assert_eq!(bounds(&cr, b), before_b);
    }

    #[test]
    fn test_tree_delete_adopts_children() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();

        let a = category
            .create(&cr, 1, vals(&[("name", json!("A"))]), &ctx())
            .unwrap();
        let b = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("B")), ("parent_id", json!(a))]),
                &ctx(),
            )
            .unwrap();
        let c = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("C")), ("parent_id", json!(b))]),
                &ctx(),
            )
            .unwrap();

        category.unlink(&cr, 1, &[b], &ctx()).unwrap();
        let row = category
            .read(&cr, 1, &[c], Some(&fields(&["parent_id"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["parent_id"], json!(a));
        assert_tree_invariant(&cr);
    }

    #[test]
    fn test_tree_invariant_under_operation_sequence() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            let parent = if i == 0 {
                Value::Null
            } else {
                json!(ids[(i - 1) / 2])
            };
            let id = category
                .create(
                    &cr,
                    1,
                    vals(&[("name", json!(format!("n{i}"))), ("parent_id", parent)]),
                    &ctx(),
                )
                .unwrap();
            ids.push(id);
            assert_tree_invariant(&cr);
        }

        // A few reparents, checking the invariant after each.
        for (child, parent) in [(5usize, 0usize), (2, 1), (4, 2)] {
            category
                .write(
                    &cr,
                    1,
                    &[ids[child]],
                    vals(&[("parent_id", json!(ids[parent]))]),
                    &ctx(),
                )
                .unwrap();
            assert_tree_invariant(&cr);
        }

        // Reparenting to a root position works too.
        category
            .write(&cr, 1, &[ids[1]], vals(&[("parent_id", Value::Null)]), &ctx())
            .unwrap();
        assert_tree_invariant(&cr);
    }

    // ── Stored computed fields ───────────────────────────────────────

    #[test]
    fn test_stored_field_follows_trigger_rows() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let invoice = registry.model("account.invoice").unwrap();
        let line = registry.model("account.invoice.line").unwrap();

        let inv = invoice
            .create(
                &cr,
                1,
                vals(&[
                    ("name", json!("Acme")),
                    (
                        "line_ids",
                        json!([[0, 0, {"label": "a", "price": 10.0}],
                               [0, 0, {"label": "b", "price": 5.0}]]),
                    ),
                ]),
                &ctx(),
            )
            .unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["total"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["total"], json!(15.0));

        // Changing a trigger field on a line refreshes the stored value.
        let line_ids = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["line_ids"])), &ctx())
            .unwrap()
            .remove(0)["line_ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_i64())
            .collect::<Vec<_>>();
        line.write(
            &cr,
            1,
            &[line_ids[0]],
            vals(&[("price", json!(20.0))]),
            &ctx(),
        )
        .unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["total"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["total"], json!(25.0));

        // Deleting a line refreshes it too (targets gathered pre-delete).
        line.unlink(&cr, 1, &[line_ids[1]], &ctx()).unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["total"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["total"], json!(20.0));

        // A write to an untracked field leaves the stored value alone.
        line.write(
            &cr,
            1,
            &[line_ids[0]],
            vals(&[("label", json!("renamed"))]),
            &ctx(),
        )
        .unwrap();
        let row = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["total"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["total"], json!(20.0));
    }

    #[test]
    fn test_dependency_priority_ordering() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let stat = registry.model("sale.stat").unwrap();

        let id = stat
            .create(&cr, 1, vals(&[("qty", json!(3))]), &ctx())
            .unwrap();
        let row = stat
            .read(&cr, 1, &[id], Some(&fields(&["base", "boosted"])), &ctx())
            .unwrap()
            .remove(0);
        // boosted reads base's column, so priority 5 must run before 20.
        assert_eq!(row["base"], json!(6.0));
        assert_eq!(row["boosted"], json!(7.0));

        stat.write(&cr, 1, &[id], vals(&[("qty", json!(10))]), &ctx())
            .unwrap();
        let row = stat
            .read(&cr, 1, &[id], Some(&fields(&["base", "boosted"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["base"], json!(20.0));
        assert_eq!(row["boosted"], json!(21.0));
    }

    #[test]
    fn test_recompute_suppressed_by_context() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let stat = registry.model("sale.stat").unwrap();
        let quiet = Context::default().without_recompute();

        let id = stat.create(&cr, 1, vals(&[("qty", json!(3))]), &quiet).unwrap();
        let row = stat
            .read(&cr, 1, &[id], Some(&fields(&["base"])), &quiet)
            .unwrap()
            .remove(0);
        assert_eq!(row["base"], Value::Null);
    }

    // ── Concurrency ──────────────────────────────────────────────────

    #[test]
    fn test_concurrency_conflict_on_stale_timestamp() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        let stamp = partner
            .read(&cr, 1, &[id], Some(&fields(&[LAST_UPDATE])), &ctx())
            .unwrap()
            .remove(0)[LAST_UPDATE]
            .as_str()
            .unwrap()
            .to_string();

        // A write with the fresh stamp passes and advances write_date.
        let fresh = Context::default().with_timestamp("res.partner", id, &stamp);
        partner
            .write(&cr, 1, &[id], vals(&[("city", json!("Girona"))]), &fresh)
            .unwrap();

        // The original stamp is now stale; nothing may be written.
        let stale = Context::default().with_timestamp("res.partner", id, &stamp);
        let err = partner
            .write(&cr, 1, &[id], vals(&[("city", json!("Figueres"))]), &stale)
            .unwrap_err();
        assert!(matches!(err, StrataError::ConcurrencyConflict { .. }));
        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["city"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["city"], json!("Girona"));
    }

    // ── Search ───────────────────────────────────────────────────────

    #[test]
    fn test_search_filters_inactive_rows() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let alive = partner
            .create(&cr, 1, vals(&[("name", json!("Alive"))]), &ctx())
            .unwrap();
        let hidden = partner
            .create(
                &cr,
                1,
                vals(&[("name", json!("Hidden")), ("active", json!(false))]),
                &ctx(),
            )
            .unwrap();

        let found = partner
            .search(&cr, 1, &Vec::new(), None, None, None, &ctx())
            .unwrap();
        assert!(found.contains(&alive));
        assert!(!found.contains(&hidden));

        let all = partner
            .search(
                &cr,
                1,
                &Vec::new(),
                None,
                None,
                None,
                &Context::default().without_active_test(),
            )
            .unwrap();
        assert!(all.contains(&hidden));

        let explicit = partner
            .search(
                &cr,
                1,
                &vec![Condition::new("active", Op::Eq, json!(false))],
                None,
                None,
                None,
                &ctx(),
            )
            .unwrap();
        assert_eq!(explicit, vec![hidden]);
    }

    #[test]
    fn test_search_operators_and_order() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let a = partner
            .create(&cr, 1, vals(&[("name", json!("Alpha"))]), &ctx())
            .unwrap();
        let b = partner
            .create(&cr, 1, vals(&[("name", json!("Beta"))]), &ctx())
            .unwrap();

        let like = partner
            .search(
                &cr,
                1,
                &vec![Condition::new("name", Op::Like, json!("%lph%"))],
                None,
                None,
                None,
                &ctx(),
            )
            .unwrap();
        assert_eq!(like, vec![a]);

        let both = partner
            .search(
                &cr,
                1,
                &vec![Condition::new("id", Op::In, json!([a, b]))],
                None,
                None,
                Some("name desc"),
                &ctx(),
            )
            .unwrap();
        assert_eq!(both, vec![b, a]);

        let err = partner
            .search(&cr, 1, &Vec::new(), None, None, Some("name; drop"), &ctx())
            .unwrap_err();
        assert!(matches!(err, StrataError::Other(_)));

        assert_eq!(
            partner.search_count(&cr, 1, &Vec::new(), &ctx()).unwrap(),
            2
        );
    }

    #[test]
    fn test_search_child_of_uses_bounds() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();

        let a = category
            .create(&cr, 1, vals(&[("name", json!("A"))]), &ctx())
            .unwrap();
        let b = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("B")), ("parent_id", json!(a))]),
                &ctx(),
            )
            .unwrap();
        let c = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("C")), ("parent_id", json!(b))]),
                &ctx(),
            )
            .unwrap();
        let other = category
            .create(&cr, 1, vals(&[("name", json!("Other"))]), &ctx())
            .unwrap();

        let mut subtree = category
            .search(
                &cr,
                1,
                &vec![Condition::new("id", Op::ChildOf, json!(a))],
                None,
                None,
                None,
                &ctx(),
            )
            .unwrap();
        subtree.sort_unstable();
        assert_eq!(subtree, vec![a, b, c]);
        assert!(!subtree.contains(&other));
    }

    // ── Validation ───────────────────────────────────────────────────

    #[test]
    fn test_validation_collects_all_failures() {
        let conn = Connection::open_in_memory().unwrap();
        let mut registry = ModelRegistry::new();
        registry
            .register(
                ModelDefinition::new("checked")
                    .field("amount", FieldDefinition::new(FieldType::Float).labelled("Amount"))
                    .constraint("always_fails_1", "amount must be positive", &["amount"])
                    .constraint("always_fails_2", "amount must be even", &["amount"]),
            )
            .unwrap();
        registry.register_constraint(
            "always_fails_1",
            |_cr: &Cursor, _reg: &ModelRegistry, _uid: i64, _ids: &[i64]| Ok(false),
        );
        registry.register_constraint(
            "always_fails_2",
            |_cr: &Cursor, _reg: &ModelRegistry, _uid: i64, _ids: &[i64]| Ok(false),
        );
        {
            let cr = Cursor::new(&conn);
            registry.setup(&cr, 1).unwrap();
        }

        let cr = Cursor::new(&conn);
        let model = registry.model("checked").unwrap();
        let err = model
            .create(&cr, 1, vals(&[("amount", json!(-1.0))]), &ctx())
            .unwrap_err();
        match err {
            StrataError::ValidationFailed { errors } => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("Amount"));
                assert!(errors[0].contains("positive"));
                assert!(errors[1].contains("even"));
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    // ── Collaborators ────────────────────────────────────────────────

    struct DenyUnlink;

    impl AccessControl for DenyUnlink {
        fn check(&self, model: &str, operation: Operation, _uid: i64) -> Result<()> {
            if operation == Operation::Unlink {
                return Err(crate::access::denied(model, operation));
            }
            Ok(())
        }
    }

    #[test]
    fn test_access_control_is_consulted() {
        let (conn, mut registry) = setup();
        registry.set_access_control(Box::new(DenyUnlink));
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        let err = partner.unlink(&cr, 1, &[id], &ctx()).unwrap_err();
        assert!(matches!(err, StrataError::AccessDenied { .. }));
        assert_eq!(partner.exists(&cr, &[id]).unwrap(), vec![id]);
    }

    struct GironaOnly;

    impl RowSecurity for GironaOnly {
        fn domain(&self, model: &str, _operation: Operation, _uid: i64) -> Option<RowFilter> {
            if model == "res.partner" {
                Some(RowFilter {
                    clause: "city = ?".to_string(),
                    params: vec![json!("Girona")],
                })
            } else {
                None
            }
        }
    }

    #[test]
    fn test_row_security_verified_not_silently_applied() {
        let (conn, mut registry) = setup();
        let cr = Cursor::new(&conn);
        let outsider = registry
            .model("res.partner")
            .unwrap()
            .create(
                &cr,
                1,
                vals(&[("name", json!("Far")), ("city", json!("Lleida"))]),
                &ctx(),
            )
            .unwrap();
        let insider = registry
            .model("res.partner")
            .unwrap()
            .create(
                &cr,
                1,
                vals(&[("name", json!("Near")), ("city", json!("Girona"))]),
                &ctx(),
            )
            .unwrap();

        registry.set_row_security(Box::new(GironaOnly));
        let partner = registry.model("res.partner").unwrap();

        // Search narrows silently; read of a forbidden row is a violation.
        let found = partner
            .search(&cr, 1, &Vec::new(), None, None, None, &ctx())
            .unwrap();
        assert_eq!(found, vec![insider]);

        let ok = partner
            .read(&cr, 1, &[insider], Some(&fields(&["name"])), &ctx())
            .unwrap();
        assert_eq!(ok.len(), 1);
        let err = partner
            .read(&cr, 1, &[outsider], Some(&fields(&["name"])), &ctx())
            .unwrap_err();
        assert!(matches!(err, StrataError::RowSecurityViolation { .. }));

        let err = partner
            .write(
                &cr,
                1,
                &[outsider],
                vals(&[("name", json!("Hacked"))]),
                &ctx(),
            )
            .unwrap_err();
        assert!(matches!(err, StrataError::RowSecurityViolation { .. }));
    }

    struct Catalan;

    impl Translations for Catalan {
        fn source(
            &self,
            _name: &str,
            kind: TranslationKind,
            lang: &str,
            original: &str,
        ) -> Option<String> {
            if lang == "ca_ES" && kind == TranslationKind::Field && original == "name" {
                return Some("Nom".to_string());
            }
            None
        }
    }

    #[test]
    fn test_fields_get_translates_labels() {
        let (conn, mut registry) = setup();
        let _ = conn;
        registry.set_translations(Box::new(Catalan));
        let partner = registry.model("res.partner").unwrap();

        let plain = partner.fields_get(1, None, &ctx()).unwrap();
        assert_eq!(plain["name"]["label"], json!("name"));
        assert_eq!(plain["name"]["type"], json!("char"));
        assert_eq!(plain["name"]["required"], json!(true));
        assert_eq!(plain["category_ids"]["relation"], json!("res.partner.category"));

        let catalan = partner
            .fields_get(1, None, &Context::default().with_lang("ca_ES"))
            .unwrap();
        assert_eq!(catalan["name"]["label"], json!("Nom"));
    }

    // ── Relations ────────────────────────────────────────────────────

    #[test]
    fn test_many2many_ops() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let category = registry.model("res.partner.category").unwrap();

        let c1 = category
            .create(&cr, 1, vals(&[("name", json!("Gold"))]), &ctx())
            .unwrap();
        let c2 = category
            .create(&cr, 1, vals(&[("name", json!("OEM"))]), &ctx())
            .unwrap();
        let id = partner
            .create(
                &cr,
                1,
                vals(&[("name", json!("Acme")), ("category_ids", json!([c1, c2]))]),
                &ctx(),
            )
            .unwrap();

        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["category_ids"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["category_ids"], json!([c1, c2]));

        partner
            .write(
                &cr,
                1,
                &[id],
                vals(&[("category_ids", json!([[3, c1]]))]),
                &ctx(),
            )
            .unwrap();
        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["category_ids"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["category_ids"], json!([c2]));

        // Deleting a category cleans the relation rows up.
        category.unlink(&cr, 1, &[c2], &ctx()).unwrap();
        let row = partner
            .read(&cr, 1, &[id], Some(&fields(&["category_ids"])), &ctx())
            .unwrap()
            .remove(0);
        assert_eq!(row["category_ids"], json!([]));
    }

    // ── Copy ─────────────────────────────────────────────────────────

    #[test]
    fn test_copy_deep_copies_children_in_order() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let invoice = registry.model("account.invoice").unwrap();

        let inv = invoice
            .create(
                &cr,
                1,
                vals(&[
                    ("name", json!("Acme")),
                    (
                        "line_ids",
                        json!([[0, 0, {"label": "first", "price": 1.0}],
                               [0, 0, {"label": "second", "price": 2.0}]]),
                    ),
                ]),
                &ctx(),
            )
            .unwrap();

        let copy_id = invoice.copy(&cr, 1, inv, None, &ctx()).unwrap();
        assert_ne!(copy_id, inv);

        let original = invoice
            .read(&cr, 1, &[inv], Some(&fields(&["line_ids", "total", "partner_id"])), &ctx())
            .unwrap()
            .remove(0);
        let copied = invoice
            .read(
                &cr,
                1,
                &[copy_id],
                Some(&fields(&["line_ids", "total", "partner_id", "name"])),
                &ctx(),
            )
            .unwrap()
            .remove(0);

        // Fresh children, same order of labels, stored total recomputed.
        assert_ne!(original["line_ids"], copied["line_ids"]);
        assert_eq!(copied["line_ids"].as_array().unwrap().len(), 2);
        assert_eq!(copied["total"], json!(3.0));
        // Delegation target rows are duplicated, not shared.
        assert_ne!(original["partner_id"], copied["partner_id"]);
        assert_eq!(copied["name"], json!("Acme"));

        let line = registry.model("account.invoice.line").unwrap();
        let copied_line_ids: Vec<i64> = copied["line_ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        let labels: Vec<Value> = line
            .read(&cr, 1, &copied_line_ids, Some(&fields(&["label"])), &ctx())
            .unwrap()
            .into_iter()
            .map(|mut r| r.remove("label").unwrap())
            .collect();
        assert_eq!(labels, vec![json!("first"), json!("second")]);
    }

    // ── Cache / handles ──────────────────────────────────────────────

    #[test]
    fn test_cache_batching_matches_unbatched_reads() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                partner
                    .create(
                        &cr,
                        1,
                        vals(&[
                            ("name", json!(format!("p{i}"))),
                            ("city", json!(format!("c{i}"))),
                        ]),
                        &ctx(),
                    )
                    .unwrap(),
            );
        }

        let session = Session::new(&registry, &cr, 1);
        let handles = session.browse("res.partner", &ids).unwrap();
        // One access faults the classic group in for every handle.
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.value("name").unwrap(), json!(format!("p{i}")));
            assert_eq!(
                session.cache().cached("res.partner", ids[i], "city"),
                Some(json!(format!("c{i}")))
            );
        }

        let flat = partner
            .read(&cr, 1, &ids, Some(&fields(&["name", "city"])), &ctx())
            .unwrap();
        for (handle, row) in handles.iter().zip(&flat) {
            assert_eq!(handle.value("name").unwrap(), row["name"]);
            assert_eq!(handle.value("city").unwrap(), row["city"]);
        }
    }

    #[test]
    fn test_handles_navigate_relations() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let invoice = registry.model("account.invoice").unwrap();

        let inv = invoice
            .create(
                &cr,
                1,
                vals(&[
                    ("name", json!("Acme")),
                    (
                        "line_ids",
                        json!([[0, 0, {"label": "a", "price": 10.0}]]),
                    ),
                ]),
                &ctx(),
            )
            .unwrap();

        let session = Session::new(&registry, &cr, 1);
        let handle = session.browse_one("account.invoice", inv).unwrap();

        match handle.get("partner_id").unwrap() {
            crate::cache::Resolved::Record(Some(p)) => {
                assert_eq!(p.model(), "res.partner");
                assert_eq!(p.value("name").unwrap(), json!("Acme"));
            }
            _ => panic!("expected a partner handle"),
        }
        match handle.get("line_ids").unwrap() {
            crate::cache::Resolved::Records(lines) => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines[0].value("label").unwrap(), json!("a"));
            }
            _ => panic!("expected line handles"),
        }
        let err = handle.value("nope").unwrap_err();
        assert!(matches!(err, StrataError::UnknownField { .. }));
    }

    #[test]
    fn test_session_write_invalidates_cache() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);

        let session = Session::new(&registry, &cr, 1);
        let id = session
            .create("res.partner", vals(&[("name", json!("Acme"))]))
            .unwrap();
        let handle = session.browse_one("res.partner", id).unwrap();
        assert_eq!(handle.value("name").unwrap(), json!("Acme"));

        session
            .write("res.partner", &[id], vals(&[("name", json!("Acme SL"))]))
            .unwrap();
        let handle = session.browse_one("res.partner", id).unwrap();
        assert_eq!(handle.value("name").unwrap(), json!("Acme SL"));
    }

    #[test]
    fn test_handle_identity() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let session_a = Session::new(&registry, &cr, 1);
        let session_b = Session::new(&registry, &cr, 1);

        let a = session_a.browse_one("res.partner", 7).unwrap();
        let b = session_b.browse_one("res.partner", 7).unwrap();
        let c = session_a.browse_one("res.partner", 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    // ── Misc surface ─────────────────────────────────────────────────

    #[test]
    fn test_exists_filters_dangling_ids() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        assert_eq!(partner.exists(&cr, &[id, id + 99]).unwrap(), vec![id]);
    }

    #[test]
    fn test_name_search() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme Industries"))]), &ctx())
            .unwrap();
        partner
            .create(&cr, 1, vals(&[("name", json!("Globex"))]), &ctx())
            .unwrap();

        let found = partner
            .name_search(&cr, 1, "Indus", &Vec::new(), None, &ctx())
            .unwrap();
        assert_eq!(found, vec![(id, "Acme Industries".to_string())]);
    }

    #[test]
    fn test_metadata_reports_audit_columns() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let id = partner
            .create(&cr, 1, vals(&[("name", json!("Acme"))]), &ctx())
            .unwrap();
        partner
            .write(&cr, 7, &[id], vals(&[("city", json!("Girona"))]), &ctx())
            .unwrap();

        let meta = partner.metadata(&cr, &[id]).unwrap().remove(0);
        assert_eq!(meta["create_uid"], json!(1));
        assert_eq!(meta["write_uid"], json!(7));
        assert!(meta["write_date"].is_string());
    }

    #[test]
    fn test_parse_rel_ops() {
        assert_eq!(
            parse_rel_ops(&json!([1, 2, 3])).unwrap(),
            vec![RelOp::Set(vec![1, 2, 3])]
        );
        assert_eq!(
            parse_rel_ops(&json!([[6, 0, [4, 5]]])).unwrap(),
            vec![RelOp::Set(vec![4, 5])]
        );
        assert_eq!(parse_rel_ops(&json!([[5]])).unwrap(), vec![RelOp::Clear]);
        assert!(matches!(
            parse_rel_ops(&json!([[0, 0, {"a": 1}]])).unwrap()[0],
            RelOp::Create(_)
        ));
        assert!(parse_rel_ops(&json!("nope")).is_err());
        assert!(parse_rel_ops(&json!([[9, 0]])).is_err());
    }

    #[test]
    fn test_check_recursion_probe() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let category = registry.model("product.category").unwrap();
        let a = category
            .create(&cr, 1, vals(&[("name", json!("A"))]), &ctx())
            .unwrap();
        let b = category
            .create(
                &cr,
                1,
                vals(&[("name", json!("B")), ("parent_id", json!(a))]),
                &ctx(),
            )
            .unwrap();
        assert!(category.check_recursion(&cr, &[b], None).is_ok());

        // Force a raw cycle behind the store's back; the probe reports it.
        cr.execute(
            "UPDATE product_category SET parent_id=? WHERE id=?",
            &[SqlValue::Integer(b), SqlValue::Integer(a)],
        )
        .unwrap();
        let err = category.check_recursion(&cr, &[a], None).unwrap_err();
        assert!(matches!(err, StrataError::RecursionDetected { .. }));
    }

    #[test]
    fn test_write_missing_row_is_not_found() {
        let (conn, registry) = setup();
        let cr = Cursor::new(&conn);
        let partner = registry.model("res.partner").unwrap();
        let err = partner
            .write(&cr, 1, &[999], vals(&[("name", json!("X"))]), &ctx())
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound { .. }));
    }

    #[test]
    fn test_unrestricted_row_security_is_default() {
        // Sanity check that the default collaborator set stays permissive.
        let registry = ModelRegistry::new();
        assert!(registry
            .row_security()
            .domain("res.partner", Operation::Read, 1)
            .is_none());
    }
}
