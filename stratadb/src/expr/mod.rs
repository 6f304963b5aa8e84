use crate::cursor::{json_to_sql, placeholders, Cursor};
use crate::error::{Result, StrataError};
use crate::registry::ModelRegistry;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Comparison operators accepted in a structured predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    In,
    NotIn,
    /// Matches the named rows and their whole subtrees.
    ChildOf,
}

/// One (field, operator, value) triple.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(field: &str, op: Op, value: Value) -> Self {
        Condition {
            field: field.to_string(),
            op,
            value,
        }
    }
}

/// A conjunction of conditions over one model's own columns.
pub type Domain = Vec<Condition>;

/// A compiled predicate: SQL fragment plus bound parameters.
#[derive(Debug, Clone)]
pub struct CompiledDomain {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

/// Compile a structured predicate into a store-native condition. Fields
/// must be stored columns of the model itself (`id` included); anything
/// else is rejected before touching SQL.
pub fn compile(
    cr: &Cursor,
    registry: &ModelRegistry,
    model: &str,
    domain: &Domain,
) -> Result<CompiledDomain> {
    let def = registry.def(model)?;
    let mut clauses = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    for cond in domain {
        if cond.field != "id" {
            let field = def.fields.get(&cond.field).ok_or_else(|| {
                StrataError::UnknownField {
                    model: model.to_string(),
                    field: cond.field.clone(),
                }
            })?;
            if !field.is_stored() {
                return Err(StrataError::Other(format!(
                    "cannot search on non-stored field '{}' of '{}'",
                    cond.field, model
                )));
            }
        }

        match cond.op {
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let sym = match cond.op {
                    Op::Eq => "=",
                    Op::Ne => "!=",
                    Op::Lt => "<",
                    Op::Le => "<=",
                    Op::Gt => ">",
                    Op::Ge => ">=",
                    _ => unreachable!(),
                };
                if cond.value.is_null() {
                    // NULL never compares equal through the operators.
                    match cond.op {
                        Op::Eq => clauses.push(format!("\"{}\" IS NULL", cond.field)),
                        Op::Ne => clauses.push(format!("\"{}\" IS NOT NULL", cond.field)),
                        _ => {
                            return Err(StrataError::Other(format!(
                                "cannot order-compare '{}' against null",
                                cond.field
                            )))
                        }
                    }
                } else {
                    clauses.push(format!("\"{}\" {} ?", cond.field, sym));
                    params.push(json_to_sql(&cond.value));
                }
            }
            Op::Like | Op::ILike => {
                clauses.push(format!("\"{}\" LIKE ?", cond.field));
                params.push(json_to_sql(&cond.value));
            }
            Op::In | Op::NotIn => {
                let items = cond.value.as_array().ok_or_else(|| {
                    StrataError::Other(format!("'{}' (not) in expects a list", cond.field))
                })?;
                if items.is_empty() {
                    clauses.push(if cond.op == Op::In { "0=1" } else { "1=1" }.to_string());
                    continue;
                }
                let not = if cond.op == Op::NotIn { "NOT " } else { "" };
                clauses.push(format!(
                    "\"{}\" {}IN ({})",
                    cond.field,
                    not,
                    placeholders(items.len())
                ));
                params.extend(items.iter().map(json_to_sql));
            }
            Op::ChildOf => {
                let (clause, mut child_params) =
                    compile_child_of(cr, registry, model, &cond.value)?;
                clauses.push(clause);
                params.append(&mut child_params);
            }
        }
    }

    Ok(CompiledDomain {
        clause: clauses.join(" AND "),
        params,
    })
}

/// Expand a child_of condition. Tree-indexed models use the interval
/// bounds directly; a model with a plain parent field gets an iterative
/// descendant walk instead.
fn compile_child_of(
    cr: &Cursor,
    registry: &ModelRegistry,
    model: &str,
    value: &Value,
) -> Result<(String, Vec<SqlValue>)> {
    let def = registry.def(model)?;
    let roots = ids_of(value)?;
    if roots.is_empty() {
        return Ok(("0=1".to_string(), Vec::new()));
    }
    let table = def.table_name();

    let parent_field = match &def.parent_field {
        Some(f) => f.clone(),
        None => {
            // No declared hierarchy: child_of degrades to id in roots.
            let params: Vec<SqlValue> = roots.iter().map(|i| SqlValue::Integer(*i)).collect();
            return Ok((format!("id IN ({})", placeholders(roots.len())), params));
        }
    };

    if registry.has_tree_index(model) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let sql = format!(
            "SELECT parent_left, parent_right FROM \"{table}\" WHERE id IN ({})",
            placeholders(roots.len())
        );
        let root_params: Vec<SqlValue> = roots.iter().map(|i| SqlValue::Integer(*i)).collect();
        for row in cr.query_rows(&sql, &root_params)? {
            let left = row["parent_left"].as_i64().unwrap_or(0);
            let right = row["parent_right"].as_i64().unwrap_or(0);
            clauses.push("(parent_left >= ? AND parent_right <= ?)".to_string());
            params.push(SqlValue::Integer(left));
            params.push(SqlValue::Integer(right));
        }
        if clauses.is_empty() {
            return Ok(("0=1".to_string(), Vec::new()));
        }
        return Ok((format!("({})", clauses.join(" OR ")), params));
    }

    // Plain parent-field walk, breadth first.
    let mut all: Vec<i64> = roots.clone();
    let mut frontier = roots;
    while !frontier.is_empty() {
        let sql = format!(
            "SELECT id FROM \"{table}\" WHERE \"{parent_field}\" IN ({})",
            placeholders(frontier.len())
        );
        let params: Vec<SqlValue> = frontier.iter().map(|i| SqlValue::Integer(*i)).collect();
        let children: Vec<i64> = cr
            .query_ids(&sql, &params)?
            .into_iter()
            .filter(|c| !all.contains(c))
            .collect();
        all.extend(children.iter().copied());
        frontier = children;
    }

    let params: Vec<SqlValue> = all.iter().map(|i| SqlValue::Integer(*i)).collect();
    Ok((format!("id IN ({})", placeholders(all.len())), params))
}

fn ids_of(value: &Value) -> Result<Vec<i64>> {
    match value {
        Value::Number(n) => Ok(vec![n.as_i64().unwrap_or(0)]),
        Value::Array(items) => Ok(items.iter().filter_map(|v| v.as_i64()).collect()),
        _ => Err(StrataError::Other(
            "child_of expects an id or a list of ids".to_string(),
        )),
    }
}

/// Validate an ORDER BY clause before it is interpolated into a query.
pub fn check_order(order: &str) -> Result<()> {
    let re = Regex::new(r#"(?i)^(([a-z0-9_]+|"[a-z0-9_]+")( +desc| +asc)?( *, *|))+$"#)
        .expect("order regex is valid");
    if !re.is_match(order) {
        return Err(StrataError::Other(format!("bad order clause: {order}")));
    }
    Ok(())
}

/// Whether the domain already constrains the given field (used for the
/// implicit active filter).
pub fn mentions(domain: &Domain, field: &str) -> bool {
    domain.iter().any(|c| c.field == field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_order() {
        assert!(check_order("id").is_ok());
        assert!(check_order("name desc, id").is_ok());
        assert!(check_order("\"name\" ASC").is_ok());
        assert!(check_order("name; DROP TABLE x").is_err());
        assert!(check_order("name || x").is_err());
    }

    #[test]
    fn test_mentions() {
        let domain = vec![Condition::new("active", Op::Eq, json!(false))];
        assert!(mentions(&domain, "active"));
        assert!(!mentions(&domain, "name"));
    }
}
