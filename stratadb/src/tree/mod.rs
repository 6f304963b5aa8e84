use crate::cursor::{placeholders, Cursor};
use crate::error::{Result, StrataError};
use crate::schema::ModelDefinition;
use rusqlite::types::Value as SqlValue;

/// Nested-set maintenance for models declaring a parent field. Every row
/// carries (parent_left, parent_right) with left < right; A is an ancestor
/// of B iff A.left < B.left and B.right < A.right, and any two intervals
/// are either disjoint or strictly nested. Deleting rows leaves holes in
/// the numbering, which the invariant tolerates; `rebuild` restores a
/// compact sequence.

fn order_clause(def: &ModelDefinition) -> String {
    def.parent_order.clone().unwrap_or_else(|| def.order.clone())
}

/// Full recompute of the interval bounds: depth-first pre-order from the
/// NULL-parent roots, assigning sequential integers.
pub fn rebuild(cr: &Cursor, def: &ModelDefinition) -> Result<()> {
    let parent_field = match &def.parent_field {
        Some(f) => f.clone(),
        None => return Ok(()),
    };
    let table = def.table_name();
    let order = order_clause(def);
    log::info!("computing parent_left and parent_right for table {table}");

    let roots = cr.query_ids(
        &format!("SELECT id FROM \"{table}\" WHERE \"{parent_field}\" IS NULL ORDER BY {order}"),
        &[],
    )?;
    let mut pos = 0;
    for root in roots {
        pos = number_subtree(cr, &table, &parent_field, &order, root, pos)?;
    }
    Ok(())
}

fn number_subtree(
    cr: &Cursor,
    table: &str,
    parent_field: &str,
    order: &str,
    id: i64,
    pos: i64,
) -> Result<i64> {
    let children = cr.query_ids(
        &format!("SELECT id FROM \"{table}\" WHERE \"{parent_field}\"=? ORDER BY {order}"),
        &[SqlValue::Integer(id)],
    )?;
    let mut pos2 = pos + 1;
    for child in children {
        pos2 = number_subtree(cr, table, parent_field, order, child, pos2)?;
    }
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_left=?, parent_right=? WHERE id=?"),
        &[
            SqlValue::Integer(pos),
            SqlValue::Integer(pos2),
            SqlValue::Integer(id),
        ],
    )?;
    Ok(pos2 + 1)
}

/// Slot a freshly inserted row into the index: open a 2-wide gap right
/// after the parent's last child (or after the parent's own left bound if
/// childless, or after everything for a new root) and take it.
pub fn on_create(cr: &Cursor, def: &ModelDefinition, id: i64, parent: Option<i64>) -> Result<()> {
    let parent_field = match &def.parent_field {
        Some(f) => f.clone(),
        None => return Ok(()),
    };
    let table = def.table_name();
    let order = order_clause(def);

    let gap_after = match parent {
        Some(parent_id) => {
            let rows = cr.query_rows(
                &format!(
                    "SELECT parent_right FROM \"{table}\" WHERE \"{parent_field}\"=? AND id!=? ORDER BY {order}"
                ),
                &[SqlValue::Integer(parent_id), SqlValue::Integer(id)],
            )?;
            let last_child = rows
                .iter()
                .filter_map(|r| r["parent_right"].as_i64())
                .last();
            match last_child {
                Some(right) => right,
                None => cr.query_int(
                    &format!("SELECT parent_left FROM \"{table}\" WHERE id=?"),
                    &[SqlValue::Integer(parent_id)],
                )?,
            }
        }
        None => {
            let rows = cr.query_rows(
                &format!("SELECT max(parent_right) AS m FROM \"{table}\" WHERE id!=?"),
                &[SqlValue::Integer(id)],
            )?;
            rows.first().and_then(|r| r["m"].as_i64()).unwrap_or(0)
        }
    };

    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_left=parent_left+2 WHERE parent_left>?"),
        &[SqlValue::Integer(gap_after)],
    )?;
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_right=parent_right+2 WHERE parent_right>?"),
        &[SqlValue::Integer(gap_after)],
    )?;
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_left=?, parent_right=? WHERE id=?"),
        &[
            SqlValue::Integer(gap_after + 1),
            SqlValue::Integer(gap_after + 2),
            SqlValue::Integer(id),
        ],
    )?;
    Ok(())
}

/// Move a row (and its whole subtree) under a new parent, keeping the
/// numbering compact: the subtree is parked in negative space, the gap it
/// occupied is closed, a fresh gap of the same width opens under the new
/// parent, and the subtree lands in it. All bound arithmetic happens
/// inside the caller's unit of work, so concurrent readers in other
/// transactions never observe a partially shifted set. Moving a row under
/// its own subtree is rejected with RecursionDetected before any bound is
/// touched.
pub fn on_reparent(
    cr: &Cursor,
    def: &ModelDefinition,
    id: i64,
    new_parent: Option<i64>,
) -> Result<()> {
    if def.parent_field.is_none() {
        return Ok(());
    }
    let table = def.table_name();

    let row = cr
        .query_rows(
            &format!("SELECT parent_left, parent_right FROM \"{table}\" WHERE id=?"),
            &[SqlValue::Integer(id)],
        )?
        .into_iter()
        .next()
        .ok_or(StrataError::NotFound {
            model: def.name.clone(),
            id,
        })?;
    let left = row["parent_left"].as_i64().unwrap_or(0);
    let right = row["parent_right"].as_i64().unwrap_or(0);
    let width = right - left + 1;

    // The new parent must not live inside the moved subtree.
    if let Some(parent_id) = new_parent {
        let parent_left = cr.query_int(
            &format!("SELECT parent_left FROM \"{table}\" WHERE id=?"),
            &[SqlValue::Integer(parent_id)],
        )?;
        if left <= parent_left && parent_left <= right {
            return Err(StrataError::RecursionDetected {
                model: def.name.clone(),
            });
        }
    }

    // Park the subtree at [-width, -1], out of the way of every live bound.
    cr.execute(
        &format!(
            "UPDATE \"{table}\" SET parent_left=parent_left-?, parent_right=parent_right-? \
             WHERE parent_left>=? AND parent_left<=?"
        ),
        &[
            SqlValue::Integer(left + width),
            SqlValue::Integer(left + width),
            SqlValue::Integer(left),
            SqlValue::Integer(right),
        ],
    )?;

    // Close the gap it left behind.
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_left=parent_left-? WHERE parent_left>?"),
        &[SqlValue::Integer(width), SqlValue::Integer(right)],
    )?;
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_right=parent_right-? WHERE parent_right>?"),
        &[SqlValue::Integer(width), SqlValue::Integer(right)],
    )?;

    // Insertion point, in the updated numbering: as the new parent's last
    // child, or after the last root.
    let position = match new_parent {
        Some(parent_id) => cr.query_int(
            &format!("SELECT parent_right FROM \"{table}\" WHERE id=?"),
            &[SqlValue::Integer(parent_id)],
        )?,
        None => {
            let rows = cr.query_rows(
                &format!("SELECT max(parent_right) AS m FROM \"{table}\" WHERE parent_right>=0"),
                &[],
            )?;
            rows.first().and_then(|r| r["m"].as_i64()).unwrap_or(0) + 1
        }
    };

    // Open a gap of the subtree's width and land it there.
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_left=parent_left+? WHERE parent_left>=?"),
        &[SqlValue::Integer(width), SqlValue::Integer(position)],
    )?;
    cr.execute(
        &format!("UPDATE \"{table}\" SET parent_right=parent_right+? WHERE parent_right>=?"),
        &[SqlValue::Integer(width), SqlValue::Integer(position)],
    )?;
    cr.execute(
        &format!(
            "UPDATE \"{table}\" SET parent_left=parent_left+?, parent_right=parent_right+? \
             WHERE parent_left<0"
        ),
        &[
            SqlValue::Integer(position + width),
            SqlValue::Integer(position + width),
        ],
    )?;
    Ok(())
}

/// Reparent the children of rows about to be deleted to each row's own
/// parent. Their bounds stay nested inside the grandparent's interval, so
/// no shifting is needed.
pub fn adopt_children(cr: &Cursor, def: &ModelDefinition, ids: &[i64]) -> Result<()> {
    let parent_field = match &def.parent_field {
        Some(f) => f.clone(),
        None => return Ok(()),
    };
    let table = def.table_name();
    for id in ids {
        cr.execute(
            &format!(
                "UPDATE \"{table}\" SET \"{parent_field}\"=\
                 (SELECT \"{parent_field}\" FROM \"{table}\" WHERE id=?) \
                 WHERE \"{parent_field}\"=?"
            ),
            &[SqlValue::Integer(*id), SqlValue::Integer(*id)],
        )?;
    }
    Ok(())
}

/// Walk the parent chain of the given rows; Ok(()) if it terminates,
/// RecursionDetected if it loops back into the starting set. Usable from
/// constraint declarations on any many2one self-relation.
pub fn check_recursion(
    cr: &Cursor,
    def: &ModelDefinition,
    parent_field: &str,
    ids: &[i64],
) -> Result<()> {
    let table = def.table_name();
    let mut seen: std::collections::HashSet<i64> = ids.iter().copied().collect();
    let mut frontier: Vec<i64> = ids.to_vec();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for chunk in frontier.chunks(crate::cursor::IN_MAX) {
            let params: Vec<SqlValue> = chunk.iter().map(|i| SqlValue::Integer(*i)).collect();
            let parents = cr.query_ids(
                &format!(
                    "SELECT DISTINCT \"{parent_field}\" FROM \"{table}\" \
                     WHERE id IN ({}) AND \"{parent_field}\" IS NOT NULL",
                    placeholders(chunk.len())
                ),
                &params,
            )?;
            next.extend(parents);
        }
        if next.iter().any(|p| ids.contains(p)) {
            return Err(StrataError::RecursionDetected {
                model: def.name.clone(),
            });
        }
        frontier = next.into_iter().filter(|p| seen.insert(*p)).collect();
    }
    Ok(())
}
