use crate::error::Result;
use crate::schema::FieldType;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Number, Value};

/// Upper bound on ids per SQL statement. Reads, updates and deletes over
/// larger id sets are split into chunks of this size.
pub const IN_MAX: usize = 200;

/// The ambient transactional unit of work. A cursor wraps a
/// caller-supplied connection; it never opens, commits or rolls back the
/// outer transaction itself; isolated sub-steps use savepoints.
pub struct Cursor<'c> {
    conn: &'c Connection,
}

impl<'c> Cursor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Cursor { conn }
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Execute a statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let n = self
            .conn
            .execute(sql, params_from_iter(params.iter().cloned()))?;
        Ok(n)
    }

    /// Execute one or more statements with no parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Execute an INSERT and return the assigned monotonic row id.
    pub fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.conn
            .execute(sql, params_from_iter(params.iter().cloned()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Run a SELECT, returning each row as a JSON object keyed by column
    /// name.
    pub fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Map<String, Value>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let rows = stmt.query_map(params_from_iter(params.iter().cloned()), |row| {
            let mut obj = Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let val: SqlValue = row.get(i)?;
                obj.insert(name.clone(), sql_to_json(val));
            }
            Ok(obj)
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Run a SELECT whose first column is an integer id.
    pub fn query_ids(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter().cloned()), |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Run a SELECT returning a single integer (count queries and friends).
    pub fn query_int(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        let n = self
            .conn
            .query_row(sql, params_from_iter(params.iter().cloned()), |row| {
                row.get(0)
            })?;
        Ok(n)
    }

    // ── Savepoints ───────────────────────────────────────────────────

    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.conn.execute_batch(&format!("SAVEPOINT \"{name}\""))?;
        Ok(())
    }

    pub fn rollback_to(&self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT \"{name}\""))?;
        Ok(())
    }

    pub fn release(&self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT \"{name}\""))?;
        Ok(())
    }
}

/// Build a "?,?,..." placeholder list of the given arity.
pub fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// Convert a stored SQLite value to its JSON form.
pub fn sql_to_json(val: SqlValue) -> Value {
    match val {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Number(n.into()),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Convert a field value to its bindable column form. Many2one values may
/// arrive as `[id, label]` pairs and collapse to the id; false booleans
/// become 0, and a JSON null is a SQL NULL regardless of kind.
pub fn column_param(kind: FieldType, val: &Value) -> SqlValue {
    match (kind, val) {
        (_, Value::Null) => SqlValue::Null,
        (FieldType::Many2one, Value::Array(items)) => items
            .first()
            .map(json_to_sql)
            .unwrap_or(SqlValue::Null),
        (FieldType::Boolean, v) => SqlValue::Integer(i64::from(v.as_bool().unwrap_or(false))),
        (_, v) => json_to_sql(v),
    }
}

/// Normalize a raw column value to the field's JSON form on the way out of
/// the store (booleans come back as 0/1 integers).
pub fn column_value(kind: FieldType, val: Value) -> Value {
    match (kind, &val) {
        (FieldType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
        _ => val,
    }
}

/// Convert a JSON value to a bindable SQLite value. Booleans map to 0/1;
/// arrays and objects are serialized as JSON text.
pub fn json_to_sql(val: &Value) -> SqlValue {
    match val {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE things (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, qty INTEGER)",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_returns_monotonic_ids() {
        let conn = setup();
        let cr = Cursor::new(&conn);
        let a = cr
            .insert(
                "INSERT INTO things (name) VALUES (?)",
                &[SqlValue::Text("a".into())],
            )
            .unwrap();
        let b = cr
            .insert(
                "INSERT INTO things (name) VALUES (?)",
                &[SqlValue::Text("b".into())],
            )
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_query_rows_as_json() {
        let conn = setup();
        let cr = Cursor::new(&conn);
        cr.execute(
            "INSERT INTO things (name, qty) VALUES (?, ?)",
            &[SqlValue::Text("widget".into()), SqlValue::Integer(3)],
        )
        .unwrap();

        let rows = cr
            .query_rows("SELECT id, name, qty FROM things", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("widget"));
        assert_eq!(rows[0]["qty"], json!(3));
    }

    #[test]
    fn test_savepoint_rollback() {
        let conn = setup();
        let cr = Cursor::new(&conn);
        cr.savepoint("sp1").unwrap();
        cr.execute(
            "INSERT INTO things (name) VALUES (?)",
            &[SqlValue::Text("doomed".into())],
        )
        .unwrap();
        cr.rollback_to("sp1").unwrap();
        cr.release("sp1").unwrap();

        let count = cr.query_int("SELECT count(*) FROM things", &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_json_round_trip() {
        assert_eq!(json_to_sql(&json!(true)), SqlValue::Integer(1));
        assert_eq!(json_to_sql(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(sql_to_json(SqlValue::Text("x".into())), json!("x"));
        assert_eq!(sql_to_json(SqlValue::Null), Value::Null);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(3), "?,?,?");
    }
}
