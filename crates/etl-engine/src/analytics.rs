//! Per-tenant analytical databases
//!
//! Each owner has one SQLite file under the data directory. The transform
//! step loads source files and inline rows into tables there and runs the
//! workflow query against them.
//!
//! Table and column names come from user data (file names, CSV headers, JSON
//! keys), so every identifier passes [`validate_identifier`] and is quoted
//! before it reaches generated SQL. Values are always bound, never
//! interpolated.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Executor, Row, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::StepError;
use crate::pipeline::{Row as JsonRow, TransformResult};

/// Table inline API rows are loaded into
pub const SOURCE_DATA_TABLE: &str = "source_data";

const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

const RESERVED: &[&str] = &[
    "all", "alter", "and", "as", "attach", "between", "by", "case", "check", "column", "commit",
    "create", "cross", "default", "delete", "detach", "distinct", "drop", "else", "end", "exists",
    "from", "group", "having", "in", "index", "inner", "insert", "into", "is", "join", "key",
    "left", "like", "limit", "not", "null", "on", "or", "order", "pragma", "primary",
    "references", "rollback", "select", "set", "table", "then", "transaction", "union", "update",
    "using", "vacuum", "values", "when", "where",
];

/// Accept `name` only if it is a plain identifier: letters, digits and
/// underscores, not starting with a digit, at most 63 characters and not a
/// reserved word
pub fn validate_identifier(name: &str) -> Result<&str, StepError> {
    let reserved = RESERVED.contains(&name.to_ascii_lowercase().as_str());
    if name.len() > MAX_IDENTIFIER_LEN || !IDENTIFIER.is_match(name) || reserved {
        return Err(StepError::UnsafeIdentifier(name.to_string()));
    }
    Ok(name)
}

/// Double-quote a validated identifier
pub fn quote_identifier(name: &str) -> Result<String, StepError> {
    Ok(format!("\"{}\"", validate_identifier(name)?))
}

/// Turn an arbitrary label (file stem, CSV header) into a safe identifier
pub fn sanitize_identifier(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if name.is_empty() {
        name.push_str("col");
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    if RESERVED.contains(&name.to_ascii_lowercase().as_str()) {
        name.push('_');
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// Sanitise a list of column labels, keeping them unique
fn sanitize_columns<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .into_iter()
        .map(|label| {
            let base = sanitize_identifier(label);
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.to_ascii_lowercase()) {
                name = format!("{}_{}", &base[..base.len().min(MAX_IDENTIFIER_LEN - 4)], n);
                n += 1;
            }
            name
        })
        .collect()
}

/// Parse CSV with a header row. Cells become integers, floats, text or NULL.
pub fn parse_csv(bytes: &[u8]) -> Result<(Vec<String>, Vec<Vec<Value>>), StepError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row: Vec<Value> = record.iter().map(infer_cell).collect();
        row.resize(headers.len(), Value::Null);
        rows.push(row);
    }
    Ok((headers, rows))
}

fn infer_cell(cell: &str) -> Value {
    let cell = cell.trim();
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = cell.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(n) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(cell.to_string())
}

/// Parse a JSON array of objects, or a single object
pub fn parse_json_rows(bytes: &[u8]) -> Result<Vec<JsonRow>, StepError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => Ok(items.into_iter().map(into_row).collect()),
        Value::Object(map) => Ok(vec![map]),
        other => Err(StepError::InvalidConfig(format!(
            "expected JSON array of objects, found {}",
            json_kind(&other)
        ))),
    }
}

/// Column that holds scalars and stands in for an empty feed
const VALUE_COLUMN: &str = "value";

/// Coerce a JSON value into a row; scalars become `{"value": v}`
pub fn into_row(value: Value) -> JsonRow {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(VALUE_COLUMN.to_string(), other);
            map
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        nested => query.bind(nested.to_string()),
    }
}

/// Convert one SQLite cell to JSON by its storage class
fn sqlite_value_to_json(row: &SqliteRow, idx: usize) -> Result<Value, StepError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => Value::Number(row.try_get_unchecked::<i64, _>(idx)?.into()),
        "REAL" => {
            let v: f64 = row.try_get_unchecked(idx)?;
            Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

/// Owner id -> database pool, opened on first use
pub struct AnalyticsRegistry {
    data_dir: PathBuf,
    pools: Mutex<HashMap<i64, SqlitePool>>,
}

impl AnalyticsRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self, owner_id: i64) -> PathBuf {
        self.data_dir.join(format!("user_{owner_id}.sqlite"))
    }

    /// The tenant's database, opening (and creating) it if needed
    pub async fn database(&self, owner_id: i64) -> Result<TenantDatabase, StepError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&owner_id) {
            return Ok(TenantDatabase { pool: pool.clone() });
        }

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| StepError::failed(format!("cannot create {}: {e}", self.data_dir.display())))?;

        let path = self.database_path(owner_id);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // One connection per tenant: loads and queries of one tenant never interleave
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!(owner_id, path = %path.display(), "opened analytics database");
        pools.insert(owner_id, pool.clone());
        Ok(TenantDatabase { pool })
    }

    pub async fn close(&self) {
        let pools: Vec<SqlitePool> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

/// Handle on one tenant's analytical database
#[derive(Clone)]
pub struct TenantDatabase {
    pool: SqlitePool,
}

impl TenantDatabase {
    /// Replace `table` with `rows`. Columns are sanitised labels; the whole
    /// load runs in one transaction so a retry starts from a clean slate.
    #[instrument(skip(self, columns, rows), fields(row_count = rows.len()))]
    pub async fn load_table(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, StepError> {
        let table = quote_identifier(table)?;
        let columns = sanitize_columns(columns.iter().map(String::as_str));
        if columns.is_empty() {
            return Err(StepError::InvalidConfig(format!("{table} has no columns")));
        }
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<_, _>>()?;

        let create = format!("CREATE TABLE {table} ({})", quoted.join(", "));
        let placeholders = vec!["?"; quoted.len()].join(", ");
        let insert = format!("INSERT INTO {table} ({}) VALUES ({placeholders})", quoted.join(", "));

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create).execute(&mut *tx).await?;

        let mut inserted = 0;
        for row in rows {
            let mut query = sqlx::query(&insert);
            for idx in 0..quoted.len() {
                query = bind_value(query, row.get(idx).unwrap_or(&Value::Null));
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(table = %table, inserted, "loaded table");
        Ok(inserted)
    }

    /// Replace `table` with JSON objects; columns are the union of keys in
    /// first-seen order. A feed without keys (`[]`) still replaces the table,
    /// with a single `value` column.
    pub async fn load_rows(&self, table: &str, rows: &[JsonRow]) -> Result<u64, StepError> {
        let mut labels: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for row in rows {
            for key in row.keys() {
                if seen.insert(key.as_str()) {
                    labels.push(key.as_str());
                }
            }
        }
        if labels.is_empty() {
            debug!(table, "feed has no columns, loading an empty table");
            labels.push(VALUE_COLUMN);
        }

        let columns: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let values: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| {
                labels
                    .iter()
                    .map(|l| row.get(*l).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        self.load_table(table, &columns, &values).await
    }

    /// Run `sql` and collect every row as a JSON object
    #[instrument(skip(self, sql))]
    pub async fn query(&self, sql: &str) -> Result<TransformResult, StepError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let columns: Vec<String> = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => self
                .pool
                .describe(sql)
                .await?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };

        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                object.insert(column.clone(), sqlite_value_to_json(row, idx)?);
            }
            data.push(object);
        }

        Ok(TransformResult {
            columns,
            row_count: data.len() as i64,
            data,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("sales_2024").is_ok());
        assert!(validate_identifier("_tmp").is_ok());
        for bad in ["", "2024_sales", "a-b", "x; DROP TABLE y", "a\"b", "select", "Table"] {
            assert!(
                matches!(validate_identifier(bad), Err(StepError::UnsafeIdentifier(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert_eq!(quote_identifier("orders").unwrap(), "\"orders\"");
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("sales 2024"), "sales_2024");
        assert_eq!(sanitize_identifier("2024-sales"), "t_2024_sales");
        assert_eq!(sanitize_identifier("x\"; DROP TABLE y; --"), "x___DROP_TABLE_y____");
        assert_eq!(sanitize_identifier(""), "col");
        assert_eq!(sanitize_identifier("order"), "order_");
        for raw in ["héllo wörld", "1", "select", "a.b.c", &"z".repeat(80)] {
            assert!(validate_identifier(&sanitize_identifier(raw)).is_ok(), "{raw:?}");
        }
    }

    #[test]
    fn test_sanitize_columns_deduplicates() {
        let columns = sanitize_columns(["a b", "a_b", "A B", ""]);
        assert_eq!(columns, vec!["a_b", "a_b_2", "A_B_3", "col"]);
    }

    #[test]
    fn test_parse_csv_infers_types() {
        let (headers, rows) = parse_csv(b"id,name,price\n1,apple,0.5\n2,,3\n").unwrap();
        assert_eq!(headers, vec!["id", "name", "price"]);
        assert_eq!(rows[0], vec![json!(1), json!("apple"), json!(0.5)]);
        assert_eq!(rows[1], vec![json!(2), Value::Null, json!(3)]);
    }

    #[test]
    fn test_parse_json_rows() {
        assert_eq!(parse_json_rows(br#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(parse_json_rows(br#"{"a":1}"#).unwrap().len(), 1);
        assert!(matches!(parse_json_rows(b"42"), Err(StepError::InvalidConfig(_))));
        assert!(matches!(parse_json_rows(b"{"), Err(StepError::Payload(_))));
    }

    #[tokio::test]
    async fn test_registry_caches_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AnalyticsRegistry::new(dir.path());

        let db = registry.database(7).await.unwrap();
        db.load_rows("t", &[json!({"x": 1}).as_object().unwrap().clone()])
            .await
            .unwrap();

        // Same owner sees the table; another owner does not
        let again = registry.database(7).await.unwrap();
        assert_eq!(again.query("SELECT x FROM t").await.unwrap().row_count, 1);
        assert!(registry.database(8).await.unwrap().query("SELECT x FROM t").await.is_err());

        assert!(registry.database_path(7).exists());
        registry.close().await;
    }

    #[tokio::test]
    async fn test_load_is_idempotent_and_values_are_bound() {
        let dir = tempfile::tempdir().unwrap();
        let db = AnalyticsRegistry::new(dir.path()).database(1).await.unwrap();

        let columns = vec!["name".to_string(), "qty".to_string()];
        let rows = vec![
            vec![json!("Robert'); DROP TABLE items;--"), json!(2)],
            vec![json!("plain"), json!(3)],
        ];
        db.load_table("items", &columns, &rows).await.unwrap();
        db.load_table("items", &columns, &rows).await.unwrap();

        let result = db.query("SELECT name, qty FROM items ORDER BY qty").await.unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns, vec!["name", "qty"]);
        assert_eq!(result.data[0]["name"], "Robert'); DROP TABLE items;--");
        assert_eq!(result.data[1]["qty"], 3);
    }

    #[tokio::test]
    async fn test_empty_feed_loads_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = AnalyticsRegistry::new(dir.path()).database(1).await.unwrap();

        db.load_rows("feed", &[json!({"a": 1}).as_object().unwrap().clone()])
            .await
            .unwrap();
        assert_eq!(db.load_rows("feed", &[]).await.unwrap(), 0);

        // The previous load is gone and the table is still queryable
        let result = db.query("SELECT COUNT(*) AS n FROM feed").await.unwrap();
        assert_eq!(result.data[0]["n"], 0);
        let rows = parse_json_rows(b"[]").unwrap();
        assert_eq!(db.load_rows("feed", &rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_table_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = AnalyticsRegistry::new(dir.path()).database(1).await.unwrap();
        let err = db
            .load_table("x; DROP TABLE y", &["a".to_string()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnsafeIdentifier(_)));
    }

    #[tokio::test]
    async fn test_query_types_and_empty_result_columns() {
        let dir = tempfile::tempdir().unwrap();
        let db = AnalyticsRegistry::new(dir.path()).database(1).await.unwrap();

        let result = db
            .query("SELECT 1 AS x, 2.5 AS y, 'z' AS s, NULL AS n")
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(
            Value::Object(result.data[0].clone()),
            json!({"x": 1, "y": 2.5, "s": "z", "n": null})
        );

        db.load_rows("empty_src", &[json!({"a": 1}).as_object().unwrap().clone()])
            .await
            .unwrap();
        let empty = db.query("SELECT a FROM empty_src WHERE a > 10").await.unwrap();
        assert_eq!(empty.row_count, 0);
        assert_eq!(empty.columns, vec!["a"]);
    }
}
