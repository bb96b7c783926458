//! Data store port and the SQLite-backed implementation.
//!
//! The rest of the engine only ever sees `query(sql, params) -> rows`;
//! schema creation and demo seeding live here so the server binary can run
//! self-contained.

use crate::catalog::{MONTH_COLUMN, ROSTER_TABLE};
use crate::error::{AssistantError, Result};
use itertools::Itertools;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Positional SQL parameter. Everything the where-builder binds is either a
/// token string or a month-number bound.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
}

impl SqlValue {
    pub fn text(s: impl Into<String>) -> Self {
        SqlValue::Text(s.into())
    }

    /// Rendering used for the display-only SQL string, never for execution.
    pub fn display(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s),
            SqlValue::Integer(i) => i.to_string(),
        }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        match self {
            SqlValue::Text(s) => s.to_sql(),
            SqlValue::Integer(i) => i.to_sql(),
        }
    }
}

pub type Row = HashMap<String, serde_json::Value>;

/// Query result: rows as column->value maps, with the column order kept
/// separately so detail rendering is stable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

pub trait DataStore: Send + Sync {
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<RowSet>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dws_tas_roster (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                st_EmpID TEXT NOT NULL,
                st_EmpNameCN TEXT,
                st_EmpNameEN TEXT,
                st_WrMonth TEXT NOT NULL,
                st_DeptName TEXT NOT NULL,
                st_OrgName TEXT NOT NULL,
                st_EmpAvailable TEXT NOT NULL DEFAULT '1',
                st_ClassName TEXT NOT NULL DEFAULT 'FE'
            );
            CREATE TABLE IF NOT EXISTS dws_wisdom_machine (
                st_SN TEXT PRIMARY KEY,
                st_ProductLine TEXT NOT NULL,
                st_BP TEXT,
                st_MachineModelName TEXT,
                st_MachineClusterFlag TEXT NOT NULL DEFAULT 'R'
            );",
        )?;
        Ok(())
    }

    /// Deterministic demo rows so a freshly created database answers every
    /// builtin metric. No-op when the tables already hold data.
    pub fn seed_demo_data(&self) -> Result<()> {
        let mut conn = self.lock()?;

        let roster_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dws_tas_roster", [], |r| r.get(0))?;
        if roster_count == 0 {
            let months = ["202510", "202511", "202512"];
            let products = ["CT", "SPS", "ES"];
            let orgs = ["PSM", "非PSM"];
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dws_tas_roster
                     (st_EmpID, st_EmpNameCN, st_EmpNameEN, st_WrMonth, st_DeptName, st_OrgName, st_EmpAvailable, st_ClassName)
                     VALUES (?, ?, ?, ?, ?, ?, '1', 'FE')",
                )?;
                for i in 0..100 {
                    stmt.execute(rusqlite::params![
                        format!("E{}", 1000 + i),
                        format!("工程师{}", i),
                        format!("Engineer {}", i),
                        months[i % months.len()],
                        products[(i / 3) % products.len()],
                        orgs[i % orgs.len()],
                    ])?;
                }
            }
            tx.commit()?;
            info!("seeded dws_tas_roster with 100 demo rows");
        }

        let machine_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dws_wisdom_machine", [], |r| r.get(0))?;
        if machine_count == 0 {
            let products = ["CT", "SPS", "ES"];
            let customers = ["BYD", "CATL", "Tesla", "NIO"];
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dws_wisdom_machine
                     (st_SN, st_ProductLine, st_BP, st_MachineModelName, st_MachineClusterFlag)
                     VALUES (?, ?, ?, ?, 'R')",
                )?;
                for i in 0..50 {
                    stmt.execute(rusqlite::params![
                        format!("SN{}", 10000 + i),
                        products[i % products.len()],
                        customers[i % customers.len()],
                        format!("Model-{}", 100 + i % 5),
                    ])?;
                }
            }
            tx.commit()?;
            info!("seeded dws_wisdom_machine with 50 demo rows");
        }

        Ok(())
    }

    /// Run a raw statement batch, e.g. to stage fixture rows.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AssistantError::Database("connection mutex poisoned".to_string()))
    }
}

impl DataStore for SqliteStore {
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = Vec::new();
        let mut raw = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = raw.next()? {
            let mut map = Row::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                map.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
            }
            rows.push(map);
        }

        Ok(RowSet { columns, rows })
    }
}

fn value_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::from(format!("<blob {} bytes>", b.len())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeOption {
    pub value: String,
    pub label: String,
}

/// Selectable time values, bucketed from the distinct months present in the
/// roster table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeOptionGroups {
    pub month: Vec<TimeOption>,
    pub half_fy: Vec<TimeOption>,
    pub fy: Vec<TimeOption>,
}

/// Scan distinct version months and bucket them into month, half-year and
/// full-year groups, sorted lexicographically. A half-year option is only
/// emitted when at least one month of that half is present.
pub fn list_time_options(store: &dyn DataStore) -> Result<TimeOptionGroups> {
    let sql = format!(
        "SELECT DISTINCT {col} FROM {table} ORDER BY {col}",
        col = MONTH_COLUMN,
        table = ROSTER_TABLE
    );
    let result = store.query(&sql, &[])?;

    let mut months: Vec<String> = result
        .rows
        .iter()
        .filter_map(|row| row.get(MONTH_COLUMN))
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    months.sort();

    let month_options = months
        .iter()
        .map(|m| TimeOption {
            value: m.clone(),
            label: m.clone(),
        })
        .collect();

    let by_year = months
        .iter()
        .filter(|m| m.len() >= 6)
        .filter_map(|m| {
            let year = &m[..4];
            m[4..].parse::<u32>().ok().map(|num| (year.to_string(), num))
        })
        .into_group_map();

    let mut fy = Vec::new();
    let mut half_fy = Vec::new();
    for (year, month_nums) in by_year.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        fy.push(TimeOption {
            value: year.clone(),
            label: format!("{} 财年", year),
        });
        if month_nums.iter().any(|n| (1..=6).contains(n)) {
            half_fy.push(TimeOption {
                value: format!("{}H1", year),
                label: format!("{} 上半年", year),
            });
        }
        if month_nums.iter().any(|n| (7..=12).contains(n)) {
            half_fy.push(TimeOption {
                value: format!("{}H2", year),
                label: format!("{} 下半年", year),
            });
        }
    }
    fy.sort_by(|a, b| a.value.cmp(&b.value));
    half_fy.sort_by(|a, b| a.value.cmp(&b.value));

    Ok(TimeOptionGroups {
        month: month_options,
        half_fy,
        fy,
    })
}
