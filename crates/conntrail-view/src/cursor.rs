use conntrail_core::Row;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("query error: {0}")]
    Query(#[from] rusqlite::Error),
}

/// A seekable window over one query's result ordering. The full result set
/// is never loaded: only `materialize` reads column values, so per-tick cost
/// is proportional to the window size, not the table size.
///
/// The position is an integer in `[-1, total]`: `-1` is "before first",
/// `total` is "after last", and any in-between value is the index of the next
/// row `materialize` will return.
pub struct WindowedCursor {
    conn: Connection,
    query: String,
    total_rows: i64,
    position: i64,
    columns: Vec<String>,
}

impl WindowedCursor {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            query: String::new(),
            total_rows: 0,
            position: -1,
            columns: Vec::new(),
        }
    }

    /// Binds `sql` and recomputes the total row count. Statement re-planning
    /// is avoided through the connection's prepared-statement cache, so
    /// binding the same text on every refresh tick stays cheap.
    pub fn bind(&mut self, sql: &str) -> Result<i64, ViewError> {
        if self.query != sql {
            let statement = self.conn.prepare_cached(sql)?;
            self.columns = statement
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            self.query = sql.to_string();
            self.position = -1;
        }

        let count_sql = format!("SELECT COUNT(*) FROM ({})", self.query);
        let total: i64 = self
            .conn
            .prepare_cached(&count_sql)?
            .query_row([], |row| row.get(0))?;
        self.total_rows = total;
        if self.position > total {
            self.position = total;
        }
        Ok(total)
    }

    /// Clamps into `[-1, total]`.
    pub fn seek(&mut self, position: i64) {
        self.position = position.clamp(-1, self.total_rows);
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn total_rows(&self) -> i64 {
        self.total_rows
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Reads at most `count` rows forward from the current position,
    /// stopping early without error at the end of the result set, and
    /// advances the position past the rows returned.
    pub fn materialize(&mut self, count: usize) -> Result<Vec<Row>, ViewError> {
        if count == 0 || self.query.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.position.max(0);
        if start >= self.total_rows {
            return Ok(Vec::new());
        }

        let window_sql = format!("SELECT * FROM ({}) LIMIT ?1 OFFSET ?2", self.query);
        let mut statement = self.conn.prepare_cached(&window_sql)?;
        let column_count = statement.column_count();
        let mut rows = statement.query(params![count as i64, start])?;

        let mut out = Vec::with_capacity(count);
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(display_value(row.get_ref(index)?));
            }
            out.push(Row::new(values));
        }
        self.position = start + out.len() as i64;
        Ok(out)
    }
}

fn display_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Text(value) => String::from_utf8_lossy(value).into_owned(),
        ValueRef::Blob(value) => format!("<{} bytes>", value.len()),
    }
}
