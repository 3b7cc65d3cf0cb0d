use crate::cursor::WindowedCursor;
use conntrail_core::Row;
use tracing::warn;

/// What a refresh pass did. `refreshed` is false when the pass was skipped
/// outright; `data_changed` is true when the materialized slice differs from
/// the previous one (or the refresh was forced).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub refreshed: bool,
    pub data_changed: bool,
    pub rows_shown: usize,
}

impl RefreshOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }
}

/// Pairs the windowed cursor with the previously shown slice so a refresh
/// can tell whether anything on screen actually changed. Read failures
/// degrade to an empty slice; they never propagate out of a refresh pass.
pub struct TableWindow {
    cursor: WindowedCursor,
    query: String,
    rows: Vec<Row>,
    last_rows: Vec<Row>,
    total_rows: i64,
}

impl TableWindow {
    pub fn new(cursor: WindowedCursor) -> Self {
        Self {
            cursor,
            query: String::new(),
            rows: Vec::new(),
            last_rows: Vec::new(),
            total_rows: 0,
        }
    }

    pub fn set_query(&mut self, sql: &str) -> i64 {
        self.query = sql.to_string();
        self.rebind()
    }

    /// Re-binds the current query and refreshes the total row count. A query
    /// failure is logged and reported as an empty result set.
    pub fn rebind(&mut self) -> i64 {
        if self.query.is_empty() {
            self.total_rows = 0;
            return 0;
        }
        match self.cursor.bind(&self.query) {
            Ok(total) => {
                self.total_rows = total;
                total
            }
            Err(err) => {
                warn!("window query failed, showing empty result: {err} ({})", self.query);
                self.total_rows = 0;
                0
            }
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn total_rows(&self) -> i64 {
        self.total_rows
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn columns(&self) -> &[String] {
        self.cursor.columns()
    }

    /// Seeks to `offset` and materializes up to `capacity` rows, then diffs
    /// the slice against the previous one field by field.
    pub fn fill(&mut self, offset: i64, capacity: i64, force: bool) -> RefreshOutcome {
        self.cursor.seek(offset);
        let upper = capacity.min(self.total_rows).max(0) as usize;
        self.rows = if upper > 0 {
            match self.cursor.materialize(upper) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!("window materialize failed, showing empty result: {err}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let data_changed = force || self.rows != self.last_rows;
        self.last_rows = self.rows.clone();
        RefreshOutcome {
            refreshed: true,
            data_changed,
            rows_shown: self.rows.len(),
        }
    }
}
