/// Content-derived identity for selection tracking. Event rows carry no
/// stable row id, so a selected row is remembered by the value of its first
/// visible column instead of its index.
pub trait KeyedRow {
    fn selection_key(&self) -> Option<&str>;
}

/// A single materialized result row; every column is rendered to display
/// text at read time so the window never holds typed column state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<String>,
}

impl Row {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn get(&self, column: usize) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<String>> for Row {
    fn from(values: Vec<String>) -> Self {
        Self::new(values)
    }
}

impl KeyedRow for Row {
    fn selection_key(&self) -> Option<&str> {
        self.get(0)
    }
}
