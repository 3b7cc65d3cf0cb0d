use conntrail_core::KeyedRow;

/// Keeps a user's logical selection stable while the window underneath it
/// moves. The selected row is remembered by its content key, never by its
/// index: when the row scrolls out of view the visual selection clears but
/// the key is kept, and the row is reselected as soon as it is back in view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionTracker {
    remembered: Option<String>,
    visual: Option<usize>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remembered_key(&self) -> Option<&str> {
        self.remembered.as_deref()
    }

    /// Index of the visually selected row within the current window, if any.
    pub fn visual_row(&self) -> Option<usize> {
        self.visual
    }

    /// User toggle on a row: selecting the remembered row again deselects it
    /// and forgets the key.
    pub fn toggle<R: KeyedRow>(&mut self, index: usize, rows: &[R]) {
        let Some(key) = rows.get(index).and_then(KeyedRow::selection_key) else {
            return;
        };
        if self.remembered.as_deref() == Some(key) {
            self.clear();
        } else {
            self.remembered = Some(key.to_string());
            self.visual = Some(index);
        }
    }

    /// Selects a row and remembers its key (keyboard navigation).
    pub fn select_index<R: KeyedRow>(&mut self, index: usize, rows: &[R]) {
        if let Some(key) = rows.get(index).and_then(KeyedRow::selection_key) {
            self.remembered = Some(key.to_string());
            self.visual = Some(index);
        }
    }

    /// Moves the highlight without touching the remembered key.
    pub fn highlight(&mut self, index: usize) {
        self.visual = Some(index);
    }

    /// Re-remembers the key of whichever row is currently highlighted.
    pub fn remember_current<R: KeyedRow>(&mut self, rows: &[R]) {
        if let Some(key) = self
            .visual
            .and_then(|index| rows.get(index))
            .and_then(KeyedRow::selection_key)
        {
            self.remembered = Some(key.to_string());
        }
    }

    /// Forgets the visual selection but keeps the remembered key.
    pub fn clear_visual(&mut self) {
        self.visual = None;
    }

    /// Forgets both the visual selection and the remembered key.
    pub fn clear(&mut self) {
        self.remembered = None;
        self.visual = None;
    }

    /// Hook fired before a window refresh: if the highlighted row no longer
    /// carries the remembered key (it fell out of view), drop the visual
    /// selection but keep the key.
    pub fn begin_refresh<R: KeyedRow>(&mut self, rows: &[R]) {
        if let Some(index) = self.visual {
            let current = rows.get(index).and_then(KeyedRow::selection_key);
            if current != self.remembered.as_deref() {
                self.visual = None;
            }
        }
    }

    /// Hook fired after materialization: scan the new window for the
    /// remembered key and reselect it when present.
    pub fn end_refresh<R: KeyedRow>(&mut self, rows: &[R]) {
        if let Some(remembered) = self.remembered.as_deref() {
            self.visual = rows
                .iter()
                .position(|row| row.selection_key() == Some(remembered));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conntrail_core::Row;

    fn rows(keys: &[&str]) -> Vec<Row> {
        keys.iter()
            .map(|key| Row::new(vec![key.to_string(), "rest".to_string()]))
            .collect()
    }

    #[test]
    fn toggle_selects_then_deselects() {
        let window = rows(&["a", "b", "c"]);
        let mut tracker = SelectionTracker::new();

        tracker.toggle(1, &window);
        assert_eq!(tracker.remembered_key(), Some("b"));
        assert_eq!(tracker.visual_row(), Some(1));

        tracker.toggle(1, &window);
        assert_eq!(tracker.remembered_key(), None);
        assert_eq!(tracker.visual_row(), None);
    }

    #[test]
    fn selection_follows_row_across_window_shift() {
        let mut tracker = SelectionTracker::new();
        let first = rows(&["a", "b", "c", "d", "e"]);
        tracker.toggle(2, &first);

        // window slides by two: c is now at index 0
        let shifted = rows(&["c", "d", "e", "f", "g"]);
        tracker.begin_refresh(&first);
        tracker.end_refresh(&shifted);
        assert_eq!(tracker.visual_row(), Some(0));
        assert_eq!(tracker.remembered_key(), Some("c"));
    }

    #[test]
    fn out_of_view_row_deselects_visually_but_keeps_key() {
        let mut tracker = SelectionTracker::new();
        let first = rows(&["a", "b", "c", "d", "e"]);
        tracker.toggle(2, &first);

        let far = rows(&["f", "g", "h", "i", "j"]);
        tracker.begin_refresh(&first);
        tracker.end_refresh(&far);
        assert_eq!(tracker.visual_row(), None);
        assert_eq!(tracker.remembered_key(), Some("c"));

        // scrolling back into view reselects the same row
        let back = rows(&["c", "d", "e", "f", "g"]);
        tracker.begin_refresh(&far);
        tracker.end_refresh(&back);
        assert_eq!(tracker.visual_row(), Some(0));
    }

    #[test]
    fn begin_refresh_clears_mismatched_highlight() {
        let mut tracker = SelectionTracker::new();
        let window = rows(&["a", "b", "c"]);
        tracker.toggle(0, &window);

        // the window content moved under the highlight
        let moved = rows(&["x", "y", "z"]);
        tracker.begin_refresh(&moved);
        assert_eq!(tracker.visual_row(), None);
        assert_eq!(tracker.remembered_key(), Some("a"));
    }

    #[test]
    fn shrunken_window_does_not_panic_reconciliation() {
        let mut tracker = SelectionTracker::new();
        let window = rows(&["a", "b", "c", "d"]);
        tracker.toggle(3, &window);

        let shrunk = rows(&["a"]);
        tracker.begin_refresh(&shrunk);
        tracker.end_refresh(&shrunk);
        assert_eq!(tracker.visual_row(), None);
        assert_eq!(tracker.remembered_key(), Some("d"));
    }
}
