use crate::selection::SelectionTracker;
use crate::window::{RefreshOutcome, TableWindow};
use conntrail_core::Row;

/// Pixel geometry supplied by the host on every resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportGeometry {
    pub viewport_px: u32,
    pub row_px: u32,
}

impl ViewportGeometry {
    pub fn new(viewport_px: u32, row_px: u32) -> Self {
        Self { viewport_px, row_px }
    }

    /// Rows that fit the visible area. The `+ 1` counts a partially visible
    /// trailing row so the scroll arithmetic stays consistent; the host
    /// stretches the last row's rendering when the count lands exactly on
    /// capacity.
    pub fn capacity(&self) -> i64 {
        if self.row_px == 0 {
            return 0;
        }
        (self.viewport_px / self.row_px) as i64 + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollState {
    pub value: i64,
    pub min: i64,
    pub max: i64,
    pub visible: bool,
}

/// Notifications for the host, drained after each call into the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportEvent {
    BeginRefresh,
    EndRefresh,
    DataChanged { rows_shown: usize },
    RowCountChanged { total_rows: i64 },
    ScrollRangeChanged { min: i64, max: i64, visible: bool },
}

/// Translates geometry and scroll position into a minimal-cost window over
/// the bound query, and decides when a refresh is mandatory versus
/// skippable. Pull-based: the host invokes the matching method on each
/// resize, scroll or row-count event; there are no timers here.
pub struct Viewport {
    window: TableWindow,
    selection: SelectionTracker,
    geometry: ViewportGeometry,
    scroll: ScrollState,
    capacity: i64,
    events: Vec<ViewportEvent>,
}

impl Viewport {
    pub fn new(window: TableWindow, geometry: ViewportGeometry) -> Self {
        let capacity = geometry.capacity();
        let mut viewport = Self {
            window,
            selection: SelectionTracker::new(),
            geometry,
            scroll: ScrollState::default(),
            capacity,
            events: Vec::new(),
        };
        let total = viewport.window.total_rows();
        viewport.apply_scroll_range(total);
        viewport
    }

    pub fn rows(&self) -> &[Row] {
        self.window.rows()
    }

    pub fn columns(&self) -> &[String] {
        self.window.columns()
    }

    pub fn total_rows(&self) -> i64 {
        self.window.total_rows()
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn geometry(&self) -> ViewportGeometry {
        self.geometry
    }

    pub fn scroll(&self) -> ScrollState {
        self.scroll
    }

    pub fn selection(&self) -> &SelectionTracker {
        &self.selection
    }

    pub fn drain_events(&mut self) -> Vec<ViewportEvent> {
        std::mem::take(&mut self.events)
    }

    /// Geometry changed: recompute capacity and re-page.
    pub fn resize(&mut self, geometry: ViewportGeometry) -> RefreshOutcome {
        self.geometry = geometry;
        self.capacity = geometry.capacity();
        self.apply_scroll_range(self.window.total_rows());
        self.refresh(true)
    }

    /// The host's scroll affordance moved.
    pub fn set_scroll_value(&mut self, value: i64) -> RefreshOutcome {
        self.scroll.value = value.clamp(self.scroll.min, self.scroll.max);
        self.refresh(true)
    }

    /// The store's total row count may have changed (ingestion, purge).
    /// Boundary pages must stay exact, so the refresh is forced only when
    /// the scrollbar sits at its minimum or maximum; anywhere else the
    /// re-page is skipped so row inspection isn't disrupted mid-list.
    pub fn row_count_changed(&mut self) -> RefreshOutcome {
        let total = self.window.rebind();
        self.apply_scroll_range(total);
        self.events.push(ViewportEvent::ScrollRangeChanged {
            min: self.scroll.min,
            max: self.scroll.max,
            visible: self.scroll.visible,
        });
        self.events
            .push(ViewportEvent::RowCountChanged { total_rows: total });
        self.refresh(self.at_scroll_boundary())
    }

    pub fn refresh(&mut self, force: bool) -> RefreshOutcome {
        if !force {
            return RefreshOutcome::skipped();
        }
        self.events.push(ViewportEvent::BeginRefresh);
        self.selection.begin_refresh(self.window.rows());

        let total = self.window.rebind();
        let offset = self.offset_for_scroll(total);
        let outcome = self.window.fill(offset, self.capacity, force);

        self.selection.end_refresh(self.window.rows());
        self.events.push(ViewportEvent::EndRefresh);
        if outcome.data_changed {
            self.events.push(ViewportEvent::DataChanged {
                rows_shown: outcome.rows_shown,
            });
        }
        outcome
    }

    fn at_scroll_boundary(&self) -> bool {
        self.scroll.value == self.scroll.min || self.scroll.value == self.scroll.max
    }

    fn apply_scroll_range(&mut self, total: i64) {
        self.scroll.min = 0;
        // the displayed rows are subtracted from the total so that the
        // maximum scroll position still fills the viewport
        self.scroll.max = (total - self.capacity + 1).max(0);
        self.scroll.visible = total > self.capacity;
        self.scroll.value = self.scroll.value.clamp(self.scroll.min, self.scroll.max);
    }

    fn offset_for_scroll(&self, total: i64) -> i64 {
        if self.scroll.value <= self.scroll.min {
            return -1;
        }
        if self.scroll.value >= self.scroll.max {
            return total - self.capacity;
        }
        // never seek past the last row
        (self.scroll.value - 1).min(total - 1)
    }

    pub fn toggle_select(&mut self, index: usize) {
        self.selection.toggle(index, self.window.rows());
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn key_up(&mut self) {
        self.selection.remember_current(self.window.rows());
        match self.selection.visual_row() {
            Some(index) if index > 0 => {
                self.selection.select_index(index - 1, self.window.rows());
            }
            _ => {
                let value = (self.scroll.value - 1).max(self.scroll.min);
                self.set_scroll_value(value);
            }
        }
    }

    pub fn key_down(&mut self) {
        self.selection.remember_current(self.window.rows());
        let visible = self.window.rows().len();
        match self.selection.visual_row() {
            Some(index) if (index as i64) < self.capacity - 2 && index + 1 < visible => {
                self.selection.select_index(index + 1, self.window.rows());
            }
            Some(_) => {
                let value = (self.scroll.value + 1).min(self.scroll.max);
                self.set_scroll_value(value);
                self.select_last_visible();
            }
            None => {
                let value = (self.scroll.value + 1).min(self.scroll.max);
                self.set_scroll_value(value);
            }
        }
    }

    pub fn key_home(&mut self) {
        self.set_scroll_value(self.scroll.min);
        self.selection.clear_visual();
    }

    pub fn key_end(&mut self) {
        self.set_scroll_value(self.scroll.max);
        self.selection.clear_visual();
    }

    pub fn key_page_up(&mut self) {
        let value = (self.scroll.value - self.capacity).max(self.scroll.min);
        self.set_scroll_value(value);
    }

    pub fn key_page_down(&mut self) {
        if !self.scroll.visible {
            return;
        }
        let value = (self.scroll.value + self.capacity - 2).min(self.scroll.max);
        self.set_scroll_value(value);
        if !self.window.rows().is_empty() {
            self.selection.highlight(0);
        }
    }

    fn select_last_visible(&mut self) {
        if self.selection.remembered_key().is_some() {
            return;
        }
        let visible = self.window.rows().len();
        if visible == 0 {
            return;
        }
        let index = ((self.capacity - 2).max(0) as usize).min(visible - 1);
        self.selection.select_index(index, self.window.rows());
    }
}
