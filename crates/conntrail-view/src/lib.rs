pub mod cursor;
pub mod selection;
pub mod viewport;
pub mod window;

pub use cursor::{ViewError, WindowedCursor};
pub use selection::SelectionTracker;
pub use viewport::{ScrollState, Viewport, ViewportEvent, ViewportGeometry};
pub use window::{RefreshOutcome, TableWindow};
