//! Plan parsing, table loading, execution and chart rendering.

mod executor;
mod plan;
mod plot;
mod table;

pub use executor::{ExecutionError, PlanExecutor, StepError};
pub use plan::{is_valid_name, Plan, PlanError, PlotKind, Step};
pub use plot::{least_squares, render_plot, PlotError, MAX_PLOT_BYTES};
pub use table::{sanitize_identifier, Cell, Table, TableError};
