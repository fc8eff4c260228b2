//! HTTP request handlers.

mod analyze;
mod api;

pub use analyze::analyze;
pub use api::{add_context, health, stats, submit_feedback};
