//! Service layer for the analyst agent.
//!
//! Domain logic separated from the HTTP and CLI surfaces.

pub mod analyst;

pub use analyst::{AnalysisOutcome, AnalysisRequest, Analyst, AnalystError, Attachment};
