//! Data analyst agent.
//!
//! Answers analysis tasks by asking an LLM for a JSON plan of typed steps
//! (scrape a table, fetch a CSV, run SQL, draw a chart) and executing it
//! against a per-request SQLite session. A persistent knowledge base enriches
//! prompts and learns from successful interactions.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod llm;
pub mod models;
pub mod rag;
pub mod server;
pub mod services;
