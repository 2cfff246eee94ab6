//! Invoice ingestion pipeline
//!
//! Claims queued documents, turns them into text (native PDF text layer, or
//! OCR with a rotation search for scans), extracts invoice data with an LLM,
//! repairs it with layout heuristics and stores the result. The server binary
//! exposes a process-next endpoint; the `worker` binary polls in a loop.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
