pub mod config;
pub mod db;
pub mod ipc;
pub mod rubric;
pub mod rubric_store;
pub mod summaries;
pub mod telemetry;
pub mod viewer;
