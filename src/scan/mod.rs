//! Scan orchestration: run lifecycle, log feed and result persistence

pub mod controller;
pub mod logs;
pub mod store;

pub use controller::{ScanController, ScanRun, ScanState};
pub use logs::LogFeed;
pub use store::ResultStore;
