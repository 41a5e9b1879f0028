//! TUI module for terminal user interfaces

mod scan_monitor;

pub use scan_monitor::{line_color, ScanMonitorApp};
