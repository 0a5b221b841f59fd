pub mod broadcast;
pub mod bus;
pub mod clipboard;
pub mod config;
pub mod display;
pub mod monitor;
pub mod session;
pub mod tabs;
pub mod telemetry;
pub mod tunnel;
