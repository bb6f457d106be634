pub mod config;
pub mod retention;
pub mod table;
pub mod telemetry;
