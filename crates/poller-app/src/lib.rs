pub mod config;
mod supervisor;

pub use config::{AppConfig, InverterConfig, InverterConnectionConfig};
pub use supervisor::{log_events, start_inverter};
