//! Agent link management

mod health;

pub use health::HealthMonitor;
