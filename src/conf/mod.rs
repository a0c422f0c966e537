mod config;
mod spill;
mod stress;

pub use config::Config;
pub use spill::SpillConfig;
pub use stress::StressConfig;
