mod args;
mod error;
mod logger;

pub use args::{CliArgs, Target};
pub use error::SpillError;
pub use logger::setup_logging;
