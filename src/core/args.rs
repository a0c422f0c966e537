use clap::{Parser, ValueEnum};
use log::kv::{ToValue, Value};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum Target {
    Column,
    Bag,
    All,
}

#[derive(Parser, Debug, PartialEq)]
#[command(version, about)]
pub struct CliArgs {
    #[arg(short, long)]
    pub config: Option<String>,
    /// Overrides `stress.records` from the config file.
    #[arg(short, long)]
    pub records: Option<u64>,
    #[arg(short, long, value_enum, default_value_t = Target::All)]
    pub target: Target,
}

impl ToValue for CliArgs {
    fn to_value(&self) -> Value<'_> {
        Value::from_debug(self)
    }
}
