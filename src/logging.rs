//! Logger setup shared by the two binaries.

use std::io::Write;
use std::str::FromStr;

use anyhow::{bail, Error};
use log::LevelFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => bail!("invalid log format '{}' (expected 'console' or 'json')", other),
        }
    }
}

pub fn init(level: &str, format: LogFormat) -> Result<(), Error> {
    let level = LevelFilter::from_str(level)
        .map_err(|_| anyhow::format_err!("invalid log level '{}'", level))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filter) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filter);
    }

    if format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }

    builder.try_init()?;
    Ok(())
}
