use std::io::Write;

use chrono::{DateTime, Utc};
use log::{info, Level};

/// Installs the process logger. `log_level` is an env_logger filter such as
/// `info` or `chatdesk=debug`; `RUST_LOG`, when set, is applied on top.
pub fn init(log_level: &str) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(log_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_line(
                    Utc::now(),
                    record.level(),
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    &record.args().to_string(),
                )
            )
        })
        .try_init()?;

    info!("ChatDesk logger initialized at {}", log_level);
    Ok(())
}

pub fn format_line(at: DateTime<Utc>, level: Level, file: &str, line: u32, message: &str) -> String {
    format!(
        "[{}] [{}] [{}:{}] {}",
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        level,
        file,
        line,
        message
    )
}
