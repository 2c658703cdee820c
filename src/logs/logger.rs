use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;

// Visible widths for the level and file:line columns.
const LEVEL_FIELD_WIDTH: usize = 8;
const FILE_LINE_FIELD_WIDTH: usize = 22;

/// Configures the global logger with an aligned, optionally colored
/// format.
///
/// Honours `RUST_LOG` for level filtering (default: info) and `NO_COLOR`
/// to disable ANSI sequences. Call once at startup; subsequent calls are
/// ignored by the underlying logger.
pub fn configure_logger() {
    let no_color = env::var("NO_COLOR").is_ok();

    Builder::new()
        .format(move |buf, record| {
            let level = record.level();
            let level_plain = level.to_string();

            let (prefix, colored_level, suffix) = if no_color {
                (String::new(), level_plain.clone(), String::new())
            } else {
                let colored = match level {
                    log::Level::Error => format!("\x1b[31m{}\x1b[39m", level_plain),
                    log::Level::Warn => format!("\x1b[33m{}\x1b[39m", level_plain),
                    log::Level::Info => format!("\x1b[32m{}\x1b[39m", level_plain),
                    log::Level::Debug => format!("\x1b[34m{}\x1b[39m", level_plain),
                    log::Level::Trace => format!("\x1b[35m{}\x1b[39m", level_plain),
                };
                ("\x1b[1m".to_string(), colored, "\x1b[0m".to_string())
            };

            let level_display = format!("[{}]", colored_level);
            // Pad on the plain width; ANSI sequences are invisible.
            let level_padding = LEVEL_FIELD_WIDTH.saturating_sub(level_plain.len() + 2).max(1);

            let file = record.file().unwrap_or("unknown");
            let line = record.line().unwrap_or(0);
            let file_line = format!("{}:{}", file, line);
            let file_line_padding = FILE_LINE_FIELD_WIDTH.saturating_sub(file_line.len()).max(1);

            writeln!(
                buf,
                "{}{}{}| {} | {}{}| {}{}",
                prefix,
                level_display,
                " ".repeat(level_padding),
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                file_line,
                " ".repeat(file_line_padding),
                record.args(),
                suffix
            )
        })
        .filter_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(LevelFilter::Info),
        )
        .try_init()
        .ok();
}
