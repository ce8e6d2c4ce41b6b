//! Terminal logger: `fern` dispatch with `chrono` timestamps and `colored`
//! level tags, verbosity selected by repeated `-v` flags.

use colored::Colorize;
use log::{Level, LevelFilter};

fn level_for(verbosity: u64) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn colored_level(level: Level) -> String {
    match level {
        Level::Error => level.to_string().red().to_string(),
        Level::Warn => level.to_string().yellow().to_string(),
        Level::Info => level.to_string().green().to_string(),
        Level::Debug => level.to_string().blue().to_string(),
        Level::Trace => level.to_string().magenta().to_string(),
    }
}

pub fn init(verbosity: u64) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colored_level(record.level()),
                record.target(),
                message
            ))
        })
        .level(level_for(verbosity))
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
