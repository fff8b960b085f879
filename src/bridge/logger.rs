//! log4rs setup.
//!
//! Everything goes to stderr: stdout carries the worker pipe in worker mode
//! and the reply stream in host mode. The host additionally writes a
//! timestamped file under the configured log directory.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

use super::config::LoggingConfig;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Install the global logger. Can only succeed once per process.
pub fn setup_logging(config: &LoggingConfig) -> Result<Handle, Box<dyn Error>> {
    let handle = log4rs::init_config(build_config(config)?)?;
    Ok(handle)
}

/// Build the log4rs configuration without installing it.
pub fn build_config(config: &LoggingConfig) -> Result<Config, Box<dyn Error>> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(console)));
    let mut root = Root::builder().appender("stderr");

    if config.file {
        fs::create_dir_all(&config.dir)?;
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(log_file_path(&config.dir))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    Ok(builder.build(root.build(parse_level(&config.level)))?)
}

/// `{dir}/{YYYY-MM-DD-HH_MM}.log` for the current local time.
pub fn log_file_path(dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    dir.join(format!("{timestamp}.log"))
}

/// Level name to filter; unknown names fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}
