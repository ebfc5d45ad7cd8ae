use std::env;
use std::fs::OpenOptions;

use lazy_static::lazy_static;
use slog::{o, Drain, Duplicate, Level, LevelFilter, Logger};
use slog_async;
use slog_envlogger;
use slog_term;

/// Environment variable selecting an optional plain-text log file
const LOG_FILE_ENV: &str = "SFMINER_LOG_FILE";

/// Datestamp format used for the status screen and init records
pub fn datestamp() -> String {
    chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]").to_string()
}

fn terminal_drain(level: Level) -> slog_async::Async {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    let drain = slog_envlogger::new(drain);
    slog_async::Async::new(drain).build()
}

fn file_drain(path: &str, level: Level) -> slog_async::Async {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap_or_else(|e| panic!("cannot open log file {}: {}", path, e));

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    slog_async::Async::new(drain).build()
}

lazy_static! {
    /// Static reference to the logger that is shared by all worker threads
    pub static ref LOGGER: Logger = {
        let level = Level::Trace;

        // envlogger doesn't allow to set default log level, so this is a workaround
        if !env::var("RUST_LOG").is_ok() {
            env::set_var("RUST_LOG", "info");
        }

        match env::var(LOG_FILE_ENV) {
            Ok(path) => Logger::root(
                Duplicate::new(terminal_drain(level).fuse(), file_drain(&path, level).fuse())
                    .fuse(),
                o!(),
            ),
            Err(_) => Logger::root(terminal_drain(level).fuse(), o!()),
        }
    };
}
