//! # Logging Configuration
//!
//! Global log verbosity plus two process-wide toggles for wire-message
//! logging. `--sent-msg` and `--recv-msg` only produce output at the
//! `debug` level; the session checks the toggles before formatting
//! anything, so the hot read loop pays nothing when they are off.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::ValueEnum;
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Warning,
    Error,
    None,
}

static LOG_SENT_MESSAGES: AtomicBool = AtomicBool::new(false);
static LOG_RECV_MESSAGES: AtomicBool = AtomicBool::new(false);

/// Install the global logger. Called once, before any other module logs.
pub fn init(level: LogLevel, sent_msgs: bool, recv_msgs: bool) {
    let filter = match level {
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Warning => LevelFilter::Warn,
        LogLevel::Error => LevelFilter::Error,
        LogLevel::None => LevelFilter::Off,
    };

    pretty_env_logger::formatted_timed_builder()
        .filter_level(filter)
        .init();

    LOG_SENT_MESSAGES.store(sent_msgs, Ordering::Relaxed);
    LOG_RECV_MESSAGES.store(recv_msgs, Ordering::Relaxed);
}

pub fn log_sent_messages() -> bool {
    LOG_SENT_MESSAGES.load(Ordering::Relaxed)
}

pub fn log_recv_messages() -> bool {
    LOG_RECV_MESSAGES.load(Ordering::Relaxed)
}
