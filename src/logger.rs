use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// File-appending logger shared by the registry and worker threads.
/// Falls back to stderr when the log file cannot be opened, so logging
/// never takes the process down.
pub struct Logger {
    file: Mutex<Option<File>>,
}

impl Logger {
    pub fn new(log_path: &str) -> Self {
        if let Some(parent) = Path::new(log_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .ok();

        Logger {
            file: Mutex::new(file),
        }
    }

    pub fn log(&self, level: &str, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("[{timestamp}] [{level}] {message}\n");

        if let Ok(mut guard) = self.file.lock() {
            match guard.as_mut() {
                Some(file) => {
                    let _ = file.write_all(log_line.as_bytes());
                    let _ = file.flush();
                }
                None => eprint!("{log_line}"),
            }
        }
    }

    pub fn debug(&self, message: &str) {
        self.log("DEBUG", message);
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERROR", message);
    }
}

// Global logger instance. Path override via MODEL_HUB_LOG.
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = {
        let path = std::env::var("MODEL_HUB_LOG")
            .unwrap_or_else(|_| "logs/model_hub.log".to_string());
        Logger::new(&path)
    };
}

// Convenience macros
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.debug(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.info(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.warn(&format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::LOGGER.error(&format!($($arg)*));
    };
}
