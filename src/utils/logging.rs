use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    // Create an environment filter
    let env_filter = if verbose {
        EnvFilter::from_default_env()
            .add_directive("shooter=debug".parse()?)
            .add_directive("warn".parse()?)
    } else {
        EnvFilter::from_default_env()
            .add_directive("shooter=info".parse()?)
            .add_directive("warn".parse()?)
    };

    // Configure the logging format
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    // If a log file is specified, create a file logger as well
    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Log of a single task execution
///
/// Every line is mirrored to `tracing` and kept so it can be persisted as the
/// bundle's `log.txt` (or the failure log).
#[derive(Debug, Clone)]
pub struct TaskLog {
    task_id: String,
    lines: Vec<String>,
}

impl TaskLog {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        info!(task_id = %self.task_id, "{}", message.as_ref());
        self.push("INFO", message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        warn!(task_id = %self.task_id, "{}", message.as_ref());
        self.push("WARNING", message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        error!(task_id = %self.task_id, "{}", message.as_ref());
        self.push("ERROR", message.as_ref());
    }

    fn push(&mut self, level: &str, message: &str) {
        self.lines.push(format!(
            "{} - {} - {} - {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.task_id,
            level,
            message
        ));
    }

    #[cfg(test)]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Text written to disk, one line per entry
    pub fn contents(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_log_lines_carry_level_and_task() {
        let mut log = TaskLog::new("task-1");
        log.info("Loading the page");
        log.error("Could not load the page");

        assert_eq!(log.lines().len(), 2);
        assert!(log.lines()[0].ends_with("task-1 - INFO - Loading the page"));
        assert!(log.lines()[1].contains(" - ERROR - "));
        assert!(log.contents().ends_with("Could not load the page\n"));
    }
}
