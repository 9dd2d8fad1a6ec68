use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::LocalTime},
    prelude::*,
};

use crate::configs::{Config, LoggingConfig};

/// Builds the filter directive from the `[logging]` section.
///
/// Chatty transport crates are pinned to `warn` unless the user names them.
pub fn filter_directive(logging: Option<&LoggingConfig>) -> String {
    let level = logging
        .and_then(|l| l.level.as_deref())
        .unwrap_or("info");
    let mut directive = format!("{level},tungstenite=warn,tokio_tungstenite=warn,hyper=warn");
    if let Some(filters) = logging.and_then(|l| l.filters.as_deref()) {
        if !filters.is_empty() {
            directive.push(',');
            directive.push_str(filters);
        }
    }
    directive
}

/// Installs the global subscriber. `RUST_LOG` wins over the config file.
pub fn init(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.logging.as_ref())));

    let stdout_layer = fmt::layer()
        .with_timer(LocalTime::rfc_3339())
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(false);

    let file_layer = config
        .logging
        .as_ref()
        .and_then(|l| l.file.as_ref())
        .map(|file| {
            if let Some(parent) = Path::new(&file.path).parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!("Failed to create log directory: {}", e);
                }
            }
            fmt::layer()
                .with_writer(CircularFileWriter::new(&file.path, file.max_lines))
                .with_timer(LocalTime::rfc_3339())
                .with_target(true)
                .with_line_number(true)
                .with_ansi(false)
        });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

/// Appends to a log file and trims it back to `max_lines` every so often.
#[derive(Clone)]
pub struct CircularFileWriter {
    path: PathBuf,
    max_lines: usize,
    lines_since_prune: Arc<Mutex<usize>>,
}

impl CircularFileWriter {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines: max_lines.max(1),
            lines_since_prune: Arc::new(Mutex::new(0)),
        }
    }

    fn prune_threshold(&self) -> usize {
        (self.max_lines / 10).max(50)
    }

    fn prune(&self) -> io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let lines: Vec<String> = BufReader::new(File::open(&self.path)?)
            .lines()
            .collect::<Result<_, _>>()?;
        if lines.len() <= self.max_lines {
            return Ok(());
        }
        let mut file = File::create(&self.path)?;
        for line in &lines[lines.len() - self.max_lines..] {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

impl io::Write for CircularFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(buf)?;

        let mut pending = self.lines_since_prune.lock();
        *pending += buf.iter().filter(|&&b| b == b'\n').count();
        if *pending >= self.prune_threshold() {
            if let Err(e) = self.prune() {
                eprintln!("Failed to prune log file: {}", e);
            }
            *pending = 0;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> fmt::MakeWriter<'a> for CircularFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::FileLoggingConfig;

    #[test]
    fn test_filter_directive_defaults_to_info() {
        assert!(filter_directive(None).starts_with("info,"));
    }

    #[test]
    fn test_filter_directive_appends_filters() {
        let logging = LoggingConfig {
            level: Some("debug".into()),
            filters: Some("gatelink::voice=trace".into()),
            file: None::<FileLoggingConfig>,
        };
        let directive = filter_directive(Some(&logging));
        assert!(directive.starts_with("debug,"));
        assert!(directive.ends_with(",gatelink::voice=trace"));
    }

    #[test]
    fn test_circular_writer_keeps_tail() {
        let path = std::env::temp_dir().join(format!("gatelink-log-{}.log", std::process::id()));
        let _ = fs::remove_file(&path);
        let mut writer = CircularFileWriter::new(&path, 10);
        for i in 0..120 {
            writeln!(writer, "line {}", i).unwrap();
        }
        writer.prune().unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines.last(), Some(&"line 119"));
        let _ = fs::remove_file(&path);
    }
}
