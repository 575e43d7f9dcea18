use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chaos_smtpd::{Direction, LineLogger};

/// Keep printable ASCII and whitespace only.
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Escape control and non-ASCII characters so a log line stays on one line
/// and is safe to `cat`.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    /// 4xx replies are warnings and 5xx replies errors.
    pub fn of_reply(line: &str) -> Self {
        match line.as_bytes().first() {
            Some(b'4') => Level::Warn,
            Some(b'5') => Level::Error,
            _ => Level::Info,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    raw_display: bool,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self {
            writer,
            raw_display,
            verbose,
        })
    }

    fn emit(&self, console: &str, file: &str) {
        if self.raw_display {
            print!("{}", console);
        } else {
            print!("{}", filter_printable_chars(console));
        }

        if let Some(writer) = &self.writer {
            if let Ok(mut writer) = writer.lock() {
                let _ = writer.write_all(file.as_bytes());
                let _ = writer.flush();
            }
        }
    }

    pub fn log(&self, level: Level, remote_ip: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let console = format!("{} [{}] {} {}\n", timestamp, level, remote_ip, message);
        let file = format!(
            "{} [{}] {} {}\n",
            timestamp,
            level,
            remote_ip,
            safe_log_string(message)
        );
        self.emit(&console, &file);
    }

    /// Multi-line block, printed only in verbose mode.
    pub fn log_verbose(&self, remote_ip: &str, title: &str, details: &str) {
        if !self.verbose {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "─".repeat(60);
        let block = |details: &str| {
            format!(
                "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
                separator, timestamp, remote_ip, title, separator, details, separator
            )
        };

        let escaped = details
            .lines()
            .map(safe_log_string)
            .collect::<Vec<_>>()
            .join("\n");
        let console = if self.raw_display { details } else { escaped.as_str() };
        self.emit(&block(console), &block(&escaped));
    }
}

impl LineLogger for Logger {
    fn log_line(&self, remote_ip: &str, direction: Direction, line: &str) {
        let level = match direction {
            Direction::Read => Level::Info,
            Direction::Write => Level::of_reply(line),
        };
        self.log(level, remote_ip, &format!("{} {}", direction, line));
    }
}
