//! ロギングシステム
//!
//! `log` ファサードのバックエンドとなる開発者向けロガーを提供する。
//! ライブラリ本体は `log::debug!` などのマクロのみを使い、出力先の決定はホストに任せる。

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// ログレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    /// `log` クレートのフィルタへ変換
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }

    fn from_level(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Error => LogLevel::Error,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warning
    }
}

/// ロガー
///
/// stderr への出力と、任意のファイルへの追記を行う。
#[derive(Debug)]
pub struct Logger {
    level: LogLevel,
    output_stderr: bool,
    output_file: Option<PathBuf>,
    file_lock: Mutex<()>,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            output_stderr: true,
            output_file: None,
            file_lock: Mutex::new(()),
        }
    }

    /// 開発者向けロガー（全レベル出力）
    pub fn for_development() -> Self {
        Self::new(LogLevel::Trace)
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// ファイル出力を設定
    pub fn with_file_output<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// 標準エラー出力を無効化
    pub fn without_stderr(mut self) -> Self {
        self.output_stderr = false;
        self
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn write_line(&self, message: &str) {
        if self.output_stderr {
            eprintln!("{}", message);
        }

        if let Some(path) = &self.output_file {
            let _guard = self.file_lock.lock();
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", message);
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.should_log(LogLevel::from_level(metadata.level()))
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = LogLevel::from_level(record.level());
        self.write_line(&format!(
            "{}: {} in {}",
            level.tag(),
            record.args(),
            record.target()
        ));
    }

    fn flush(&self) {}
}

/// ロガーをグローバルに登録する
///
/// 既に登録済みの場合は何もせず `false` を返す。
pub fn init_logging(logger: Logger) -> bool {
    let filter = logger.level().to_filter();
    match log::set_boxed_logger(Box::new(logger)) {
        Ok(()) => {
            log::set_max_level(filter);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn logger_respects_log_level() {
        let logger = Logger::for_development().without_stderr();
        assert!(logger.should_log(LogLevel::Debug));
        assert!(logger.should_log(LogLevel::Error));

        let info_logger = Logger::for_development()
            .with_level(LogLevel::Info)
            .without_stderr();
        assert!(!info_logger.should_log(LogLevel::Debug));
        assert!(info_logger.should_log(LogLevel::Warning));
    }

    #[test]
    fn logger_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.log");
        let logger = Logger::new(LogLevel::Debug)
            .without_stderr()
            .with_file_output(&path);

        logger.log(
            &log::Record::builder()
                .level(log::Level::Warn)
                .target("altre_template::state")
                .args(format_args!("recalculation cap reached"))
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .level(log::Level::Trace)
                .target("altre_template::state")
                .args(format_args!("filtered out"))
                .build(),
        );

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("WARNING: recalculation cap reached"));
        assert!(!written.contains("filtered out"));
    }

    #[test]
    fn level_filter_mapping() {
        assert_eq!(LogLevel::Warning.to_filter(), log::LevelFilter::Warn);
        assert_eq!(LogLevel::default(), LogLevel::Warning);
    }
}
