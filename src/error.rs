//! エラーハンドリングシステム
//!
//! テンプレート展開エンジン全体で使用される統一されたエラー型を定義する。
//! セッション内のエラーはすべてセッション単位で完結し、ホストを停止させない。

use thiserror::Error;

/// クレート全体のエラー型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    /// テンプレート解析エラー
    #[error("Template parse failed: {0}")]
    Parse(#[from] ParseError),

    /// バッファ操作エラー
    #[error("Buffer operation failed: {0}")]
    Buffer(#[from] BufferError),

    /// 展開セッションのエラー
    #[error("Expansion session failed: {0}")]
    Session(#[from] SessionError),

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// テンプレート解析固有のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// `$` で始まるマーカーが閉じていない、または入れ子になっている
    #[error("Malformed template at {position}: {reason}")]
    Malformed { position: usize, reason: String },

    /// 対応する変数宣言のないセグメント名
    #[error("Undeclared variable `{name}` at {position}")]
    UndeclaredVariable { name: String, position: usize },
}

/// バッファ操作固有のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid position {position} (length {len})")]
    InvalidPosition { position: usize, len: usize },

    #[error("Invalid range {start}..{end} (length {len})")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("Unknown range marker: {id}")]
    UnknownMarker { id: usize },
}

/// 展開セッション固有のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// セグメントがバッファ範囲外を指している（内部不変条件の破綻）
    #[error("Corrupted session for template `{key}`: {detail}")]
    Corrupted { key: String, detail: String },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session has not been started")]
    NotStarted,

    #[error("Session belongs to buffer {expected}, got buffer {actual}")]
    ForeignBuffer { expected: usize, actual: usize },

    #[error("Unknown segment index {index}")]
    UnknownSegment { index: usize },

    #[error("No candidate choice is pending")]
    NoPendingChoice,

    #[error("Candidate index {index} out of range ({count} candidates)")]
    CandidateOutOfRange { index: usize, count: usize },
}

/// 設定固有のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid configuration: {message}")]
    Parse { message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl TemplateError {
    /// セッションが破損したことを示すエラーかどうか
    pub fn is_corrupted_session(&self) -> bool {
        matches!(self, TemplateError::Session(SessionError::Corrupted { .. }))
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        ConfigError::Parse {
            message: error.to_string(),
        }
    }
}

/// プロジェクト標準のResult型
pub type Result<T> = std::result::Result<T, TemplateError>;

/// 各モジュール固有のResult型
pub mod buffer {
    pub type Result<T> = std::result::Result<T, super::BufferError>;
}

pub mod parse {
    pub type Result<T> = std::result::Result<T, super::ParseError>;
}

pub mod config {
    pub type Result<T> = std::result::Result<T, super::ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_error_converts_into_template_error() {
        let error: TemplateError = BufferError::InvalidPosition { position: 7, len: 3 }.into();
        assert!(matches!(
            error,
            TemplateError::Buffer(BufferError::InvalidPosition { position: 7, len: 3 })
        ));
        assert!(error.to_string().contains("Invalid position 7"));
    }

    #[test]
    fn test_corrupted_session_detection() {
        let error: TemplateError = SessionError::Corrupted {
            key: "fori".to_string(),
            detail: "segment 2 at 10..12 outside buffer of length 4".to_string(),
        }
        .into();
        assert!(error.is_corrupted_session());

        let other: TemplateError = SessionError::NotStarted.into();
        assert!(!other.is_corrupted_session());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let config_error: ConfigError = json_error.into();
        assert!(matches!(config_error, ConfigError::Parse { .. }));
    }
}
