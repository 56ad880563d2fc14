//! 展開エンジンの設定
//!
//! ホストが JSON で与える展開オプションを保持する。

use crate::error::{config::Result, ConfigError};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_EMPTY_VARIABLE_MARKER: &str = "a";

/// テンプレート展開のオプション
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExpansionOptions {
    /// ヘッドレス（テスト）モード：開始直後に最後まで展開する
    pub headless: bool,
    /// 整形コラボレータを呼び出すかどうか
    pub reformat: bool,
    /// 空の変数を一時的に埋めるマーカー文字列
    pub empty_variable_marker: String,
    /// ホスト側でロガーを初期化する際のレベル
    pub log_level: LogLevel,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            headless: false,
            reformat: true,
            empty_variable_marker: DEFAULT_EMPTY_VARIABLE_MARKER.to_string(),
            log_level: LogLevel::default(),
        }
    }
}

impl ExpansionOptions {
    /// ヘッドレスモードの設定
    pub fn headless() -> Self {
        Self {
            headless: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: ExpansionOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// 上書き設定とマージ（上書き側のデフォルト以外の値を優先）
    pub fn merged_with(&self, overrides: &ExpansionOptions) -> ExpansionOptions {
        let defaults = ExpansionOptions::default();
        ExpansionOptions {
            headless: overrides.headless || self.headless,
            reformat: if overrides.reformat != defaults.reformat {
                overrides.reformat
            } else {
                self.reformat
            },
            empty_variable_marker: if overrides.empty_variable_marker != defaults.empty_variable_marker {
                overrides.empty_variable_marker.clone()
            } else {
                self.empty_variable_marker.clone()
            },
            log_level: if overrides.log_level != defaults.log_level {
                overrides.log_level
            } else {
                self.log_level
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.empty_variable_marker.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "empty-variable-marker".to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let options = ExpansionOptions::from_json_str("{}").unwrap();
        assert_eq!(options, ExpansionOptions::default());
        assert!(options.reformat);
        assert_eq!(options.empty_variable_marker, "a");
    }

    #[test]
    fn test_kebab_case_keys() {
        let options = ExpansionOptions::from_json_str(
            r#"{ "headless": true, "empty-variable-marker": "x", "log-level": "debug" }"#,
        )
        .unwrap();
        assert!(options.headless);
        assert_eq!(options.empty_variable_marker, "x");
        assert_eq!(options.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_empty_marker_is_rejected() {
        let result = ExpansionOptions::from_json_str(r#"{ "empty-variable-marker": "" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let base = ExpansionOptions {
            empty_variable_marker: "z".to_string(),
            ..ExpansionOptions::default()
        };
        let overrides = ExpansionOptions {
            reformat: false,
            ..ExpansionOptions::headless()
        };
        let merged = base.merged_with(&overrides);
        assert!(merged.headless);
        assert!(!merged.reformat);
        assert_eq!(merged.empty_variable_marker, "z");
    }
}
