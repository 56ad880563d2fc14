//! altre-template - ライブテンプレート展開エンジン
//!
//! テンプレート（リテラルテキストと名前付きプレースホルダー）をバッファへ展開し、
//! タブストップ間の移動と変数値の再計算を駆動する

// コアモジュール
pub mod config;
pub mod error;
pub mod logging;

// データ層
pub mod buffer;

// 展開層
pub mod template;

// 公開API
pub use buffer::{ChangeEvent, TextBuffer};
pub use config::ExpansionOptions;
pub use error::{Result, TemplateError};
pub use template::{
    parse, ExpansionSession, SessionEvent, SessionState, StartParams, TemplateDefinition,
    TemplateManager, Variable,
};
