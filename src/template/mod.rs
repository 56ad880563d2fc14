//! テンプレート展開モジュール
//!
//! テンプレート定義の解析、セグメント管理、式の評価契約、
//! 展開セッション（状態機械）とバッファごとのセッション管理を提供

pub mod definition;
pub mod expression;
pub mod manager;
pub mod observer;
pub mod parser;
pub mod reformat;
pub mod segments;
pub mod state;

// 公開API
pub use definition::{SegmentDef, TemplateDefinition, Variable, END, SELECTION, SELECTION_END, SELECTION_START};
pub use expression::{
    Expression, ExpressionContext, RecalcHook, TemplateResult, VariableValues,
};
pub use manager::{StartParams, TemplateManager};
pub use observer::{ObserverList, SessionEvent, SessionObserver};
pub use parser::parse;
pub use reformat::{smart_indent, Reformatter};
pub use segments::SegmentTable;
pub use state::{ExpansionSession, PendingChoice, RecalcReport, SessionState, ValueFilter};
