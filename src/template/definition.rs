//! テンプレート定義
//!
//! 解析済みの不変なテンプレート記述。リテラルテキスト、
//! リテラル中のセグメント位置、宣言順の変数リストを持つ。

use super::expression::{self, Expression};
use std::fmt;
use std::sync::Arc;

/// 展開後のキャレット位置を示す構造マーカー
pub const END: &str = "END";
/// 展開前に選択されていたテキストを受け取る暗黙の変数
pub const SELECTION: &str = "SELECTION";
/// 展開後に復元する選択範囲の開始
pub const SELECTION_START: &str = "SELECTION_START";
/// 展開後に復元する選択範囲の終了
pub const SELECTION_END: &str = "SELECTION_END";

/// 式を持たない構造マーカーかどうか
pub fn is_structural_name(name: &str) -> bool {
    matches!(name, END | SELECTION_START | SELECTION_END)
}

/// テンプレート変数
#[derive(Clone)]
pub struct Variable {
    pub name: String,
    /// `None` の変数は評価されず、タブストップにもならない
    pub expression: Option<Arc<dyn Expression>>,
    pub default_value: Option<Arc<dyn Expression>>,
    pub always_stop_at: bool,
    pub skip_on_start: bool,
}

impl Variable {
    /// 自由入力欄として宣言する（式は常に結果なし）
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: Some(expression::empty()),
            default_value: None,
            always_stop_at: true,
            skip_on_start: false,
        }
    }

    /// 式を持たない受動的な変数
    pub fn passive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: None,
            default_value: None,
            always_stop_at: false,
            skip_on_start: false,
        }
    }

    pub fn with_expression(mut self, expression: Arc<dyn Expression>) -> Self {
        self.expression = Some(expression);
        self
    }

    pub fn with_default(mut self, default_value: Arc<dyn Expression>) -> Self {
        self.default_value = Some(default_value);
        self
    }

    pub fn always_stop_at(mut self, value: bool) -> Self {
        self.always_stop_at = value;
        self
    }

    pub fn skip_on_start(mut self, value: bool) -> Self {
        self.skip_on_start = value;
        self
    }
}

fn same_expression(a: &Option<Arc<dyn Expression>>, b: &Option<Arc<dyn Expression>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.always_stop_at == other.always_stop_at
            && self.skip_on_start == other.skip_on_start
            && same_expression(&self.expression, &other.expression)
            && same_expression(&self.default_value, &other.default_value)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("expression", &self.expression.as_ref().map(|e| e.describe()))
            .field("default_value", &self.default_value.as_ref().map(|e| e.describe()))
            .field("always_stop_at", &self.always_stop_at)
            .field("skip_on_start", &self.skip_on_start)
            .finish()
    }
}

/// セグメント定義（名前とリテラルテキスト中の文字位置）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDef {
    pub name: String,
    pub offset: usize,
}

/// 解析済みテンプレート
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDefinition {
    key: String,
    literal_text: String,
    segments: Vec<SegmentDef>,
    variables: Vec<Variable>,
    inline: bool,
    to_reformat: bool,
    to_indent: bool,
}

impl TemplateDefinition {
    pub(crate) fn from_parts(
        literal_text: String,
        segments: Vec<SegmentDef>,
        variables: Vec<Variable>,
    ) -> Self {
        Self {
            key: String::new(),
            literal_text,
            segments,
            variables,
            inline: false,
            to_reformat: false,
            to_indent: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// リテラルテキストが既にキャレット位置に存在するテンプレート
    pub fn inline(mut self, value: bool) -> Self {
        self.inline = value;
        self
    }

    pub fn reformat(mut self, value: bool) -> Self {
        self.to_reformat = value;
        self
    }

    pub fn indent(mut self, value: bool) -> Self {
        self.to_indent = value;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn literal_text(&self) -> &str {
        &self.literal_text
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn is_to_reformat(&self) -> bool {
        self.to_reformat
    }

    pub fn is_to_indent(&self) -> bool {
        self.to_indent
    }

    // ---- セグメント ----

    pub fn segments(&self) -> &[SegmentDef] {
        &self.segments
    }

    pub fn segments_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_name(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.name.as_str())
    }

    pub fn segment_offset(&self, index: usize) -> Option<usize> {
        self.segments.get(index).map(|s| s.offset)
    }

    /// 指定名の最初のセグメント
    pub fn variable_segment_number(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }

    pub fn end_segment_number(&self) -> Option<usize> {
        self.variable_segment_number(END)
    }

    pub fn selection_start_segment_number(&self) -> Option<usize> {
        self.variable_segment_number(SELECTION_START)
    }

    pub fn selection_end_segment_number(&self) -> Option<usize> {
        self.variable_segment_number(SELECTION_END)
    }

    /// 選択テキストを包むテンプレートかどうか
    pub fn is_selection_template(&self) -> bool {
        self.variable_segment_number(SELECTION).is_some()
    }

    // ---- 変数 ----

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn variable(&self, index: usize) -> Option<&Variable> {
        self.variables.get(index)
    }

    pub fn variable_by_name(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    /// マーカー形式へ再エンコードする
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.literal_text.len() + self.segments.len() * 8);
        let mut segments = self.segments.iter().peekable();
        for (pos, ch) in self.literal_text.chars().enumerate() {
            while let Some(segment) = segments.next_if(|s| s.offset == pos) {
                push_marker(&mut out, &segment.name);
            }
            if ch == '$' {
                out.push_str("$$");
            } else {
                out.push(ch);
            }
        }
        for segment in segments {
            push_marker(&mut out, &segment.name);
        }
        out
    }
}

fn push_marker(out: &mut String, name: &str) {
    out.push('$');
    out.push_str(name);
    out.push('$');
}
