//! 式と評価結果
//!
//! 変数の値を計算する式の契約。具体的な式言語は持たず、
//! ホストが `Expression` を実装して変数ごとに差し込む。
//! 汎用的に使える少数の実装（定数、変数参照、選択肢、クロージャ、正規表現置換）も提供する。

use crate::buffer::TextBuffer;
use crate::error::buffer::Result as BufferResult;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// 評価結果の後処理フック
///
/// 結果がバッファへ書き込まれた直後に、書き込まれた範囲に対して呼ばれる。
pub trait RecalcHook {
    fn handle_recalc(&self, buffer: &mut TextBuffer, start: usize, end: usize) -> BufferResult<()>;
}

/// 式の評価結果
#[derive(Clone)]
pub enum TemplateResult {
    /// 単純なテキスト
    Plain(String),
    /// 書き込み後に後処理が必要なテキスト
    Recalculatable {
        text: String,
        hook: Arc<dyn RecalcHook>,
    },
}

impl TemplateResult {
    pub fn plain(text: impl Into<String>) -> Self {
        TemplateResult::Plain(text.into())
    }

    pub fn text(&self) -> &str {
        match self {
            TemplateResult::Plain(text) => text,
            TemplateResult::Recalculatable { text, .. } => text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    pub fn hook(&self) -> Option<&Arc<dyn RecalcHook>> {
        match self {
            TemplateResult::Plain(_) => None,
            TemplateResult::Recalculatable { hook, .. } => Some(hook),
        }
    }
}

impl fmt::Debug for TemplateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateResult::Plain(text) => f.debug_tuple("Plain").field(text).finish(),
            TemplateResult::Recalculatable { text, .. } => {
                f.debug_struct("Recalculatable").field("text", text).finish()
            }
        }
    }
}

impl PartialEq for TemplateResult {
    fn eq(&self, other: &Self) -> bool {
        self.text() == other.text() && self.hook().is_some() == other.hook().is_some()
    }
}

/// 評価中に他の変数の現在値を参照するためのインターフェース
pub trait VariableValues {
    fn variable_value(&self, name: &str) -> Option<String>;
}

/// 式の評価コンテキスト
pub struct ExpressionContext<'a> {
    buffer: &'a TextBuffer,
    start_offset: usize,
    template_range: Option<(usize, usize)>,
    values: &'a dyn VariableValues,
}

impl<'a> ExpressionContext<'a> {
    pub fn new(
        buffer: &'a TextBuffer,
        start_offset: usize,
        template_range: Option<(usize, usize)>,
        values: &'a dyn VariableValues,
    ) -> Self {
        Self {
            buffer,
            start_offset,
            template_range,
            values,
        }
    }

    /// 評価対象セグメントの開始位置
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn template_start_offset(&self) -> Option<usize> {
        self.template_range.map(|(start, _)| start)
    }

    pub fn template_end_offset(&self) -> Option<usize> {
        self.template_range.map(|(_, end)| end)
    }

    pub fn buffer(&self) -> &TextBuffer {
        self.buffer
    }

    /// 変数の現在値
    pub fn variable_value(&self, name: &str) -> Option<String> {
        self.values.variable_value(name)
    }
}

/// 変数の値を計算する式
pub trait Expression {
    /// 完全な評価
    fn calculate_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult>;

    /// 入力中の再計算で使われる軽量な評価。古い値を返してもよい
    fn calculate_quick_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        self.calculate_result(context)
    }

    /// 候補の一覧。曖昧でなければ空
    fn candidates(&self, _context: &ExpressionContext<'_>) -> Vec<TemplateResult> {
        Vec::new()
    }

    /// 候補一覧と一緒に表示する説明
    fn advertising_text(&self) -> Option<String> {
        None
    }

    /// 空の変数を一時的に埋めるマーカー
    fn empty_marker(&self) -> Option<String> {
        None
    }

    fn describe(&self) -> String {
        "expression".to_string()
    }
}

impl fmt::Debug for dyn Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({})", self.describe())
    }
}

/// 値を持たない式（自由入力欄）
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyExpression;

impl Expression for EmptyExpression {
    fn calculate_result(&self, _context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        None
    }

    fn describe(&self) -> String {
        "empty".to_string()
    }
}

/// 定数
#[derive(Debug, Clone)]
pub struct ConstantExpression {
    value: String,
}

impl ConstantExpression {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Expression for ConstantExpression {
    fn calculate_result(&self, _context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        Some(TemplateResult::plain(self.value.clone()))
    }

    fn empty_marker(&self) -> Option<String> {
        (!self.value.is_empty()).then(|| self.value.clone())
    }

    fn describe(&self) -> String {
        format!("\"{}\"", self.value)
    }
}

/// 他の変数の現在値
#[derive(Debug, Clone)]
pub struct VariableReference {
    name: String,
}

impl VariableReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Expression for VariableReference {
    fn calculate_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        context.variable_value(&self.name).map(TemplateResult::Plain)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// 固定の選択肢。結果は先頭の候補
#[derive(Debug, Clone)]
pub struct ChoiceExpression {
    items: Vec<String>,
    advertising: Option<String>,
}

impl ChoiceExpression {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
            advertising: None,
        }
    }

    pub fn with_advertising_text(mut self, text: impl Into<String>) -> Self {
        self.advertising = Some(text.into());
        self
    }
}

impl Expression for ChoiceExpression {
    fn calculate_result(&self, _context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        self.items.first().cloned().map(TemplateResult::Plain)
    }

    fn candidates(&self, _context: &ExpressionContext<'_>) -> Vec<TemplateResult> {
        self.items.iter().cloned().map(TemplateResult::Plain).collect()
    }

    fn advertising_text(&self) -> Option<String> {
        self.advertising.clone()
    }

    fn describe(&self) -> String {
        format!("enum({})", self.items.join(", "))
    }
}

type EvalFn = dyn Fn(&ExpressionContext<'_>) -> Option<TemplateResult>;

/// クロージャで定義する式
pub struct FnExpression {
    full: Box<EvalFn>,
    quick: Option<Box<EvalFn>>,
    label: String,
}

impl FnExpression {
    pub fn new<F>(label: impl Into<String>, full: F) -> Self
    where
        F: Fn(&ExpressionContext<'_>) -> Option<TemplateResult> + 'static,
    {
        Self {
            full: Box::new(full),
            quick: None,
            label: label.into(),
        }
    }

    pub fn with_quick<F>(mut self, quick: F) -> Self
    where
        F: Fn(&ExpressionContext<'_>) -> Option<TemplateResult> + 'static,
    {
        self.quick = Some(Box::new(quick));
        self
    }
}

impl Expression for FnExpression {
    fn calculate_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        (self.full)(context)
    }

    fn calculate_quick_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        match &self.quick {
            Some(quick) => quick(context),
            None => (self.full)(context),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// 別の式の結果に正規表現置換を適用する
pub struct RegexReplaceExpression {
    source: Arc<dyn Expression>,
    pattern: Regex,
    replacement: String,
}

impl RegexReplaceExpression {
    pub fn new(
        source: Arc<dyn Expression>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            source,
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    fn apply(&self, result: Option<TemplateResult>) -> Option<TemplateResult> {
        result.map(|r| {
            TemplateResult::plain(
                self.pattern
                    .replace_all(r.text(), self.replacement.as_str())
                    .into_owned(),
            )
        })
    }
}

impl Expression for RegexReplaceExpression {
    fn calculate_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        self.apply(self.source.calculate_result(context))
    }

    fn calculate_quick_result(&self, context: &ExpressionContext<'_>) -> Option<TemplateResult> {
        self.apply(self.source.calculate_quick_result(context))
    }

    fn describe(&self) -> String {
        format!(
            "regularExpression({}, {}, {})",
            self.source.describe(),
            self.pattern.as_str(),
            self.replacement
        )
    }
}

// 便利関数

pub fn empty() -> Arc<dyn Expression> {
    Arc::new(EmptyExpression)
}

pub fn constant(value: impl Into<String>) -> Arc<dyn Expression> {
    Arc::new(ConstantExpression::new(value))
}

pub fn variable(name: impl Into<String>) -> Arc<dyn Expression> {
    Arc::new(VariableReference::new(name))
}

pub fn choice<I, S>(items: I) -> Arc<dyn Expression>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Arc::new(ChoiceExpression::new(items))
}

pub fn from_fn<F>(label: impl Into<String>, full: F) -> Arc<dyn Expression>
where
    F: Fn(&ExpressionContext<'_>) -> Option<TemplateResult> + 'static,
{
    Arc::new(FnExpression::new(label, full))
}
