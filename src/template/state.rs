//! 展開セッション
//!
//! テンプレート 1 回分の展開を駆動する状態機械。
//! セグメントの実体化、不動点に達するまでの再計算、タブストップ間の移動、
//! 外部編集の検出と終了処理を担当する。
//!
//! セッションはバッファを所有しない。各操作は対象の `TextBuffer` を引数に取り、
//! 開始時に結び付いたバッファ以外を渡すとエラーになる。

use super::definition::{self, TemplateDefinition, END, SELECTION};
use super::expression::{Expression, ExpressionContext, RecalcHook, TemplateResult, VariableValues};
use super::observer::{ObserverList, SessionEvent, SessionObserver};
use super::reformat::{smart_indent, Reformatter};
use super::segments::SegmentTable;
use crate::buffer::{BufferId, ChangeEvent, MarkerId, TextBuffer};
use crate::config::ExpansionOptions;
use crate::error::{Result, SessionError, TemplateError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    /// 変数インデックス
    AtVariable(usize),
    Finished,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Cancelled)
    }
}

/// 直近の再計算の統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecalcReport {
    /// 実行したパス数（変更のない最終パスを含む）
    pub passes: usize,
    /// 1 つ以上の変数が変化したパス数
    pub changed_passes: usize,
    /// 上限に達する前に収束したか
    pub converged: bool,
}

/// ユーザーの選択を待っている候補一覧
#[derive(Debug, Clone)]
pub struct PendingChoice {
    pub variable: usize,
    pub candidates: Vec<TemplateResult>,
    pub advertising_text: Option<String>,
}

/// フォーカス中の変数の値を検査する述語。false なら展開を終える
pub type ValueFilter = Box<dyn Fn(&str, &str) -> bool>;

struct SegmentChange {
    segment: usize,
    text: String,
}

/// 式の評価中に見える変数の値
struct SessionValues<'a> {
    template: &'a TemplateDefinition,
    segments: &'a SegmentTable,
    buffer: &'a TextBuffer,
    predefined: &'a HashMap<String, String>,
    selection: Option<&'a str>,
}

impl VariableValues for SessionValues<'_> {
    fn variable_value(&self, name: &str) -> Option<String> {
        match name {
            SELECTION => return Some(self.selection.unwrap_or_default().to_string()),
            END => return Some(String::new()),
            _ => {}
        }
        if let Some(value) = self.predefined.get(name) {
            return Some(value.clone());
        }
        let segment = self.template.variable_segment_number(name)?;
        let (start, end) = self.segments.range(self.buffer, segment).ok()?;
        self.buffer.slice(start, end).ok()
    }
}

/// テンプレート展開セッション
pub struct ExpansionSession {
    template: TemplateDefinition,
    buffer_id: Option<BufferId>,
    segments: SegmentTable,
    template_range: Option<MarkerId>,
    state: SessionState,
    current_segment: Option<usize>,
    predefined_values: HashMap<String, String>,
    selection_text: Option<String>,
    selection_calculated: bool,
    template_indented: bool,
    /// 終了通知（完了・取り消し共通）を送ったか
    notified_end: bool,
    observers: ObserverList,
    reformatter: Option<Box<dyn Reformatter>>,
    value_filter: Option<ValueFilter>,
    options: ExpansionOptions,
    pending_choice: Option<PendingChoice>,
    /// 自身の編集後に確認したフォーカス中セグメントの範囲
    focus_range: Option<(usize, usize)>,
    last_report: RecalcReport,
}

impl ExpansionSession {
    pub fn new(template: TemplateDefinition) -> Self {
        Self {
            template,
            buffer_id: None,
            segments: SegmentTable::new(),
            template_range: None,
            state: SessionState::NotStarted,
            current_segment: None,
            predefined_values: HashMap::new(),
            selection_text: None,
            selection_calculated: false,
            template_indented: false,
            notified_end: false,
            observers: ObserverList::new(),
            reformatter: None,
            value_filter: None,
            options: ExpansionOptions::default(),
            pending_choice: None,
            focus_range: None,
            last_report: RecalcReport::default(),
        }
    }

    pub fn with_predefined_values(mut self, values: HashMap<String, String>) -> Self {
        self.predefined_values = values;
        self
    }

    /// 展開前に選択されていたテキスト（`SELECTION` の値）
    pub fn with_selection_text(mut self, text: impl Into<String>) -> Self {
        self.selection_text = Some(text.into());
        self
    }

    pub fn with_value_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &str) -> bool + 'static,
    {
        self.value_filter = Some(Box::new(filter));
        self
    }

    pub fn with_reformatter(mut self, reformatter: Box<dyn Reformatter>) -> Self {
        self.reformatter = Some(reformatter);
        self
    }

    pub fn with_options(mut self, options: ExpansionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn SessionObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.add(observer);
    }

    // ---- 状態の参照 ----

    pub fn template(&self) -> &TemplateDefinition {
        &self.template
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn options(&self) -> &ExpansionOptions {
        &self.options
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer_id
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current_variable(&self) -> Option<usize> {
        match self.state {
            SessionState::AtVariable(index) => Some(index),
            _ => None,
        }
    }

    pub fn current_segment(&self) -> Option<usize> {
        self.current_segment
    }

    pub fn selection_text(&self) -> Option<&str> {
        self.selection_text.as_deref()
    }

    pub fn pending_choice(&self) -> Option<&PendingChoice> {
        self.pending_choice.as_ref()
    }

    pub fn last_recalc_report(&self) -> RecalcReport {
        self.last_report
    }

    pub fn segments_count(&self) -> usize {
        self.segments.segments_count()
    }

    pub fn segment_range(&self, buffer: &TextBuffer, segment: usize) -> Result<(usize, usize)> {
        self.segments.range(buffer, segment)
    }

    pub fn current_variable_range(&self, buffer: &TextBuffer) -> Option<(usize, usize)> {
        self.current_segment
            .and_then(|segment| self.segments.range(buffer, segment).ok())
    }

    /// 指定名の変数の最初のセグメントの範囲
    pub fn variable_range(&self, buffer: &TextBuffer, name: &str) -> Option<(usize, usize)> {
        let segment = self.template.variable_segment_number(name)?;
        self.segments.range(buffer, segment).ok()
    }

    pub fn variable_value(&self, buffer: &TextBuffer, name: &str) -> Option<String> {
        self.values(buffer).variable_value(name)
    }

    /// テンプレート全体の現在の範囲
    pub fn template_range(&self, buffer: &TextBuffer) -> Option<(usize, usize)> {
        self.template_range
            .and_then(|marker| buffer.marker_range(marker).ok())
    }

    fn values<'a>(&'a self, buffer: &'a TextBuffer) -> SessionValues<'a> {
        SessionValues {
            template: &self.template,
            segments: &self.segments,
            buffer,
            predefined: &self.predefined_values,
            selection: self.selection_text.as_deref(),
        }
    }

    // ---- 公開操作 ----

    /// 展開を開始する
    ///
    /// キャレット位置にリテラルテキストを挿入（インラインでなければ）してセグメントを作り、
    /// 2 回の完全な再計算の後、最初のタブストップへ移動する。
    /// タブストップがなければその場で完了する。
    pub fn start(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        if self.state != SessionState::NotStarted {
            return Err(SessionError::AlreadyStarted.into());
        }
        self.buffer_id = Some(buffer.id());
        // 開始前の編集はセッションの関知するところではない
        buffer.take_changes();
        self.guarded(buffer, Self::do_start)
    }

    pub fn next_tab(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, Self::do_next_tab)
    }

    pub fn previous_tab(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, Self::do_previous_tab)
    }

    /// 展開を終える。`broken_off` が true なら中断として扱う
    pub fn goto_end(&mut self, buffer: &mut TextBuffer, broken_off: bool) -> Result<()> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, |session, buffer| session.do_goto_end(buffer, broken_off))
    }

    /// 再計算を実行する
    pub fn recalculate(&mut self, buffer: &mut TextBuffer, quick: bool) -> Result<RecalcReport> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, |session, buffer| {
            session.sync_external_changes(buffer)?;
            session.calc_results(buffer, quick)
        })
    }

    /// ホストによる編集を取り込む
    ///
    /// フォーカス中のセグメント内の編集なら軽量な再計算を行い、
    /// それ以外の編集ならセッションを取り消す。
    pub fn after_change(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, Self::sync_external_changes)
    }

    /// 変数 `index` がタブストップかどうか
    pub fn is_tab_stop(&self, buffer: &TextBuffer, index: usize) -> Result<bool> {
        self.check_buffer(buffer)?;
        self.check_if_tab_stop(buffer, index)
    }

    pub fn fix_overlapped_segments(&mut self, buffer: &mut TextBuffer, segment: usize) -> Result<()> {
        self.check_buffer(buffer)?;
        self.guarded(buffer, |session, buffer| {
            session.segments.fix_overlapped_segments(buffer, segment)
        })
    }

    /// 保留中の候補から 1 つを選んで次のタブストップへ進む
    pub fn choose_candidate(&mut self, buffer: &mut TextBuffer, index: usize) -> Result<()> {
        self.check_buffer(buffer)?;
        let count = match &self.pending_choice {
            Some(choice) => choice.candidates.len(),
            None => return Err(SessionError::NoPendingChoice.into()),
        };
        if index >= count {
            return Err(SessionError::CandidateOutOfRange { index, count }.into());
        }
        self.guarded(buffer, |session, buffer| session.do_choose_candidate(buffer, index))
    }

    /// 候補一覧を閉じる（フォーカスはそのまま）
    pub fn dismiss_candidates(&mut self) {
        self.pending_choice = None;
    }

    /// 展開を取り消す
    pub fn cancel(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.check_buffer(buffer)?;
        self.cancel_session(buffer);
        buffer.take_changes();
        Ok(())
    }

    /// 通知なしでセグメントを解放する（同じバッファで次の展開を始める前など）
    pub(crate) fn dispose(&mut self, buffer: &mut TextBuffer) {
        if !self.state.is_terminal() {
            log::debug!("template `{}`: disposed", self.template.key());
            self.state = SessionState::Cancelled;
        }
        self.current_segment = None;
        self.release_all(buffer);
    }

    // ---- 内部処理 ----

    fn check_buffer(&self, buffer: &TextBuffer) -> Result<()> {
        match self.buffer_id {
            None => Err(SessionError::NotStarted.into()),
            Some(expected) if expected != buffer.id() => Err(SessionError::ForeignBuffer {
                expected,
                actual: buffer.id(),
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    /// 操作を実行し、失敗したらセッションを取り消してからエラーを返す
    fn guarded<T, F>(&mut self, buffer: &mut TextBuffer, op: F) -> Result<T>
    where
        F: FnOnce(&mut Self, &mut TextBuffer) -> Result<T>,
    {
        match op(self, buffer) {
            Ok(value) => {
                self.mark_changes_seen(buffer);
                Ok(value)
            }
            Err(error) => {
                log::warn!("template `{}`: session aborted: {}", self.template.key(), error);
                self.cancel_session(buffer);
                buffer.take_changes();
                Err(error)
            }
        }
    }

    /// 自身の編集を既読にし、フォーカス範囲を記録し直す
    fn mark_changes_seen(&mut self, buffer: &mut TextBuffer) {
        buffer.take_changes();
        self.focus_range = if self.state.is_terminal() {
            None
        } else {
            self.current_variable_range(buffer)
        };
    }

    fn notify(&mut self, event: SessionEvent) {
        self.observers.notify(&self.template, &event);
    }

    fn corrupted(&self, detail: String) -> TemplateError {
        SessionError::Corrupted {
            key: self.template.key().to_string(),
            detail,
        }
        .into()
    }

    /// バッファ内に収まっていることを確認したセグメント範囲
    fn checked_range(&self, buffer: &TextBuffer, segment: usize) -> Result<(usize, usize)> {
        if !self.segments.is_valid(buffer, segment) {
            return Err(self.corrupted(format!("segment {} was invalidated", segment)));
        }
        let (start, end) = self.segments.range(buffer, segment)?;
        if start > end || end > buffer.len_chars() {
            return Err(self.corrupted(format!(
                "segment {} at {}..{} is outside buffer of length {}",
                segment,
                start,
                end,
                buffer.len_chars()
            )));
        }
        Ok((start, end))
    }

    fn segment_text(&self, buffer: &TextBuffer, segment: usize) -> Result<String> {
        let (start, end) = self.checked_range(buffer, segment)?;
        Ok(buffer.slice(start, end)?)
    }

    fn do_start(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        let caret = buffer.caret();
        let text_len = self.template.literal_text().chars().count();
        let range_end = if self.template.is_inline() {
            caret + text_len
        } else {
            caret
        };
        let range = buffer.create_range_marker(caret, range_end)?;
        buffer.set_marker_greedy(range, true, true)?;
        self.template_range = Some(range);

        if !self.template.is_inline() {
            buffer.insert(caret, self.template.literal_text())?;
        }
        for segment in self.template.segments() {
            let offset = caret + segment.offset;
            self.segments.add_segment(buffer, offset, offset)?;
        }
        log::debug!(
            "template `{}`: started at {} with {} segments",
            self.template.key(),
            caret,
            self.segments.segments_count()
        );

        // 他の変数の計算結果を参照する式のため、完全な再計算を 2 回行う
        self.calc_results(buffer, false)?;
        self.calc_results(buffer, false)?;
        self.do_reformat(buffer)?;

        match self.next_variable_number(buffer, None)? {
            Some(next) => {
                self.notify(SessionEvent::WaitingForInput);
                self.set_current_variable(next);
                self.focus_current_expression(buffer)?;
                self.notify(SessionEvent::CurrentVariableChanged {
                    old: None,
                    new: Some(next),
                });
            }
            None => self.finish_template_editing(buffer)?,
        }
        Ok(())
    }

    fn do_next_tab(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.sync_external_changes(buffer)?;
        let Some(old) = self.current_variable() else {
            return Ok(());
        };
        self.pending_choice = None;

        match self.next_variable_number(buffer, Some(old))? {
            None => {
                self.calc_results(buffer, false)?;
                if self.state.is_terminal() {
                    return Ok(());
                }
                self.do_reformat(buffer)?;
                self.finish_template_editing(buffer)
            }
            Some(next) => self.move_to_variable(buffer, old, next),
        }
    }

    fn do_previous_tab(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.sync_external_changes(buffer)?;
        let Some(old) = self.current_variable() else {
            return Ok(());
        };
        self.pending_choice = None;

        match self.previous_variable_number(buffer, old)? {
            Some(previous) => self.move_to_variable(buffer, old, previous),
            None => Ok(()),
        }
    }

    fn move_to_variable(&mut self, buffer: &mut TextBuffer, old: usize, next: usize) -> Result<()> {
        self.calc_results(buffer, false)?;
        if self.state.is_terminal() {
            return Ok(());
        }
        self.do_reformat(buffer)?;
        self.set_current_variable(next);
        self.focus_current_expression(buffer)?;
        self.notify(SessionEvent::CurrentVariableChanged {
            old: Some(old),
            new: Some(next),
        });
        Ok(())
    }

    fn do_goto_end(&mut self, buffer: &mut TextBuffer, broken_off: bool) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if !broken_off {
            self.sync_external_changes(buffer)?;
            if self.state.is_terminal() {
                return Ok(());
            }
        } else {
            buffer.take_changes();
        }
        self.pending_choice = None;

        self.calc_results(buffer, false)?;
        if self.state.is_terminal() {
            return Ok(());
        }
        if !broken_off || self.options.headless {
            self.do_reformat(buffer)?;
        }
        self.set_final_editor_state(buffer, broken_off)?;
        self.cleanup_template_state(buffer, broken_off);
        Ok(())
    }

    fn do_choose_candidate(&mut self, buffer: &mut TextBuffer, index: usize) -> Result<()> {
        self.sync_external_changes(buffer)?;
        let Some(choice) = self.pending_choice.take() else {
            return Ok(());
        };
        let Some(segment) = self.current_segment else {
            return Ok(());
        };
        let text = choice.candidates[index].text().to_string();
        log::debug!(
            "template `{}`: candidate `{}` chosen for variable {}",
            self.template.key(),
            text,
            choice.variable
        );

        self.replace_segment_text(buffer, segment, &text)?;
        let (_, end) = self.checked_range(buffer, segment)?;
        buffer.set_caret(end);
        self.calc_results(buffer, true)?;
        self.mark_changes_seen(buffer);
        self.do_next_tab(buffer)
    }

    /// 未読の外部編集を調べ、フォーカス中のセグメント外なら取り消す
    fn sync_external_changes(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        let events = buffer.take_changes();
        if events.is_empty() || self.state.is_terminal() {
            return Ok(());
        }

        let inside = match self.focus_range {
            Some(range) => edits_stay_inside(range, &events),
            None => false,
        };
        if !inside || self.segments.is_invalid(buffer) {
            log::debug!(
                "template `{}`: cancelled by an edit outside the current variable",
                self.template.key()
            );
            self.cancel_session(buffer);
            return Ok(());
        }

        self.calc_results(buffer, true)?;
        self.mark_changes_seen(buffer);
        Ok(())
    }

    fn set_current_variable(&mut self, index: usize) {
        self.state = SessionState::AtVariable(index);
        self.current_segment = self
            .template
            .variable(index)
            .and_then(|variable| self.template.variable_segment_number(&variable.name));
    }

    fn rejected_by_filter(&self, buffer: &TextBuffer) -> Result<bool> {
        let (Some(filter), Some(index), Some(segment)) = (
            self.value_filter.as_ref(),
            self.current_variable(),
            self.current_segment,
        ) else {
            return Ok(false);
        };
        let Some(variable) = self.template.variable(index) else {
            return Ok(false);
        };
        let value = self.segment_text(buffer, segment)?;
        Ok(!value.is_empty() && !filter(&variable.name, &value))
    }

    /// 不動点に達するか上限に達するまで再計算を繰り返す
    fn calc_results(&mut self, buffer: &mut TextBuffer, quick: bool) -> Result<RecalcReport> {
        if self.state.is_terminal() {
            return Ok(RecalcReport::default());
        }
        if self.rejected_by_filter(buffer)? {
            log::debug!(
                "template `{}`: value of the current variable was rejected",
                self.template.key()
            );
            self.finish_template_editing(buffer)?;
            return Ok(RecalcReport::default());
        }
        if let Some(current) = self.current_segment {
            self.segments.fix_overlapped_segments(buffer, current)?;
        }

        let max_passes = 3 * (self.template.variable_count() + 1);
        let mut report = RecalcReport::default();
        while report.passes < max_passes {
            report.passes += 1;
            let changed = self.recalc_pass(buffer, quick)?;
            log::trace!(
                "template `{}`: recalculation pass {} changed {} variables",
                self.template.key(),
                report.passes,
                changed
            );
            if changed == 0 {
                report.converged = true;
                break;
            }
            report.changed_passes += 1;
        }
        if !report.converged {
            log::warn!(
                "template `{}`: recalculation stopped after {} passes without converging",
                self.template.key(),
                max_passes
            );
        }
        self.last_report = report;
        Ok(report)
    }

    /// 1 パス分の評価・差分・一括適用。値が変化した変数の数を返す
    fn recalc_pass(&mut self, buffer: &mut TextBuffer, quick: bool) -> Result<usize> {
        let segment_count = self.segments.segments_count();
        let mut calced = vec![false; segment_count];
        let mut staged_values: HashMap<String, String> = HashMap::new();
        let mut changes = Vec::new();
        let mut hooks: Vec<(usize, Arc<dyn RecalcHook>)> = Vec::new();

        let first = self.current_variable().map_or(0, |current| current + 1);
        for index in first..self.template.variable_count() {
            let Some(variable) = self.template.variable(index) else {
                continue;
            };
            if self.predefined_values.contains_key(&variable.name) {
                continue;
            }
            let Some(expression) = variable.expression.as_deref() else {
                continue;
            };
            let Some(segment) = self.template.variable_segment_number(&variable.name) else {
                continue;
            };
            let result = self.recalc_segment(
                buffer,
                segment,
                quick,
                expression,
                variable.default_value.as_deref(),
            )?;
            if let Some(result) = result {
                calced[segment] = true;
                staged_values.insert(variable.name.clone(), result.text().to_string());
                if let Some(hook) = result.hook() {
                    hooks.push((segment, Arc::clone(hook)));
                }
                changes.push(SegmentChange {
                    segment,
                    text: result.text().to_string(),
                });
            }
        }

        let mut selection_written = false;
        for segment in 0..segment_count {
            if calced[segment] {
                continue;
            }
            let Some(name) = self.template.segment_name(segment) else {
                continue;
            };
            if definition::is_structural_name(name) {
                continue;
            }
            if name == SELECTION {
                if self.selection_calculated {
                    continue;
                }
                selection_written = true;
            }
            let value = match staged_values.get(name) {
                Some(value) => value.clone(),
                None => self.values(buffer).variable_value(name).unwrap_or_default(),
            };
            if self.segment_text(buffer, segment)? != value {
                changes.push(SegmentChange {
                    segment,
                    text: value,
                });
            }
        }

        self.execute_changes(buffer, changes)?;
        if selection_written {
            self.selection_calculated = true;
        }
        for (segment, hook) in hooks {
            self.run_recalc_hook(buffer, segment, hook.as_ref())?;
        }
        Ok(calced.iter().filter(|&&changed| changed).count())
    }

    /// 1 セグメント分の評価。書き込むべき新しい値があれば返す
    fn recalc_segment(
        &self,
        buffer: &TextBuffer,
        segment: usize,
        quick: bool,
        expression: &dyn Expression,
        default_value: Option<&dyn Expression>,
    ) -> Result<Option<TemplateResult>> {
        let (start, end) = self.checked_range(buffer, segment)?;
        let old = buffer.slice(start, end)?;
        let values = self.values(buffer);
        let context = ExpressionContext::new(buffer, start, self.template_range(buffer), &values);

        let result = if quick {
            expression.calculate_quick_result(&context)
        } else {
            expression.calculate_result(&context)
        };
        // 入力中は、ユーザーが書いたテキストを消さない
        if quick && result.is_none() && !old.is_empty() {
            return Ok(None);
        }

        let null_or_empty = result.as_ref().map_or(true, TemplateResult::is_empty);
        if null_or_empty {
            if let Some(current) = self.current_segment {
                let (current_start, current_end) = self.segments.range(buffer, current)?;
                if start == current_end || end == current_start {
                    return Ok(None);
                }
            }
        }

        let result = match default_value {
            Some(default_value) if null_or_empty => default_value.calculate_result(&context),
            _ => result,
        };
        Ok(result.filter(|result| result.text() != old))
    }

    /// 変更を開始位置の降順で 1 回の一括編集として適用する
    fn execute_changes(&mut self, buffer: &mut TextBuffer, changes: Vec<SegmentChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut ordered = Vec::with_capacity(changes.len());
        for change in changes {
            let (start, end) = self.checked_range(buffer, change.segment)?;
            ordered.push((start, end, change));
        }
        ordered.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.segment.cmp(&a.2.segment))
        });

        buffer.run_bulk(|buffer| -> Result<()> {
            for (_, _, change) in &ordered {
                self.replace_segment_text(buffer, change.segment, &change.text)?;
            }
            Ok(())
        })
    }

    /// セグメントのテキストを置き換える。隣接セグメントは取り込まない
    fn replace_segment_text(&mut self, buffer: &mut TextBuffer, segment: usize, text: &str) -> Result<()> {
        let (start, end) = self.checked_range(buffer, segment)?;
        if buffer.slice(start, end)? == text {
            return Ok(());
        }
        self.segments.set_neighbours_greedy(buffer, segment, false)?;
        buffer.replace(start, end, text)?;
        let new_end = start + text.chars().count();
        self.segments
            .replace_segment_at(buffer, segment, start, new_end, false)?;
        self.segments.set_neighbours_greedy(buffer, segment, true)?;
        self.segments.fix_overlapped_segments(buffer, segment)
    }

    fn run_recalc_hook(&mut self, buffer: &mut TextBuffer, segment: usize, hook: &dyn RecalcHook) -> Result<()> {
        let seeded = self.init_empty_variables(buffer)?;
        self.segments.set_segments_greedy(buffer, false)?;
        if let (Some((start, end)), Some(reformatter)) =
            (self.template_range(buffer), self.reformatter.as_mut())
        {
            reformatter.shorten_references(buffer, start, end)?;
        }
        let (start, end) = self.checked_range(buffer, segment)?;
        hook.handle_recalc(buffer, start, end)?;
        self.segments.set_segments_greedy(buffer, true)?;
        self.restore_empty_variables(buffer, seeded)
    }

    /// 空の変数セグメントに一時的なマーカーを書き込み、対象のセグメント番号を返す
    fn init_empty_variables(&mut self, buffer: &mut TextBuffer) -> Result<Vec<usize>> {
        let mut changes = Vec::new();
        for segment in 0..self.segments.segments_count() {
            let (start, end) = self.checked_range(buffer, segment)?;
            if start != end {
                continue;
            }
            let Some(name) = self.template.segment_name(segment) else {
                continue;
            };
            if definition::is_structural_name(name) {
                continue;
            }
            let Some(variable) = self.template.variable_by_name(name) else {
                continue;
            };
            let marker = variable
                .expression
                .as_ref()
                .and_then(|expression| expression.empty_marker())
                .unwrap_or_else(|| self.options.empty_variable_marker.clone());
            changes.push(SegmentChange {
                segment,
                text: marker,
            });
        }
        let seeded = changes.iter().map(|change| change.segment).collect();
        self.execute_changes(buffer, changes)?;
        Ok(seeded)
    }

    /// 一時的なマーカーを位置の降順に取り除く
    fn restore_empty_variables(&mut self, buffer: &mut TextBuffer, seeded: Vec<usize>) -> Result<()> {
        if seeded.is_empty() {
            return Ok(());
        }
        let mut ranges = Vec::with_capacity(seeded.len());
        for segment in seeded {
            ranges.push(self.checked_range(buffer, segment)?);
        }
        ranges.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        buffer.run_bulk(|buffer| -> Result<()> {
            for (start, end) in ranges {
                buffer.delete(start, end)?;
            }
            Ok(())
        })
    }

    /// 字下げと整形。どちらも不要なら何もしない
    fn do_reformat(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        let wants_indent = self.template.is_to_indent() && !self.template_indented;
        let wants_reformat =
            self.options.reformat && self.template.is_to_reformat() && self.reformatter.is_some();
        if !wants_indent && !wants_reformat {
            return Ok(());
        }

        let seeded = self.init_empty_variables(buffer)?;
        self.segments.set_segments_greedy(buffer, false)?;
        if wants_indent {
            if let Some((start, end)) = self.template_range(buffer) {
                smart_indent(buffer, start, end)?;
            }
            self.template_indented = true;
        }
        if wants_reformat {
            if let (Some((start, end)), Some(reformatter)) =
                (self.template_range(buffer), self.reformatter.as_mut())
            {
                reformatter.reformat(buffer, start, end)?;
            }
        }
        self.segments.set_segments_greedy(buffer, true)?;
        self.restore_empty_variables(buffer, seeded)
    }

    fn next_variable_number(&self, buffer: &TextBuffer, current: Option<usize>) -> Result<Option<usize>> {
        let first = current.map_or(0, |current| current + 1);
        for index in first..self.template.variable_count() {
            if self.check_if_tab_stop(buffer, index)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn previous_variable_number(&self, buffer: &TextBuffer, current: usize) -> Result<Option<usize>> {
        for index in (0..current).rev() {
            if self.check_if_tab_stop(buffer, index)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn check_if_tab_stop(&self, buffer: &TextBuffer, index: usize) -> Result<bool> {
        let Some(variable) = self.template.variable(index) else {
            return Ok(false);
        };
        let Some(expression) = variable.expression.as_deref() else {
            return Ok(false);
        };
        if self.current_variable().is_none() && variable.skip_on_start {
            return Ok(false);
        }
        // セグメントを持たない変数にはフォーカスできない
        let Some(segment) = self.template.variable_segment_number(&variable.name) else {
            return Ok(false);
        };
        if variable.always_stop_at && !self.predefined_values.contains_key(&variable.name) {
            return Ok(true);
        }

        let start = self.segments.get_start(buffer, segment)?;
        let values = self.values(buffer);
        let context = ExpressionContext::new(buffer, start, self.template_range(buffer), &values);
        if expression.calculate_result(&context).is_none() {
            return Ok(true);
        }
        Ok(expression.candidates(&context).len() > 1)
    }

    /// 現在の変数を選択状態にし、候補があれば提示する
    fn focus_current_expression(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        let (Some(segment), Some(index)) = (self.current_segment, self.current_variable()) else {
            return Ok(());
        };
        // 前のフォーカスで掛けたロックを外してから掛け直す
        self.segments.set_segments_greedy(buffer, true)?;
        self.segments.lock_segment_at_same_offset_if_any(buffer, segment)?;
        let (start, end) = self.checked_range(buffer, segment)?;
        buffer.set_caret(end);
        buffer.set_selection(start, end)?;

        let Some(expression) = self
            .template
            .variable(index)
            .and_then(|variable| variable.expression.clone())
        else {
            return Ok(());
        };
        let candidates = {
            let values = self.values(buffer);
            let context = ExpressionContext::new(buffer, start, self.template_range(buffer), &values);
            expression.candidates(&context)
        };
        if candidates.is_empty() {
            return Ok(());
        }

        if self.options.headless {
            let text = candidates[0].text().to_string();
            self.replace_segment_text(buffer, segment, &text)?;
            let (_, end) = self.checked_range(buffer, segment)?;
            buffer.set_caret(end);
        } else {
            self.pending_choice = Some(PendingChoice {
                variable: index,
                candidates,
                advertising_text: expression.advertising_text(),
            });
        }
        Ok(())
    }

    /// 最終的なキャレットと選択範囲を設定する
    fn set_final_editor_state(&mut self, buffer: &mut TextBuffer, broken_off: bool) -> Result<()> {
        buffer.remove_selection();
        if broken_off && !self.options.headless {
            return Ok(());
        }

        let target_segment = self.template.end_segment_number().or_else(|| {
            self.template
                .variable_segment_number(SELECTION)
                .filter(|_| self.selection_text.is_none())
        });
        let offset = match target_segment {
            Some(segment) => Some(self.checked_range(buffer, segment)?.0),
            None if !self.template.is_selection_template() && !self.template.is_inline() => {
                self.template_range(buffer).map(|(_, end)| end)
            }
            None => None,
        };
        if let Some(offset) = offset {
            buffer.set_caret(offset);
        }

        if let (Some(selection_start), Some(selection_end)) = (
            self.template.selection_start_segment_number(),
            self.template.selection_end_segment_number(),
        ) {
            let (start, _) = self.checked_range(buffer, selection_start)?;
            let (end, _) = self.checked_range(buffer, selection_end)?;
            buffer.set_selection(start, end)?;
        }
        Ok(())
    }

    fn finish_template_editing(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        self.pending_choice = None;
        self.set_final_editor_state(buffer, false)?;
        self.cleanup_template_state(buffer, false);
        Ok(())
    }

    fn cleanup_template_state(&mut self, buffer: &mut TextBuffer, broken_off: bool) {
        self.notify(SessionEvent::BeforeFinished { broken_off });
        let old = self.current_variable();
        self.state = if broken_off {
            SessionState::Cancelled
        } else {
            SessionState::Finished
        };
        self.current_segment = None;
        if old.is_some() {
            self.notify(SessionEvent::CurrentVariableChanged { old, new: None });
        }
        if !self.notified_end {
            self.notified_end = true;
            self.notify(SessionEvent::Finished { broken_off });
        }
        log::debug!(
            "template `{}`: finished (broken off: {})",
            self.template.key(),
            broken_off
        );
        self.release_all(buffer);
    }

    /// 外部編集や内部エラーによる取り消し
    fn cancel_session(&mut self, buffer: &mut TextBuffer) {
        if self.state.is_terminal() {
            return;
        }
        let old = self.current_variable();
        self.state = SessionState::Cancelled;
        self.current_segment = None;
        self.pending_choice = None;
        if old.is_some() {
            self.notify(SessionEvent::CurrentVariableChanged { old, new: None });
        }
        if !self.notified_end {
            self.notified_end = true;
            self.notify(SessionEvent::Cancelled);
        }
        log::debug!("template `{}`: cancelled", self.template.key());
        self.release_all(buffer);
    }

    fn release_all(&mut self, buffer: &mut TextBuffer) {
        self.segments.remove_all(buffer);
        if let Some(range) = self.template_range.take() {
            buffer.release_marker(range);
        }
        self.pending_choice = None;
        self.focus_range = None;
    }
}

/// 連続する編集がすべてフォーカス範囲（両端を含む）の内側に収まるか
///
/// 範囲は各編集に合わせて伸縮させながら追跡する。
fn edits_stay_inside(range: (usize, usize), events: &[ChangeEvent]) -> bool {
    let (start, mut end) = range;
    for event in events {
        match event {
            ChangeEvent::Reload { .. } => return false,
            ChangeEvent::Edit { .. } => {
                let offset = event.offset();
                let removed = event.removed_len();
                if offset < start || offset + removed > end {
                    return false;
                }
                end = end - removed + event.inserted_len();
            }
        }
    }
    true
}

impl fmt::Debug for ExpansionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpansionSession")
            .field("template", &self.template.key())
            .field("state", &self.state)
            .field("current_segment", &self.current_segment)
            .field("segments", &self.segments.segments_count())
            .field("observers", &self.observers)
            .finish()
    }
}
