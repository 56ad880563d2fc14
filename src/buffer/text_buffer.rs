//! 編集可能なテキストバッファ
//!
//! ギャップバッファ、範囲マーカー、キャレット・選択範囲、変更通知をまとめた
//! テンプレート展開の対象となるバッファ。すべての編集はここを通り、
//! 生存中のマーカーはその都度自動的に補正される。

use super::gap_buffer::GapBuffer;
use super::marker::{MarkerId, MarkerTable, RangeMarker};
use crate::error::{buffer::Result, BufferError};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_BUFFER_ID: AtomicUsize = AtomicUsize::new(0);

/// バッファの一意識別子
pub type BufferId = usize;

/// 変更イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// `offset` から `removed` を取り除き `inserted` を挿入した
    Edit {
        offset: usize,
        removed: String,
        inserted: String,
    },
    /// 内容全体が置き換えられた
    Reload { old_len: usize, new_len: usize },
}

impl ChangeEvent {
    pub fn offset(&self) -> usize {
        match self {
            ChangeEvent::Edit { offset, .. } => *offset,
            ChangeEvent::Reload { .. } => 0,
        }
    }

    pub fn removed_len(&self) -> usize {
        match self {
            ChangeEvent::Edit { removed, .. } => removed.chars().count(),
            ChangeEvent::Reload { old_len, .. } => *old_len,
        }
    }

    pub fn inserted_len(&self) -> usize {
        match self {
            ChangeEvent::Edit { inserted, .. } => inserted.chars().count(),
            ChangeEvent::Reload { new_len, .. } => *new_len,
        }
    }
}

/// 変更通知リスナー
///
/// 一括編集中の変更は終了時にまとめて 1 回で通知される。
pub trait ChangeListener {
    fn on_change(&mut self, events: &[ChangeEvent]);
}

impl<F> ChangeListener for F
where
    F: FnMut(&[ChangeEvent]),
{
    fn on_change(&mut self, events: &[ChangeEvent]) {
        self(events)
    }
}

/// テキストバッファ
pub struct TextBuffer {
    id: BufferId,
    content: GapBuffer,
    markers: MarkerTable,
    caret: usize,
    selection: Option<(usize, usize)>,
    /// 未読の変更履歴（展開セッションが消費する）
    journal: Vec<ChangeEvent>,
    listeners: Vec<Box<dyn ChangeListener>>,
    bulk_depth: usize,
    bulk_events: Vec<ChangeEvent>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::from_str("")
    }

    pub fn from_str(s: &str) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::SeqCst),
            content: GapBuffer::from_str(s),
            markers: MarkerTable::new(),
            caret: 0,
            selection: None,
            journal: Vec::new(),
            listeners: Vec::new(),
            bulk_depth: 0,
            bulk_events: Vec::new(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len_chars(&self) -> usize {
        self.content.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// 現在の内容
    pub fn text(&self) -> String {
        self.content.to_string()
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<String> {
        self.content.substring(start, end)
    }

    pub fn char_at(&self, pos: usize) -> Option<char> {
        self.content.char_at(pos)
    }

    // ---- 編集操作 ----

    pub fn insert(&mut self, offset: usize, text: &str) -> Result<()> {
        self.replace(offset, offset, text).map(|_| ())
    }

    pub fn delete(&mut self, start: usize, end: usize) -> Result<String> {
        self.replace(start, end, "")
    }

    /// 範囲を置換し、置換前のテキストを返す
    pub fn replace(&mut self, start: usize, end: usize, text: &str) -> Result<String> {
        let removed = self.content.replace_range(start, end, text)?;
        let old_len = end - start;
        let new_len = text.chars().count();
        if old_len == 0 && new_len == 0 {
            return Ok(removed);
        }

        self.markers.apply_edit(start, old_len, new_len);
        self.caret = shift_point(self.caret, start, old_len, new_len);
        self.selection = None;

        self.record(ChangeEvent::Edit {
            offset: start,
            removed: removed.clone(),
            inserted: text.to_string(),
        });
        Ok(removed)
    }

    /// 一括編集スコープ。リスナーへはスコープ終了時にまとめて通知される
    pub fn run_bulk<F, T, E>(&mut self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
    {
        self.bulk_depth += 1;
        let result = body(self);
        self.bulk_depth -= 1;

        if self.bulk_depth == 0 && !self.bulk_events.is_empty() {
            let events = std::mem::take(&mut self.bulk_events);
            self.dispatch(&events);
        }
        result
    }

    pub fn is_in_bulk(&self) -> bool {
        self.bulk_depth > 0
    }

    /// 内容全体を置き換える。既存のマーカーはすべて無効になる
    pub fn reload(&mut self, text: &str) {
        let old_len = self.len_chars();
        self.content.reset(text);
        let new_len = self.len_chars();
        self.markers.invalidate_all(new_len);
        self.caret = self.caret.min(new_len);
        self.selection = None;
        self.record(ChangeEvent::Reload { old_len, new_len });
    }

    fn record(&mut self, event: ChangeEvent) {
        self.journal.push(event.clone());
        if self.bulk_depth > 0 {
            self.bulk_events.push(event);
        } else {
            self.dispatch(std::slice::from_ref(&event));
        }
    }

    fn dispatch(&mut self, events: &[ChangeEvent]) {
        for listener in &mut self.listeners {
            listener.on_change(events);
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    /// 未読の変更履歴を取り出す
    pub fn take_changes(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.journal)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.journal.is_empty()
    }

    // ---- 範囲マーカー ----

    pub fn create_range_marker(&mut self, start: usize, end: usize) -> Result<MarkerId> {
        self.check_range(start, end)?;
        Ok(self.markers.create(start, end))
    }

    pub fn marker(&self, id: MarkerId) -> Result<RangeMarker> {
        self.markers.get(id).copied()
    }

    pub fn marker_range(&self, id: MarkerId) -> Result<(usize, usize)> {
        self.markers.get(id).map(|m| (m.start, m.end))
    }

    /// マーカーの位置を直接設定する（テキストは変更しない）
    pub fn set_marker_range(&mut self, id: MarkerId, start: usize, end: usize) -> Result<()> {
        self.check_range(start, end)?;
        let marker = self.markers.get_mut(id)?;
        marker.start = start;
        marker.end = end;
        Ok(())
    }

    pub fn set_marker_greedy(&mut self, id: MarkerId, left: bool, right: bool) -> Result<()> {
        let marker = self.markers.get_mut(id)?;
        marker.greedy_left = left;
        marker.greedy_right = right;
        Ok(())
    }

    pub fn release_marker(&mut self, id: MarkerId) -> bool {
        self.markers.release(id)
    }

    pub fn live_marker_count(&self) -> usize {
        self.markers.live_count()
    }

    // ---- キャレットと選択範囲 ----

    pub fn caret(&self) -> usize {
        self.caret
    }

    pub fn set_caret(&mut self, offset: usize) {
        self.caret = offset.min(self.len_chars());
    }

    pub fn selection(&self) -> Option<(usize, usize)> {
        self.selection
    }

    pub fn selected_text(&self) -> Option<String> {
        self.selection
            .and_then(|(start, end)| self.slice(start, end).ok())
    }

    pub fn set_selection(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start.min(end), start.max(end))?;
        self.selection = Some((start.min(end), start.max(end)));
        Ok(())
    }

    pub fn remove_selection(&mut self) {
        self.selection = None;
    }

    /// 選択中のテキストを削除し、キャレットを選択開始位置へ移動する
    pub fn delete_selection(&mut self) -> Result<Option<String>> {
        match self.selection {
            Some((start, end)) => {
                let removed = self.delete(start, end)?;
                self.caret = start;
                Ok(Some(removed))
            }
            None => Ok(None),
        }
    }

    // ---- 行情報 ----

    pub fn line_number(&self, offset: usize) -> usize {
        let starts = self.content.line_start_positions();
        match starts.binary_search(&offset) {
            Ok(line) => line,
            Err(insert_at) => insert_at.saturating_sub(1),
        }
    }

    pub fn line_count(&self) -> usize {
        self.content.line_start_positions().len()
    }

    pub fn line_start_offset(&self, line: usize) -> usize {
        let starts = self.content.line_start_positions();
        starts.get(line).copied().unwrap_or_else(|| self.len_chars())
    }

    /// 行末位置（改行文字を含まない）
    pub fn line_end_offset(&self, line: usize) -> usize {
        let starts = self.content.line_start_positions();
        match starts.get(line + 1) {
            Some(next) => next - 1,
            None => self.len_chars(),
        }
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        let len = self.len_chars();
        if start > end || end > len {
            return Err(BufferError::InvalidRange { start, end, len });
        }
        Ok(())
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextBuffer")
            .field("id", &self.id)
            .field("text", &self.text())
            .field("caret", &self.caret)
            .field("selection", &self.selection)
            .field("markers", &self.markers.live_count())
            .finish()
    }
}

/// キャレットを編集に追従させる（挿入位置ちょうどのキャレットは後ろへ動く）
fn shift_point(point: usize, offset: usize, old_len: usize, new_len: usize) -> usize {
    if point < offset {
        point
    } else if point >= offset + old_len {
        point + new_len - old_len
    } else {
        offset + new_len
    }
}
