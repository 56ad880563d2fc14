//! 範囲マーカー
//!
//! バッファへの編集に追従して位置を自動的に補正する範囲の集合。
//! マーカーは小さな整数 ID で参照されるアリーナに格納され、
//! 編集の確定時に `apply_edit` で一括して補正される。

use crate::error::{buffer::Result, BufferError};

/// マーカーの一意識別子
pub type MarkerId = usize;

/// 単一の範囲マーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMarker {
    pub start: usize,
    pub end: usize,
    /// 開始位置ちょうどへの挿入を取り込むか
    pub greedy_left: bool,
    /// 終了位置ちょうどへの挿入を取り込むか
    pub greedy_right: bool,
    /// バッファ全体の再読み込みなどで位置が意味を失った場合 false
    pub valid: bool,
}

impl RangeMarker {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            greedy_left: false,
            greedy_right: false,
            valid: true,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 編集 `[offset, offset + old_len)` → 長さ `new_len` に追従する
    fn apply_edit(&mut self, offset: usize, old_len: usize, new_len: usize) {
        let start = map_boundary(self.start, offset, old_len, new_len, !self.greedy_left, false);
        let end = map_boundary(self.end, offset, old_len, new_len, self.greedy_right, true);
        self.start = start;
        // 非貪欲な空マーカーは挿入テキストの後ろへ移動する
        self.end = end.max(start);
    }
}

/// 境界位置を編集後の座標へ写像する
///
/// `moves_on_insert` はちょうど挿入位置にある境界が挿入テキストの後ろへ動くかどうか。
fn map_boundary(
    point: usize,
    offset: usize,
    old_len: usize,
    new_len: usize,
    moves_on_insert: bool,
    is_end: bool,
) -> usize {
    let removed_end = offset + old_len;
    if point < offset {
        return point;
    }
    if old_len == 0 {
        if point > offset || moves_on_insert {
            return point + new_len;
        }
        return point;
    }
    if point == offset {
        return point;
    }
    if point >= removed_end {
        return point + new_len - old_len;
    }
    // 削除範囲の内部
    if is_end {
        offset + new_len
    } else {
        offset
    }
}

/// マーカーのアリーナ
#[derive(Debug, Clone, Default)]
pub struct MarkerTable {
    markers: Vec<Option<RangeMarker>>,
    free: Vec<MarkerId>,
}

impl MarkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, start: usize, end: usize) -> MarkerId {
        let marker = Some(RangeMarker::new(start, end));
        match self.free.pop() {
            Some(id) => {
                self.markers[id] = marker;
                id
            }
            None => {
                self.markers.push(marker);
                self.markers.len() - 1
            }
        }
    }

    pub fn get(&self, id: MarkerId) -> Result<&RangeMarker> {
        self.markers
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(BufferError::UnknownMarker { id })
    }

    pub fn get_mut(&mut self, id: MarkerId) -> Result<&mut RangeMarker> {
        self.markers
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(BufferError::UnknownMarker { id })
    }

    pub fn release(&mut self, id: MarkerId) -> bool {
        match self.markers.get_mut(id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(id);
                true
            }
            _ => false,
        }
    }

    /// 生存しているマーカー数
    pub fn live_count(&self) -> usize {
        self.markers.iter().filter(|m| m.is_some()).count()
    }

    /// すべての生存マーカーを編集に追従させる
    pub fn apply_edit(&mut self, offset: usize, old_len: usize, new_len: usize) {
        for marker in self.markers.iter_mut().flatten() {
            marker.apply_edit(offset, old_len, new_len);
        }
    }

    /// 全マーカーを無効化し、新しい長さに収まるよう切り詰める
    pub fn invalidate_all(&mut self, new_len: usize) {
        for marker in self.markers.iter_mut().flatten() {
            marker.valid = false;
            marker.start = marker.start.min(new_len);
            marker.end = marker.end.min(new_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(start: usize, end: usize, left: bool, right: bool) -> RangeMarker {
        RangeMarker {
            greedy_left: left,
            greedy_right: right,
            ..RangeMarker::new(start, end)
        }
    }

    #[test]
    fn test_insert_before_shifts() {
        let mut m = marker(5, 8, false, false);
        m.apply_edit(2, 0, 3);
        assert_eq!((m.start, m.end), (8, 11));
    }

    #[test]
    fn test_insert_inside_grows() {
        let mut m = marker(5, 8, false, false);
        m.apply_edit(6, 0, 2);
        assert_eq!((m.start, m.end), (5, 10));
    }

    #[test]
    fn test_insert_at_boundaries_respects_greediness() {
        let mut lazy = marker(5, 8, false, false);
        lazy.apply_edit(5, 0, 2);
        assert_eq!((lazy.start, lazy.end), (7, 10));
        lazy.apply_edit(10, 0, 1);
        assert_eq!((lazy.start, lazy.end), (7, 10));

        let mut greedy = marker(5, 8, true, true);
        greedy.apply_edit(5, 0, 2);
        assert_eq!((greedy.start, greedy.end), (5, 10));
        greedy.apply_edit(10, 0, 1);
        assert_eq!((greedy.start, greedy.end), (5, 11));
    }

    #[test]
    fn test_empty_marker_insertion() {
        let mut greedy = marker(3, 3, true, true);
        greedy.apply_edit(3, 0, 4);
        assert_eq!((greedy.start, greedy.end), (3, 7));

        let mut lazy = marker(3, 3, false, false);
        lazy.apply_edit(3, 0, 4);
        assert_eq!((lazy.start, lazy.end), (7, 7));

        let mut left_only = marker(3, 3, true, false);
        left_only.apply_edit(3, 0, 4);
        assert_eq!((left_only.start, left_only.end), (3, 3));
    }

    #[test]
    fn test_delete_covering_marker_collapses() {
        let mut m = marker(4, 6, true, true);
        m.apply_edit(2, 6, 0);
        assert_eq!((m.start, m.end), (2, 2));
    }

    #[test]
    fn test_replace_inside_marker() {
        let mut m = marker(2, 10, false, false);
        m.apply_edit(4, 3, 1);
        assert_eq!((m.start, m.end), (2, 8));
    }

    #[test]
    fn test_delete_ending_at_marker_start() {
        let mut m = marker(5, 7, false, false);
        m.apply_edit(2, 3, 0);
        assert_eq!((m.start, m.end), (2, 4));
    }

    #[test]
    fn test_table_reuses_released_ids() {
        let mut table = MarkerTable::new();
        let a = table.create(0, 1);
        let b = table.create(2, 3);
        assert!(table.release(a));
        assert!(!table.release(a));
        let c = table.create(4, 4);
        assert_eq!(c, a);
        assert_eq!(table.live_count(), 2);
        assert_eq!(table.get(b).unwrap().start, 2);
        assert!(table.get(99).is_err());
    }
}
