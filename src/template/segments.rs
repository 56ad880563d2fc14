//! セグメントテーブル
//!
//! 展開セッション中の各セグメントをバッファの範囲マーカーとして保持する。
//! セグメントは位置（インデックス）で識別され、名前では識別しない。
//! 座標の補正はバッファ側のマーカーアリーナが編集ごとに行う。

use crate::buffer::{MarkerId, TextBuffer};
use crate::error::{Result, SessionError};

#[derive(Debug, Default)]
pub struct SegmentTable {
    markers: Vec<MarkerId>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 両側貪欲なセグメントを追加する
    pub fn add_segment(&mut self, buffer: &mut TextBuffer, start: usize, end: usize) -> Result<usize> {
        let marker = buffer.create_range_marker(start, end)?;
        buffer.set_marker_greedy(marker, true, true)?;
        self.markers.push(marker);
        Ok(self.markers.len() - 1)
    }

    pub fn segments_count(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn marker_id(&self, index: usize) -> Result<MarkerId> {
        self.markers
            .get(index)
            .copied()
            .ok_or_else(|| SessionError::UnknownSegment { index }.into())
    }

    pub fn range(&self, buffer: &TextBuffer, index: usize) -> Result<(usize, usize)> {
        Ok(buffer.marker_range(self.marker_id(index)?)?)
    }

    pub fn get_start(&self, buffer: &TextBuffer, index: usize) -> Result<usize> {
        self.range(buffer, index).map(|(start, _)| start)
    }

    pub fn get_end(&self, buffer: &TextBuffer, index: usize) -> Result<usize> {
        self.range(buffer, index).map(|(_, end)| end)
    }

    /// セグメントの範囲を付け替える
    ///
    /// `preserve_greediness` が false なら両側貪欲に戻す。
    pub fn replace_segment_at(
        &mut self,
        buffer: &mut TextBuffer,
        index: usize,
        start: usize,
        end: usize,
        preserve_greediness: bool,
    ) -> Result<()> {
        let marker = self.marker_id(index)?;
        buffer.set_marker_range(marker, start, end)?;
        if !preserve_greediness {
            buffer.set_marker_greedy(marker, true, true)?;
        }
        Ok(())
    }

    /// 全セグメントの貪欲性を一括で切り替える
    pub fn set_segments_greedy(&self, buffer: &mut TextBuffer, greedy: bool) -> Result<()> {
        for &marker in &self.markers {
            buffer.set_marker_greedy(marker, greedy, greedy)?;
        }
        Ok(())
    }

    /// 指定セグメントの前後（インデックス順）のセグメントの貪欲性を切り替える
    ///
    /// 非貪欲にする場合も直前のセグメントの開始位置は左貪欲のまま。
    /// 同じ位置にある空の直前セグメントは、書き込まれたテキストの前に残る。
    pub fn set_neighbours_greedy(&self, buffer: &mut TextBuffer, index: usize, greedy: bool) -> Result<()> {
        if index > 0 {
            let marker = self.marker_id(index - 1)?;
            buffer.set_marker_greedy(marker, true, greedy)?;
        }
        if index + 1 < self.markers.len() {
            let marker = self.marker_id(index + 1)?;
            buffer.set_marker_greedy(marker, greedy, greedy)?;
        }
        Ok(())
    }

    /// 同じ位置から始まる他のセグメントが、指定セグメントへの入力を取り込まないようにする
    pub fn lock_segment_at_same_offset_if_any(&self, buffer: &mut TextBuffer, index: usize) -> Result<()> {
        let start = self.get_start(buffer, index)?;
        for (other, &marker) in self.markers.iter().enumerate() {
            if other == index {
                continue;
            }
            let other_marker = buffer.marker(marker)?;
            if other_marker.start == start {
                buffer.set_marker_greedy(marker, false, other_marker.greedy_right)?;
            }
        }
        Ok(())
    }

    /// 指定セグメントの内側に入り込んだ他のセグメントを外側へ押し出す
    ///
    /// 後続のセグメントは終了位置の後ろへ、先行するセグメントは開始位置の前へ。
    /// 指定セグメント自身は動かさない。
    pub fn fix_overlapped_segments(&mut self, buffer: &mut TextBuffer, current: usize) -> Result<()> {
        let (current_start, current_end) = self.range(buffer, current)?;
        for index in 0..self.markers.len() {
            let (start, end) = self.range(buffer, index)?;
            if index > current {
                if current_start <= start && start < current_end {
                    self.replace_segment_at(buffer, index, current_end, end.max(current_end), true)?;
                }
            } else if index < current && current_start < end && end <= current_end {
                self.replace_segment_at(buffer, index, start.min(current_start), current_start, true)?;
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, buffer: &TextBuffer, index: usize) -> bool {
        self.markers
            .get(index)
            .and_then(|&marker| buffer.marker(marker).ok())
            .map_or(false, |m| m.valid)
    }

    /// 無効化されたセグメントが一つでもあるか
    pub fn is_invalid(&self, buffer: &TextBuffer) -> bool {
        (0..self.markers.len()).any(|index| !self.is_valid(buffer, index))
    }

    /// 全セグメントのマーカーを解放する
    pub fn remove_all(&mut self, buffer: &mut TextBuffer) {
        for marker in self.markers.drain(..) {
            buffer.release_marker(marker);
        }
    }
}
