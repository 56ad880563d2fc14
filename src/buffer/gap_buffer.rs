//! ギャップバッファ実装
//!
//! テンプレートを展開するテキストの格納領域。位置はすべて文字単位で扱う。

use crate::error::{buffer::Result, BufferError};
use std::fmt;

const DEFAULT_GAP_CAPACITY: usize = 256;
const MIN_GAP_RESERVE: usize = 64;
const GAP_GROWTH_FACTOR: usize = 2;

/// ギャップバッファ構造体
///
/// 編集位置付近にギャップ（空き領域）を保持し、
/// 連続した挿入・削除を高速化する
#[derive(Debug, Clone)]
pub struct GapBuffer {
    /// 内部バッファ（文字単位）
    buffer: Vec<char>,
    /// ギャップの開始位置
    gap_start: usize,
    /// ギャップの終了位置（排他的）
    gap_end: usize,
}

impl GapBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GAP_CAPACITY)
    }

    /// 指定容量で新しいギャップバッファを作成
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec!['\0'; capacity],
            gap_start: 0,
            gap_end: capacity,
        }
    }

    /// 文字列からギャップバッファを作成
    pub fn from_str(s: &str) -> Self {
        let chars: Vec<char> = s.chars().collect();
        let gap_size = (chars.len() / 4).max(MIN_GAP_RESERVE);
        let mut buffer = chars;
        let text_len = buffer.len();
        buffer.resize(text_len + gap_size, '\0');

        Self {
            buffer,
            gap_start: text_len,
            gap_end: text_len + gap_size,
        }
    }

    pub fn gap_size(&self) -> usize {
        self.gap_end - self.gap_start
    }

    /// 有効な文字数
    pub fn len_chars(&self) -> usize {
        self.buffer.len() - self.gap_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len_chars() == 0
    }

    /// 指定位置の文字を取得
    pub fn char_at(&self, pos: usize) -> Option<char> {
        if pos >= self.len_chars() {
            return None;
        }
        let physical = if pos < self.gap_start {
            pos
        } else {
            pos + self.gap_size()
        };
        self.buffer.get(physical).copied()
    }

    /// 指定範囲のテキストを取得
    pub fn substring(&self, start: usize, end: usize) -> Result<String> {
        self.check_range(start, end)?;
        Ok((start..end).filter_map(|pos| self.char_at(pos)).collect())
    }

    /// 指定位置に文字列を挿入
    pub fn insert_str(&mut self, pos: usize, s: &str) -> Result<()> {
        if pos > self.len_chars() {
            return Err(BufferError::InvalidPosition {
                position: pos,
                len: self.len_chars(),
            });
        }
        let chars: Vec<char> = s.chars().collect();
        if chars.is_empty() {
            return Ok(());
        }

        self.move_gap_to(pos);
        if self.gap_size() < chars.len() {
            self.grow_gap(chars.len());
        }

        let gap_pos = self.gap_start;
        self.buffer[gap_pos..gap_pos + chars.len()].copy_from_slice(&chars);
        self.gap_start += chars.len();
        Ok(())
    }

    /// 指定範囲を削除し、削除したテキストを返す
    pub fn delete_range(&mut self, start: usize, end: usize) -> Result<String> {
        let deleted = self.substring(start, end)?;
        if start == end {
            return Ok(deleted);
        }

        self.move_gap_to(end);
        self.gap_start = start;
        Ok(deleted)
    }

    /// 指定範囲を置換し、置換前のテキストを返す
    pub fn replace_range(&mut self, start: usize, end: usize, s: &str) -> Result<String> {
        let deleted = self.delete_range(start, end)?;
        self.insert_str(start, s)?;
        Ok(deleted)
    }

    /// 内容をすべて置き換える
    pub fn reset(&mut self, s: &str) {
        *self = Self::from_str(s);
    }

    /// 行の開始位置（文字単位）のリスト
    pub fn line_start_positions(&self) -> Vec<usize> {
        let mut starts = vec![0];
        for pos in 0..self.len_chars() {
            if self.char_at(pos) == Some('\n') {
                starts.push(pos + 1);
            }
        }
        starts
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        let len = self.len_chars();
        if start > end || end > len {
            return Err(BufferError::InvalidRange { start, end, len });
        }
        Ok(())
    }

    /// ギャップを指定位置（文字単位）へ移動
    fn move_gap_to(&mut self, pos: usize) {
        if pos == self.gap_start {
            return;
        }

        let gap_size = self.gap_size();
        if pos < self.gap_start {
            // ギャップより前の文字列を後ろへずらす
            let count = self.gap_start - pos;
            self.buffer.copy_within(pos..self.gap_start, self.gap_end - count);
            self.gap_start = pos;
            self.gap_end = pos + gap_size;
        } else {
            let count = pos - self.gap_start;
            self.buffer
                .copy_within(self.gap_end..self.gap_end + count, self.gap_start);
            self.gap_start = pos;
            self.gap_end = pos + gap_size;
        }
    }

    /// ギャップを拡張
    fn grow_gap(&mut self, required: usize) {
        let current = self.buffer.len();
        let new_gap = (required + MIN_GAP_RESERVE).max(current * GAP_GROWTH_FACTOR / 2);
        let suffix_len = current - self.gap_end;

        let mut grown = Vec::with_capacity(current + new_gap);
        grown.extend_from_slice(&self.buffer[..self.gap_start]);
        grown.resize(self.gap_start + self.gap_size() + new_gap, '\0');
        grown.extend_from_slice(&self.buffer[self.gap_end..]);

        self.gap_end = grown.len() - suffix_len;
        self.buffer = grown;
    }
}

impl Default for GapBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.buffer[..self.gap_start].iter().collect();
        let suffix: String = self.buffer[self.gap_end..].iter().collect();
        f.write_str(&prefix)?;
        f.write_str(&suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let mut buffer = GapBuffer::new();
        buffer.insert_str(0, "for () {}").unwrap();
        buffer.insert_str(5, "int i").unwrap();
        assert_eq!(buffer.to_string(), "for (int i) {}");

        let deleted = buffer.delete_range(4, 11).unwrap();
        assert_eq!(deleted, "(int i)");
        assert_eq!(buffer.to_string(), "for  {}");
    }

    #[test]
    fn test_unicode_positions_are_chars() {
        let mut buffer = GapBuffer::from_str("日本語");
        buffer.insert_str(1, "x").unwrap();
        assert_eq!(buffer.to_string(), "日x本語");
        assert_eq!(buffer.len_chars(), 4);
        assert_eq!(buffer.substring(2, 4).unwrap(), "本語");
    }

    #[test]
    fn test_gap_growth_keeps_suffix() {
        let mut buffer = GapBuffer::with_capacity(2);
        buffer.insert_str(0, "ab").unwrap();
        buffer.insert_str(1, &"x".repeat(500)).unwrap();
        assert_eq!(buffer.len_chars(), 502);
        assert_eq!(buffer.char_at(501), Some('b'));
        assert_eq!(buffer.char_at(0), Some('a'));
    }

    #[test]
    fn test_invalid_range() {
        let mut buffer = GapBuffer::from_str("abc");
        assert!(matches!(
            buffer.delete_range(2, 5),
            Err(BufferError::InvalidRange { start: 2, end: 5, len: 3 })
        ));
        assert!(matches!(
            buffer.insert_str(4, "x"),
            Err(BufferError::InvalidPosition { position: 4, len: 3 })
        ));
    }

    #[test]
    fn test_line_starts() {
        let buffer = GapBuffer::from_str("a\nbc\n\nd");
        assert_eq!(buffer.line_start_positions(), vec![0, 2, 5, 6]);
    }
}
