//! 再整形コラボレーター
//!
//! 言語依存の整形はホストが `Reformatter` として提供する。
//! 呼び出し中はセグメントが非貪欲になっているため、
//! 境界への挿入がセグメントへ取り込まれることはない。

use crate::buffer::TextBuffer;
use crate::error::buffer::Result;

pub trait Reformatter {
    /// テンプレート範囲 `[start, end)` を整形する
    fn reformat(&mut self, buffer: &mut TextBuffer, start: usize, end: usize) -> Result<()>;

    /// 参照の短縮（完全修飾名の import 化など）
    fn shorten_references(&mut self, _buffer: &mut TextBuffer, _start: usize, _end: usize) -> Result<()> {
        Ok(())
    }
}

/// テンプレート 2 行目以降に、開始行の字下げを付ける
///
/// 開始行が空の場合は上方向に最初の空でない行の字下げを使う。
pub fn smart_indent(buffer: &mut TextBuffer, start: usize, end: usize) -> Result<()> {
    let start_line = buffer.line_number(start);
    let end_line = buffer.line_number(end);
    if start_line == end_line {
        return Ok(());
    }

    let Some(indent_line) = (0..=start_line)
        .rev()
        .find(|&line| buffer.line_end_offset(line) > buffer.line_start_offset(line))
    else {
        return Ok(());
    };

    let line_start = buffer.line_start_offset(indent_line);
    let line_end = buffer.line_end_offset(indent_line);
    let indent: String = buffer
        .slice(line_start, line_end)?
        .chars()
        .take_while(|&ch| ch == ' ' || ch == '\t')
        .collect();
    if indent.is_empty() {
        return Ok(());
    }

    buffer.run_bulk(|buffer| -> Result<()> {
        for line in (start_line + 1..=end_line).rev() {
            let offset = buffer.line_start_offset(line);
            buffer.insert(offset, &indent)?;
        }
        Ok(())
    })
}
