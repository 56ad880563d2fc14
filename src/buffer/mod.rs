//! バッファ管理モジュール
//!
//! テキストデータの格納、編集に追従する範囲マーカー、変更通知を提供

pub mod gap_buffer;
pub mod marker;
pub mod text_buffer;

// 公開API
pub use gap_buffer::GapBuffer;
pub use marker::{MarkerId, MarkerTable, RangeMarker};
pub use text_buffer::{BufferId, ChangeEvent, ChangeListener, TextBuffer};
