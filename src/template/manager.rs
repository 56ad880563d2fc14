//! 展開セッションの管理
//!
//! バッファごとに高々 1 つの有効なセッションを保持する。
//! 同じバッファで新しい展開を始めると、以前のセッションは通知なしに破棄される。

use super::definition::TemplateDefinition;
use super::observer::SessionObserver;
use super::reformat::Reformatter;
use super::state::{ExpansionSession, ValueFilter};
use crate::buffer::{BufferId, TextBuffer};
use crate::config::ExpansionOptions;
use crate::error::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// 展開開始時の引数
#[derive(Default)]
pub struct StartParams {
    /// 展開前に選択されていたテキスト。指定時はバッファの選択範囲を削除する
    pub selection: Option<String>,
    pub predefined_values: HashMap<String, String>,
    pub observers: Vec<Box<dyn SessionObserver>>,
    pub reformatter: Option<Box<dyn Reformatter>>,
    pub value_filter: Option<ValueFilter>,
}

impl StartParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(mut self, selection: impl Into<String>) -> Self {
        self.selection = Some(selection.into());
        self
    }

    pub fn with_predefined_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.predefined_values.insert(name.into(), value.into());
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_reformatter(mut self, reformatter: Box<dyn Reformatter>) -> Self {
        self.reformatter = Some(reformatter);
        self
    }

    pub fn with_value_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &str) -> bool + 'static,
    {
        self.value_filter = Some(Box::new(filter));
        self
    }

    fn into_session(self, template: TemplateDefinition, options: ExpansionOptions) -> ExpansionSession {
        let mut session = ExpansionSession::new(template)
            .with_predefined_values(self.predefined_values)
            .with_options(options);
        if let Some(selection) = self.selection {
            session = session.with_selection_text(selection);
        }
        if let Some(reformatter) = self.reformatter {
            session = session.with_reformatter(reformatter);
        }
        if let Some(filter) = self.value_filter {
            session = session.with_value_filter(filter);
        }
        for observer in self.observers {
            session.add_observer(observer);
        }
        session
    }
}

/// バッファ ID → セッション
#[derive(Debug, Default)]
pub struct TemplateManager {
    sessions: HashMap<BufferId, ExpansionSession>,
    options: ExpansionOptions,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ExpansionOptions) -> Self {
        Self {
            sessions: HashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &ExpansionOptions {
        &self.options
    }

    /// キャレット位置でテンプレートの展開を始める
    ///
    /// ヘッドレスモードでは開始直後に最後まで展開する。
    pub fn start_template(
        &mut self,
        buffer: &mut TextBuffer,
        template: TemplateDefinition,
        params: StartParams,
    ) -> Result<&mut ExpansionSession> {
        self.clear_template_state(buffer);
        if params.selection.is_some() {
            buffer.delete_selection()?;
        } else {
            buffer.remove_selection();
        }

        let mut session = params.into_session(template, self.options.clone());
        session.start(buffer)?;
        if self.options.headless && !session.is_finished() {
            session.goto_end(buffer, false)?;
        }

        Ok(match self.sessions.entry(buffer.id()) {
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        })
    }

    /// 選択中のテキストを `SELECTION` として展開を始める
    pub fn start_template_on_selection(
        &mut self,
        buffer: &mut TextBuffer,
        template: TemplateDefinition,
        params: StartParams,
    ) -> Result<&mut ExpansionSession> {
        let params = match buffer.selected_text() {
            Some(selected) => params.with_selection(selected),
            None => params,
        };
        self.start_template(buffer, template, params)
    }

    /// 有効なセッション
    pub fn session(&self, buffer_id: BufferId) -> Option<&ExpansionSession> {
        self.sessions
            .get(&buffer_id)
            .filter(|session| !session.is_finished())
    }

    pub fn session_mut(&mut self, buffer_id: BufferId) -> Option<&mut ExpansionSession> {
        self.sessions
            .get_mut(&buffer_id)
            .filter(|session| !session.is_finished())
    }

    /// 終了したセッションも含めて参照する
    pub fn last_session(&self, buffer_id: BufferId) -> Option<&ExpansionSession> {
        self.sessions.get(&buffer_id)
    }

    /// 有効なセッションを正常終了させる。セッションがなければ false
    pub fn finish_template(&mut self, buffer: &mut TextBuffer) -> Result<bool> {
        match self.session_mut(buffer.id()) {
            Some(session) => {
                session.goto_end(buffer, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 有効なセッションを取り消す。セッションがなければ false
    pub fn cancel_template(&mut self, buffer: &mut TextBuffer) -> Result<bool> {
        match self.session_mut(buffer.id()) {
            Some(session) => {
                session.cancel(buffer)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// ホストの編集を有効なセッションへ伝える
    pub fn after_change(&mut self, buffer: &mut TextBuffer) -> Result<()> {
        match self.session_mut(buffer.id()) {
            Some(session) => session.after_change(buffer),
            None => Ok(()),
        }
    }

    /// バッファのセッションを通知なしで破棄する
    pub fn clear_template_state(&mut self, buffer: &mut TextBuffer) {
        if let Some(mut previous) = self.sessions.remove(&buffer.id()) {
            previous.dispose(buffer);
        }
    }

    /// 終了したセッションを取り除く
    pub fn clear_finished(&mut self) {
        self.sessions.retain(|_, session| !session.is_finished());
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| !session.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::definition::Variable;
    use crate::template::observer::SessionEvent;
    use crate::template::parser::parse;
    use crate::template::state::SessionState;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn field_template() -> TemplateDefinition {
        parse("private $TYPE$ $NAME$;$END$", vec![Variable::new("TYPE"), Variable::new("NAME")])
            .unwrap()
            .with_key("field")
    }

    #[test]
    fn test_restart_disposes_previous_session_silently() {
        let mut manager = TemplateManager::new();
        let mut buffer = TextBuffer::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let params = StartParams::new().with_observer(Box::new(move |event: &SessionEvent| {
            sink.borrow_mut().push(event.clone())
        }));

        manager.start_template(&mut buffer, field_template(), params).unwrap();
        let markers_after_first = buffer.live_marker_count();
        let seen = events.borrow().len();

        buffer.set_caret(buffer.len_chars());
        manager
            .start_template(&mut buffer, field_template(), StartParams::new())
            .unwrap();

        assert_eq!(events.borrow().len(), seen);
        assert_eq!(buffer.live_marker_count(), markers_after_first);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_headless_runs_to_completion() {
        let mut manager = TemplateManager::with_options(ExpansionOptions::headless());
        let mut buffer = TextBuffer::new();
        let session = manager
            .start_template(&mut buffer, field_template(), StartParams::new())
            .unwrap();

        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(buffer.text(), "private  ;");
        assert_eq!(buffer.caret(), 10);
        assert!(manager.session(buffer.id()).is_none());
        assert!(manager.last_session(buffer.id()).is_some());

        manager.clear_finished();
        assert!(manager.last_session(buffer.id()).is_none());
    }

    #[test]
    fn test_selection_is_replaced_by_template() {
        let mut manager = TemplateManager::new();
        let mut buffer = TextBuffer::from_str("call(value)");
        buffer.set_selection(5, 10).unwrap();
        let template = parse("Some($SELECTION$)$END$", vec![]).unwrap();

        manager
            .start_template_on_selection(&mut buffer, template, StartParams::new())
            .unwrap();

        assert_eq!(buffer.text(), "call(Some(value))");
        assert_eq!(buffer.caret(), 16);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_finish_and_after_change_without_session() {
        let mut manager = TemplateManager::new();
        let mut buffer = TextBuffer::new();
        assert!(!manager.finish_template(&mut buffer).unwrap());
        assert!(!manager.cancel_template(&mut buffer).unwrap());
        manager.after_change(&mut buffer).unwrap();

        manager
            .start_template(&mut buffer, field_template(), StartParams::new())
            .unwrap();
        assert!(manager.finish_template(&mut buffer).unwrap());
        assert_eq!(
            manager.last_session(buffer.id()).map(|s| s.state()),
            Some(SessionState::Finished)
        );
    }
}
