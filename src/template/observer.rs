//! セッションのオブザーバー
//!
//! 状態遷移の確定した時点でのみ、登録順に通知する。
//! 再計算の途中で通知することはない。

use super::definition::TemplateDefinition;

/// 状態遷移イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    WaitingForInput,
    CurrentVariableChanged {
        old: Option<usize>,
        new: Option<usize>,
    },
    BeforeFinished {
        broken_off: bool,
    },
    Finished {
        broken_off: bool,
    },
    Cancelled,
}

/// 展開セッションのオブザーバー
pub trait SessionObserver {
    fn waiting_for_input(&mut self, _template: &TemplateDefinition) {}

    fn current_variable_changed(&mut self, _old: Option<usize>, _new: Option<usize>) {}

    fn before_finished(&mut self, _broken_off: bool) {}

    fn template_finished(&mut self, _broken_off: bool) {}

    fn template_cancelled(&mut self) {}
}

/// イベントを受け取るクロージャもオブザーバーとして使える
impl<F> SessionObserver for F
where
    F: FnMut(&SessionEvent),
{
    fn waiting_for_input(&mut self, _template: &TemplateDefinition) {
        self(&SessionEvent::WaitingForInput)
    }

    fn current_variable_changed(&mut self, old: Option<usize>, new: Option<usize>) {
        self(&SessionEvent::CurrentVariableChanged { old, new })
    }

    fn before_finished(&mut self, broken_off: bool) {
        self(&SessionEvent::BeforeFinished { broken_off })
    }

    fn template_finished(&mut self, broken_off: bool) {
        self(&SessionEvent::Finished { broken_off })
    }

    fn template_cancelled(&mut self) {
        self(&SessionEvent::Cancelled)
    }
}

/// 登録順のオブザーバーリスト
#[derive(Default)]
pub struct ObserverList {
    observers: Vec<Box<dyn SessionObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&mut self, template: &TemplateDefinition, event: &SessionEvent) {
        log::trace!("session event: {:?}", event);
        for observer in &mut self.observers {
            match *event {
                SessionEvent::WaitingForInput => observer.waiting_for_input(template),
                SessionEvent::CurrentVariableChanged { old, new } => {
                    observer.current_variable_changed(old, new)
                }
                SessionEvent::BeforeFinished { broken_off } => observer.before_finished(broken_off),
                SessionEvent::Finished { broken_off } => observer.template_finished(broken_off),
                SessionEvent::Cancelled => observer.template_cancelled(),
            }
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Counter {
        cancelled: usize,
        finished: Vec<bool>,
    }

    struct CountingObserver(Rc<RefCell<Counter>>);

    impl SessionObserver for CountingObserver {
        fn template_finished(&mut self, broken_off: bool) {
            self.0.borrow_mut().finished.push(broken_off);
        }

        fn template_cancelled(&mut self) {
            self.0.borrow_mut().cancelled += 1;
        }
    }

    #[test]
    fn test_observers_are_notified_in_order() {
        let template = parse("x$END$", vec![]).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = ObserverList::new();
        for id in 0..2 {
            let log = Rc::clone(&log);
            list.add(Box::new(move |event: &SessionEvent| {
                log.borrow_mut().push((id, event.clone()))
            }));
        }

        list.notify(&template, &SessionEvent::Cancelled);
        list.notify(&template, &SessionEvent::Finished { broken_off: true });

        assert_eq!(
            *log.borrow(),
            vec![
                (0, SessionEvent::Cancelled),
                (1, SessionEvent::Cancelled),
                (0, SessionEvent::Finished { broken_off: true }),
                (1, SessionEvent::Finished { broken_off: true }),
            ]
        );
    }

    #[test]
    fn test_trait_observer_defaults() {
        let template = parse("", vec![]).unwrap();
        let counter = Rc::new(RefCell::new(Counter::default()));
        let mut list = ObserverList::new();
        list.add(Box::new(CountingObserver(Rc::clone(&counter))));

        list.notify(&template, &SessionEvent::WaitingForInput);
        list.notify(&template, &SessionEvent::Finished { broken_off: false });
        list.notify(&template, &SessionEvent::Cancelled);

        assert_eq!(counter.borrow().cancelled, 1);
        assert_eq!(counter.borrow().finished, vec![false]);
        assert_eq!(list.len(), 1);
    }
}
