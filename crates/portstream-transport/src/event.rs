//! リスナーリスト（オブザーバー）
//!
//! ポートの message/disconnect 通知やストリームの onConnect/onDisconnect に使う。
//! シングルスレッド前提のため内部可変性は `Cell`/`RefCell` のみ。

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

/// 登録したリスナーの識別子（`remove_listener` に渡す）
pub type ListenerId = u64;

/// リスナーコールバック
pub type Listener<T> = Box<dyn FnMut(&T)>;

struct Slot<T> {
    id: ListenerId,
    callback: Rc<RefCell<Listener<T>>>,
}

/// 0 個以上のリスナーに同期的に通知するイベント
///
/// `fire` は登録済みリスナーのスナップショットに対して通知するため、
/// リスナーは通知中に自分自身や他のリスナーを削除してよい。
/// 削除されたリスナーはそれ以降呼ばれない。
pub struct Event<T> {
    next_id: Cell<ListenerId>,
    slots: RefCell<Vec<Slot<T>>>,
}

impl<T> Event<T> {
    /// リスナーのない Event を生成する
    pub fn new() -> Self {
        Event {
            next_id: Cell::new(1),
            slots: RefCell::new(Vec::new()),
        }
    }

    /// リスナーを登録する
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&T) + 'static,
    {
        self.add_boxed(Box::new(listener))
    }

    /// Box 済みのリスナーを登録する
    pub fn add_boxed(&self, listener: Listener<T>) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.slots.borrow_mut().push(Slot {
            id,
            callback: Rc::new(RefCell::new(listener)),
        });
        id
    }

    /// リスナーを削除する。登録されていなければ `false`
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    /// 登録中のリスナー数
    pub fn listener_count(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn has_listeners(&self) -> bool {
        !self.slots.borrow().is_empty()
    }

    /// 指定 ID のリスナーが登録中か
    pub fn contains(&self, id: ListenerId) -> bool {
        self.slots.borrow().iter().any(|slot| slot.id == id)
    }

    /// 全リスナーに通知し、呼び出したリスナー数を返す
    ///
    /// 実行中のリスナーが再入的に同じイベントを発火した場合、
    /// そのリスナー自身はスキップされる（panic しない）。
    pub fn fire(&self, value: &T) -> usize {
        let snapshot: Vec<(ListenerId, Rc<RefCell<Listener<T>>>)> = self
            .slots
            .borrow()
            .iter()
            .map(|slot| (slot.id, Rc::clone(&slot.callback)))
            .collect();

        let mut called = 0;
        for (id, callback) in snapshot {
            if !self.contains(id) {
                continue;
            }
            match callback.try_borrow_mut() {
                Ok(mut guard) => {
                    let f = &mut *guard;
                    f(value);
                    called += 1;
                }
                Err(_) => {
                    tracing::warn!(listener = id, "re-entrant event dispatch skipped");
                }
            }
        }
        called
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_fire_in_registration_order() {
        let event: Event<u32> = Event::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = Rc::clone(&log);
        event.add_listener(move |v| l1.borrow_mut().push(("first", *v)));
        let l2 = Rc::clone(&log);
        event.add_listener(move |v| l2.borrow_mut().push(("second", *v)));

        assert_eq!(event.fire(&7), 2);
        assert_eq!(*log.borrow(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_remove_listener() {
        let event: Event<()> = Event::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let id = event.add_listener(move |_| c.set(c.get() + 1));

        assert!(event.remove_listener(id));
        assert!(!event.remove_listener(id)); // 2 回目は何もしない
        event.fire(&());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_listener_removes_itself_during_fire() {
        let event: Rc<Event<()>> = Rc::new(Event::new());
        let count = Rc::new(Cell::new(0));
        let id_cell = Rc::new(Cell::new(0));

        let ev = Rc::downgrade(&event);
        let c = Rc::clone(&count);
        let idc = Rc::clone(&id_cell);
        let id = event.add_listener(move |_| {
            c.set(c.get() + 1);
            if let Some(ev) = ev.upgrade() {
                ev.remove_listener(idc.get());
            }
        });
        id_cell.set(id);

        event.fire(&());
        event.fire(&());
        assert_eq!(count.get(), 1);
        assert!(!event.has_listeners());
    }

    #[test]
    fn test_listener_removed_by_earlier_listener_is_skipped() {
        let event: Rc<Event<()>> = Rc::new(Event::new());
        let second_called = Rc::new(Cell::new(false));
        let second_id = Rc::new(Cell::new(0));

        let ev = Rc::downgrade(&event);
        let sid = Rc::clone(&second_id);
        event.add_listener(move |_| {
            if let Some(ev) = ev.upgrade() {
                ev.remove_listener(sid.get());
            }
        });
        let flag = Rc::clone(&second_called);
        second_id.set(event.add_listener(move |_| flag.set(true)));

        assert_eq!(event.fire(&()), 1);
        assert!(!second_called.get());
    }

    #[test]
    fn test_reentrant_fire_skips_running_listener() {
        let event: Rc<Event<u32>> = Rc::new(Event::new());
        let calls = Rc::new(Cell::new(0));

        let ev = Rc::downgrade(&event);
        let c = Rc::clone(&calls);
        event.add_listener(move |depth| {
            c.set(c.get() + 1);
            if *depth == 0 {
                if let Some(ev) = ev.upgrade() {
                    ev.fire(&1);
                }
            }
        });

        event.fire(&0);
        assert_eq!(calls.get(), 1);
    }
}
