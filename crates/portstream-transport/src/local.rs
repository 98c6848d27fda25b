//! インメモリのポートペア
//!
//! 同一プロセス内で 2 つのストリームをつなぐための `Port` 実装。
//! ブラウザの `MessageChannel` / 拡張機能ポートと同じく、配送は常に
//! `EventLoop` 上の別タスクとして行われる。
//!
//! ## 配送保証
//!
//! 受信側にメッセージリスナーがまだ登録されていない間に届いたメッセージは
//! バックログに保持され、リスナー登録後に順番どおり配送される。
//! これにより、受け入れ側が接続直後に送るセンチネルが
//! 接続側のリスナー登録前に届いても失われない。
//!
//! 相手側の切断も同じ順序に従う。バックログが残っている間に届いた切断は、
//! バックログをすべて配送し終えてから通知される。

use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use core::cell::{Cell, RefCell};

use serde_json::Value;

use crate::event::{Event, Listener, ListenerId};
use crate::event_loop::EventLoop;
use crate::port::Port;
use crate::TransportError;

/// インメモリポートの一端
pub struct LocalPort {
    name: String,
    event_loop: Rc<EventLoop>,
    me: Weak<LocalPort>,
    peer: RefCell<Weak<LocalPort>>,
    connected: Cell<bool>,
    on_message: Event<Value>,
    on_disconnect: Event<()>,
    /// リスナー未登録の間に届いたメッセージ
    backlog: RefCell<VecDeque<Value>>,
    drain_scheduled: Cell<bool>,
    /// バックログ配送後に通知する相手側の切断
    disconnect_pending: Cell<bool>,
}

impl LocalPort {
    /// 接続済みのポートペアを生成する
    pub fn pair(event_loop: Rc<EventLoop>, name: &str) -> (Rc<LocalPort>, Rc<LocalPort>) {
        let a = Self::new_end(Rc::clone(&event_loop), name);
        let b = Self::new_end(event_loop, name);
        *a.peer.borrow_mut() = Rc::downgrade(&b);
        *b.peer.borrow_mut() = Rc::downgrade(&a);
        (a, b)
    }

    fn new_end(event_loop: Rc<EventLoop>, name: &str) -> Rc<LocalPort> {
        Rc::new_cyclic(|me| LocalPort {
            name: String::from(name),
            event_loop,
            me: me.clone(),
            peer: RefCell::new(Weak::new()),
            connected: Cell::new(true),
            on_message: Event::new(),
            on_disconnect: Event::new(),
            backlog: RefCell::new(VecDeque::new()),
            drain_scheduled: Cell::new(false),
            disconnect_pending: Cell::new(false),
        })
    }

    /// バックログに溜まっているメッセージ数
    pub fn backlog_len(&self) -> usize {
        self.backlog.borrow().len()
    }

    /// 相手側から届いたメッセージを処理する（タスク内で呼ばれる）
    fn deliver(&self, message: Value) {
        if !self.connected.get() {
            tracing::trace!(port = %self.name, "message dropped after disconnect");
            return;
        }

        // 順序を保つため、バックログが残っている間は必ず後ろに積む
        if !self.on_message.has_listeners() || !self.backlog.borrow().is_empty() {
            self.backlog.borrow_mut().push_back(message);
            if self.on_message.has_listeners() {
                self.schedule_drain();
            }
            return;
        }

        self.on_message.fire(&message);
    }

    fn schedule_drain(&self) {
        if self.drain_scheduled.replace(true) {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.event_loop.spawn(move || me.drain_backlog());
        }
    }

    fn drain_backlog(&self) {
        self.drain_scheduled.set(false);
        self.flush_backlog();
        if self.disconnect_pending.get() && self.backlog.borrow().is_empty() {
            self.finish_remote_disconnect();
        }
    }

    /// リスナーがいる限りバックログを順に配送する
    fn flush_backlog(&self) {
        while self.connected.get() && self.on_message.has_listeners() {
            let next = self.backlog.borrow_mut().pop_front();
            match next {
                Some(message) => {
                    self.on_message.fire(&message);
                }
                None => break,
            }
        }
    }

    /// 相手側が切断した（タスク内で呼ばれる）
    ///
    /// 切断より先に届いたメッセージが残っていれば、それを配送してから通知する。
    fn remote_disconnected(&self) {
        if !self.connected.get() {
            return;
        }
        self.flush_backlog();
        if !self.backlog.borrow().is_empty() {
            tracing::debug!(
                port = %self.name,
                backlog = self.backlog_len(),
                "remote end disconnected; delivering backlog first"
            );
            self.disconnect_pending.set(true);
            return;
        }
        self.finish_remote_disconnect();
    }

    fn finish_remote_disconnect(&self) {
        self.disconnect_pending.set(false);
        if !self.connected.replace(false) {
            return;
        }
        self.backlog.borrow_mut().clear();
        tracing::debug!(port = %self.name, "remote end disconnected");
        self.on_disconnect.fire(&());
    }

    fn notify_peer_disconnect(&self) {
        if let Some(peer) = self.peer.borrow().upgrade() {
            self.event_loop.spawn(move || peer.remote_disconnected());
        }
    }
}

impl Port for LocalPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn post_message(&self, message: Value) -> Result<(), TransportError> {
        if !self.connected.get() {
            return Err(TransportError::Disconnected);
        }
        let peer = self
            .peer
            .borrow()
            .upgrade()
            .ok_or(TransportError::Disconnected)?;
        self.event_loop.spawn(move || peer.deliver(message));
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnect_pending.set(false);
        if !self.connected.replace(false) {
            return;
        }
        self.backlog.borrow_mut().clear();
        self.notify_peer_disconnect();
    }

    fn add_message_listener(&self, listener: Listener<Value>) -> ListenerId {
        let id = self.on_message.add_boxed(listener);
        if !self.backlog.borrow().is_empty() {
            self.schedule_drain();
        }
        id
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.on_message.remove_listener(id)
    }

    fn add_disconnect_listener(&self, listener: Listener<()>) -> ListenerId {
        self.on_disconnect.add_boxed(listener)
    }

    fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        self.on_disconnect.remove_listener(id)
    }
}

impl Drop for LocalPort {
    fn drop(&mut self) {
        // 片側が破棄されたら相手側には切断として見える
        if self.connected.get() {
            self.notify_peer_disconnect();
        }
    }
}

impl core::fmt::Debug for LocalPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalPort")
            .field("name", &self.name)
            .field("connected", &self.connected.get())
            .field("backlog", &self.backlog_len())
            .finish()
    }
}
