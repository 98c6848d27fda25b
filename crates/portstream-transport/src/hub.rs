//! インメモリの接続ハブ
//!
//! `chrome.runtime.connect(appId)` と `chrome.runtime.onConnectExternal` の組を
//! 同一プロセス内で再現する。チャンネル名ごとに着信リスナーを持ち、
//! `connect` で生成したポートペアの遠端を次のタスクで着信リスナーに渡す。
//!
//! 着信時点でリスナーが 1 つもなければ接続は拒否され、
//! 接続側のポートには切断として通知される。

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use core::cell::{Cell, RefCell};

use crate::event::{Event, Listener, ListenerId};
use crate::event_loop::EventLoop;
use crate::local::LocalPort;
use crate::port::{ConnectSource, Port, PortRef};

/// チャンネル名で接続を仲介するハブ
pub struct PortHub {
    event_loop: Rc<EventLoop>,
    channels: RefCell<BTreeMap<String, Rc<Event<PortRef>>>>,
    offered: Rc<Cell<u64>>,
    refused: Rc<Cell<u64>>,
}

impl PortHub {
    pub fn new(event_loop: Rc<EventLoop>) -> Self {
        PortHub {
            event_loop,
            channels: RefCell::new(BTreeMap::new()),
            offered: Rc::new(Cell::new(0)),
            refused: Rc::new(Cell::new(0)),
        }
    }

    /// ハブが使う EventLoop
    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    /// `channel` に接続し、接続側のポートを返す
    ///
    /// 返ったポートは即座に使えるが、相手が受け入れたかどうかは
    /// ハンドシェイク（センチネル受信）か切断通知で判明する。
    pub fn connect(&self, channel: &str) -> Rc<LocalPort> {
        let (local, remote) = LocalPort::pair(Rc::clone(&self.event_loop), channel);
        let listeners = self.channel_event(channel);
        let offered = Rc::clone(&self.offered);
        let refused = Rc::clone(&self.refused);
        let channel = String::from(channel);

        self.event_loop.spawn(move || {
            offered.set(offered.get() + 1);
            if !listeners.has_listeners() {
                refused.set(refused.get() + 1);
                tracing::warn!(channel = %channel, "connection refused: nobody is listening");
                remote.disconnect();
                return;
            }
            let port: PortRef = remote;
            listeners.fire(&port);
        });

        local
    }

    /// `channel` の着信リスナー数
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .borrow()
            .get(channel)
            .map_or(0, |event| event.listener_count())
    }

    /// これまでに届いた接続要求の数
    pub fn offered_count(&self) -> u64 {
        self.offered.get()
    }

    /// リスナー不在で拒否した接続要求の数
    pub fn refused_count(&self) -> u64 {
        self.refused.get()
    }

    fn channel_event(&self, channel: &str) -> Rc<Event<PortRef>> {
        let mut channels = self.channels.borrow_mut();
        let event = channels
            .entry(String::from(channel))
            .or_insert_with(|| Rc::new(Event::new()));
        Rc::clone(event)
    }
}

impl ConnectSource for PortHub {
    fn add_connect_listener(&self, channel: &str, listener: Listener<PortRef>) -> ListenerId {
        self.channel_event(channel).add_boxed(listener)
    }

    fn remove_connect_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.channels
            .borrow()
            .get(channel)
            .map_or(false, |event| event.remove_listener(id))
    }
}
