//! 着信接続の受け入れ
//!
//! 既知のチャンネル名で `ConnectSource` に着信リスナーを登録し、
//! 届いたポートを `PortStream::accept` に渡す。
//!
//! ```text
//! Idle ──start_listening()──▶ Listening ──着信(one_shot)──▶ Idle
//!                              │   ▲
//!                              └───┘ 着信(繰り返しモード)
//! ```
//!
//! 繰り返しモードでは、ストリームが接続中に届いた着信はポートを切断して拒否する
//! （ストリームが同時に持てるポートは 1 つだけ）。

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use core::cell::Cell;

use portstream_stream::StreamError;
use portstream_transport::{ConnectSource, Event, ListenerId, PortRef};

use crate::stream::PortStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptorState {
    Idle,
    Listening { listener: ListenerId, one_shot: bool },
}

/// チャンネルへの着信をストリームに結び付けるアクセプター
pub struct Acceptor {
    shared: Rc<AcceptorShared>,
}

struct AcceptorShared {
    source: Rc<dyn ConnectSource>,
    channel: String,
    stream: PortStream,
    state: Cell<AcceptorState>,
    /// `serve()` 中にストリームの onDisconnect へ登録したリスナー
    serve_listener: Cell<Option<ListenerId>>,
    accepted: Cell<u64>,
    refused: Cell<u64>,
}

impl Acceptor {
    /// `channel` への着信を `stream` で受け入れるアクセプターを生成する（まだ待ち受けない）
    pub fn new(source: Rc<dyn ConnectSource>, channel: &str, stream: PortStream) -> Self {
        Acceptor {
            shared: Rc::new(AcceptorShared {
                source,
                channel: String::from(channel),
                stream,
                state: Cell::new(AcceptorState::Idle),
                serve_listener: Cell::new(None),
                accepted: Cell::new(0),
                refused: Cell::new(0),
            }),
        }
    }

    /// 着信の待ち受けを開始する
    ///
    /// `one_shot = true` なら最初の着信を受け入れた時点で待ち受けをやめる。
    ///
    /// # エラー
    /// - `InvalidState`: すでに待ち受け中、またはストリームが CLOSED でない
    pub fn start_listening(&self, one_shot: bool) -> Result<(), StreamError> {
        start_listening(&self.shared, one_shot)
    }

    /// 待ち受けをやめる（待ち受けていなければ何もしない）
    ///
    /// `serve()` による再待ち受けも解除する。
    pub fn stop_listening(&self) {
        stop_serving(&self.shared);
        stop_listening(&self.shared);
    }

    /// 1 クライアントずつ受け入れ続ける
    ///
    /// one-shot で待ち受け、接続が切れるたびに再び待ち受ける。
    /// `stop_listening()` で止める。
    pub fn serve(&self) -> Result<(), StreamError> {
        start_listening(&self.shared, true)?;

        let weak = Rc::downgrade(&self.shared);
        let id = self.shared.stream.on_disconnect().add_listener(move |_| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.is_listening() {
                return;
            }
            match start_listening(&shared, true) {
                Ok(()) => tracing::debug!(channel = %shared.channel, "re-armed after disconnect"),
                Err(e) => tracing::warn!(error = %e, "could not re-arm acceptor"),
            }
        });
        if let Some(previous) = self.shared.serve_listener.replace(Some(id)) {
            self.shared.stream.on_disconnect().remove_listener(previous);
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.shared.is_listening()
    }

    /// `serve()` で受け入れを続けているか
    pub fn is_serving(&self) -> bool {
        self.shared.serve_listener.get().is_some()
    }

    /// 待ち受けているチャンネル名
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    /// 着信を受け入れるストリーム
    pub fn stream(&self) -> &PortStream {
        &self.shared.stream
    }

    pub fn on_connect(&self) -> &Event<()> {
        self.shared.stream.on_connect()
    }

    pub fn on_disconnect(&self) -> &Event<()> {
        self.shared.stream.on_disconnect()
    }

    /// 受け入れた着信の数
    pub fn accepted_count(&self) -> u64 {
        self.shared.accepted.get()
    }

    /// ストリームが使用中のため拒否した着信の数
    pub fn refused_count(&self) -> u64 {
        self.shared.refused.get()
    }
}

impl core::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Acceptor")
            .field("channel", &self.shared.channel)
            .field("state", &self.shared.state.get())
            .field("stream", &self.shared.stream)
            .finish()
    }
}

impl AcceptorShared {
    fn is_listening(&self) -> bool {
        matches!(self.state.get(), AcceptorState::Listening { .. })
    }
}

impl Drop for AcceptorShared {
    fn drop(&mut self) {
        if let AcceptorState::Listening { listener, .. } = self.state.get() {
            self.source.remove_connect_listener(&self.channel, listener);
        }
        if let Some(id) = self.serve_listener.take() {
            self.stream.on_disconnect().remove_listener(id);
        }
    }
}

fn start_listening(shared: &Rc<AcceptorShared>, one_shot: bool) -> Result<(), StreamError> {
    let stream_state = shared.stream.state();
    if shared.is_listening() || !stream_state.is_closed() {
        return Err(StreamError::InvalidState {
            op: "listen",
            state: stream_state,
        });
    }

    let weak = Rc::downgrade(shared);
    let listener = shared.source.add_connect_listener(
        &shared.channel,
        Box::new(move |port: &PortRef| {
            if let Some(shared) = weak.upgrade() {
                handle_offer(&shared, Rc::clone(port));
            }
        }),
    );
    shared
        .state
        .set(AcceptorState::Listening { listener, one_shot });
    tracing::debug!(channel = %shared.channel, one_shot, "listening for connections");
    Ok(())
}

fn stop_listening(shared: &AcceptorShared) {
    if let AcceptorState::Listening { listener, .. } = shared.state.replace(AcceptorState::Idle) {
        shared.source.remove_connect_listener(&shared.channel, listener);
        tracing::debug!(channel = %shared.channel, "stopped listening");
    }
}

fn stop_serving(shared: &AcceptorShared) {
    if let Some(id) = shared.serve_listener.take() {
        shared.stream.on_disconnect().remove_listener(id);
    }
}

fn handle_offer(shared: &AcceptorShared, port: PortRef) {
    let one_shot = match shared.state.get() {
        AcceptorState::Listening { one_shot, .. } => one_shot,
        AcceptorState::Idle => return,
    };
    // 切れたポートは着信として数えず、待ち受けを続ける
    if !port.is_connected() {
        tracing::debug!(channel = %shared.channel, "offered port is already disconnected");
        return;
    }
    if one_shot {
        stop_listening(shared);
    }

    let stream_state = shared.stream.state();
    if !stream_state.is_closed() {
        shared.refused.set(shared.refused.get() + 1);
        tracing::warn!(
            channel = %shared.channel,
            state = %stream_state,
            "refusing connection: stream is busy"
        );
        port.disconnect();
        return;
    }

    match shared.stream.accept(Rc::clone(&port)) {
        Ok(_) => {
            shared.accepted.set(shared.accepted.get() + 1);
            tracing::info!(channel = %shared.channel, "accepted connection");
        }
        Err(e) => {
            shared.refused.set(shared.refused.get() + 1);
            tracing::warn!(channel = %shared.channel, error = %e, "failed to accept connection");
            port.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use portstream_proto::Frame;
    use portstream_stream::ConnectionState;
    use portstream_transport::{EventLoop, LocalPort, Port, PortHub};
    use serde_json::json;

    const CHANNEL: &str = "app.test";

    fn hub() -> Rc<PortHub> {
        Rc::new(PortHub::new(Rc::new(EventLoop::new())))
    }

    fn acceptor(hub: &Rc<PortHub>) -> Acceptor {
        let source: Rc<dyn ConnectSource> = hub.clone();
        Acceptor::new(source, CHANNEL, PortStream::new())
    }

    #[test]
    fn test_start_and_stop_listening() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        assert!(!acceptor.is_listening());

        acceptor.start_listening(false).unwrap();
        assert!(acceptor.is_listening());
        assert_eq!(hub.listener_count(CHANNEL), 1);

        acceptor.stop_listening();
        acceptor.stop_listening();
        assert!(!acceptor.is_listening());
        assert_eq!(hub.listener_count(CHANNEL), 0);
    }

    #[test]
    fn test_start_listening_twice_is_invalid() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.start_listening(true).unwrap();
        assert!(matches!(
            acceptor.start_listening(true),
            Err(StreamError::InvalidState { op: "listen", .. })
        ));
        assert_eq!(hub.listener_count(CHANNEL), 1);
    }

    #[test]
    fn test_start_listening_requires_closed_stream() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        let port = hub.connect("elsewhere");
        let _hs = acceptor.stream().connect(port).unwrap();

        assert_eq!(
            acceptor.start_listening(false),
            Err(StreamError::InvalidState {
                op: "listen",
                state: ConnectionState::Connecting
            })
        );
    }

    #[test]
    fn test_one_shot_accepts_and_stops_listening() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.start_listening(true).unwrap();

        let client = hub.connect(CHANNEL);
        hub.event_loop().run_until_idle();

        assert_eq!(acceptor.stream().state(), ConnectionState::Connected);
        assert!(!acceptor.is_listening());
        assert_eq!(hub.listener_count(CHANNEL), 0);
        assert_eq!(acceptor.accepted_count(), 1);
        assert!(client.is_connected());
    }

    #[test]
    fn test_repeating_refuses_while_busy() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.start_listening(false).unwrap();

        let first = hub.connect(CHANNEL);
        let second = hub.connect(CHANNEL);
        hub.event_loop().run_until_idle();

        assert!(first.is_connected());
        assert!(!second.is_connected());
        assert!(acceptor.is_listening());
        assert_eq!(acceptor.accepted_count(), 1);
        assert_eq!(acceptor.refused_count(), 1);
    }

    #[test]
    fn test_repeating_accepts_again_after_disconnect() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.start_listening(false).unwrap();

        let first = hub.connect(CHANNEL);
        hub.event_loop().run_until_idle();
        first.disconnect();
        hub.event_loop().run_until_idle();
        assert_eq!(acceptor.stream().state(), ConnectionState::Closed);

        let second = hub.connect(CHANNEL);
        hub.event_loop().run_until_idle();
        assert!(second.is_connected());
        assert_eq!(acceptor.accepted_count(), 2);
    }

    #[test]
    fn test_accepted_stream_sends_sentinel() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.start_listening(true).unwrap();

        let client = hub.connect(CHANNEL);
        let first = Rc::new(RefCell::new(None));
        let f = Rc::clone(&first);
        client.add_message_listener(Box::new(move |m: &serde_json::Value| {
            if f.borrow().is_none() {
                *f.borrow_mut() = Some(m.clone());
            }
        }));
        acceptor.stream().write(json!("queued")).unwrap();
        hub.event_loop().run_until_idle();

        let first = first.borrow().clone().unwrap();
        assert!(Frame::is_sentinel(&first));
    }

    #[test]
    fn test_serve_rearms_after_each_client() {
        let hub = hub();
        let acceptor = acceptor(&hub);
        acceptor.serve().unwrap();
        assert!(acceptor.is_serving());

        for round in 1..=3u64 {
            let client = hub.connect(CHANNEL);
            hub.event_loop().run_until_idle();
            assert!(!acceptor.is_listening());
            assert_eq!(acceptor.accepted_count(), round);

            client.disconnect();
            hub.event_loop().run_until_idle();
            assert!(acceptor.is_listening());
        }

        acceptor.stop_listening();
        assert!(!acceptor.is_serving());
        assert_eq!(hub.listener_count(CHANNEL), 0);
    }

    /// 任意のポートを着信として差し出せる ConnectSource
    struct ManualSource {
        offers: Event<PortRef>,
    }

    impl ConnectSource for ManualSource {
        fn add_connect_listener(
            &self,
            _channel: &str,
            listener: portstream_transport::Listener<PortRef>,
        ) -> ListenerId {
            self.offers.add_boxed(listener)
        }

        fn remove_connect_listener(&self, _channel: &str, id: ListenerId) -> bool {
            self.offers.remove_listener(id)
        }
    }

    #[test]
    fn test_serve_keeps_listening_after_dead_offer() {
        let lp = Rc::new(EventLoop::new());
        let source = Rc::new(ManualSource {
            offers: Event::new(),
        });
        let dyn_source: Rc<dyn ConnectSource> = source.clone();
        let acceptor = Acceptor::new(dyn_source, CHANNEL, PortStream::new());
        acceptor.serve().unwrap();

        // 相手がすでに去ったポート
        let (dead, _client) = LocalPort::pair(Rc::clone(&lp), CHANNEL);
        dead.disconnect();
        let dead: PortRef = dead;
        source.offers.fire(&dead);
        assert!(acceptor.is_listening());
        assert_eq!(acceptor.accepted_count(), 0);
        assert_eq!(acceptor.refused_count(), 0);

        // 次の着信は受け入れられる
        let (live, client) = LocalPort::pair(Rc::clone(&lp), CHANNEL);
        let live: PortRef = live;
        source.offers.fire(&live);
        lp.run_until_idle();
        assert_eq!(acceptor.accepted_count(), 1);
        assert_eq!(acceptor.stream().state(), ConnectionState::Connected);
        assert!(client.is_connected());
        assert!(!acceptor.is_listening());
    }

    #[test]
    fn test_drop_removes_connect_listener() {
        let hub = hub();
        {
            let acceptor = acceptor(&hub);
            acceptor.start_listening(false).unwrap();
            assert_eq!(hub.listener_count(CHANNEL), 1);
        }
        assert_eq!(hub.listener_count(CHANNEL), 0);
    }
}
