//! portstream-session 統合テスト
//!
//! transport (PortHub / LocalPort) + proto + stream + session の完全な経路で、
//! 接続側と受け入れ側のストリームを実際にハンドシェイクさせる。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::FutureExt;
use serde_json::{json, Value};

use portstream_proto::Frame;
use portstream_session::{Acceptor, ConnectionState, PortStream, StreamConfig, StreamError};
use portstream_transport::{ConnectSource, EventLoop, Port, PortHub};

const APP_ID: &str = "kfbbdcmhjkpbajekmklkdkdfmfpjnclh";

// ==============================================================
// ヘルパー
// ==============================================================

struct World {
    hub: Rc<PortHub>,
}

impl World {
    fn new() -> Self {
        World {
            hub: Rc::new(PortHub::new(Rc::new(EventLoop::new()))),
        }
    }

    fn acceptor(&self, stream: PortStream) -> Acceptor {
        let source: Rc<dyn ConnectSource> = self.hub.clone();
        Acceptor::new(source, APP_ID, stream)
    }

    fn run(&self) -> usize {
        self.hub.event_loop().run_until_idle()
    }
}

fn count(event: &portstream_transport::Event<()>) -> Rc<Cell<u32>> {
    let n = Rc::new(Cell::new(0));
    let c = Rc::clone(&n);
    event.add_listener(move |_| c.set(c.get() + 1));
    n
}

// ==============================================================
// ハンドシェイク
// ==============================================================

#[test]
fn test_connect_and_accept_round_trip() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    // サーバーは受信した ping に pong で応える
    let server = acceptor.stream().clone();
    let responder = server.clone();
    server.on_readable().add_listener(move |_| {
        for request in responder.read_available() {
            if request == json!("ping") {
                responder.write(json!("pong")).unwrap();
            }
        }
    });

    let client = PortStream::new();
    let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    client.write(json!("ping")).unwrap(); // CONNECTING 中の write
    assert_eq!(client.state(), ConnectionState::Connecting);
    world.run();

    assert_eq!(handshake.now_or_never(), Some(Ok(())));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_eq!(client.read_available(), vec![json!("pong")]);
}

#[test]
fn test_initiator_resolves_once_and_connects_once() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(false).unwrap();

    let client = PortStream::new();
    let connects = count(client.on_connect());
    let resolved_at_connect = Rc::new(Cell::new(false));
    let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();

    // onConnect の時点で Future はすでに解決済み
    let shared = Rc::new(RefCell::new(Some(handshake)));
    let (flag, hs) = (Rc::clone(&resolved_at_connect), Rc::clone(&shared));
    client.on_connect().add_listener(move |_| {
        if let Some(handshake) = hs.borrow_mut().as_mut() {
            flag.set(handshake.now_or_never() == Some(Ok(())));
        }
    });

    world.run();
    assert_eq!(connects.get(), 1);
    assert!(resolved_at_connect.get());

    // 重複したセンチネルは再解決も再通知も起こさない
    let server_port = acceptor.stream().port().unwrap();
    server_port.post_message(Frame::Connected.encode().unwrap()).unwrap();
    world.run();
    assert_eq!(connects.get(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.read_available().is_empty());
}

#[test]
fn test_connect_without_listener_fails_without_events() {
    let world = World::new();
    let client = PortStream::new();
    let connects = count(client.on_connect());
    let disconnects = count(client.on_disconnect());

    let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();

    assert!(matches!(
        handshake.now_or_never(),
        Some(Err(StreamError::ConnectionFailed(_)))
    ));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(connects.get(), 0);
    assert_eq!(disconnects.get(), 0);
    assert_eq!(world.hub.refused_count(), 1);
}

#[test]
fn test_open_while_connecting_is_invalid_and_leaves_handshake_alone() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::new();
    let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    let err = client.connect(world.hub.connect("other")).unwrap_err();
    assert_eq!(
        err,
        StreamError::InvalidState {
            op: "open",
            state: ConnectionState::Connecting
        }
    );

    world.run();
    assert_eq!(handshake.now_or_never(), Some(Ok(())));
}

// ==============================================================
// バッファリング
// ==============================================================

#[test]
fn test_writes_before_and_during_handshake_arrive_in_order() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::new();
    client.write(json!(1)).unwrap();
    let _handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    client.write(json!(2)).unwrap();
    world.hub.event_loop().run_once(); // 着信だけ処理（センチネルはまだ届かない）
    client.write(json!(3)).unwrap();
    world.run();
    client.write(json!(4)).unwrap();
    world.run();

    let server = acceptor.stream();
    assert_eq!(
        server.read_available(),
        vec![json!(1), json!(2), json!(3), json!(4)]
    );
    assert_eq!(client.stats().items_sent, 4);
    assert_eq!(client.stats().items_buffered, 3);
}

#[test]
fn test_server_writes_before_accept_follow_the_sentinel() {
    let world = World::new();
    let server = PortStream::new();
    server.write(json!("banner")).unwrap();
    let acceptor = world.acceptor(server.clone());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::new();
    let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();

    assert_eq!(handshake.now_or_never(), Some(Ok(())));
    assert_eq!(client.read_available(), vec![json!("banner")]);
}

#[test]
fn test_max_buffered_rejects_excess_writes() {
    let client = PortStream::with_config(StreamConfig::default().with_max_buffered(2));
    client.write(json!(1)).unwrap();
    client.write(json!(2)).unwrap();
    assert_eq!(
        client.write(json!(3)),
        Err(StreamError::BufferFull { limit: 2 })
    );
    assert_eq!(client.pending_writes(), 2);
}

#[test]
fn test_strict_writes_after_close_are_rejected() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::with_config(StreamConfig::strict());
    let _handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();
    client.close();

    assert!(matches!(
        client.write(json!("late")),
        Err(StreamError::InvalidState { op: "write", .. })
    ));
}

// ==============================================================
// 切断
// ==============================================================

#[test]
fn test_close_twice_fires_disconnect_once_on_each_side() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    let server_disconnects = count(acceptor.on_disconnect());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::new();
    let client_disconnects = count(client.on_disconnect());
    let _handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();

    client.close();
    client.close();
    world.run();
    acceptor.stream().close();

    assert_eq!(client_disconnects.get(), 1);
    assert_eq!(server_disconnects.get(), 1);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(acceptor.stream().state(), ConnectionState::Closed);
}

#[test]
fn test_connect_precedes_disconnect() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let client = PortStream::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = Rc::clone(&log);
    client.on_connect().add_listener(move |_| l.borrow_mut().push("connect"));
    let l = Rc::clone(&log);
    client
        .on_disconnect()
        .add_listener(move |_| l.borrow_mut().push("disconnect"));

    let _handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();
    acceptor.stream().close();
    world.run();

    assert_eq!(*log.borrow(), vec!["connect", "disconnect"]);
}

// ==============================================================
// アクセプター
// ==============================================================

#[test]
fn test_one_shot_ignores_second_offer_until_relisten() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let first = PortStream::new();
    let first_hs = first.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();
    assert_eq!(first_hs.now_or_never(), Some(Ok(())));

    // 待ち受けていないので 2 本目は拒否される
    let second = PortStream::new();
    let second_hs = second.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();
    assert!(matches!(
        second_hs.now_or_never(),
        Some(Err(StreamError::ConnectionFailed(_)))
    ));
    assert_eq!(acceptor.accepted_count(), 1);

    // 切断してから再び待ち受ける
    first.close();
    world.run();
    acceptor.start_listening(true).unwrap();

    let third = PortStream::new();
    let third_hs = third.connect(world.hub.connect(APP_ID)).unwrap();
    world.run();
    assert_eq!(third_hs.now_or_never(), Some(Ok(())));
    assert_eq!(acceptor.accepted_count(), 2);
}

#[test]
fn test_serve_accepts_clients_one_after_another() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    let connects = count(acceptor.on_connect());
    acceptor.serve().unwrap();

    for i in 0..3 {
        let client = PortStream::new();
        let handshake = client.connect(world.hub.connect(APP_ID)).unwrap();
        world.run();
        assert_eq!(handshake.now_or_never(), Some(Ok(())));

        client.write(json!({ "client": i })).unwrap();
        world.run();
        assert_eq!(
            acceptor.stream().read_available(),
            vec![json!({ "client": i })]
        );

        client.close();
        world.run();
    }

    assert_eq!(connects.get(), 3);
    assert!(acceptor.is_listening());
}

#[test]
fn test_undecodable_message_is_counted_not_thrown() {
    let world = World::new();
    let acceptor = world.acceptor(PortStream::new());
    acceptor.start_listening(true).unwrap();

    let port = world.hub.connect(APP_ID);
    let client = PortStream::new();
    let _handshake = client.connect(port.clone()).unwrap();
    world.run();

    port.post_message(json!({"command": "bogus"})).unwrap();
    port.post_message(Value::Null).unwrap();
    world.run();

    let server = acceptor.stream();
    assert_eq!(server.stats().malformed_frames, 2);
    assert_eq!(server.state(), ConnectionState::Connected);
}
