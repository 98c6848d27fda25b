//! ハンドシェイク可能なポートストリーム
//!
//! `BufferedStream` の状態機械を 1 つの `Port` に結び付け、
//! 接続（initiator）と受け入れ（acceptor）の 2 通りのハンドシェイクを実装する。
//!
//! ## ハンドシェイク
//!
//! ```text
//! 接続側 (connect)                       受け入れ側 (accept)
//!   CLOSED → CONNECTING                    CLOSED → CONNECTED
//!   一時リスナー登録                       定常リスナー登録
//!          ◀──────── {"command":"connected"} ────────  センチネル送信
//!   一時リスナー解除                       バッファ flush
//!   CONNECTED / バッファ flush             onConnect
//!   Future 解決 / onConnect
//! ```
//!
//! 受け入れ側は返事を待たない。着信を受け入れた時点でポートは双方向に
//! 生きているので、待つ必要があるのは相手が聞いているか分からない接続側だけ。
//!
//! ## 再入の扱い
//!
//! 内部状態の `RefCell` を借用したままポートやユーザーのコールバックを呼ぶことはない。
//! 状態遷移を確定させてから通知するため、onConnect/onDisconnect のハンドラ内で
//! `close()` や `write()` を呼んでもよい。送信確認フックは flush と onConnect の後に呼ばれる。

use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;

use serde_json::Value;

use portstream_proto::Frame;
use portstream_stream::{
    AckFn, BufferedStream, ConnectionState, StreamConfig, StreamError, StreamStats, WriteAction,
    WriteItem,
};
use portstream_transport::{Event, ListenerId, PortRef, TransportError};

use crate::handshake::{Completer, Handshake};

/// 呼び出し待ちの送信確認
type DeferredAck = (AckFn, Result<(), StreamError>);

/// ポート上のバッファ付き双方向ストリーム
///
/// `Clone` は同じストリームへのハンドルを増やすだけ。
/// ポートに登録したリスナーは弱参照しか持たないため、
/// すべてのハンドルを破棄すればストリームは解放される。
///
/// ## スレッド安全性
///
/// シングルスレッドのイベントループ専用（`!Send + !Sync`）。
#[derive(Clone)]
pub struct PortStream {
    shared: Rc<Shared>,
}

struct Shared {
    core: RefCell<Core>,
    on_connect: Event<()>,
    on_disconnect: Event<()>,
    on_readable: Event<()>,
}

struct Core {
    buffer: BufferedStream,
    /// 現在結び付いているポート（高々 1 つ）
    port: Option<PortRef>,
    /// CONNECTING の間だけ存在する
    handshake: Option<PendingHandshake>,
    /// CONNECTED の間に登録している定常リスナー
    listeners: Option<PortListeners>,
}

/// 進行中の open()（接続側）
struct PendingHandshake {
    completer: Completer,
    message_listener: ListenerId,
    disconnect_listener: ListenerId,
}

#[derive(Debug, Clone, Copy)]
struct PortListeners {
    message: ListenerId,
    disconnect: ListenerId,
}

impl PortStream {
    /// デフォルト設定で CLOSED のストリームを生成する
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        PortStream {
            shared: Rc::new(Shared {
                core: RefCell::new(Core {
                    buffer: BufferedStream::new(config),
                    port: None,
                    handshake: None,
                    listeners: None,
                }),
                on_connect: Event::new(),
                on_disconnect: Event::new(),
                on_readable: Event::new(),
            }),
        }
    }

    /// ポートを結び付けて接続を開く
    ///
    /// - `already_connected = true`: 受け入れ側。直ちに CONNECTED になり、
    ///   センチネルを送ってからバッファを flush し、完了済みの `Handshake` を返す
    /// - `already_connected = false`: 接続側。CONNECTING になり、
    ///   最初のメッセージ（センチネル）か切断で完了する `Handshake` を返す
    ///
    /// # エラー
    /// - `InvalidState`: CLOSED 以外の状態で呼んだ（ハンドシェイクは同時に 1 つまで）
    pub fn open(&self, port: PortRef, already_connected: bool) -> Result<Handshake, StreamError> {
        let state = self.state();
        if state != ConnectionState::Closed {
            return Err(StreamError::InvalidState { op: "open", state });
        }

        if !port.is_connected() {
            tracing::warn!(port = port.name(), "open on a port that is already disconnected");
            return Ok(Handshake::ready(Err(StreamError::ConnectionFailed(
                "port is already disconnected",
            ))));
        }

        if already_connected {
            accept(&self.shared, port)?;
            Ok(Handshake::ready(Ok(())))
        } else {
            initiate(&self.shared, port)
        }
    }

    /// 接続側として開く（`open(port, false)`）
    pub fn connect(&self, port: PortRef) -> Result<Handshake, StreamError> {
        self.open(port, false)
    }

    /// 受け入れ側として開く（`open(port, true)`）
    pub fn accept(&self, port: PortRef) -> Result<Handshake, StreamError> {
        self.open(port, true)
    }

    /// ペイロードを書き込む
    ///
    /// CONNECTED なら直ちにポートへ送り、それ以外ならバッファに積む。
    /// 接続後のポート送信失敗はここでは返らず、onDisconnect で観測する。
    ///
    /// # エラー
    /// `StreamConfig` の `strict_writes` / `max_buffered` を設定した場合のみ。
    pub fn write(&self, value: Value) -> Result<(), StreamError> {
        self.write_item(WriteItem::new(value))
    }

    /// 送信確認フック付きで書き込む
    ///
    /// フックはポートに渡した時点（バッファされた場合は flush 時）に一度だけ呼ばれる。
    pub fn write_with_ack<F>(&self, value: Value, ack: F) -> Result<(), StreamError>
    where
        F: FnOnce(Result<(), StreamError>) + 'static,
    {
        self.write_item(WriteItem::with_ack(value, ack))
    }

    fn write_item(&self, item: WriteItem) -> Result<(), StreamError> {
        let action = self.shared.core.borrow_mut().buffer.write(item)?;
        if let WriteAction::Send(item) = action {
            let port = self.shared.core.borrow().port.clone();
            let (value, ack) = item.into_parts();
            let result = post_data(port.as_ref(), value);
            if result.is_ok() {
                self.shared.core.borrow_mut().buffer.record_sent();
            }
            if let Some(ack) = ack {
                ack(result);
            }
        }
        Ok(())
    }

    /// 接続を閉じる
    ///
    /// - CONNECTED: CLOSING → ポートに切断を要求 → CLOSED → onDisconnect（一度だけ）
    /// - CONNECTING: 進行中のハンドシェイクを `ConnectionFailed` で終わらせて CLOSED（通知なし）
    /// - CLOSED / CLOSING: 何もしない（冪等）
    pub fn close(&self) {
        close(&self.shared);
    }

    /// 現在の接続状態
    pub fn state(&self) -> ConnectionState {
        self.shared.core.borrow().buffer.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// 受信済みのペイロードをすべて取り出す
    pub fn read_available(&self) -> Vec<Value> {
        self.shared.core.borrow_mut().buffer.read_available()
    }

    pub fn has_pending_read(&self) -> bool {
        self.shared.core.borrow().buffer.has_pending_read()
    }

    /// 送信待ち（未接続のため保留中）のアイテム数
    pub fn pending_writes(&self) -> usize {
        self.shared.core.borrow().buffer.send_buffer_len()
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.core.borrow().buffer.stats().clone()
    }

    /// 結び付いているポート
    pub fn port(&self) -> Option<PortRef> {
        self.shared.core.borrow().port.clone()
    }

    /// CONNECTED に入ったときに通知される
    pub fn on_connect(&self) -> &Event<()> {
        &self.shared.on_connect
    }

    /// CONNECTED だった接続が CLOSED になったときに通知される
    pub fn on_disconnect(&self) -> &Event<()> {
        &self.shared.on_disconnect
    }

    /// 受信バッファにペイロードが積まれたときに通知される
    pub fn on_readable(&self) -> &Event<()> {
        &self.shared.on_readable
    }
}

impl Default for PortStream {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PortStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.shared.core.borrow();
        f.debug_struct("PortStream")
            .field("state", &core.buffer.state())
            .field("pending_writes", &core.buffer.send_buffer_len())
            .field("port", &core.port.as_ref().map(|p| p.name()))
            .finish()
    }
}

// ===== 状態遷移（Rc<Shared> を受け取り、リスナーには Weak を渡す） =====

fn initiate(shared: &Rc<Shared>, port: PortRef) -> Result<Handshake, StreamError> {
    {
        let mut core = shared.core.borrow_mut();
        core.buffer.begin_connecting()?;
        core.port = Some(Rc::clone(&port));
    }

    let weak = Rc::downgrade(shared);
    let message_listener = port.add_message_listener(Box::new(move |message: &Value| {
        if let Some(shared) = weak.upgrade() {
            handshake_message(&shared, message);
        }
    }));
    let weak = Rc::downgrade(shared);
    let disconnect_listener = port.add_disconnect_listener(Box::new(move |_: &()| {
        if let Some(shared) = weak.upgrade() {
            handshake_failed(&shared);
        }
    }));

    let (completer, handshake) = Handshake::pending();
    shared.core.borrow_mut().handshake = Some(PendingHandshake {
        completer,
        message_listener,
        disconnect_listener,
    });
    tracing::debug!(port = port.name(), "waiting for handshake sentinel");
    Ok(handshake)
}

fn accept(shared: &Rc<Shared>, port: PortRef) -> Result<(), StreamError> {
    shared.core.borrow_mut().port = Some(Rc::clone(&port));
    let acks = enter_connected(shared, &port, true)?;
    tracing::info!(port = port.name(), "connection accepted");
    shared.on_connect.fire(&());
    run_acks(acks);
    Ok(())
}

/// 接続側: ハンドシェイク中に最初のメッセージが届いた
fn handshake_message(shared: &Rc<Shared>, message: &Value) {
    let (pending, port) = {
        let mut core = shared.core.borrow_mut();
        if core.buffer.state() != ConnectionState::Connecting {
            return;
        }
        match (core.handshake.take(), core.port.clone()) {
            (Some(pending), Some(port)) => (pending, port),
            _ => return,
        }
    };
    port.remove_message_listener(pending.message_listener);
    port.remove_disconnect_listener(pending.disconnect_listener);

    // 最初のメッセージの中身はハンドシェイク完了の合図としてしか使わないが、
    // データフレームだった場合はペイロードを失わないよう受信バッファへ回す
    let early_payload = match Frame::decode(message) {
        Ok(Frame::Connected) => None,
        Ok(Frame::Data { payload }) => {
            tracing::debug!("handshake completed by a data frame");
            Some(payload)
        }
        Err(e) => {
            tracing::warn!(error = %e, "handshake completed by an undecodable message");
            shared.core.borrow_mut().buffer.record_malformed();
            None
        }
    };

    let acks = match enter_connected(shared, &port, false) {
        Ok(acks) => acks,
        Err(e) => {
            tracing::error!(error = %e, "handshake could not enter CONNECTED");
            let _ = pending.completer.send(Err(e));
            return;
        }
    };
    tracing::info!(port = port.name(), "handshake completed");

    let has_early_payload = early_payload.is_some();
    if let Some(payload) = early_payload {
        shared.core.borrow_mut().buffer.push_received(payload);
    }

    // 受信側が Future を破棄していても接続自体は成立している
    let _ = pending.completer.send(Ok(()));
    shared.on_connect.fire(&());
    if has_early_payload {
        shared.on_readable.fire(&());
    }
    run_acks(acks);
}

/// 接続側: センチネルより先に切断された
fn handshake_failed(shared: &Rc<Shared>) {
    let (pending, port) = {
        let mut core = shared.core.borrow_mut();
        if core.buffer.state() != ConnectionState::Connecting {
            return;
        }
        let pending = core.handshake.take();
        let port = core.port.take();
        // ハンドシェイク未完了なので onDisconnect は通知しない
        core.buffer.enter_closed();
        (pending, port)
    };

    if let (Some(pending), Some(port)) = (&pending, &port) {
        port.remove_message_listener(pending.message_listener);
        port.remove_disconnect_listener(pending.disconnect_listener);
    }
    tracing::warn!("port disconnected before the handshake completed");

    if let Some(pending) = pending {
        let _ = pending
            .completer
            .send(Err(StreamError::ConnectionFailed("port disconnected before the handshake")));
    }
}

/// CONNECTED に入り、定常リスナーを登録してバッファを flush する
///
/// 受け入れ側（`send_sentinel = true`）はセンチネルを flush より先に送るため、
/// 接続側が最初に受け取るメッセージは必ずセンチネルになる。
fn enter_connected(
    shared: &Rc<Shared>,
    port: &PortRef,
    send_sentinel: bool,
) -> Result<Vec<DeferredAck>, StreamError> {
    shared.core.borrow_mut().buffer.enter_connected()?;

    let weak: Weak<Shared> = Rc::downgrade(shared);
    let message = port.add_message_listener(Box::new(move |message: &Value| {
        if let Some(shared) = weak.upgrade() {
            port_message(&shared, message);
        }
    }));
    let weak: Weak<Shared> = Rc::downgrade(shared);
    let disconnect = port.add_disconnect_listener(Box::new(move |_: &()| {
        if let Some(shared) = weak.upgrade() {
            port_disconnected(&shared);
        }
    }));
    shared.core.borrow_mut().listeners = Some(PortListeners {
        message,
        disconnect,
    });

    if send_sentinel {
        let sent = Frame::Connected
            .encode()
            .map_err(StreamError::from)
            .and_then(|sentinel| port.post_message(sentinel).map_err(StreamError::from));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to send handshake sentinel");
        }
    }

    Ok(flush(shared, port))
}

/// バッファを積まれた順に一度だけポートへ送る
fn flush(shared: &Shared, port: &PortRef) -> Vec<DeferredAck> {
    let mut acks = Vec::new();
    let mut flushed = 0usize;
    loop {
        let next = shared.core.borrow_mut().buffer.next_flush();
        let item = match next {
            Some(item) => item,
            None => break,
        };
        let (value, ack) = item.into_parts();
        let result = post_data(Some(port), value);
        if result.is_ok() {
            shared.core.borrow_mut().buffer.record_sent();
        }
        if let Some(ack) = ack {
            acks.push((ack, result));
        }
        flushed += 1;
    }
    if flushed > 0 {
        tracing::debug!(count = flushed, "flushed buffered writes");
    }
    acks
}

/// CONNECTED 中のメッセージ受信
fn port_message(shared: &Shared, message: &Value) {
    let readable = {
        let mut core = shared.core.borrow_mut();
        if core.buffer.state() != ConnectionState::Connected {
            return;
        }
        match Frame::decode(message) {
            Ok(Frame::Data { payload }) => {
                core.buffer.push_received(payload);
                true
            }
            Ok(Frame::Connected) => {
                tracing::debug!("duplicate handshake sentinel ignored");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                core.buffer.record_malformed();
                false
            }
        }
    };
    if readable {
        shared.on_readable.fire(&());
    }
}

/// CONNECTED 中に相手側から切断された
fn port_disconnected(shared: &Shared) {
    let (port, listeners, notify) = {
        let mut core = shared.core.borrow_mut();
        if !matches!(
            core.buffer.state(),
            ConnectionState::Connected | ConnectionState::Closing
        ) {
            return;
        }
        let port = core.port.take();
        let listeners = core.listeners.take();
        let notify = core.buffer.enter_closed();
        (port, listeners, notify)
    };
    if let (Some(port), Some(listeners)) = (port, listeners) {
        remove_listeners(&port, listeners);
    }
    tracing::info!("port disconnected by the remote end");
    if notify {
        shared.on_disconnect.fire(&());
    }
}

fn close(shared: &Shared) {
    let state = shared.core.borrow().buffer.state();
    match state {
        ConnectionState::Closed | ConnectionState::Closing => {}
        ConnectionState::Connecting => {
            let (pending, port) = {
                let mut core = shared.core.borrow_mut();
                let pending = core.handshake.take();
                let port = core.port.take();
                core.buffer.enter_closed();
                (pending, port)
            };
            if let Some(port) = &port {
                if let Some(pending) = &pending {
                    port.remove_message_listener(pending.message_listener);
                    port.remove_disconnect_listener(pending.disconnect_listener);
                }
                port.disconnect();
            }
            tracing::debug!("handshake cancelled by close()");
            if let Some(pending) = pending {
                let _ = pending.completer.send(Err(StreamError::ConnectionFailed(
                    "stream closed before the handshake completed",
                )));
            }
        }
        ConnectionState::Connected => {
            let (port, listeners) = {
                let mut core = shared.core.borrow_mut();
                core.buffer.begin_closing();
                (core.port.clone(), core.listeners.take())
            };
            if let Some(port) = &port {
                if let Some(listeners) = listeners {
                    remove_listeners(port, listeners);
                }
                port.disconnect();
            }
            let notify = {
                let mut core = shared.core.borrow_mut();
                core.port = None;
                core.buffer.enter_closed()
            };
            tracing::info!("stream closed");
            if notify {
                shared.on_disconnect.fire(&());
            }
        }
    }
}

fn remove_listeners(port: &PortRef, listeners: PortListeners) {
    port.remove_message_listener(listeners.message);
    port.remove_disconnect_listener(listeners.disconnect);
}

fn post_data(port: Option<&PortRef>, value: Value) -> Result<(), StreamError> {
    let result = match port {
        Some(port) => Frame::data(value)
            .encode()
            .map_err(StreamError::from)
            .and_then(|message| port.post_message(message).map_err(StreamError::from)),
        None => Err(StreamError::Transport(TransportError::Disconnected)),
    };
    result.map_err(|e| {
        tracing::warn!(error = %e, "write could not be handed to the port");
        e
    })
}

fn run_acks(acks: Vec<DeferredAck>) {
    for (ack, result) in acks {
        ack(result);
    }
}
