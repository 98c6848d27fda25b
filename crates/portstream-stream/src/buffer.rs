//! バッファ付きストリームの状態機械
//!
//! 具体的なポートには依存しない（sans-I/O）。実際のポート送信・リスナー管理・
//! イベント通知は `portstream-session` の `PortStream` が担当し、
//! このクラスは「いま送ってよいか」「何をどの順で送るか」だけを決める。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use serde::Serialize;
use serde_json::Value;

use crate::{ConnectionState, StreamConfig, StreamError};

/// 1 アイテムごとの送信確認フック
///
/// ポートに渡した時点で `Ok(())`、渡せなかった場合は `Err` で一度だけ呼ばれる。
pub type AckFn = Box<dyn FnOnce(Result<(), StreamError>)>;

/// 送信待ちアイテム
pub struct WriteItem {
    value: Value,
    ack: Option<AckFn>,
}

impl WriteItem {
    pub fn new(value: Value) -> Self {
        WriteItem { value, ack: None }
    }

    /// 送信確認フック付きのアイテム
    pub fn with_ack<F>(value: Value, ack: F) -> Self
    where
        F: FnOnce(Result<(), StreamError>) + 'static,
    {
        WriteItem {
            value,
            ack: Some(Box::new(ack)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn has_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// 値と送信確認フックに分解する
    pub fn into_parts(self) -> (Value, Option<AckFn>) {
        (self.value, self.ack)
    }
}

impl core::fmt::Debug for WriteItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteItem")
            .field("value", &self.value)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// `write` の結果
#[derive(Debug)]
pub enum WriteAction {
    /// 接続中なので直ちにポートへ送る
    Send(WriteItem),
    /// 未接続なのでバッファに積んだ
    Buffered,
}

/// ストリーム統計
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// ポートが受け取ったアイテム数（`record_sent` で数える）
    pub items_sent: u64,
    /// 未接続のためバッファに積んだアイテム数
    pub items_buffered: u64,
    /// 受信したペイロード数
    pub items_received: u64,
    /// CONNECTED に入った回数
    pub connections: u64,
    /// デコードできなかった受信メッセージ数
    pub malformed_frames: u64,
}

/// 接続状態と送受信バッファ
///
/// ## 不変条件
/// - CONNECTED 以外の状態では `WriteAction::Send` を返さない
/// - バッファは CONNECTED に入った直後に積まれた順で一度だけ吐き出される
/// - フラッシュ中の write はバッファの末尾に積まれ、追い越さない
/// - `enter_closed` が `true`（onDisconnect を通知すべき）を返すのは、
///   CONNECTED に到達した接続ごとに一度だけ
pub struct BufferedStream {
    config: StreamConfig,
    state: ConnectionState,
    /// 送信バッファ（接続前に write されたアイテム）
    send_buffer: VecDeque<WriteItem>,
    /// 受信バッファ（上位レイヤーが read_available() で取得する）
    recv_buffer: VecDeque<Value>,
    /// CONNECTED に入ってからバッファを吐き出し終えるまで true
    flushing: bool,
    /// CONNECTED に到達したが、まだ切断を通知していない
    disconnect_pending: bool,
    /// 一度でも開いた後に閉じたか（strict_writes 判定用）
    has_closed: bool,
    stats: StreamStats,
}

impl BufferedStream {
    pub fn new(config: StreamConfig) -> Self {
        BufferedStream {
            config,
            state: ConnectionState::Closed,
            send_buffer: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            flushing: false,
            disconnect_pending: false,
            has_closed: false,
            stats: StreamStats::default(),
        }
    }

    /// 現在の接続状態
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 上位レイヤーからの送信アイテムを受け付ける
    ///
    /// 呼び出し側をブロックしない。未接続の間の write はエラーではなくバッファされる。
    ///
    /// # エラー
    /// - `InvalidState`: `strict_writes` 設定で、閉じたストリームに書いた
    /// - `BufferFull`: `max_buffered` 設定で、バッファが上限に達している
    ///
    /// エラー時はアイテムを破棄し、送信確認フックは呼ばれない。
    pub fn write(&mut self, item: WriteItem) -> Result<WriteAction, StreamError> {
        if self.can_send_now() {
            return Ok(WriteAction::Send(item));
        }

        let closed_after_use = self.has_closed
            && matches!(self.state, ConnectionState::Closed | ConnectionState::Closing);
        if closed_after_use && self.config.strict_writes {
            return Err(StreamError::InvalidState {
                op: "write",
                state: self.state,
            });
        }

        if let Some(limit) = self.config.max_buffered {
            if self.send_buffer.len() >= limit {
                return Err(StreamError::BufferFull { limit });
            }
        }

        if closed_after_use {
            tracing::debug!(
                state = %self.state,
                "write buffered on a closed stream; it is sent only if the stream is reopened"
            );
        }

        self.send_buffer.push_back(item);
        self.stats.items_buffered += 1;
        Ok(WriteAction::Buffered)
    }

    /// CLOSED → CONNECTING（接続側のハンドシェイク開始）
    pub fn begin_connecting(&mut self) -> Result<(), StreamError> {
        self.expect_state("open", ConnectionState::Closed)?;
        self.state = ConnectionState::Connecting;
        tracing::debug!("stream CLOSED -> CONNECTING");
        Ok(())
    }

    /// CLOSED / CONNECTING → CONNECTED
    ///
    /// この後 `next_flush()` が `None` を返すまでバッファを吐き出すこと。
    pub fn enter_connected(&mut self) -> Result<(), StreamError> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Connecting => {}
            state => {
                return Err(StreamError::InvalidState {
                    op: "connect",
                    state,
                })
            }
        }
        tracing::debug!(from = %self.state, buffered = self.send_buffer.len(), "stream -> CONNECTED");
        self.state = ConnectionState::Connected;
        self.flushing = true;
        self.disconnect_pending = true;
        self.stats.connections += 1;
        Ok(())
    }

    /// フラッシュで次に送るアイテムを取り出す
    ///
    /// バッファが空になった時点でフラッシュは終わり、以降の write は直接送られる。
    pub fn next_flush(&mut self) -> Option<WriteItem> {
        if !self.flushing || self.state != ConnectionState::Connected {
            self.flushing = false;
            return None;
        }
        let next = self.send_buffer.pop_front();
        if next.is_none() {
            self.flushing = false;
        }
        next
    }

    /// フラッシュ中か
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// CONNECTED → CLOSING。CONNECTED 以外なら何もせず `false`
    pub fn begin_closing(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.state = ConnectionState::Closing;
        tracing::debug!("stream CONNECTED -> CLOSING");
        true
    }

    /// 任意の状態 → CLOSED
    ///
    /// onDisconnect を通知すべきなら `true` を返す。
    /// ハンドシェイクが完了しなかった接続や、通知済みの接続では `false`。
    /// 既に CLOSED なら何もしない（冪等）。
    pub fn enter_closed(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        tracing::debug!(from = %self.state, "stream -> CLOSED");
        self.state = ConnectionState::Closed;
        self.flushing = false;
        self.has_closed = true;
        core::mem::replace(&mut self.disconnect_pending, false)
    }

    /// ポートから受信したペイロードをバッファに積む
    pub fn push_received(&mut self, payload: Value) {
        self.recv_buffer.push_back(payload);
        self.stats.items_received += 1;
    }

    /// 取り出したアイテムをポートが受け取ったことを記録する
    ///
    /// `WriteAction::Send` / `next_flush()` で渡したアイテムの送信が成功したときだけ呼ぶ。
    pub fn record_sent(&mut self) {
        self.stats.items_sent += 1;
    }

    /// デコードできなかった受信メッセージを記録する
    pub fn record_malformed(&mut self) {
        self.stats.malformed_frames += 1;
    }

    /// 上位レイヤーが読み取れるペイロードをすべて返す
    ///
    /// 読み取ったペイロードは内部バッファから削除される。
    pub fn read_available(&mut self) -> Vec<Value> {
        self.recv_buffer.drain(..).collect()
    }

    /// バッファに未読データがあるか
    pub fn has_pending_read(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    /// 送信待ちデータがあるか
    pub fn has_pending_write(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    pub fn recv_buffer_len(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.len()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    fn can_send_now(&self) -> bool {
        self.state == ConnectionState::Connected && !self.flushing && self.send_buffer.is_empty()
    }

    fn expect_state(&self, op: &'static str, expected: ConnectionState) -> Result<(), StreamError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(StreamError::InvalidState {
                op,
                state: self.state,
            })
        }
    }
}

impl Default for BufferedStream {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}
