//! トランスポートポートの抽象
//!
//! ストリームは具体的なポート実装（`chrome.runtime.Port`、インメモリのペアなど）
//! ではなく、このトレイトの能力だけに依存する。

use alloc::rc::Rc;

use serde_json::Value;

use crate::event::{Listener, ListenerId};
use crate::TransportError;

/// 共有されたポート参照
pub type PortRef = Rc<dyn Port>;

/// 双方向のメッセージポート
///
/// - メッセージは離散的な JSON 値として届く
/// - どちらの端もいつでも切断しうる
/// - `disconnect()` を呼んだ側には切断通知は届かない（相手側にのみ届く）
pub trait Port {
    /// ポートの名前（接続時のチャンネル名）
    fn name(&self) -> &str;

    /// まだ接続中か
    fn is_connected(&self) -> bool;

    /// 相手側にメッセージを送る
    ///
    /// # エラー
    /// - `TransportError::Disconnected`: 切断済み
    fn post_message(&self, message: Value) -> Result<(), TransportError>;

    /// 切断を要求する
    fn disconnect(&self);

    /// メッセージ受信リスナーを登録する
    fn add_message_listener(&self, listener: Listener<Value>) -> ListenerId;

    /// メッセージ受信リスナーを削除する
    fn remove_message_listener(&self, id: ListenerId) -> bool;

    /// 切断通知リスナーを登録する
    fn add_disconnect_listener(&self, listener: Listener<()>) -> ListenerId;

    /// 切断通知リスナーを削除する
    fn remove_disconnect_listener(&self, id: ListenerId) -> bool;
}

/// 既知のチャンネル名で着信接続を待ち受ける能力
/// （`chrome.runtime.onConnectExternal` 相当）
pub trait ConnectSource {
    /// `channel` への着信リスナーを登録する
    fn add_connect_listener(&self, channel: &str, listener: Listener<PortRef>) -> ListenerId;

    /// 着信リスナーを削除する
    fn remove_connect_listener(&self, channel: &str, id: ListenerId) -> bool;
}
