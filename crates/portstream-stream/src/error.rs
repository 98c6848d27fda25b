//! ストリームのエラー型

use portstream_proto::ProtoError;
use portstream_transport::TransportError;

use crate::ConnectionState;

/// ストリーム操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// 現在の状態では許されない操作（同期的に返る）
    #[error("Cannot {op}: connection is {state}")]
    InvalidState {
        /// 試みた操作名
        op: &'static str,
        /// そのときの状態
        state: ConnectionState,
    },
    /// ハンドシェイク完了前に切断された（open の Future が一度だけ reject される）
    #[error("Connection failed: {0}")]
    ConnectionFailed(&'static str),
    /// ポートが送信に失敗した
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// 送信バッファが上限に達した（`StreamConfig::max_buffered` 設定時のみ）
    #[error("Write buffer full ({limit} items)")]
    BufferFull {
        /// 設定された上限
        limit: usize,
    },
    /// 送信フレームを組み立てられなかった
    #[error("Encode error: {0}")]
    Encode(#[from] ProtoError),
}
