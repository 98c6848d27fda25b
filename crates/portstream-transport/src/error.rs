//! portstream-transport エラー型

use alloc::string::String;

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// ポートが切断済み（ローカル・リモートいずれの切断も含む）
    #[error("Port is disconnected")]
    Disconnected,
    /// 下位のポート実装が送信を拒否した
    #[error("Port rejected the message: {0}")]
    Rejected(String),
    /// メッセージを転送可能な形式に変換できなかった
    #[error("Message serialization failed: {0}")]
    Serialization(String),
}
