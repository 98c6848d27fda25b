//! portstream-proto エラー型

use alloc::string::String;

/// フレームのエンコード/デコードエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// オブジェクトでない、`command` キーがない、フィールドの型が不正
    #[error("Malformed frame: {0}")]
    Malformed(String),
    /// `command` の値が未知
    #[error("Unknown frame command: {0}")]
    UnknownCommand(String),
    /// フレームを JSON 値にできなかった
    #[error("Frame encoding failed: {0}")]
    Encode(String),
}
