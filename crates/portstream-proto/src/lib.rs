//! # portstream-proto
//!
//! ポート上を流れるメッセージのエンベロープ（フレーム）定義と
//! エンコード/デコードユーティリティ。
//!
//! ## フレームの Wire Format
//!
//! すべてのメッセージは `command` キーでタグ付けされた JSON オブジェクト。
//!
//! ```text
//! ハンドシェイク完了（センチネル）:
//!   {"command": "connected"}
//!
//! アプリケーションデータ:
//!   {"command": "data", "payload": <任意の JSON>}
//! ```
//!
//! アプリケーションのペイロードは必ず `data` フレームに包まれるため、
//! ペイロードの内容がセンチネルと衝突することはない。

#![no_std]
extern crate alloc;

use alloc::string::{String, ToString};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod error;

pub use error::ProtoError;

/// フレームのタグキー
pub const COMMAND_KEY: &str = "command";

/// センチネルの `command` 値
pub const COMMAND_CONNECTED: &str = "connected";

/// データフレームの `command` 値
pub const COMMAND_DATA: &str = "data";

/// ポート上の 1 メッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Frame {
    /// 受け入れ側が接続直後に一度だけ送るハンドシェイク完了通知
    Connected,
    /// 上位レイヤーのペイロード
    Data {
        /// 不透明なペイロード（中身は解釈しない）
        payload: Value,
    },
}

impl Frame {
    /// データフレームを組み立てる
    pub fn data(payload: Value) -> Self {
        Frame::Data { payload }
    }

    /// ポートに渡す JSON 値にエンコードする
    ///
    /// # エラー
    /// - `ProtoError::Encode`: ペイロードを JSON 値として表現できない
    pub fn encode(&self) -> Result<Value, ProtoError> {
        serde_json::to_value(self).map_err(|e| ProtoError::Encode(e.to_string()))
    }

    /// ポートから受け取った JSON 値をデコードする
    ///
    /// # エラー
    /// - `ProtoError::Malformed`: オブジェクトでない / `command` がない / `payload` がない
    /// - `ProtoError::UnknownCommand`: `command` が未知の値
    pub fn decode(value: &Value) -> Result<Frame, ProtoError> {
        let command = value
            .get(COMMAND_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::Malformed(String::from("missing string `command` key")))?;

        match command {
            COMMAND_CONNECTED | COMMAND_DATA => Frame::deserialize(value)
                .map_err(|e| ProtoError::Malformed(e.to_string())),
            other => Err(ProtoError::UnknownCommand(other.to_string())),
        }
    }

    /// 値がセンチネル `{"command": "connected"}` か
    pub fn is_sentinel(value: &Value) -> bool {
        value.get(COMMAND_KEY).and_then(Value::as_str) == Some(COMMAND_CONNECTED)
    }

    /// センチネルか
    pub fn is_connected(&self) -> bool {
        matches!(self, Frame::Connected)
    }

    /// データフレームならペイロードを取り出す
    pub fn into_payload(self) -> Option<Value> {
        match self {
            Frame::Data { payload } => Some(payload),
            Frame::Connected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sentinel_wire_format() {
        assert_eq!(Frame::Connected.encode().unwrap(), json!({"command": "connected"}));
    }

    #[test]
    fn test_data_wire_format() {
        let frame = Frame::data(json!({"op": "stat", "path": "/exe"}));
        assert_eq!(
            frame.encode().unwrap(),
            json!({"command": "data", "payload": {"op": "stat", "path": "/exe"}})
        );
    }

    #[test]
    fn test_encode_follows_derived_tag() {
        let frame = Frame::data(json!([1, {"nested": null}]));
        let wire = frame.encode().unwrap();
        assert_eq!(wire[COMMAND_KEY], json!(COMMAND_DATA));
        assert_eq!(wire.as_object().map(|m| m.len()), Some(2));
        assert_eq!(Frame::decode(&wire), Ok(frame));

        let sentinel = Frame::Connected.encode().unwrap();
        assert_eq!(sentinel[COMMAND_KEY], json!(COMMAND_CONNECTED));
        assert!(Frame::is_sentinel(&sentinel));
    }

    #[test]
    fn test_decode_sentinel() {
        let frame = Frame::decode(&json!({"command": "connected"})).unwrap();
        assert!(frame.is_connected());
        assert!(Frame::is_sentinel(&json!({"command": "connected"})));
    }

    #[test]
    fn test_payload_never_collides_with_sentinel() {
        // ペイロード自体がセンチネルと同じ形でもデータとして扱われる
        let frame = Frame::data(json!({"command": "connected"}));
        let wire = frame.encode().unwrap();
        assert!(!Frame::is_sentinel(&wire));

        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(decoded.into_payload(), Some(json!({"command": "connected"})));
    }

    #[test]
    fn test_decode_missing_command() {
        let result = Frame::decode(&json!("ping"));
        assert!(matches!(result, Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn test_decode_unknown_command() {
        let result = Frame::decode(&json!({"command": "resume"}));
        assert_eq!(result, Err(ProtoError::UnknownCommand(String::from("resume"))));
    }

    #[test]
    fn test_decode_data_without_payload() {
        let result = Frame::decode(&json!({"command": "data"}));
        assert!(matches!(result, Err(ProtoError::Malformed(_))));
    }
}
