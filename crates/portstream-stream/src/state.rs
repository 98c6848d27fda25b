//! 接続状態

use serde::{Deserialize, Serialize};

/// ストリームの接続状態
///
/// ```text
/// Closed ──open(initiator)──▶ Connecting ──sentinel──▶ Connected
///   ▲  └──open(acceptor)────────────────────────────▶    │
///   │           │ disconnect / close                       │ close
///   ├───────────┘                                          ▼
///   └──────────────────── port disconnect ─────────── Closing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// 初期状態・切断後
    #[default]
    Closed,
    /// 接続側がセンチネルを待っている
    Connecting,
    /// ハンドシェイク完了
    Connected,
    /// close() の処理中
    Closing,
}

impl ConnectionState {
    /// 大文字の状態名（ログ・エラーメッセージ用）
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
