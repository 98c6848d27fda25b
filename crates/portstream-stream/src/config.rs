//! ストリーム設定

use serde::{Deserialize, Serialize};

/// ストリームの動作ポリシー
///
/// JSON から読み込む場合、省略したフィールドはデフォルト値になる。
///
/// ```json
/// { "strict_writes": true, "max_buffered": 1024 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// 一度閉じたストリームへの write をエラーにする
    ///
    /// `false`（デフォルト）の場合はバッファに積まれ、再 open されたときだけ送られる。
    pub strict_writes: bool,
    /// 未接続の間にバッファできる最大アイテム数。`None` なら無制限
    pub max_buffered: Option<usize>,
}

impl StreamConfig {
    /// JSON 文字列から読み込む
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 閉じたストリームへの write をエラーにする設定
    pub fn strict() -> Self {
        StreamConfig {
            strict_writes: true,
            ..Self::default()
        }
    }

    /// バッファ上限を設定する
    pub fn with_max_buffered(mut self, limit: usize) -> Self {
        self.max_buffered = Some(limit);
        self
    }
}
