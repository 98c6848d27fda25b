//! ExtensionStream wasm-bindgen エクスポート
//!
//! ブラウザ拡張機能の間で `chrome.runtime` のポートを使ってストリームを張る。
//! 一方が `startListening()` で待ち受け、もう一方が `openExtension(appId)` で接続する。

use std::rc::Rc;

use js_sys::{Array, Function, Promise};
use serde_json::Value;
use wasm_bindgen::prelude::*;

use portstream_session::{Acceptor, ConnectionState, PortStream, StreamConfig};
use portstream_transport::{ConnectSource, Port};

use crate::port::value_to_js;
use crate::runtime::JsRuntime;

/// `onConnectExternal` を表すチャンネル名（ログ用）
const EXTERNAL_CHANNEL: &str = "onConnectExternal";

/// 拡張機能間のバッファ付きストリーム
///
/// ## 内部アーキテクチャ
///
/// ```text
/// ExtensionStream
///   ├── JsRuntime   - chrome.runtime.connect / onConnectExternal
///   ├── PortStream  - 状態機械・送受信バッファ・ハンドシェイク
///   └── Acceptor    - 着信の待ち受け
/// ```
///
/// ## スレッド安全性
///
/// WASM はシングルスレッドのため `!Send + !Sync`。
#[wasm_bindgen]
pub struct ExtensionStream {
    runtime: Rc<JsRuntime>,
    stream: PortStream,
    acceptor: Acceptor,
}

#[wasm_bindgen]
impl ExtensionStream {
    /// ストリームを生成する（まだ接続も待ち受けもしない）
    ///
    /// # 引数
    /// - `config_json`: 省略可。例: `{"strict_writes": true, "max_buffered": 256}`
    ///
    /// # エラー
    /// - 設定 JSON が不正
    /// - `chrome.runtime` が使えないコンテキスト
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<ExtensionStream, JsError> {
        let config = match config_json.as_deref() {
            Some(json) => StreamConfig::from_json(json)
                .map_err(|e| JsError::new(&format!("Invalid config: {}", e)))?,
            None => StreamConfig::default(),
        };
        let runtime = JsRuntime::new().map_err(|e| JsError::new(&crate::chrome::describe(&e)))?;
        let stream = PortStream::with_config(config);
        let source: Rc<dyn ConnectSource> = runtime.clone();
        let acceptor = Acceptor::new(source, EXTERNAL_CHANNEL, stream.clone());

        Ok(ExtensionStream {
            runtime,
            stream,
            acceptor,
        })
    }

    /// 別の拡張機能に接続する
    ///
    /// 返る Promise は相手が受け入れたとき（センチネル受信）に resolve し、
    /// その前に切断されると reject する。
    ///
    /// # エラー
    /// - 待ち受け中、またはストリームが CLOSED でない
    #[wasm_bindgen(js_name = "openExtension")]
    pub fn open_extension(&self, app_id: &str) -> Result<Promise, JsError> {
        if self.acceptor.is_listening() {
            return Err(JsError::new("Cannot connect: already listening"));
        }
        let state = self.stream.state();
        if state != ConnectionState::Closed {
            return Err(JsError::new(&format!("Cannot connect: connection is {}", state)));
        }

        let port = self
            .runtime
            .connect(app_id)
            .map_err(|e| JsError::new(&e.to_string()))?;
        let handshake = match self.stream.connect(Rc::clone(&port)) {
            Ok(handshake) => handshake,
            Err(e) => {
                port.disconnect();
                return Err(JsError::new(&e.to_string()));
            }
        };

        Ok(wasm_bindgen_futures::future_to_promise(async move {
            handshake
                .await
                .map(|()| JsValue::UNDEFINED)
                .map_err(|e| JsError::new(&e.to_string()).into())
        }))
    }

    /// 着信の待ち受けを開始する
    #[wasm_bindgen(js_name = "startListening")]
    pub fn start_listening(&self, one_shot: bool) -> Result<(), JsError> {
        self.acceptor
            .start_listening(one_shot)
            .map_err(|e| JsError::new(&e.to_string()))
    }

    /// 待ち受けをやめる
    #[wasm_bindgen(js_name = "stopListening")]
    pub fn stop_listening(&self) {
        self.acceptor.stop_listening();
    }

    /// 接続が切れるたびに待ち受けを再開し、1 つずつ受け入れ続ける
    #[wasm_bindgen]
    pub fn serve(&self) -> Result<(), JsError> {
        self.acceptor.serve().map_err(|e| JsError::new(&e.to_string()))
    }

    #[wasm_bindgen(getter, js_name = "isListening")]
    pub fn is_listening(&self) -> bool {
        self.acceptor.is_listening()
    }

    /// JSON 文字列のペイロードを書き込む（未接続ならバッファされる）
    #[wasm_bindgen]
    pub fn write(&self, json: &str) -> Result<(), JsError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| JsError::new(&format!("Invalid JSON: {}", e)))?;
        self.stream
            .write(value)
            .map_err(|e| JsError::new(&e.to_string()))
    }

    /// 受信済みのペイロードをすべて取り出す
    #[wasm_bindgen(js_name = "readPending")]
    pub fn read_pending(&self) -> Result<Array, JsError> {
        let result = Array::new();
        for value in self.stream.read_available() {
            let js = value_to_js(&value).map_err(|e| JsError::new(&e.to_string()))?;
            result.push(&js);
        }
        Ok(result)
    }

    #[wasm_bindgen(js_name = "hasPendingRead")]
    pub fn has_pending_read(&self) -> bool {
        self.stream.has_pending_read()
    }

    /// 接続を閉じる（何度呼んでもよい）
    #[wasm_bindgen]
    pub fn close(&self) {
        self.stream.close();
    }

    /// `"CLOSED"` / `"CONNECTING"` / `"CONNECTED"` / `"CLOSING"`
    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        self.stream.state().as_str().to_string()
    }

    /// ストリーム統計を JSON 文字列で返す
    ///
    /// ```json
    /// {"items_sent":3,"items_buffered":1,"items_received":2,"connections":1,"malformed_frames":0}
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> Result<String, JsError> {
        serde_json::to_string(&self.stream.stats()).map_err(|e| JsError::new(&e.to_string()))
    }

    #[wasm_bindgen(js_name = "onConnect")]
    pub fn on_connect(&self, callback: Function) {
        self.stream
            .on_connect()
            .add_listener(move |_| invoke(&callback, "onConnect"));
    }

    #[wasm_bindgen(js_name = "onDisconnect")]
    pub fn on_disconnect(&self, callback: Function) {
        self.stream
            .on_disconnect()
            .add_listener(move |_| invoke(&callback, "onDisconnect"));
    }

    /// 受信データが届いたときに呼ばれる。中身は `readPending()` で取り出す
    #[wasm_bindgen(js_name = "onReadable")]
    pub fn on_readable(&self, callback: Function) {
        self.stream
            .on_readable()
            .add_listener(move |_| invoke(&callback, "onReadable"));
    }
}

impl Drop for ExtensionStream {
    fn drop(&mut self) {
        self.acceptor.stop_listening();
        self.stream.close();
    }
}

fn invoke(callback: &Function, event: &str) {
    if let Err(e) = callback.call0(&JsValue::NULL) {
        tracing::warn!(event, error = %crate::chrome::describe(&e), "callback threw");
    }
}
