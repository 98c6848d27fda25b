//! # portstream-wasm
//!
//! wasm-bindgen エクスポート：ブラウザ拡張機能から呼び出す公開 API。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { ExtensionStream, init_panic_hook, init_logging } from './portstream-wasm-pkg/portstream_wasm';
//!
//! // パニック時のスタックトレースを有効化（開発時）
//! init_panic_hook();
//! init_logging("debug");
//!
//! // 受け入れ側の拡張機能
//! const server = new ExtensionStream();
//! server.onReadable(() => {
//!     for (const msg of server.readPending()) {
//!         server.write(JSON.stringify({ echo: msg }));
//!     }
//! });
//! server.startListening(true);
//!
//! // 接続側の拡張機能
//! const client = new ExtensionStream('{"max_buffered": 256}');
//! client.write(JSON.stringify("hello"));      // 接続前でもバッファされる
//! await client.openExtension("kfbbdcmhjkpbajekmklkdkdfmfpjnclh");
//! ```

use wasm_bindgen::prelude::*;

pub mod chrome;
pub mod extension;
pub mod logging;
pub mod port;
pub mod runtime;

pub use extension::ExtensionStream;
pub use port::JsPort;
pub use runtime::JsRuntime;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// `tracing` のログをブラウザコンソールに出力する
///
/// # 引数
/// - `level`: `"error"` / `"warn"` / `"info"` / `"debug"` / `"trace"` / `"off"`
///
/// # エラー
/// - 不明なレベル名
/// - 既に初期化済み
#[wasm_bindgen]
pub fn init_logging(level: &str) -> Result<(), JsError> {
    let filter = logging::parse_level(level).map_err(|e| JsError::new(&e))?;
    logging::install(filter).map_err(|e| JsError::new(&format!("Logging already initialized: {}", e)))?;
    tracing::info!(%level, "logging initialized");
    Ok(())
}
