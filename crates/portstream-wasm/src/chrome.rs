//! `chrome.runtime` の最小限のバインディング
//!
//! 使うのは Port（postMessage / disconnect / onMessage / onDisconnect）と
//! `chrome.runtime.connect` / `chrome.runtime.onConnectExternal` だけ。

use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

#[wasm_bindgen]
extern "C" {
    /// `chrome.runtime.Port`
    #[derive(Debug, Clone)]
    pub type ChromePort;

    #[wasm_bindgen(method, getter)]
    pub fn name(this: &ChromePort) -> String;

    #[wasm_bindgen(method, catch, js_name = postMessage)]
    pub fn post_message(this: &ChromePort, message: &JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(method)]
    pub fn disconnect(this: &ChromePort);

    #[wasm_bindgen(method, getter, js_name = onMessage)]
    pub fn on_message(this: &ChromePort) -> ChromeEvent;

    #[wasm_bindgen(method, getter, js_name = onDisconnect)]
    pub fn on_disconnect(this: &ChromePort) -> ChromeEvent;

    /// `chrome.events.Event`
    #[derive(Debug, Clone)]
    pub type ChromeEvent;

    #[wasm_bindgen(method, js_name = addListener)]
    pub fn add_listener(this: &ChromeEvent, callback: &js_sys::Function);

    #[wasm_bindgen(method, js_name = removeListener)]
    pub fn remove_listener(this: &ChromeEvent, callback: &js_sys::Function);

    /// `chrome.runtime`
    #[derive(Debug, Clone)]
    pub type ChromeRuntime;

    #[wasm_bindgen(method, catch)]
    pub fn connect(this: &ChromeRuntime, extension_id: &str) -> Result<ChromePort, JsValue>;

    #[wasm_bindgen(method, getter, js_name = onConnectExternal)]
    pub fn on_connect_external(this: &ChromeRuntime) -> ChromeEvent;
}

/// `globalThis.chrome.runtime` を取得する
///
/// 拡張機能のコンテキスト外（通常の Web ページなど）では `Err`。
pub fn runtime() -> Result<ChromeRuntime, JsValue> {
    let chrome = js_sys::Reflect::get(&js_sys::global(), &JsValue::from_str("chrome"))?;
    if chrome.is_undefined() || chrome.is_null() {
        return Err(JsValue::from_str("chrome is not available in this context"));
    }
    let runtime = js_sys::Reflect::get(&chrome, &JsValue::from_str("runtime"))?;
    if runtime.is_undefined() || runtime.is_null() {
        return Err(JsValue::from_str("chrome.runtime is not available in this context"));
    }
    Ok(runtime.unchecked_into())
}

/// JS の例外値を表示用の文字列にする
pub fn describe(value: &JsValue) -> String {
    if let Some(s) = value.as_string() {
        return s;
    }
    if let Some(err) = value.dyn_ref::<js_sys::Error>() {
        return String::from(err.message());
    }
    format!("{:?}", value)
}
