//! `chrome.runtime.Port` を `Port` トレイトに適合させる
//!
//! メッセージは JS 値と `serde_json::Value` の間を `JSON.stringify` / `JSON.parse` で変換する。
//! Chrome のポートも内部では JSON シリアライズでメッセージを運ぶため、表現できる値の範囲は同じ。

use std::cell::Cell;
use std::rc::Rc;

use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use portstream_transport::{Event, Listener, ListenerId, Port, PortRef, TransportError};

use crate::chrome::{self, ChromePort};

/// `chrome.runtime.Port` のラッパー
///
/// JS 側のリスナー（Closure）はこの構造体が所有し、Drop で登録解除する。
pub struct JsPort {
    port: ChromePort,
    name: String,
    connected: Rc<Cell<bool>>,
    on_message: Rc<Event<Value>>,
    on_disconnect: Rc<Event<()>>,
    message_closure: Closure<dyn FnMut(JsValue)>,
    disconnect_closure: Closure<dyn FnMut(JsValue)>,
}

impl JsPort {
    /// 接続済みの `chrome.runtime.Port` を包む
    pub fn new(port: ChromePort) -> Rc<JsPort> {
        let name = port.name();
        let connected = Rc::new(Cell::new(true));
        let on_message: Rc<Event<Value>> = Rc::new(Event::new());
        let on_disconnect: Rc<Event<()>> = Rc::new(Event::new());

        let message_closure = {
            let on_message = Rc::clone(&on_message);
            let name = name.clone();
            Closure::<dyn FnMut(JsValue)>::new(move |message: JsValue| {
                match js_to_value(&message) {
                    Ok(value) => {
                        on_message.fire(&value);
                    }
                    Err(e) => tracing::warn!(port = %name, error = %e, "dropping message"),
                }
            })
        };
        let disconnect_closure = {
            let connected = Rc::clone(&connected);
            let on_disconnect = Rc::clone(&on_disconnect);
            Closure::<dyn FnMut(JsValue)>::new(move |_port: JsValue| {
                if connected.replace(false) {
                    on_disconnect.fire(&());
                }
            })
        };

        port.on_message()
            .add_listener(message_closure.as_ref().unchecked_ref());
        port.on_disconnect()
            .add_listener(disconnect_closure.as_ref().unchecked_ref());

        Rc::new(JsPort {
            port,
            name,
            connected,
            on_message,
            on_disconnect,
            message_closure,
            disconnect_closure,
        })
    }

    /// `PortRef` として包む
    pub fn new_ref(port: ChromePort) -> PortRef {
        JsPort::new(port)
    }
}

impl Port for JsPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn post_message(&self, message: Value) -> Result<(), TransportError> {
        if !self.connected.get() {
            return Err(TransportError::Disconnected);
        }
        let js = value_to_js(&message)?;
        self.port
            .post_message(&js)
            .map_err(|e| TransportError::Rejected(chrome::describe(&e)))
    }

    fn disconnect(&self) {
        if self.connected.replace(false) {
            self.port.disconnect();
        }
    }

    fn add_message_listener(&self, listener: Listener<Value>) -> ListenerId {
        self.on_message.add_boxed(listener)
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.on_message.remove_listener(id)
    }

    fn add_disconnect_listener(&self, listener: Listener<()>) -> ListenerId {
        self.on_disconnect.add_boxed(listener)
    }

    fn remove_disconnect_listener(&self, id: ListenerId) -> bool {
        self.on_disconnect.remove_listener(id)
    }
}

impl Drop for JsPort {
    fn drop(&mut self) {
        self.port
            .on_message()
            .remove_listener(self.message_closure.as_ref().unchecked_ref());
        self.port
            .on_disconnect()
            .remove_listener(self.disconnect_closure.as_ref().unchecked_ref());
    }
}

impl std::fmt::Debug for JsPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsPort")
            .field("name", &self.name)
            .field("connected", &self.connected.get())
            .finish()
    }
}

/// `serde_json::Value` → JS 値
pub fn value_to_js(value: &Value) -> Result<JsValue, TransportError> {
    let text = serde_json::to_string(value)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    js_sys::JSON::parse(&text).map_err(|e| TransportError::Serialization(chrome::describe(&e)))
}

/// JS 値 → `serde_json::Value`
///
/// `undefined` や関数など JSON で表せない値は `Serialization` エラー。
pub fn js_to_value(value: &JsValue) -> Result<Value, TransportError> {
    let text = js_sys::JSON::stringify(value)
        .map_err(|e| TransportError::Serialization(chrome::describe(&e)))?
        .as_string()
        .ok_or_else(|| TransportError::Serialization("value has no JSON representation".into()))?;
    serde_json::from_str(&text).map_err(|e| TransportError::Serialization(e.to_string()))
}
