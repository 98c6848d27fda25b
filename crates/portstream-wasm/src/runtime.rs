//! `chrome.runtime` を `ConnectSource` として使う
//!
//! `onConnectExternal` は拡張機能ごとに 1 つしかないため、チャンネル名は
//! 着信の振り分けには使わずログにだけ残す。JS 側のリスナーは最初の Rust リスナーが
//! 登録された時点で登録し、`JsRuntime` の Drop まで保持する。
//! Rust 側にリスナーがいない間の着信は、ポートを切断して拒否する。

use std::cell::RefCell;
use std::rc::Rc;

use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use portstream_transport::{
    ConnectSource, Event, Listener, ListenerId, Port, PortRef, TransportError,
};

use crate::chrome::{self, ChromePort, ChromeRuntime};
use crate::port::JsPort;

/// `chrome.runtime` の接続機能
pub struct JsRuntime {
    runtime: ChromeRuntime,
    on_connect: Rc<Event<PortRef>>,
    closure: RefCell<Option<Closure<dyn FnMut(JsValue)>>>,
}

impl JsRuntime {
    /// 現在のコンテキストの `chrome.runtime` を使う
    pub fn new() -> Result<Rc<JsRuntime>, JsValue> {
        Ok(Rc::new(JsRuntime {
            runtime: chrome::runtime()?,
            on_connect: Rc::new(Event::new()),
            closure: RefCell::new(None),
        }))
    }

    /// `chrome.runtime.connect(extension_id)` で別の拡張機能に接続する
    pub fn connect(&self, extension_id: &str) -> Result<PortRef, TransportError> {
        let port = self
            .runtime
            .connect(extension_id)
            .map_err(|e| TransportError::Rejected(chrome::describe(&e)))?;
        tracing::debug!(extension_id, "chrome.runtime.connect");
        Ok(JsPort::new_ref(port))
    }

    fn attach(&self) {
        if self.closure.borrow().is_some() {
            return;
        }
        let on_connect = Rc::clone(&self.on_connect);
        let closure = Closure::<dyn FnMut(JsValue)>::new(move |port: JsValue| {
            let port = JsPort::new_ref(port.unchecked_into::<ChromePort>());
            if !on_connect.has_listeners() {
                tracing::warn!(port = port.name(), "connection refused: nobody is listening");
                port.disconnect();
                return;
            }
            tracing::debug!(port = port.name(), "incoming external connection");
            on_connect.fire(&port);
        });
        self.runtime
            .on_connect_external()
            .add_listener(closure.as_ref().unchecked_ref());
        *self.closure.borrow_mut() = Some(closure);
    }

    fn detach(&self) {
        if let Some(closure) = self.closure.borrow_mut().take() {
            self.runtime
                .on_connect_external()
                .remove_listener(closure.as_ref().unchecked_ref());
        }
    }
}

impl ConnectSource for JsRuntime {
    fn add_connect_listener(&self, channel: &str, listener: Listener<PortRef>) -> ListenerId {
        let id = self.on_connect.add_boxed(listener);
        self.attach();
        tracing::debug!(channel, listener = id, "listening on chrome.runtime.onConnectExternal");
        id
    }

    fn remove_connect_listener(&self, channel: &str, id: ListenerId) -> bool {
        let removed = self.on_connect.remove_listener(id);
        if removed {
            tracing::debug!(channel, listener = id, "stopped listening on onConnectExternal");
        }
        removed
    }
}

impl Drop for JsRuntime {
    fn drop(&mut self) {
        self.detach();
    }
}
