//! # portstream-transport
//!
//! メッセージパッシング型トランスポート（ポート）の抽象化レイヤー。
//!
//! ストリーム層が依存するのは次の能力だけ：
//!
//! ```text
//! Port:
//!   post_message(value)            相手側へ 1 メッセージ送る
//!   disconnect()                   切断を要求する
//!   message リスナー               メッセージ受信通知
//!   disconnect リスナー            切断通知（ペイロードなし）
//!
//! ConnectSource:
//!   connect リスナー(channel)      既知のチャンネル名への着信通知
//! ```
//!
//! 具体実装として、ブラウザのタスクキューを模した `EventLoop` 上で動く
//! インメモリのポートペア `LocalPort` と接続ハブ `PortHub` を提供する。
//! ブラウザ拡張の `chrome.runtime.Port` へのバインディングは `portstream-wasm` にある。

#![no_std]
extern crate alloc;

pub mod error;
pub mod event;
pub mod event_loop;
pub mod hub;
pub mod local;
pub mod port;

pub use error::TransportError;
pub use event::{Event, Listener, ListenerId};
pub use event_loop::EventLoop;
pub use hub::PortHub;
pub use local::LocalPort;
pub use port::{ConnectSource, Port, PortRef};
