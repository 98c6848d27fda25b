//! # portstream-session
//!
//! ポート上のハンドシェイク付きストリームと、着信接続のアクセプター。
//!
//! ## レイヤー構成
//!
//! ```text
//! PortStream / Acceptor        ← このクレート
//!   ├ BufferedStream           ← portstream-stream（状態機械・送受信バッファ）
//!   ├ Frame                    ← portstream-proto（センチネル / データフレーム）
//!   └ Port / ConnectSource     ← portstream-transport
//! ```
//!
//! ## 使い方
//!
//! ```text
//! // 接続側
//! let stream = PortStream::new();
//! stream.write(json!({"op": "hello"}))?;      // 接続前でもバッファされる
//! let handshake = stream.connect(hub.connect("app"))?;
//! event_loop.run_until_idle();
//! handshake.await?;                           // センチネル受信で解決
//!
//! // 受け入れ側
//! let acceptor = Acceptor::new(source, "app", PortStream::new());
//! acceptor.start_listening(true)?;
//! ```

#![no_std]
extern crate alloc;

pub mod acceptor;
pub mod handshake;
pub mod stream;

pub use acceptor::Acceptor;
pub use handshake::Handshake;
pub use stream::PortStream;

pub use portstream_stream::{ConnectionState, StreamConfig, StreamError, StreamStats};
