//! # portstream-stream
//!
//! バッファ付きストリームの状態機械レイヤー
//!
//! 接続状態（CLOSED / CONNECTING / CONNECTED / CLOSING）と送受信バッファを管理する。
//! ポートへの実際の送信は行わず、「いま送るべきアイテム」を呼び出し側に返す。
//!
//! ## 送信の流れ
//!
//! ```text
//! 未接続:
//!   1. 上位レイヤー → stream.write(item) → WriteAction::Buffered
//!
//! CONNECTED に入った直後:
//!   2. stream.enter_connected()
//!   3. while let Some(item) = stream.next_flush() { port.post_message(item) }
//!
//! 接続中:
//!   4. 上位レイヤー → stream.write(item) → WriteAction::Send(item) → port.post_message
//! ```

#![no_std]
extern crate alloc;

pub mod buffer;
pub mod config;
pub mod error;
pub mod state;

pub use buffer::{AckFn, BufferedStream, StreamStats, WriteAction, WriteItem};
pub use config::StreamConfig;
pub use error::StreamError;
pub use state::ConnectionState;
