//! open() が返すハンドシェイク完了 Future

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use futures_channel::oneshot;
use portstream_stream::StreamError;

pub(crate) type Completer = oneshot::Sender<Result<(), StreamError>>;

/// ハンドシェイクの完了を待つ Future
///
/// - 受け入れ側（`accept`）では生成時点で完了している
/// - 接続側（`connect`）ではセンチネル受信で `Ok(())`、
///   それより先に切断されると `Err(StreamError::ConnectionFailed)` になる
///
/// タイムアウトは持たない。必要なら呼び出し側で包むこと。
#[must_use = "the handshake result is only observable by polling this future"]
pub struct Handshake {
    inner: Inner,
}

enum Inner {
    Ready(Option<Result<(), StreamError>>),
    Pending(oneshot::Receiver<Result<(), StreamError>>),
}

impl Handshake {
    pub(crate) fn ready(result: Result<(), StreamError>) -> Self {
        Handshake {
            inner: Inner::Ready(Some(result)),
        }
    }

    pub(crate) fn pending() -> (Completer, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Handshake {
                inner: Inner::Pending(rx),
            },
        )
    }
}

impl Future for Handshake {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or(Err(StreamError::ConnectionFailed("handshake already consumed"))),
            ),
            Inner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // 完了前にストリームが破棄された
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(
                    StreamError::ConnectionFailed("stream dropped before the handshake completed"),
                )),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl core::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.inner {
            Inner::Ready(_) => "ready",
            Inner::Pending(_) => "pending",
        };
        f.debug_tuple("Handshake").field(&kind).finish()
    }
}
