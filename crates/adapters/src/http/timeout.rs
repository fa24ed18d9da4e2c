use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Sleep, sleep};

use infrastructure::config::ServerTimeouts;

/// Connection stream with read, write, and idle deadlines.
///
/// - A read or write poll that makes no progress within its bound fails the
///   connection with `TimedOut`.
/// - The idle bound fires when no bytes move in either direction; any
///   progress rearms it.
///
/// A zero duration disables the corresponding bound, matching the option
/// defaults.
pub struct TimeoutStream<S> {
    inner: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    idle_deadline: Option<Pin<Box<Sleep>>>,
}

fn bound(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeouts: ServerTimeouts) -> Self {
        Self {
            inner,
            read_timeout: bound(timeouts.read),
            write_timeout: bound(timeouts.write),
            idle_timeout: bound(timeouts.idle),
            read_deadline: None,
            write_deadline: None,
            idle_deadline: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

/// Poll a lazily armed deadline; `Ready` means the bound elapsed.
fn deadline_elapsed(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(sleep(timeout)));
    sleep.as_mut().poll(cx).is_ready()
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                this.idle_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if deadline_elapsed(&mut this.read_deadline, this.read_timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection read timeout",
                    )));
                }
                if deadline_elapsed(&mut this.idle_deadline, this.idle_timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection idle timeout",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                this.idle_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if deadline_elapsed(&mut this.write_deadline, this.write_timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection write timeout",
                    )));
                }
                if deadline_elapsed(&mut this.idle_deadline, this.idle_timeout, cx) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection idle timeout",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
