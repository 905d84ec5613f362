// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cancellable blocking byte stream over TCP.
//!
//! Inlet-side reads must be interruptible by an outer teardown call, so
//! this stream wraps a non-blocking socket in a private, pulsed poll: each
//! blocking operation retries the socket until it would block, then parks
//! in `Poll::poll` until the socket is ready again - or until a foreign
//! thread cancels.
//!
//! The cancellation protocol guards the "poll is running" interval with a
//! mutex. `cancel()` either grabs the mutex and closes the socket
//! directly, or - when an operation is mid-flight - wakes the poll, waits
//! for the mutex, and re-checks that the socket really closed (the wake
//! may race the operation finishing on its own). Once cancelled the
//! stream is permanently unusable.

use std::io::{self, BufRead, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::config::{STREAM_BUFFER_BYTES, STREAM_PUTBACK_BYTES};

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

fn cancelled_err() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream cancelled")
}

// ============================================================================
// Shared core
// ============================================================================

struct Core {
    poll: Poll,
    stream: Option<mio::net::TcpStream>,
}

impl Core {
    /// Park until the socket or the waker fires.
    fn wait_event(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(4);
        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

struct StreamInner {
    core: Mutex<Core>,
    cancelled: AtomicBool,
    waker: Waker,
}

impl StreamInner {
    /// Cancel from any thread, racing a possibly running operation.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.core.try_lock() {
            Some(mut core) => {
                // no operation running: close right here
                core.close();
            }
            None => {
                // an operation holds the loop: wake it, wait for it to
                // drain, then double-check the close actually happened
                let _ = self.waker.wake();
                let mut core = self.core.lock();
                if core.stream.is_some() {
                    core.close();
                }
            }
        }
    }

    fn check_cancelled(&self) -> io::Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(cancelled_err())
        } else {
            Ok(())
        }
    }

    /// Blocking receive into `buf`; 0 means EOF.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut core = self.core.lock();
        loop {
            self.check_cancelled()?;
            let result = match core.stream.as_mut() {
                Some(stream) => stream.read(buf),
                None => return Err(cancelled_err()),
            };
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => core.wait_event()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocking send of the whole buffer.
    fn send_all(&self, mut data: &[u8]) -> io::Result<()> {
        let mut core = self.core.lock();
        while !data.is_empty() {
            self.check_cancelled()?;
            let result = match core.stream.as_mut() {
                Some(stream) => stream.write(data),
                None => return Err(cancelled_err()),
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => core.wait_event()?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Block until the in-flight connect resolved either way.
    fn await_connected(&self) -> io::Result<()> {
        let mut core = self.core.lock();
        loop {
            self.check_cancelled()?;
            let stream = match core.stream.as_ref() {
                Some(stream) => stream,
                None => return Err(cancelled_err()),
            };
            if let Some(e) = stream.take_error()? {
                return Err(e);
            }
            match stream.peer_addr() {
                Ok(_) => return Ok(()),
                Err(e)
                    if e.kind() == io::ErrorKind::NotConnected
                        || e.raw_os_error() == Some(libc_einprogress()) =>
                {
                    core.wait_event()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// EINPROGRESS without pulling in libc: the value is ABI-stable per-OS.
const fn libc_einprogress() -> i32 {
    if cfg!(target_os = "linux") {
        115
    } else {
        36 // BSD family / macOS
    }
}

// ============================================================================
// Cancel token
// ============================================================================

/// Clonable handle that can abort the stream's blocking operations from
/// any thread at any time.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<StreamInner>,
}

impl CancelToken {
    /// Destructively cancel the stream. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

// ============================================================================
// The stream
// ============================================================================

/// A synchronous, buffered TCP byte stream whose blocking reads and
/// writes can be aborted by [`CancelToken::cancel`] from another thread.
pub struct CancellableByteStream {
    inner: Arc<StreamInner>,
    /// Buffered inbound data; `get_start` is the consumer position. The
    /// first few bytes of a refilled buffer repeat already-consumed data
    /// so small putbacks never hit the socket.
    get_buf: Vec<u8>,
    get_start: usize,
    put_buf: Vec<u8>,
}

impl CancellableByteStream {
    /// Establish a connection to the endpoint.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let mut stream = mio::net::TcpStream::connect(addr)?;
        poll.registry().register(
            &mut stream,
            STREAM_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let inner = Arc::new(StreamInner {
            core: Mutex::new(Core {
                poll,
                stream: Some(stream),
            }),
            cancelled: AtomicBool::new(false),
            waker,
        });
        inner.await_connected()?;
        Ok(Self {
            inner,
            get_buf: Vec::with_capacity(STREAM_BUFFER_BYTES),
            get_start: 0,
            put_buf: Vec::with_capacity(STREAM_BUFFER_BYTES),
        })
    }

    /// Token for cancelling this stream from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Undo the consumption of the last `count` buffered bytes. Returns
    /// false when more than the putback reserve is requested.
    pub fn putback(&mut self, count: usize) -> bool {
        if count <= self.get_start {
            self.get_start -= count;
            true
        } else {
            false
        }
    }

    /// Refill the get buffer, preserving the putback reserve. Returns the
    /// number of fresh bytes (0 = EOF).
    fn fill_get_buf(&mut self) -> io::Result<usize> {
        let keep = self.get_buf.len().min(STREAM_PUTBACK_BYTES);
        let tail_from = self.get_buf.len() - keep;
        self.get_buf.copy_within(tail_from.., 0);
        self.get_buf.truncate(keep);

        let data_start = keep;
        self.get_buf.resize(STREAM_BUFFER_BYTES, 0);
        let n = self.inner.recv(&mut self.get_buf[data_start..])?;
        self.get_buf.truncate(data_start + n);
        self.get_start = data_start;
        Ok(n)
    }

    fn flush_put(&mut self) -> io::Result<()> {
        if self.put_buf.is_empty() {
            return Ok(());
        }
        let result = self.inner.send_all(&self.put_buf);
        self.put_buf.clear();
        result
    }
}

impl Read for CancellableByteStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.get_start >= self.get_buf.len() {
            if self.fill_get_buf()? == 0 {
                return Ok(0);
            }
        }
        let available = &self.get_buf[self.get_start..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.get_start += n;
        Ok(n)
    }
}

impl BufRead for CancellableByteStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.get_start >= self.get_buf.len() {
            self.fill_get_buf()?;
        }
        Ok(&self.get_buf[self.get_start..])
    }

    fn consume(&mut self, amt: usize) {
        self.get_start = (self.get_start + amt).min(self.get_buf.len());
    }
}

impl Write for CancellableByteStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.check_cancelled()?;
        self.put_buf.extend_from_slice(data);
        if self.put_buf.len() >= STREAM_BUFFER_BYTES {
            self.flush_put()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_put()
    }
}

impl Drop for CancellableByteStream {
    fn drop(&mut self) {
        if !self.is_cancelled() {
            let _ = self.flush_put();
        }
        self.inner.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_connect_write_read_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let mut stream = CancellableByteStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        stream.flush().unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");
        echo.join().unwrap();
    }

    #[test]
    fn test_read_line_via_bufread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"status: ok\r\nrest").unwrap();
        });

        let mut stream = CancellableByteStream::connect(addr).unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).unwrap();
        assert_eq!(line, "status: ok\r\n");
        writer.join().unwrap();
    }

    #[test]
    fn test_putback_within_reserve() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"abcdef").unwrap();
        });

        let mut stream = CancellableByteStream::connect(addr).unwrap();
        let mut got = [0u8; 4];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abcd");
        assert!(stream.putback(2));
        let mut again = [0u8; 2];
        stream.read_exact(&mut again).unwrap();
        assert_eq!(&again, b"cd");
        writer.join().unwrap();
    }

    #[test]
    fn test_cancel_from_other_thread_interrupts_blocking_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // accept but never send: the read must block until cancelled
        let quiet = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(5));
            drop(sock);
        });

        let mut stream = CancellableByteStream::connect(addr).unwrap();
        let token = stream.cancel_token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        });

        let start = Instant::now();
        let mut buf = [0u8; 16];
        let result = stream.read(&mut buf);
        assert!(result.is_err(), "read must fail after cancel");
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "cancel must interrupt promptly"
        );
        canceller.join().unwrap();
        drop(quiet); // detached accept thread may still be sleeping
    }

    #[test]
    fn test_cancelled_stream_is_permanently_unusable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = thread::spawn(move || listener.accept());

        let mut stream = CancellableByteStream::connect(addr).unwrap();
        let _ = holder.join();
        stream.cancel_token().cancel();
        stream.cancel_token().cancel(); // idempotent

        assert!(stream.is_cancelled());
        assert!(stream.write(b"x").is_err());
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).is_err());
    }
}
