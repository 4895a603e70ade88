//! TCP stream over an [`IoChannel`]
//!
//! The stream keeps its descriptor in an ownership slot shared with the
//! channel's cleanup handler. Cleanup closes whatever the slot still holds;
//! `pipe()` empties the slot first, so the old channel can be torn down
//! while a new stream keeps using the same connection.

use crate::channel::IoChannel;
use crate::sys;

use gvdispatch_core::constants::MAX_IO_CHUNK;
use gvdispatch_core::{kdebug, oneshot, ChannelKind, CleanupOutcome, Completion, IoError, IoOutcome};
use gvdispatch_runtime::{default_queue, Queue};

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};

type FdSlot = Arc<Mutex<Option<OwnedFd>>>;

/// Connected byte stream with exactly-once `receive` and `send`
pub struct TcpStream {
    channel: IoChannel,
    slot: FdSlot,
    /// Where completions run
    queue: Queue,
}

fn take_fd(slot: &FdSlot) -> Option<OwnedFd> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl TcpStream {
    /// Take ownership of a connected socket; completions run on the default
    /// global queue
    pub fn new(fd: OwnedFd) -> TcpStream {
        TcpStream::with_queue(fd, default_queue())
    }

    pub fn with_queue(fd: OwnedFd, queue: Queue) -> TcpStream {
        let raw = fd.as_raw_fd();
        let slot: FdSlot = Arc::new(Mutex::new(Some(fd)));
        let cleanup_slot = Arc::clone(&slot);
        let channel = IoChannel::new(ChannelKind::Stream, raw, queue.clone(), move |outcome| {
            if let CleanupOutcome::Failure(e) = outcome {
                kdebug!("fd {} torn down: {}", raw, e);
            }
            drop(take_fd(&cleanup_slot));
        });
        channel.set_low_water(1);
        TcpStream {
            channel,
            slot,
            queue,
        }
    }

    /// Connect to `addr` (blocking)
    pub fn connect(addr: SocketAddr) -> Result<TcpStream, IoError> {
        let stream = std::net::TcpStream::connect(addr)?;
        let fd = OwnedFd::from(stream);
        sys::set_nodelay(fd.as_raw_fd())?;
        Ok(TcpStream::new(fd))
    }

    /// Deliver the next bytes to `completion`, exactly once.
    ///
    /// Empty data means the peer closed its side; closing this stream while
    /// the receive is outstanding yields `Err(IoError::Canceled)`.
    pub fn receive<F>(&self, completion: F)
    where
        F: FnOnce(Result<Vec<u8>, IoError>) + Send + 'static,
    {
        let mut completion = Some(completion);
        self.channel.read_chunk(MAX_IO_CHUNK, &self.queue, move |outcome: IoOutcome| {
            if !outcome.is_terminal() {
                return;
            }
            if let Some(completion) = completion.take() {
                completion(outcome.into_result().map(|(_, data)| data));
            }
        });
    }

    /// Write all of `data`, then call `completion` exactly once
    pub fn send<F>(&self, data: impl Into<Vec<u8>>, completion: F)
    where
        F: FnOnce(Result<(), IoError>) + Send + 'static,
    {
        let mut completion = Some(completion);
        self.channel.write(0, &self.queue, data.into(), move |outcome: IoOutcome| {
            if !outcome.is_terminal() {
                return;
            }
            if let Some(completion) = completion.take() {
                completion(outcome.into_result().map(drop));
            }
        });
    }

    /// [`receive`](Self::receive) as a completion that can be awaited or
    /// waited on
    pub fn receive_future(&self) -> Completion<Result<Vec<u8>, IoError>> {
        let (promise, completion) = oneshot();
        self.receive(move |result| promise.complete(result));
        completion
    }

    pub fn send_future(&self, data: impl Into<Vec<u8>>) -> Completion<Result<(), IoError>> {
        let (promise, completion) = oneshot();
        self.send(data, move |result| promise.complete(result));
        completion
    }

    /// Close the channel; the descriptor is closed once outstanding
    /// operations have been canceled
    pub fn close(&self) {
        self.channel.close();
    }

    /// Move the connection into a new stream.
    ///
    /// This stream's channel is closed without closing the descriptor.
    /// Fails with `IoError::Closed` if the descriptor was already released
    /// by an earlier close.
    pub fn pipe(self) -> Result<TcpStream, IoError> {
        let fd = take_fd(&self.slot);
        self.channel.close();
        match fd {
            Some(fd) => Ok(TcpStream::with_queue(fd, self.queue.clone())),
            None => Err(IoError::Closed),
        }
    }

    /// The underlying channel, for watermark tuning
    pub fn channel(&self) -> &IoChannel {
        &self.channel
    }

    /// Queue completions run on, for operations submitted later
    pub fn set_queue(&mut self, queue: Queue) {
        self.queue = queue;
    }

    pub fn file_descriptor(&self) -> RawFd {
        self.channel.file_descriptor()
    }
}

impl FromRawFd for TcpStream {
    /// # Safety
    ///
    /// `fd` must be an open, connected stream socket that nothing else owns.
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream::new(OwnedFd::from_raw_fd(fd))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.channel.close();
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("channel", &self.channel)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::TcpListener;
    use gvdispatch_runtime::QueueKind;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn stream_pair() -> (TcpStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (TcpStream::new(OwnedFd::from(a)), b)
    }

    fn wait<T>(c: Completion<T>) -> T {
        c.wait_timeout(WAIT).ok().flatten().expect("completion not delivered")
    }

    #[test]
    fn test_receive_and_send() {
        let (stream, mut peer) = stream_pair();
        peer.write_all(b"ping").unwrap();
        assert_eq!(wait(stream.receive_future()), Ok(b"ping".to_vec()));

        assert_eq!(wait(stream.send_future("pong")), Ok(()));
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_receive_eof_is_empty() {
        let (stream, peer) = stream_pair();
        drop(peer);
        assert_eq!(wait(stream.receive_future()), Ok(Vec::new()));
    }

    #[test]
    fn test_receive_canceled_by_close() {
        let (stream, _peer) = stream_pair();
        let pending = stream.receive_future();
        stream.close();
        assert_eq!(wait(pending), Err(IoError::Canceled));
    }

    #[test]
    fn test_send_high_water_completes_once() {
        let (stream, mut peer) = stream_pair();
        stream.channel().set_high_water(16);

        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot();
        let counter = Arc::clone(&calls);
        stream.send(payload.clone(), move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.complete(result);
        });

        let mut received = vec![0u8; payload.len()];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(received, payload);
        assert_eq!(wait(rx), Ok(()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pipe_keeps_connection_open() {
        let (stream, mut peer) = stream_pair();
        let piped = stream.pipe().unwrap();

        // Let the old channel's cleanup run
        std::thread::sleep(Duration::from_millis(50));

        peer.write_all(b"still here").unwrap();
        assert_eq!(wait(piped.receive_future()), Ok(b"still here".to_vec()));
        assert_eq!(wait(piped.send_future("yes")), Ok(()));
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"yes");
    }

    #[test]
    fn test_pipe_after_close_fails() {
        let (stream, _peer) = stream_pair();
        stream.close();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stream.pipe().err(), Some(IoError::Closed));
    }

    #[test]
    fn test_drop_closes_descriptor() {
        let (stream, mut peer) = stream_pair();
        drop(stream);
        peer.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_completions_on_custom_queue() {
        let (mut stream, mut peer) = stream_pair();
        let queue = Queue::new("test.stream-queue", QueueKind::Serial);
        stream.set_queue(queue.clone());

        let (tx, rx) = oneshot();
        stream.receive(move |result| tx.complete(result));
        peer.write_all(b"q").unwrap();
        assert_eq!(wait(rx), Ok(b"q".to_vec()));
        assert_eq!(queue.sync(|| 1), 1);
    }

    #[test]
    fn test_tcp_connect_and_accept() {
        let listener = TcpListener::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let port = listener.local_port().unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let client = TcpStream::connect(addr).unwrap();
        let server = TcpStream::new(listener.accept().unwrap());

        assert_eq!(wait(client.send_future("hello over tcp")), Ok(()));
        let mut got = Vec::new();
        while got.len() < 14 {
            let chunk = wait(server.receive_future()).unwrap();
            assert!(!chunk.is_empty());
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"hello over tcp");
    }
}
