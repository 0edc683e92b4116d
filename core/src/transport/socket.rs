//! A single, long-lived channel socket.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::codec::{read_object, write_object};
use crate::error::TransportError;

/// How often the accepting side polls for an incoming connection or an abort
/// while waiting in `connect()`.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One long-lived stream socket bound to a single endpoint file.
///
/// The `listen` flag passed at construction decides which side of the
/// connection this is: the listening side binds the endpoint and accepts one
/// connection when `connect()` gets called, the other side connects to it.
/// Exactly one side of every channel listens.
///
/// Sends are not internally synchronized. The caller is responsible for
/// keeping a single writer per socket; concurrent writers would interleave
/// frames. [`AdHocSocketHandler`](super::adhoc::AdHocSocketHandler) exists for
/// the channels where that guarantee cannot be upheld.
pub struct SocketHandler {
    endpoint: PathBuf,
    listener: Option<UnixListener>,
    socket: OnceLock<UnixStream>,
    closed: AtomicBool,
}

impl SocketHandler {
    /// Set up the socket. On the listening side this binds the endpoint (and
    /// creates the base directory if needed), but no connection is active
    /// until `connect()` gets called.
    pub fn new(endpoint: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();

        let listener = if listen {
            if let Some(parent) = endpoint.parent() {
                fs::create_dir_all(parent)?;
            }

            let listener = UnixListener::bind(&endpoint)?;
            // Accepts are polled so `close()` can interrupt a pending
            // `connect()` when the worker process dies before connecting
            listener.set_nonblocking(true)?;

            Some(listener)
        } else {
            None
        };

        Ok(Self { endpoint, listener, socket: OnceLock::new(), closed: AtomicBool::new(false) })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Establish the connection: accept on the listening side, connect on the
    /// other. Blocks until the peer shows up or `close()` gets called.
    pub fn connect(&self) -> Result<(), TransportError> {
        let stream = match &self.listener {
            Some(listener) => loop {
                if self.closed.load(Ordering::Relaxed) {
                    return Err(TransportError::ConnectionClosed);
                }

                match listener.accept() {
                    Ok((stream, _)) => break stream,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) => return Err(e.into()),
                }
            },
            None => UnixStream::connect(&self.endpoint)?,
        };

        stream.set_nonblocking(false)?;
        let _ = self.socket.set(stream);

        Ok(())
    }

    fn stream(&self) -> Result<&UnixStream, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket.get().ok_or(TransportError::ConnectionClosed)
    }

    /// Serialize `object` into `scratch` and send it as one frame.
    pub fn send<T: Serialize>(
        &self,
        object: &T,
        scratch: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut stream = self.stream()?;
        write_object(&mut stream, object, scratch)
    }

    /// Block until a frame arrives and deserialize it.
    pub fn receive_single<T: DeserializeOwned>(
        &self,
        scratch: &mut Vec<u8>,
    ) -> Result<T, TransportError> {
        let mut stream = self.stream()?;
        read_object(&mut stream, scratch)
    }

    /// Receive objects in a blocking loop until the socket gets closed. The
    /// callback is handed the received object together with the scratch
    /// buffer so it can reply with `send()` without allocating.
    pub fn receive_multi<T, F>(&self, mut callback: F)
    where
        T: DeserializeOwned,
        F: FnMut(T, &mut Vec<u8>) -> Result<(), TransportError>,
    {
        let mut scratch = Vec::new();

        loop {
            let object = match self.receive_single::<T>(&mut scratch) {
                Ok(object) => object,
                // The sockets got closed because the bridge is shutting down
                Err(TransportError::ConnectionClosed) => break,
                Err(e) => {
                    log::error!("Receive loop on '{}' failed: {}", self.endpoint.display(), e);
                    break;
                }
            };

            if let Err(e) = callback(object, &mut scratch) {
                if !matches!(e, TransportError::ConnectionClosed) {
                    log::error!("Message handler on '{}' failed: {}", self.endpoint.display(), e);
                }
                break;
            }
        }
    }

    /// Shut the socket down, failing any blocked reader or writer with a
    /// connection-closed error. Safe to call more than once and from any
    /// thread.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(stream) = self.socket.get() {
            // The shutdown can fail when the socket is already closed
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn endpoint_pair(dir: &tempfile::TempDir, name: &str) -> (Arc<SocketHandler>, SocketHandler) {
        let path = dir.path().join(name);
        let listening = Arc::new(SocketHandler::new(&path, true).unwrap());
        let connecting = SocketHandler::new(&path, false).unwrap();
        (listening, connecting)
    }

    #[test]
    fn send_and_receive() {
        let dir = tempfile::tempdir().unwrap();
        let (listening, connecting) = endpoint_pair(&dir, "control.sock");

        let accepted = {
            let listening = Arc::clone(&listening);
            std::thread::spawn(move || listening.connect())
        };
        connecting.connect().unwrap();
        accepted.join().unwrap().unwrap();

        let mut scratch = Vec::new();
        connecting.send(&String::from("hello"), &mut scratch).unwrap();

        let received: String = listening.receive_single(&mut scratch).unwrap();
        assert_eq!(received, "hello");
    }

    #[test]
    fn close_unblocks_receive() {
        let dir = tempfile::tempdir().unwrap();
        let (listening, connecting) = endpoint_pair(&dir, "control.sock");

        let listening_clone = Arc::clone(&listening);
        let accepted = std::thread::spawn(move || listening_clone.connect());
        connecting.connect().unwrap();
        accepted.join().unwrap().unwrap();

        let listening_clone = Arc::clone(&listening);
        let receiver = std::thread::spawn(move || {
            let mut scratch = Vec::new();
            listening_clone.receive_single::<String>(&mut scratch)
        });

        std::thread::sleep(Duration::from_millis(20));
        listening.close();

        assert!(matches!(receiver.join().unwrap(), Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SocketHandler::new(dir.path().join("control.sock"), true).unwrap();

        handler.close();
        handler.close();
    }

    #[test]
    fn close_aborts_pending_accept() {
        let dir = tempfile::tempdir().unwrap();
        let listening = Arc::new(SocketHandler::new(dir.path().join("control.sock"), true).unwrap());

        let listening_clone = Arc::clone(&listening);
        let accepting = std::thread::spawn(move || listening_clone.connect());

        std::thread::sleep(Duration::from_millis(20));
        listening.close();

        assert!(matches!(accepting.join().unwrap(), Err(TransportError::ConnectionClosed)));
    }
}
