//! A channel socket that can spawn additional short-lived sockets on demand.
//!
//! Most channels only ever carry requests from one thread at a time, but the
//! dispatch and callback surfaces can be driven concurrently from multiple
//! plugin or host threads, and those calls can even be mutually recursive with
//! calls going the other way. Serializing them behind a mutex would deadlock
//! the mutually recursive sequences, so contention is handled by opening a
//! fresh connection to the same endpoint instead:
//!
//! - A single long-lived primary socket works like every other channel. When
//!   the primary's write lock is free, requests go over it.
//! - When the write lock is taken, the sender opens a secondary socket to the
//!   same endpoint, performs one request/response cycle there, and drops it.
//! - The receiving side accepts secondary connections on a second thread and
//!   spawns a short-lived handler thread per connection.

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, TryLockError};
use std::time::Duration;

use crate::error::TransportError;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct AdHocSocketHandler {
    endpoint: PathBuf,
    /// Consumed by `connect()` on the listening side. `receive_multi()`
    /// re-binds the endpoint afterwards to pick up secondary connections, on
    /// whichever side runs the receive loop for this channel.
    listener: Mutex<Option<UnixListener>>,
    socket: OnceLock<UnixStream>,

    /// Locks the primary socket for one request/response cycle. When taken,
    /// concurrent senders fall back to a secondary socket.
    write_lock: Mutex<()>,

    /// Whether the peer has answered at least one request we sent. During the
    /// very first outbound call the other side may not have entered its
    /// accept loop yet, in which case a failed secondary connect falls back to
    /// blocking on the primary. That fallback is only sound before the initial
    /// connect completes; once this flag is set the error propagates instead.
    sent_first_event: AtomicBool,

    /// Set while `receive_multi()` is running so `close()` can wait for the
    /// loop to wind down before the handler gets dropped from another thread.
    currently_listening: AtomicBool,

    closed: AtomicBool,
}

impl AdHocSocketHandler {
    pub fn new(endpoint: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();

        let listener = if listen {
            if let Some(parent) = endpoint.parent() {
                fs::create_dir_all(parent)?;
            }

            let listener = UnixListener::bind(&endpoint)?;
            listener.set_nonblocking(true)?;

            Some(listener)
        } else {
            None
        };

        Ok(Self {
            endpoint,
            listener: Mutex::new(listener),
            socket: OnceLock::new(),
            write_lock: Mutex::new(()),
            sent_first_event: AtomicBool::new(false),
            currently_listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Accept the primary connection on the listening side, or connect to it
    /// on the other. The listening side's acceptor is released afterwards so
    /// `receive_multi()` can re-bind the endpoint, potentially on the other
    /// side of the connection.
    pub fn connect(&self) -> Result<(), TransportError> {
        let taken_listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();

        let stream = match taken_listener {
            Some(listener) => {
                let stream = loop {
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
                };

                // The endpoint file gets re-created by whichever side runs
                // `receive_multi()` for this channel
                drop(listener);
                let _ = fs::remove_file(&self.endpoint);

                stream
            }
            None => UnixStream::connect(&self.endpoint)?,
        };

        stream.set_nonblocking(false)?;
        let _ = self.socket.set(stream);

        Ok(())
    }

    fn primary(&self) -> Result<&UnixStream, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket.get().ok_or(TransportError::ConnectionClosed)
    }

    /// Perform one send/receive cycle. The callback gets a socket to do the
    /// actual IO on: the primary when its write lock is free, a freshly
    /// connected secondary otherwise.
    pub fn send<R>(
        &self,
        callback: impl FnOnce(&UnixStream) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        match self.write_lock.try_lock() {
            Ok(_guard) => {
                let result = callback(self.primary()?)?;
                self.sent_first_event.store(true, Ordering::SeqCst);

                Ok(result)
            }
            Err(TryLockError::Poisoned(_guard)) => Err(TransportError::ConnectionClosed),
            Err(TryLockError::WouldBlock) => match UnixStream::connect(&self.endpoint) {
                Ok(secondary) => callback(&secondary),
                Err(connect_error) => {
                    // Nobody is listening for secondary connections yet. This
                    // can happen when the peer performs a callback before the
                    // receive loop on this channel has started, so before the
                    // first answered request we block on the primary instead.
                    // Outside that window the channel is simply gone.
                    if !self.sent_first_event.load(Ordering::SeqCst) {
                        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
                        let result = callback(self.primary()?)?;
                        self.sent_first_event.store(true, Ordering::SeqCst);

                        Ok(result)
                    } else {
                        Err(connect_error.into())
                    }
                }
            },
        }
    }

    /// Run the blocking receive loop for this channel: re-bind the endpoint
    /// and accept secondary connections on a second thread (one short-lived
    /// handler thread per connection), while handling primary-socket requests
    /// on the calling thread until the socket gets closed.
    ///
    /// `primary` performs a single read/handle/write cycle and is called in a
    /// loop; `secondary` does the same for one incoming secondary connection.
    pub fn receive_multi<F, G>(&self, mut primary: F, secondary: G)
    where
        F: FnMut(&UnixStream) -> Result<(), TransportError>,
        G: Fn(&UnixStream) -> Result<(), TransportError> + Sync,
    {
        debug_assert!(!self.currently_listening.load(Ordering::SeqCst));
        self.currently_listening.store(true, Ordering::SeqCst);

        // The primary acceptor was already released in `connect()`, so the
        // endpoint can be re-bound here regardless of which side originally
        // listened on it
        let _ = fs::remove_file(&self.endpoint);
        let acceptor = match UnixListener::bind(&self.endpoint) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                log::error!(
                    "Could not listen for secondary connections on '{}': {}",
                    self.endpoint.display(),
                    e
                );
                self.currently_listening.store(false, Ordering::SeqCst);
                return;
            }
        };
        if let Err(e) = acceptor.set_nonblocking(true) {
            log::error!("Could not configure the secondary acceptor: {}", e);
            self.currently_listening.store(false, Ordering::SeqCst);
            return;
        }

        let primary_done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let secondary = &secondary;
            let primary_done = &primary_done;

            scope.spawn(move || {
                loop {
                    if primary_done.load(Ordering::Relaxed) || self.closed.load(Ordering::Relaxed)
                    {
                        break;
                    }

                    match acceptor.accept() {
                        Ok((stream, _)) => {
                            if stream.set_nonblocking(false).is_err() {
                                continue;
                            }

                            scope.spawn(move || {
                                if let Err(e) = secondary(&stream) {
                                    if !matches!(e, TransportError::ConnectionClosed) {
                                        log::error!(
                                            "Failure while handling a secondary connection: {}",
                                            e
                                        );
                                    }
                                }
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(e) => {
                            log::error!("Failure while accepting connections: {}", e);
                            break;
                        }
                    }
                }
            });

            // Handle reads on the primary socket until the socket shuts down
            loop {
                let stream = match self.primary() {
                    Ok(stream) => stream,
                    Err(_) => break,
                };

                match primary(stream) {
                    Ok(()) => {}
                    Err(e) => {
                        if !matches!(e, TransportError::ConnectionClosed) {
                            log::error!(
                                "Receive loop on '{}' failed: {}",
                                self.endpoint.display(),
                                e
                            );
                        }
                        break;
                    }
                }
            }

            primary_done.store(true, Ordering::SeqCst);
        });

        self.currently_listening.store(false, Ordering::SeqCst);
    }

    /// Shut down the primary socket, then wait for an in-flight
    /// `receive_multi()` to finish. The loop exits almost immediately after
    /// the shutdown, so a spin wait is enough here.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(stream) = self.socket.get() {
            // The shutdown can fail when the socket is already closed
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }

        while self.currently_listening.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_object, write_object};
    use std::sync::Arc;

    fn connected_pair(dir: &tempfile::TempDir) -> (Arc<AdHocSocketHandler>, Arc<AdHocSocketHandler>) {
        let path = dir.path().join("callback.sock");
        let listening = Arc::new(AdHocSocketHandler::new(&path, true).unwrap());
        let connecting = Arc::new(AdHocSocketHandler::new(&path, false).unwrap());

        let listening_clone = Arc::clone(&listening);
        let accepted = std::thread::spawn(move || listening_clone.connect());
        connecting.connect().unwrap();
        accepted.join().unwrap().unwrap();

        (listening, connecting)
    }

    #[test]
    fn concurrent_sends_use_a_secondary_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, sender) = connected_pair(&dir);

        // The receiver answers `n` with `n + 1`, tagging primary responses so
        // the test can tell which socket carried which request
        let receiver_clone = Arc::clone(&receiver);
        let receive_loop = std::thread::spawn(move || {
            let on_request = |tag: u64| {
                move |socket: &UnixStream| -> Result<(), TransportError> {
                    let mut socket = socket;
                    let mut scratch = Vec::new();
                    let n: u64 = read_object(&mut socket, &mut scratch)?;
                    write_object(&mut socket, &(n + 1 + tag * 1000), &mut scratch)
                }
            };

            receiver_clone.receive_multi(on_request(1), on_request(2));
        });

        // Thread A takes the primary and sits in it while thread B sends
        let slow_barrier = Arc::new(std::sync::Barrier::new(2));

        let sender_a = Arc::clone(&sender);
        let barrier_a = Arc::clone(&slow_barrier);
        let thread_a = std::thread::spawn(move || {
            sender_a.send(|socket| {
                let mut socket = socket;
                let mut scratch = Vec::new();
                write_object(&mut socket, &10u64, &mut scratch)?;
                barrier_a.wait();
                // Hold the primary until B has had a chance to contend
                std::thread::sleep(Duration::from_millis(50));
                read_object::<u64, _>(&mut socket, &mut scratch)
            })
        });

        slow_barrier.wait();
        std::thread::sleep(Duration::from_millis(10));

        let response_b = sender
            .send(|socket| {
                let mut socket = socket;
                let mut scratch = Vec::new();
                write_object(&mut socket, &20u64, &mut scratch)?;
                read_object::<u64, _>(&mut socket, &mut scratch)
            })
            .unwrap();

        let response_a = thread_a.join().unwrap().unwrap();

        // A went over the primary (tag 1), B over a secondary (tag 2)
        assert_eq!(response_a, 1011);
        assert_eq!(response_b, 2021);

        receiver.close();
        sender.close();
        receive_loop.join().unwrap();
    }

    #[test]
    fn close_waits_for_receive_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, sender) = connected_pair(&dir);

        let receiver_clone = Arc::clone(&receiver);
        let receive_loop = std::thread::spawn(move || {
            let handle = |socket: &UnixStream| -> Result<(), TransportError> {
                let mut socket = socket;
                let mut scratch = Vec::new();
                let n: u64 = read_object(&mut socket, &mut scratch)?;
                write_object(&mut socket, &n, &mut scratch)
            };
            receiver_clone.receive_multi(handle, handle);
        });

        std::thread::sleep(Duration::from_millis(20));
        receiver.close();
        receive_loop.join().unwrap();

        sender.close();
    }
}
