//! Typed request/response messaging on top of the ad-hoc socket handler.
//!
//! Every channel carries a tagged variant of all the request types that may
//! travel over it. Each request type declares its response type through the
//! [`Request`] trait, so `send_message()` can hand back a fully typed response
//! and the receiving side can't reply with the wrong shape without it showing
//! up in the `match`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::codec::{read_object, shrink_scratch, write_object};
use crate::error::TransportError;
use crate::transport::adhoc::AdHocSocketHandler;

/// A request that can be sent with [`MessageHandler::send_message`]. The peer
/// answers every request of type `T` with exactly one `T::Response`.
pub trait Request: Serialize + DeserializeOwned {
    type Response: Serialize + DeserializeOwned;
}

thread_local! {
    /// Reusable per-thread serialization buffers. Audio-thread channels keep
    /// theirs pre-grown across calls; the other channels shrink oversized
    /// buffers after every message so large state chunks don't pin memory.
    /// Requests and replies get separate buffers so a handler that issues a
    /// nested request from the receiving thread never trips over its own
    /// in-flight borrow.
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    static REPLY_SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

/// The write half of one in-flight request on the receiving side. Consumed by
/// sending the response on the same socket the request came in on.
pub struct Reply<'a> {
    socket: &'a UnixStream,
    persistent_buffers: bool,
}

impl Reply<'_> {
    pub fn send<T: Serialize>(self, response: &T) -> Result<(), TransportError> {
        REPLY_SCRATCH.with(|scratch| {
            let scratch = &mut *scratch.borrow_mut();

            let mut socket = self.socket;
            write_object(&mut socket, response, scratch)?;

            if !self.persistent_buffers {
                shrink_scratch(scratch);
            }

            Ok(())
        })
    }
}

/// A typed message channel carrying the request variant `R`.
///
/// `R` is the dialect's tagged request enum for this channel (control,
/// callback or audio thread). Responses are not wrapped in a variant: the
/// sender already knows which `T::Response` to expect.
pub struct MessageHandler<R> {
    sockets: AdHocSocketHandler,
    /// Audio-thread channels set this so their scratch buffers are never
    /// shrunk. Processing must not allocate once the buffers reached their
    /// steady-state size.
    persistent_buffers: bool,
    _request: PhantomData<fn(R) -> R>,
}

impl<R: Serialize + DeserializeOwned + std::fmt::Debug> MessageHandler<R> {
    pub fn new(endpoint: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        Ok(Self {
            sockets: AdHocSocketHandler::new(endpoint, listen)?,
            persistent_buffers: false,
            _request: PhantomData,
        })
    }

    /// A handler for an audio-thread channel. Identical except that the
    /// per-thread serialization buffers are kept at their high-water size.
    pub fn new_persistent(
        endpoint: impl Into<PathBuf>,
        listen: bool,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            sockets: AdHocSocketHandler::new(endpoint, listen)?,
            persistent_buffers: true,
            _request: PhantomData,
        })
    }

    pub fn endpoint(&self) -> &Path {
        self.sockets.endpoint()
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        self.sockets.connect()
    }

    pub fn close(&self) {
        self.sockets.close()
    }

    /// Send a request and block until its response arrives.
    ///
    /// Requests issued from one thread arrive and are answered in order.
    /// Concurrent requests from different threads are valid (contention moves
    /// them onto secondary sockets) but have no ordering relative to each
    /// other.
    pub fn send_message<T>(&self, request: T) -> Result<T::Response, TransportError>
    where
        T: Request + Into<R>,
    {
        let request: R = request.into();
        log::trace!(">> {:?}", request);

        SCRATCH.with(|scratch| {
            let scratch = &mut *scratch.borrow_mut();

            let response = self.sockets.send(|socket| {
                let mut socket = socket;
                write_object(&mut socket, &request, scratch)?;
                read_object::<T::Response, _>(&mut socket, scratch)
            })?;

            if !self.persistent_buffers {
                shrink_scratch(scratch);
            }

            Ok(response)
        })
    }

    /// Handle incoming requests in a blocking loop until the channel closes.
    ///
    /// The callback receives each decoded request together with a [`Reply`]
    /// and must answer with the response type matching the request's variant.
    /// Secondary connections are served on their own short-lived threads, so
    /// the callback is shared across threads.
    pub fn receive_messages<F>(&self, callback: F)
    where
        F: Fn(R, Reply<'_>) -> Result<(), TransportError> + Sync,
    {
        let persistent_buffers = self.persistent_buffers;

        let process_message = |socket: &UnixStream| -> Result<(), TransportError> {
            // The scratch borrow must not span the callback: handlers are
            // allowed to issue their own requests from this thread
            let request: R = SCRATCH.with(|scratch| {
                let scratch = &mut *scratch.borrow_mut();

                let mut socket = socket;
                let request = read_object(&mut socket, scratch);

                if !persistent_buffers {
                    shrink_scratch(scratch);
                }

                request
            })?;
            log::trace!("<< {:?}", request);

            callback(request, Reply { socket, persistent_buffers })
        };

        self.sockets.receive_multi(&process_message, &process_message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping(u32);
    #[derive(Debug, Serialize, Deserialize)]
    struct NameQuery;

    impl Request for Ping {
        type Response = u32;
    }
    impl Request for NameQuery {
        type Response = String;
    }

    #[derive(Debug, Serialize, Deserialize)]
    enum TestRequest {
        Ping(Ping),
        NameQuery(NameQuery),
    }

    impl From<Ping> for TestRequest {
        fn from(r: Ping) -> Self {
            TestRequest::Ping(r)
        }
    }
    impl From<NameQuery> for TestRequest {
        fn from(r: NameQuery) -> Self {
            TestRequest::NameQuery(r)
        }
    }

    fn connected_pair(
        dir: &tempfile::TempDir,
    ) -> (Arc<MessageHandler<TestRequest>>, Arc<MessageHandler<TestRequest>>) {
        let path = dir.path().join("control.sock");
        let listening = Arc::new(MessageHandler::new(&path, true).unwrap());
        let connecting = Arc::new(MessageHandler::new(&path, false).unwrap());

        let listening_clone = Arc::clone(&listening);
        let accepted = std::thread::spawn(move || listening_clone.connect());
        connecting.connect().unwrap();
        accepted.join().unwrap().unwrap();

        (listening, connecting)
    }

    #[test]
    fn each_request_gets_one_typed_response() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, sender) = connected_pair(&dir);

        let handler_invocations = Arc::new(AtomicU32::new(0));

        let receiver_clone = Arc::clone(&receiver);
        let invocations_clone = Arc::clone(&handler_invocations);
        let receive_loop = std::thread::spawn(move || {
            receiver_clone.receive_messages(|request, reply| {
                invocations_clone.fetch_add(1, Ordering::SeqCst);
                match request {
                    TestRequest::Ping(Ping(n)) => reply.send(&(n * 2)),
                    TestRequest::NameQuery(NameQuery) => reply.send(&String::from("plugbridge")),
                }
            });
        });

        assert_eq!(sender.send_message(Ping(21)).unwrap(), 42);
        assert_eq!(sender.send_message(NameQuery).unwrap(), "plugbridge");
        assert_eq!(handler_invocations.load(Ordering::SeqCst), 2);

        receiver.close();
        sender.close();
        receive_loop.join().unwrap();
    }

    #[test]
    fn requests_from_one_thread_are_answered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (receiver, sender) = connected_pair(&dir);

        let receiver_clone = Arc::clone(&receiver);
        let receive_loop = std::thread::spawn(move || {
            receiver_clone.receive_messages(|request, reply| match request {
                TestRequest::Ping(Ping(n)) => reply.send(&n),
                TestRequest::NameQuery(NameQuery) => reply.send(&String::new()),
            });
        });

        for n in 0..100 {
            assert_eq!(sender.send_message(Ping(n)).unwrap(), n);
        }

        receiver.close();
        sender.close();
        receive_loop.join().unwrap();
    }
}
