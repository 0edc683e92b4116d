use std::error::Error;
use std::io;

/// Errors on the socket fabric. Closing a socket from another thread fails any
/// blocking operation on it with `ConnectionClosed`, which is what the receive
/// loops use as their exit signal.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the connection, or the socket was shut down locally
    /// while a blocking call was in flight.
    ConnectionClosed,
    /// Any other IO error.
    Io(io::Error),
    /// Encoding failed, or decoding did not consume exactly the framed number
    /// of bytes. Fatal to the connection it happened on, but not to the
    /// process.
    Codec(String),
}

impl Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionClosed => write!(f, "the connection was closed"),
            TransportError::Io(e) => write!(f, "socket IO error: {}", e),
            TransportError::Codec(e) => write!(f, "codec error: {}", e),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => TransportError::ConnectionClosed,
            _ => TransportError::Io(e),
        }
    }
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        // Serialization itself only touches memory. IO errors bubbling up
        // through bincode still mean the socket died under us.
        match *e {
            bincode::ErrorKind::Io(io_err) => TransportError::from(io_err),
            other => TransportError::Codec(other.to_string()),
        }
    }
}

/// Errors setting up or mapping the shared-memory audio buffers.
#[derive(Debug)]
pub enum ShmError {
    Create { name: String, errno: i32 },
    Open { name: String, errno: i32 },
    Resize { name: String, errno: i32 },
    Map { name: String, errno: i32 },
    /// The existing mapping does not match the configuration's size. Should
    /// not happen since both sides derive the size from the same config.
    SizeMismatch { expected: usize, actual: usize },
}

impl Error for ShmError {}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strerror = |errno: &i32| {
            io::Error::from_raw_os_error(*errno).to_string()
        };

        match self {
            ShmError::Create { name, errno } => {
                write!(f, "could not create shared memory object '{}': {}", name, strerror(errno))
            }
            ShmError::Open { name, errno } => {
                write!(f, "could not open shared memory object '{}': {}", name, strerror(errno))
            }
            ShmError::Resize { name, errno } => {
                write!(f, "could not resize shared memory object '{}': {}", name, strerror(errno))
            }
            ShmError::Map { name, errno } => {
                write!(f, "could not map shared memory object '{}': {}", name, strerror(errno))
            }
            ShmError::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "shared memory size mismatch, expected {} bytes but mapped {}",
                    expected, actual
                )
            }
        }
    }
}
