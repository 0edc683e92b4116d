//! Length-prefixed binary framing for everything that travels over a channel.
//!
//! Every frame is a 64-bit little-endian byte count followed by that many
//! bytes of bincode payload. The length is written as a `u64` even on 32-bit
//! builds so that 32-bit and 64-bit workers stay wire compatible, and bincode's
//! legacy functions encode all integers as fixed-width little-endian for the
//! same reason.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, Read, Write};

use crate::error::TransportError;

/// Once a reusable serialization buffer has grown past this many bytes
/// (chunk/state data can get large), the next non-audio-path use reallocates
/// it small again. Audio-path buffers are thread local and never shrink.
pub const SCRATCH_HIGH_WATER_MARK: usize = 256 * 1024;

/// Serialize `object` into `scratch` and write it to `socket` as a single
/// length-prefixed frame.
///
/// The write is message-atomic from the caller's perspective: the caller must
/// guarantee a single writer per socket (the socket handlers do), and in
/// return no two frames ever interleave on a channel.
pub fn write_object<T: Serialize, S: Write>(
    socket: &mut S,
    object: &T,
    scratch: &mut Vec<u8>,
) -> Result<(), TransportError> {
    scratch.clear();
    bincode::serialize_into(&mut *scratch, object)?;

    let size = scratch.len() as u64;
    socket.write_all(&size.to_le_bytes())?;
    socket.write_all(scratch)?;

    Ok(())
}

/// Read a single length-prefixed frame from `socket` and deserialize it.
///
/// Blocks until the whole frame arrived. Fails with
/// [`TransportError::ConnectionClosed`] when the socket gets closed while
/// waiting, and with [`TransportError::Codec`] when decoding does not consume
/// exactly the framed number of bytes.
pub fn read_object<T: DeserializeOwned, S: Read>(
    socket: &mut S,
    scratch: &mut Vec<u8>,
) -> Result<T, TransportError> {
    let mut size_bytes = [0u8; 8];
    socket.read_exact(&mut size_bytes)?;
    let size = u64::from_le_bytes(size_bytes) as usize;

    scratch.resize(size, 0);
    socket.read_exact(&mut scratch[..size])?;

    let mut reader = Cursor::new(&scratch[..size]);
    let object: T = bincode::deserialize_from(&mut reader)?;

    let consumed = reader.position();
    if consumed != size as u64 {
        return Err(TransportError::Codec(format!(
            "decoded {} bytes out of a {} byte frame",
            consumed, size
        )));
    }

    Ok(object)
}

/// `read_object()`, but replacing an existing object. The deserialized value
/// is moved into `object` so that callers which keep a long-lived response
/// object (the audio path does) don't need a separate binding.
pub fn read_object_into<T: DeserializeOwned, S: Read>(
    socket: &mut S,
    object: &mut T,
    scratch: &mut Vec<u8>,
) -> Result<(), TransportError> {
    *object = read_object(socket, scratch)?;
    Ok(())
}

/// Reallocate an oversized scratch buffer. Called from the non-audio receive
/// loops after handling a message so a single large state chunk doesn't pin
/// hundreds of kilobytes for the rest of the session.
pub fn shrink_scratch(scratch: &mut Vec<u8>) {
    if scratch.capacity() > SCRATCH_HIGH_WATER_MARK {
        *scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMessage {
        opcode: i32,
        value: i64,
        name: String,
        chunk: Vec<u8>,
    }

    fn test_message() -> TestMessage {
        TestMessage {
            opcode: 42,
            value: -1,
            name: "oscillator".to_owned(),
            chunk: vec![0, 1, 2, 254, 255],
        }
    }

    #[test]
    fn frames_round_trip() {
        let mut wire: Vec<u8> = Vec::new();
        let mut scratch = Vec::new();

        write_object(&mut wire, &test_message(), &mut scratch).unwrap();

        // 64-bit little-endian length prefix, then exactly that many bytes
        let size = u64::from_le_bytes(wire[..8].try_into().unwrap());
        assert_eq!(wire.len() as u64 - 8, size);

        let mut reader = &wire[..];
        let decoded: TestMessage = read_object(&mut reader, &mut scratch).unwrap();
        assert_eq!(decoded, test_message());
    }

    #[test]
    fn sequential_frames_stay_ordered() {
        let mut wire: Vec<u8> = Vec::new();
        let mut scratch = Vec::new();

        for i in 0..10i32 {
            let msg = TestMessage { opcode: i, ..test_message() };
            write_object(&mut wire, &msg, &mut scratch).unwrap();
        }

        let mut reader = &wire[..];
        for i in 0..10i32 {
            let decoded: TestMessage = read_object(&mut reader, &mut scratch).unwrap();
            assert_eq!(decoded.opcode, i);
        }
    }

    #[test]
    fn short_frames_are_codec_errors() {
        // Frame a `TestMessage`, then claim the frame is one byte longer than
        // the decoder will consume
        let mut wire: Vec<u8> = Vec::new();
        let mut scratch = Vec::new();
        write_object(&mut wire, &test_message(), &mut scratch).unwrap();

        let size = u64::from_le_bytes(wire[..8].try_into().unwrap());
        wire[..8].copy_from_slice(&(size + 1).to_le_bytes());
        wire.push(0xaa);

        let mut reader = &wire[..];
        let result: Result<TestMessage, _> = read_object(&mut reader, &mut scratch);
        assert!(matches!(result, Err(TransportError::Codec(_))));
    }

    #[test]
    fn closed_reader_is_connection_closed() {
        let mut reader: &[u8] = &[1, 2, 3];
        let mut scratch = Vec::new();

        let result: Result<TestMessage, _> = read_object(&mut reader, &mut scratch);
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn oversized_scratch_gets_reallocated() {
        let mut scratch = Vec::with_capacity(SCRATCH_HIGH_WATER_MARK * 2);
        shrink_scratch(&mut scratch);
        assert!(scratch.capacity() <= SCRATCH_HIGH_WATER_MARK);

        let mut small = Vec::with_capacity(64);
        shrink_scratch(&mut small);
        assert_eq!(small.capacity(), 64);
    }
}
