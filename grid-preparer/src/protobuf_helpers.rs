//! Framing for streams of length-delimited protobuf messages: a varint byte
//! length followed by the encoded message, repeated until EOF.

use std::io::{self, BufRead, Read, Write};

use prost::Message;

/// Decodes a varint from `stream`. `Ok(None)` on a clean EOF before the first
/// byte; an EOF in the middle of the varint is an error.
pub fn decode_varint<R: BufRead>(stream: &mut R) -> io::Result<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut started = false;

    loop {
        let available = stream.fill_buf()?;
        if available.is_empty() {
            return if started {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF in the middle of a varint",
                ))
            } else {
                Ok(None)
            };
        }
        started = true;

        let mut consumed = 0;
        let mut done = false;
        for &byte in available {
            consumed += 1;
            if shift > 63 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                done = true;
                break;
            }
            shift += 7;
        }
        stream.consume(consumed);
        if done {
            return Ok(Some(value));
        }
    }
}

/// Reads the next message, or `Ok(None)` at the end of the stream.
pub fn read_delimited<M, R>(stream: &mut R) -> io::Result<Option<M>>
where
    M: Message + Default,
    R: BufRead,
{
    let Some(len) = decode_varint(stream)? else {
        return Ok(None);
    };
    // The length comes from the stream itself, so grow the buffer as bytes
    // arrive instead of allocating it up front.
    let mut buf = Vec::new();
    (&mut *stream).take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("message truncated after {} of {len} bytes", buf.len()),
        ));
    }
    let message = M::decode(&buf[..])?;
    Ok(Some(message))
}

pub fn write_delimited<M: Message, W: Write>(stream: &mut W, message: &M) -> io::Result<()> {
    let buf = message.encode_length_delimited_to_vec();
    stream.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Probe {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint64, repeated, tag = "2")]
        values: Vec<u64>,
    }

    #[test]
    fn decodes_multi_byte_varints() {
        let mut stream = Cursor::new(vec![0xac, 0x02, 0x01]);
        assert_eq!(decode_varint(&mut stream).unwrap(), Some(300));
        assert_eq!(decode_varint(&mut stream).unwrap(), Some(1));
        assert_eq!(decode_varint(&mut stream).unwrap(), None);
    }

    #[test]
    fn truncated_varint_is_an_error() {
        let mut stream = Cursor::new(vec![0x80]);
        let err = decode_varint(&mut stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let mut stream = Cursor::new(vec![0xff; 11]);
        let err = decode_varint(&mut stream).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_prefix_is_an_error() {
        // varint for 2^62 followed by three bytes of payload
        let mut buf = vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x40];
        buf.extend_from_slice(&[1, 2, 3]);
        let err = read_delimited::<Probe, _>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn messages_stream_back_in_order() {
        let first = Probe { name: "3355_1825".into(), values: vec![1, 0, 300] };
        let second = Probe { name: "2540_2810".into(), values: vec![] };
        let mut buf = Vec::new();
        write_delimited(&mut buf, &first).unwrap();
        write_delimited(&mut buf, &second).unwrap();

        let mut stream = Cursor::new(buf);
        assert_eq!(read_delimited::<Probe, _>(&mut stream).unwrap(), Some(first));
        assert_eq!(read_delimited::<Probe, _>(&mut stream).unwrap(), Some(second));
        assert_eq!(read_delimited::<Probe, _>(&mut stream).unwrap(), None);
    }
}
