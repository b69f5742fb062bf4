use crate::net::frame::{Message, MessageData, MessageHdr, Nickname, DATA_HDR_SIZE, HDR_SIZE, NAME_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

pub type NetResult<T> = Result<T, NetError>;

/// Transport outcome for a frame operation. `Closed` means the peer shut the
/// connection down (a zero-byte transfer); everything else is an I/O error.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Closed,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        NetError::Io(err.kind())
    }
}

/// Reads exactly `buf.len()` bytes, resuming across short reads and
/// interruption.
fn readn<R: Read>(reader: &mut R, buf: &mut [u8]) -> NetResult<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match reader.read(&mut buf[pos..]) {
            Ok(0) => return Err(NetError::Closed),
            Ok(count) => pos += count,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes, resuming across short writes and
/// interruption.
fn writen<W: Write>(writer: &mut W, buf: &[u8]) -> NetResult<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match writer.write(&buf[pos..]) {
            Ok(0) => return Err(NetError::Closed),
            Ok(count) => pos += count,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Reads a message header.
pub fn read_header<R: Read>(reader: &mut R) -> NetResult<MessageHdr> {
    let mut raw = [0u8; HDR_SIZE];
    readn(reader, &mut raw)?;

    let mut name = [0u8; NAME_SIZE];
    name.copy_from_slice(&raw[1..]);

    Ok(MessageHdr {
        op: raw[0],
        sender: Nickname::from_wire(name),
    })
}

/// Reads a data header and then a payload of exactly the declared length.
/// A declared length of zero yields an empty buffer.
pub fn read_data<R: Read>(reader: &mut R) -> NetResult<MessageData> {
    let mut raw = [0u8; DATA_HDR_SIZE];
    readn(reader, &mut raw)?;

    let mut name = [0u8; NAME_SIZE];
    name.copy_from_slice(&raw[..NAME_SIZE]);
    let len = LittleEndian::read_u32(&raw[NAME_SIZE..]) as usize;

    let mut buf = vec![0u8; len];
    if len > 0 {
        readn(reader, &mut buf)?;
    }

    Ok(MessageData {
        receiver: Nickname::from_wire(name),
        buf,
    })
}

/// Reads one full message: header, data header, payload.
pub fn read_msg<R: Read>(reader: &mut R) -> NetResult<Message> {
    let hdr = read_header(reader)?;
    let data = read_data(reader)?;
    Ok(Message { hdr, data })
}

/// Writes a message header. This is also the entire frame for replies that
/// carry no data part.
pub fn send_header<W: Write>(writer: &mut W, hdr: &MessageHdr) -> NetResult<()> {
    let mut raw = [0u8; HDR_SIZE];
    raw[0] = hdr.op;
    raw[1..].copy_from_slice(hdr.sender.as_bytes());
    writen(writer, &raw)
}

/// Writes a data header followed by the payload.
pub fn send_data<W: Write>(writer: &mut W, data: &MessageData) -> NetResult<()> {
    let mut raw = [0u8; DATA_HDR_SIZE];
    raw[..NAME_SIZE].copy_from_slice(data.receiver.as_bytes());
    LittleEndian::write_u32(&mut raw[NAME_SIZE..], data.buf.len() as u32);

    writen(writer, &raw)?;
    if !data.buf.is_empty() {
        writen(writer, &data.buf)?;
    }
    Ok(())
}

/// Writes one full message.
pub fn send_msg<W: Write>(writer: &mut W, msg: &Message) -> NetResult<()> {
    send_header(writer, &msg.hdr)?;
    send_data(writer, &msg.data)
}

/// Raw read/write adapter over a descriptor owned by the dispatch runtime.
///
/// Workers address connections by descriptor while the owning `UnixStream`
/// sits in the runtime's registry, so frame I/O goes through the descriptor
/// directly.
pub struct FdIo(pub RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if count < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if count < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(count as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::Op;
    use std::cmp::min;
    use std::io::Cursor;

    /// In-memory channel that transfers at most `chunk` bytes per call and
    /// can inject interruptions, mimicking a slow or signal-ridden socket.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        interrupts: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                interrupts: 0,
            }
        }

        fn with_interrupts(mut self, interrupts: usize) -> MockChannel {
            self.interrupts = interrupts;
            self
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }
            if self.cursor == self.data.len() {
                return Ok(0);
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        send_msg(&mut out, msg).unwrap();
        out
    }

    #[test]
    fn test_roundtrip() {
        let msg = Message::new(
            Op::PostTxt,
            Nickname::new("alice"),
            Nickname::new("bob"),
            b"hi there".to_vec(),
        );

        let mut cursor = Cursor::new(encode(&msg));
        let decoded = read_msg(&mut cursor).unwrap();

        assert_eq!(decoded.hdr.op, u8::from(Op::PostTxt));
        assert_eq!(decoded.hdr.sender, Nickname::new("alice"));
        assert_eq!(decoded.data.receiver, Nickname::new("bob"));
        assert_eq!(decoded.data.buf, b"hi there");
    }

    #[test]
    fn test_roundtrip_short_reads() {
        let msg = Message::new(
            Op::PostTxt,
            Nickname::new("alice"),
            Nickname::new("bob"),
            vec![7; 300],
        );

        // 3 bytes per read, with interruptions sprinkled in.
        let mut channel = MockChannel::new(encode(&msg), 3).with_interrupts(5);
        let decoded = read_msg(&mut channel).unwrap();

        assert_eq!(decoded.data.buf, vec![7; 300]);
    }

    #[test]
    fn test_send_short_writes() {
        let msg = Message::new(
            Op::PostTxt,
            Nickname::new("alice"),
            Nickname::new("bob"),
            vec![9; 150],
        );

        let mut channel = MockChannel::new(Vec::new(), 2).with_interrupts(3);
        send_msg(&mut channel, &msg).unwrap();

        assert_eq!(channel.data, encode(&msg));
    }

    #[test]
    fn test_read_empty_payload() {
        let msg = Message::new(
            Op::UsrList,
            Nickname::new("alice"),
            Nickname::EMPTY,
            Vec::new(),
        );

        let mut cursor = Cursor::new(encode(&msg));
        let decoded = read_msg(&mut cursor).unwrap();

        assert!(decoded.data.buf.is_empty());
    }

    #[test]
    fn test_read_err_closed_at_start() {
        let mut channel = MockChannel::new(Vec::new(), 16);

        assert_eq!(read_header(&mut channel).unwrap_err(), NetError::Closed);
    }

    #[test]
    fn test_read_err_closed_mid_frame() {
        let msg = Message::new(
            Op::PostTxt,
            Nickname::new("alice"),
            Nickname::new("bob"),
            vec![1; 64],
        );

        let mut truncated = encode(&msg);
        truncated.truncate(truncated.len() - 10);

        let mut channel = MockChannel::new(truncated, 16);
        assert_eq!(read_msg(&mut channel).unwrap_err(), NetError::Closed);
    }

    #[test]
    fn test_ack_roundtrip() {
        let mut out = Vec::new();
        send_header(&mut out, &MessageHdr::ack(Op::NickAlready)).unwrap();

        assert_eq!(out.len(), HDR_SIZE);

        let mut cursor = Cursor::new(out);
        let hdr = read_header(&mut cursor).unwrap();

        assert_eq!(hdr.op, u8::from(Op::NickAlready));
        assert!(hdr.sender.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let msg = Message::new(
            Op::PostTxt,
            Nickname::new("a"),
            Nickname::new("b"),
            b"xy".to_vec(),
        );
        let raw = encode(&msg);

        assert_eq!(raw.len(), HDR_SIZE + DATA_HDR_SIZE + 2);
        assert_eq!(raw[0], 2); // POSTTXT
        assert_eq!(raw[1], b'a');
        assert_eq!(raw[2], 0);
        assert_eq!(raw[HDR_SIZE], b'b');
        // Length field, little endian.
        assert_eq!(&raw[HDR_SIZE + NAME_SIZE..HDR_SIZE + DATA_HDR_SIZE], &[2, 0, 0, 0]);
        assert_eq!(&raw[HDR_SIZE + DATA_HDR_SIZE..], b"xy");
    }
}
