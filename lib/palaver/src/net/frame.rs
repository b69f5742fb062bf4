use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum number of bytes in a nickname, excluding the terminator.
pub const MAX_NAME_LENGTH: usize = 32;

/// On-the-wire size of a name field. Names are zero padded to this width.
pub const NAME_SIZE: usize = MAX_NAME_LENGTH + 1;

/// On-the-wire size of a message header: opcode byte plus sender name.
pub const HDR_SIZE: usize = 1 + NAME_SIZE;

/// On-the-wire size of a data header: receiver name plus a u32 length.
pub const DATA_HDR_SIZE: usize = NAME_SIZE + 4;

/// Request and reply opcodes.
///
/// The numbering is part of the wire protocol and must not change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Register = 0,
    Connect = 1,
    PostTxt = 2,
    PostTxtAll = 3,
    PostFile = 4,
    GetFile = 5,
    GetPrevMsgs = 6,
    UsrList = 7,
    Unregister = 8,
    Disconnect = 9,

    Ok = 20,
    Fail = 21,
    NickAlready = 22,
    NickUnknown = 23,
    MsgTooLong = 24,
    NoSuchFile = 25,

    TxtMessage = 30,
    FileMessage = 31,
}

impl From<Op> for u8 {
    #[inline]
    fn from(op: Op) -> Self {
        op as u8
    }
}

impl Op {
    /// Decodes a wire opcode byte. Returns `None` for bytes outside the
    /// protocol, which the dispatcher answers with `Fail`.
    #[inline]
    pub fn decode(raw: u8) -> Option<Op> {
        Some(match raw {
            0 => Op::Register,
            1 => Op::Connect,
            2 => Op::PostTxt,
            3 => Op::PostTxtAll,
            4 => Op::PostFile,
            5 => Op::GetFile,
            6 => Op::GetPrevMsgs,
            7 => Op::UsrList,
            8 => Op::Unregister,
            9 => Op::Disconnect,
            20 => Op::Ok,
            21 => Op::Fail,
            22 => Op::NickAlready,
            23 => Op::NickUnknown,
            24 => Op::MsgTooLong,
            25 => Op::NoSuchFile,
            30 => Op::TxtMessage,
            31 => Op::FileMessage,
            _ => return None,
        })
    }
}

/// A fixed-width, zero-padded nickname field.
///
/// Equality and hashing consider the bytes up to the first NUL only, so two
/// names that differ in trailing padding compare equal.
#[derive(Copy, Clone)]
pub struct Nickname([u8; NAME_SIZE]);

impl Nickname {
    pub const EMPTY: Nickname = Nickname([0; NAME_SIZE]);

    /// Builds a nickname from a string, truncating to `MAX_NAME_LENGTH` bytes.
    #[inline]
    pub fn new(name: &str) -> Nickname {
        let mut raw = [0u8; NAME_SIZE];
        let bytes = name.as_bytes();
        let count = bytes.len().min(MAX_NAME_LENGTH);
        raw[..count].copy_from_slice(&bytes[..count]);
        Nickname(raw)
    }

    #[inline]
    pub fn from_wire(mut raw: [u8; NAME_SIZE]) -> Nickname {
        // The terminator is reserved even if the peer filled the whole field.
        raw[NAME_SIZE - 1] = 0;
        Nickname(raw)
    }

    /// The full zero-padded field, as transmitted.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// The name bytes up to the first NUL.
    #[inline]
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &self.0[..end]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl PartialEq for Nickname {
    #[inline]
    fn eq(&self, other: &Nickname) -> bool {
        self.name_bytes() == other.name_bytes()
    }
}

impl Eq for Nickname {}

impl Hash for Nickname {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name_bytes().hash(state)
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.name_bytes()))
    }
}

impl fmt::Debug for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Nickname({})", self)
    }
}

/// Message header: opcode and sender.
///
/// The opcode is kept as the raw wire byte so that frames carrying unknown
/// operations can still be read in full and answered with `Fail`.
#[derive(Debug, Clone)]
pub struct MessageHdr {
    pub op: u8,
    pub sender: Nickname,
}

impl MessageHdr {
    #[inline]
    pub fn new(op: Op, sender: Nickname) -> MessageHdr {
        MessageHdr { op: op.into(), sender }
    }

    /// Header for a reply carrying no data part, with an empty sender.
    #[inline]
    pub fn ack(op: Op) -> MessageHdr {
        MessageHdr::new(op, Nickname::EMPTY)
    }
}

/// Message data part: receiver and payload.
#[derive(Debug, Clone)]
pub struct MessageData {
    pub receiver: Nickname,
    pub buf: Vec<u8>,
}

/// One full frame: header, data header and payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub hdr: MessageHdr,
    pub data: MessageData,
}

impl Message {
    #[inline]
    pub fn new(op: Op, sender: Nickname, receiver: Nickname, buf: Vec<u8>) -> Message {
        Message {
            hdr: MessageHdr::new(op, sender),
            data: MessageData { receiver, buf },
        }
    }

    /// A data-bearing reply from the server itself.
    #[inline]
    pub fn server_reply(op: Op, buf: Vec<u8>) -> Message {
        Message::new(op, Nickname::EMPTY, Nickname::new("server"), buf)
    }
}
