//! Wire constants for the file-transfer protocol: opcodes, flag bits, status
//! codes, and the handful of magic values used during negotiation.
//!
//! Opcode numbers and status codes follow the SFTP draft at versions 3-6; see
//! DESIGN.md for where each table entry is grounded.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use std::error::Error;
use std::fmt;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Lowest protocol version this client is willing to negotiate.
pub const MIN_VERSION: u32 = 3;
/// Highest protocol version this client asks for in INIT.
pub const MAX_VERSION: u32 = 6;

#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}

impl Error for ProtocolError {}

/// Message opcodes, shared by requests and replies.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    INIT = 1,
    VERSION = 2,
    OPEN = 3,
    CLOSE = 4,
    READ = 5,
    WRITE = 6,
    LSTAT = 7,
    FSTAT = 8,
    SETSTAT = 9,
    FSETSTAT = 10,
    OPENDIR = 11,
    READDIR = 12,
    REMOVE = 13,
    MKDIR = 14,
    RMDIR = 15,
    REALPATH = 16,
    STAT = 17,
    RENAME = 18,
    READLINK = 19,
    SYMLINK = 20,
    LINK = 21,

    STATUS = 101,
    HANDLE = 102,
    DATA = 103,
    NAME = 104,
    ATTRS = 105,

    EXTENDED = 200,
    EXTENDED_REPLY = 201,
}

/// Status codes carried in a STATUS reply. Only the codes this client acts on
/// by name are modeled individually; anything else round-trips through
/// `Other`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusCode {
    OK,
    EOF,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    InvalidHandle,
    NoSuchPath,
    FileAlreadyExists,
    Other(u32),
}

impl StatusCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => Self::OK,
            1 => Self::EOF,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            9 => Self::InvalidHandle,
            10 => Self::NoSuchPath,
            11 => Self::FileAlreadyExists,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::OK => 0,
            Self::EOF => 1,
            Self::NoSuchFile => 2,
            Self::PermissionDenied => 3,
            Self::Failure => 4,
            Self::BadMessage => 5,
            Self::NoConnection => 6,
            Self::ConnectionLost => 7,
            Self::OpUnsupported => 8,
            Self::InvalidHandle => 9,
            Self::NoSuchPath => 10,
            Self::FileAlreadyExists => 11,
            Self::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::OK)
    }

    pub fn is_eof(self) -> bool {
        matches!(self, Self::EOF)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OK => write!(f, "ok"),
            Self::EOF => write!(f, "eof"),
            Self::NoSuchFile => write!(f, "no such file"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Failure => write!(f, "failure"),
            Self::BadMessage => write!(f, "bad message"),
            Self::NoConnection => write!(f, "no connection"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::OpUnsupported => write!(f, "operation unsupported"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::NoSuchPath => write!(f, "no such path"),
            Self::FileAlreadyExists => write!(f, "file already exists"),
            Self::Other(code) => write!(f, "status {code}"),
        }
    }
}

bitflags! {
    /// `valid` bitmask of an ATTRS record, v3 layout.
    pub struct AttrFlagsV3: u32 {
        const SIZE = 0x0000_0001;
        const UIDGID = 0x0000_0002;
        const PERMISSIONS = 0x0000_0004;
        const ACMODTIME = 0x0000_0008;
        const EXTENDED = 0x8000_0000;
    }

    /// `valid` bitmask of an ATTRS record, v4+ layout.
    pub struct AttrFlagsV4: u32 {
        const SIZE = 0x0000_0001;
        const PERMISSIONS = 0x0000_0004;
        const ACCESSTIME = 0x0000_0008;
        const CREATETIME = 0x0000_0010;
        const MODIFYTIME = 0x0000_0020;
        const ACL = 0x0000_0040;
        const OWNERGROUP = 0x0000_0080;
        const SUBSECOND_TIMES = 0x0000_0100;
        const BITS = 0x0000_0200;
        const ALLOCATION_SIZE = 0x0000_0400;
        const TEXT_HINT = 0x0000_0800;
        const MIME_TYPE = 0x0000_1000;
        const LINK_COUNT = 0x0000_2000;
        const UNTRANSLATED_NAME = 0x0000_4000;
        const CTIME = 0x0000_8000;
        const EXTENDED = 0x8000_0000;
    }

    /// v3/v4 OPEN `pflags`.
    pub struct PFlags: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const APPEND = 0x0000_0004;
        const CREAT = 0x0000_0008;
        const TRUNC = 0x0000_0010;
        const EXCL = 0x0000_0020;
        const TEXT = 0x0000_0040;
    }

    /// v5/v6 OPEN `desired_access` (a small slice of the ACE4 mask).
    pub struct DesiredAccess: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
    }

    /// v5/v6 OPEN `flags`: low 3 bits are the disposition, the rest are
    /// independent bits.
    pub struct OpenFlags: u32 {
        const CREATE_NEW = 0x0000_0000;
        const CREATE_TRUNCATE = 0x0000_0001;
        const OPEN_EXISTING = 0x0000_0002;
        const OPEN_OR_CREATE = 0x0000_0003;
        const TRUNCATE_EXISTING = 0x0000_0004;
        const DISPOSITION_MASK = 0x0000_0007;
        const APPEND_DATA = 0x0000_0008;
        const APPEND_DATA_ATOMIC = 0x0000_0010;
        const TEXT_MODE = 0x0000_0020;
    }

    /// v5/v6 RENAME flags.
    pub struct RenameFlags: u32 {
        const OVERWRITE = 0x0000_0001;
        const ATOMIC = 0x0000_0002;
        const NATIVE = 0x0000_0004;
    }
}

/// File type, present from v4 onward (v3 infers it from `permissions`).
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    REGULAR = 1,
    DIRECTORY = 2,
    SYMLINK = 3,
    SPECIAL = 4,
    UNKNOWN = 5,
    SOCKET = 6,
    CHAR_DEVICE = 7,
    BLOCK_DEVICE = 8,
    FIFO = 9,
}

impl FileType {
    /// Infer a v3-style file type from the low bits of `st_mode`.
    pub fn from_permissions(perm: u32) -> Self {
        const S_IFMT: u32 = 0o170000;
        match perm & S_IFMT {
            0o040000 => Self::DIRECTORY,
            0o120000 => Self::SYMLINK,
            0o140000 => Self::SOCKET,
            0o020000 => Self::CHAR_DEVICE,
            0o060000 => Self::BLOCK_DEVICE,
            0o010000 => Self::FIFO,
            0o100000 => Self::REGULAR,
            0 => Self::UNKNOWN,
            _ => Self::SPECIAL,
        }
    }
}
