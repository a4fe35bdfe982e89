//! Request engine (C4): id allocation, framed send/receive, and STATUS
//! decoding. This is the one place that turns "what's on the wire" into
//! "what the operation layer asked for, or why not."
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{trace, warn};

use crate::proto::{MsgType, StatusCode};
use crate::session::SftpError;
use crate::transport::FramedTransport;
use crate::wire;

/// A parsed, not-yet-consumed response frame: the opcode, the id (0 for
/// VERSION, which has none), and the bytes following the id.
pub struct Response {
    pub kind: MsgType,
    pub id: u32,
    pub body: Vec<u8>,
}

impl Response {
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.body)
    }
}

/// Decoded STATUS payload (`u32 code · string message · string lang`).
#[derive(Debug, Clone)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub lang: String,
}

impl Status {
    fn parse(body: &[u8]) -> Result<Self, SftpError> {
        let mut r = Cursor::new(body);
        let code = r
            .read_u32::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated STATUS: {e}")))?;
        let message = wire::read_string(&mut r)
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated STATUS message: {e}")))?;
        let lang = wire::read_string(&mut r)
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated STATUS lang: {e}")))?;
        Ok(Status {
            code: StatusCode::from_wire(code),
            message,
            lang,
        })
    }
}

/// Allocates request ids, frames requests, and matches one response per
/// call to `recv`. Shared across the main thread and the transfer engine's
/// driver/reaper threads via `Arc`.
pub struct RequestEngine {
    transport: Arc<FramedTransport>,
    next_id: AtomicU32,
}

impl RequestEngine {
    pub fn new(transport: Arc<FramedTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next request id, skipping 0 (reserved for "no id") on
    /// wraparound (spec.md §4.4).
    pub fn alloc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // we just handed out 0; the fetch_add already advanced past it
        }
    }

    /// Send `INIT(client_version)`: the one frame with neither an opcode id
    /// nor any other payload shape.
    pub fn send_init(&self, client_version: u32) -> Result<(), SftpError> {
        let mut frame = Vec::with_capacity(5);
        frame.push(u8::from(MsgType::INIT));
        frame
            .write_u32::<BE>(client_version)
            .expect("writing to a Vec cannot fail");
        self.transport
            .write_frame(&frame)
            .map_err(|e| SftpError::TransportFatal(e.to_string()))
    }

    /// Send a typed request: `u8 kind · u32 id · payload`.
    pub fn send(&self, kind: MsgType, id: u32, payload: &[u8]) -> Result<(), SftpError> {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(u8::from(kind));
        frame
            .write_u32::<BE>(id)
            .expect("writing to a Vec cannot fail");
        frame.extend_from_slice(payload);
        trace!("-> {:?} id={id} ({} byte payload)", kind, payload.len());
        self.transport
            .write_frame(&frame)
            .map_err(|e| SftpError::TransportFatal(e.to_string()))
    }

    /// Block for one full frame and parse its opcode/id header.
    fn recv_raw(&self) -> Result<Response, SftpError> {
        let raw = self
            .transport
            .read_frame()
            .map_err(|e| SftpError::TransportFatal(e.to_string()))?;
        let mut r = Cursor::new(&raw[..]);
        let kind_byte = r
            .read_u8()
            .map_err(|e| SftpError::ProtocolFatal(format!("empty frame: {e}")))?;
        let kind = MsgType::try_from(kind_byte)
            .map_err(|_| SftpError::ProtocolFatal(format!("unknown opcode {kind_byte}")))?;
        let id = if kind == MsgType::VERSION {
            0
        } else {
            r.read_u32::<BE>()
                .map_err(|e| SftpError::ProtocolFatal(format!("truncated id: {e}")))?
        };
        let body = raw[r.position() as usize..].to_vec();
        trace!("<- {:?} id={id} ({} byte body)", kind, body.len());
        Ok(Response { kind, id, body })
    }

    /// Receive exactly one response and validate it against what the caller
    /// expected (spec.md §4.4). `expected_kind = None` accepts any kind
    /// (used by the transfer engine's reaper, which demultiplexes by id
    /// instead).
    pub fn recv(
        &self,
        expected_kind: Option<MsgType>,
        expected_id: u32,
    ) -> Result<Response, SftpError> {
        let resp = self.recv_raw()?;
        if expected_id != 0 && resp.id != expected_id {
            return Err(SftpError::ProtocolFatal(format!(
                "response id {} does not match expected id {expected_id}",
                resp.id
            )));
        }
        if let Some(expected) = expected_kind {
            if resp.kind != expected {
                if resp.kind == MsgType::STATUS {
                    let status = Status::parse(&resp.body)?;
                    if status.code.is_ok() {
                        return Err(SftpError::ProtocolFatal(format!(
                            "got STATUS=OK where {expected:?} was expected"
                        )));
                    }
                    warn!("remote error on id {}: {}", resp.id, status.message);
                    return Err(SftpError::RemoteError {
                        code: status.code,
                        message: status.message,
                    });
                }
                return Err(SftpError::ProtocolFatal(format!(
                    "expected {expected:?}, got {:?}",
                    resp.kind
                )));
            }
        }
        Ok(resp)
    }

    /// Convenience for operations whose only possible reply is STATUS:
    /// returns `Ok(())` on `FX_OK`, `RemoteError` otherwise.
    pub fn recv_status(&self, expected_id: u32) -> Result<(), SftpError> {
        let resp = self.recv(Some(MsgType::STATUS), expected_id)?;
        let status = Status::parse(&resp.body)?;
        if status.code.is_ok() {
            Ok(())
        } else {
            Err(SftpError::RemoteError {
                code: status.code,
                message: status.message,
            })
        }
    }

    /// Parse a STATUS body the caller already knows is the expected kind
    /// (used by the transfer engine, which dispatches by id before it knows
    /// whether the opcode is DATA or STATUS).
    pub fn parse_status(body: &[u8]) -> Result<Status, SftpError> {
        Status::parse(body)
    }
}
