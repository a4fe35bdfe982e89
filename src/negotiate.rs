//! Version negotiator (C7): send INIT, parse VERSION plus its extension
//! records, and resolve the protocol table the rest of the session runs
//! against.
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{ReadBytesExt, BE};
use log::{debug, warn};

use crate::proto::{MsgType, MAX_VERSION, MIN_VERSION};
use crate::request::RequestEngine;
use crate::session::{ServerIdentity, SftpError};
use crate::wire;

/// Everything the negotiator learned, before a `Session` is built from it.
pub struct Negotiated {
    pub protocol_version: u32,
    pub newline: Vec<u8>,
    pub server_identity: Option<ServerIdentity>,
}

/// Default line terminator, per spec.md §3, used until the server sends a
/// `newline` extension record.
const DEFAULT_NEWLINE: &[u8] = b"\r\n";

/// True if `needle` has a proper self-overlap, i.e. a nonempty proper
/// prefix of it is also a suffix of it. The streaming newline translator
/// (transfer.rs) relies on this being false.
fn has_self_overlap(needle: &[u8]) -> bool {
    for len in 1..needle.len() {
        if needle[..len] == needle[needle.len() - len..] {
            return true;
        }
    }
    false
}

/// Send `INIT(client_version)` and negotiate down to a mutually supported
/// protocol version, applying the `newline`/`vendor-id`/`versions`
/// extensions the server may send back (spec.md §4.7).
pub fn negotiate(engine: &Arc<RequestEngine>, client_version: u32, min_buffer_size: u32) -> Result<(Negotiated, u32), SftpError> {
    engine.send_init(client_version)?;
    let resp = engine.recv(Some(MsgType::VERSION), 0)?;
    let mut r = resp.reader();
    let server_version = r
        .read_u32::<BE>()
        .map_err(|e| SftpError::ProtocolFatal(format!("truncated VERSION: {e}")))?;
    let negotiated_version = client_version.min(server_version);
    if !(MIN_VERSION..=MAX_VERSION).contains(&negotiated_version) {
        return Err(SftpError::ProtocolFatal(format!(
            "server wanted protocol version {server_version}, which is unsupported"
        )));
    }
    debug!("negotiated protocol version {negotiated_version} (server offered {server_version})");

    let mut newline = DEFAULT_NEWLINE.to_vec();
    let mut server_identity = None;
    loop {
        let name = match wire::read_string(&mut r) {
            Ok(n) => n,
            Err(_) => break,
        };
        let data = wire::read_bytes(&mut r)
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated extension data: {e}")))?;
        match name.as_str() {
            "newline" => {
                if data.is_empty() {
                    return Err(SftpError::ProtocolFatal(
                        "server sent an empty newline sequence".into(),
                    ));
                }
                newline = data;
            }
            "vendor-id" => {
                let mut xr = Cursor::new(&data[..]);
                let vendor = wire::read_string(&mut xr).unwrap_or_default();
                let name = wire::read_string(&mut xr).unwrap_or_default();
                let version = wire::read_string(&mut xr).unwrap_or_default();
                let build = xr.read_u64::<BE>().unwrap_or(0);
                server_identity = Some(ServerIdentity {
                    vendor,
                    name,
                    version,
                    build,
                });
            }
            "versions" => {
                debug!("server advertises additional versions extension");
            }
            other => {
                warn!("ignoring unknown extension {other}");
            }
        }
    }

    if has_self_overlap(&newline) {
        return Err(SftpError::ProtocolFatal(format!(
            "server newline sequence {newline:?} has a proper self-overlap, which the text-mode translator cannot handle"
        )));
    }

    let buffer_size = min_buffer_size.max(newline.len() as u32);

    Ok((
        Negotiated {
            protocol_version: negotiated_version,
            newline,
            server_identity,
        },
        buffer_size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedTransport;
    use byteorder::WriteBytesExt;
    use std::io::Cursor as IoCursor;

    fn engine_with_input(bytes: Vec<u8>) -> Arc<RequestEngine> {
        let transport = FramedTransport::new(Box::new(IoCursor::new(bytes)), Box::new(Vec::new()), 4096);
        Arc::new(RequestEngine::new(Arc::new(transport)))
    }

    fn version_frame(version: u32, extensions: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(u8::from(MsgType::VERSION));
        body.write_u32::<BE>(version).unwrap();
        for (name, data) in extensions {
            wire::write_string(&mut body, name).unwrap();
            wire::write_bytes(&mut body, data).unwrap();
        }
        let mut frame = Vec::new();
        frame.write_u32::<BE>(body.len() as u32).unwrap();
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn negotiates_min_of_client_and_server_version() {
        let engine = engine_with_input(version_frame(3, &[]));
        let (n, _) = negotiate(&engine, 6, 32768).unwrap();
        assert_eq!(n.protocol_version, 3);
        assert_eq!(n.newline, b"\r\n");
    }

    #[test]
    fn applies_newline_extension() {
        let engine = engine_with_input(version_frame(3, &[("newline", b"\n")]));
        let (n, _) = negotiate(&engine, 6, 32768).unwrap();
        assert_eq!(n.newline, b"\n");
    }

    #[test]
    fn rejects_self_overlapping_newline() {
        let engine = engine_with_input(version_frame(3, &[("newline", b"aa")]));
        assert!(negotiate(&engine, 6, 32768).is_err());
    }

    #[test]
    fn unsupported_server_version_is_fatal() {
        let engine = engine_with_input(version_frame(99, &[]));
        assert!(negotiate(&engine, 6, 32768).is_err());
    }

    #[test]
    fn buffer_size_raised_to_fit_newline() {
        let engine = engine_with_input(version_frame(3, &[("newline", b"\r\n")]));
        let (_, buffer_size) = negotiate(&engine, 6, 1).unwrap();
        assert_eq!(buffer_size, 2);
    }

    #[test]
    fn parses_vendor_id_extension() {
        let mut vendor_data = Vec::new();
        wire::write_string(&mut vendor_data, "Acme").unwrap();
        wire::write_string(&mut vendor_data, "acme-sftp").unwrap();
        wire::write_string(&mut vendor_data, "1.0").unwrap();
        vendor_data.write_u64::<BE>(42).unwrap();
        let engine = engine_with_input(version_frame(3, &[("vendor-id", &vendor_data)]));
        let (n, _) = negotiate(&engine, 6, 32768).unwrap();
        let id = n.server_identity.unwrap();
        assert_eq!(id.vendor, "Acme");
        assert_eq!(id.name, "acme-sftp");
        assert_eq!(id.build, 42);
    }
}
