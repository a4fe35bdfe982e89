//! Operation layer (C5): one method per logical remote-filesystem
//! operation, plus the v5/v6 -> v3/v4 emulation rules for OPEN, RENAME,
//! and LINK/SYMLINK (spec.md §4.5).
use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::attrs::Attrs;
use crate::proto::{DesiredAccess, MsgType, OpenFlags, PFlags, RenameFlags};
use crate::session::{SftpError, Session};
use crate::wire;

/// An opaque server-issued token naming an open file or directory
/// (spec.md §3 "Handle"). Owned by whoever received it from OPEN/OPENDIR
/// until CLOSE succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle(pub Vec<u8>);

/// One entry of a READDIR response.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub filename: String,
    /// `ls -l`-style rendered line, sent alongside the filename in v3.
    pub longname: Option<String>,
    pub attrs: Attrs,
}

/// Reply to the `space-available` extended request.
#[derive(Debug, Clone, Copy)]
pub struct SpaceAvailable {
    pub bytes_on_device: u64,
    pub unused_bytes_on_device: u64,
    pub bytes_available_to_user: u64,
    pub unused_bytes_available_to_user: u64,
    pub bytes_per_allocation_unit: u32,
}

/// The caller's intent for OPEN, expressed in the v5/v6 access+flags
/// vocabulary regardless of the negotiated protocol version; `Session::open`
/// emulates it down to v3/v4 `pflags` when needed.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest {
    pub desired_access: DesiredAccess,
    pub flags: OpenFlags,
}

impl Default for OpenRequest {
    fn default() -> Self {
        Self {
            desired_access: DesiredAccess::empty(),
            flags: OpenFlags::empty(),
        }
    }
}

impl OpenRequest {
    pub fn read_existing() -> Self {
        Self {
            desired_access: DesiredAccess::READ_DATA | DesiredAccess::READ_ATTRIBUTES,
            flags: OpenFlags::OPEN_EXISTING,
        }
    }

    pub fn write_create_truncate() -> Self {
        Self {
            desired_access: DesiredAccess::WRITE_DATA | DesiredAccess::WRITE_ATTRIBUTES,
            flags: OpenFlags::CREATE_TRUNCATE,
        }
    }

    pub fn with_text_mode(mut self) -> Self {
        self.flags |= OpenFlags::TEXT_MODE;
        self
    }
}

/// Translate a v5/v6 OPEN request into v3/v4 `pflags`, per spec.md §4.5's
/// "OPEN emulation" table. Returns `EmulationError` for anything the
/// narrower protocol cannot express.
fn emulate_open_pflags(req: OpenRequest, protocol_version: u32) -> Result<PFlags, SftpError> {
    let mut pflags = PFlags::empty();
    if req.desired_access.contains(DesiredAccess::READ_DATA) {
        pflags |= PFlags::READ;
    }
    if req.desired_access.contains(DesiredAccess::WRITE_DATA) {
        pflags |= PFlags::WRITE;
    }
    match req.flags & OpenFlags::DISPOSITION_MASK {
        OpenFlags::CREATE_NEW => pflags |= PFlags::CREAT | PFlags::EXCL,
        OpenFlags::CREATE_TRUNCATE => pflags |= PFlags::CREAT | PFlags::TRUNC,
        OpenFlags::OPEN_OR_CREATE => pflags |= PFlags::CREAT,
        OpenFlags::OPEN_EXISTING => {}
        OpenFlags::TRUNCATE_EXISTING => {
            return Err(SftpError::EmulationError(
                "TRUNCATE_EXISTING cannot be emulated in protocol 3/4".into(),
            ))
        }
        other => {
            return Err(SftpError::EmulationError(format!(
                "unknown open disposition {:#x}",
                other.bits()
            )))
        }
    }
    if req
        .flags
        .intersects(OpenFlags::APPEND_DATA | OpenFlags::APPEND_DATA_ATOMIC)
    {
        pflags |= PFlags::APPEND;
    }
    if req.flags.contains(OpenFlags::TEXT_MODE) {
        if protocol_version < 4 {
            return Err(SftpError::EmulationError(format!(
                "TEXT_MODE cannot be emulated in protocol {protocol_version}"
            )));
        }
        pflags |= PFlags::TEXT;
    }
    let known = OpenFlags::DISPOSITION_MASK
        | OpenFlags::APPEND_DATA
        | OpenFlags::APPEND_DATA_ATOMIC
        | OpenFlags::TEXT_MODE;
    if !(req.flags & !known).is_empty() {
        return Err(SftpError::EmulationError(format!(
            "unemulatable open flags {:#x}",
            req.flags.bits()
        )));
    }
    Ok(pflags)
}

impl Session {
    fn next_id(&self) -> u32 {
        self.engine.alloc_id()
    }

    /// REALPATH: canonicalize `path` on the server.
    pub fn realpath(&self, path: &str) -> Result<String, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path))
            .expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::REALPATH, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::NAME), id)?;
        let mut r = resp.reader();
        let count = r
            .read_u32::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated NAME count: {e}")))?;
        if count != 1 {
            return Err(SftpError::ProtocolFatal(format!(
                "expected exactly 1 NAME entry from REALPATH, got {count}"
            )));
        }
        wire::read_path(&mut r).map_err(|e| SftpError::ProtocolFatal(e.to_string()))
    }

    fn stat_impl(&self, msg: MsgType, path: &str, follow_symlink_flags: bool) -> Result<Attrs, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        if self.protocol_version >= 4 && follow_symlink_flags {
            payload
                .write_u32::<BE>(0xFFFF_FFFF)
                .expect("writing to a Vec cannot fail");
        }
        self.engine.send(msg, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::ATTRS), id)?;
        let mut r = resp.reader();
        self.attr_codec
            .parse(&mut r)
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated ATTRS: {e}")))
    }

    /// STAT: attributes of `path`, following a final symlink.
    pub fn stat(&self, path: &str) -> Result<Attrs, SftpError> {
        self.stat_impl(MsgType::STAT, path, true)
    }

    /// LSTAT: attributes of `path`, without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<Attrs, SftpError> {
        self.stat_impl(MsgType::LSTAT, path, true)
    }

    /// FSTAT: attributes of an already-open handle.
    pub fn fstat(&self, handle: &Handle) -> Result<Attrs, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        if self.protocol_version >= 4 {
            payload
                .write_u32::<BE>(0xFFFF_FFFF)
                .expect("writing to a Vec cannot fail");
        }
        self.engine.send(MsgType::FSTAT, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::ATTRS), id)?;
        let mut r = resp.reader();
        self.attr_codec
            .parse(&mut r)
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated ATTRS: {e}")))
    }

    /// OPEN: translate `req` to the negotiated protocol's wire shape and
    /// return the resulting handle.
    pub fn open(&self, path: &str, req: OpenRequest, attrs: &Attrs) -> Result<Handle, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        if self.protocol_version >= 5 {
            payload
                .write_u32::<BE>(req.desired_access.bits())
                .expect("writing to a Vec cannot fail");
            payload
                .write_u32::<BE>(req.flags.bits())
                .expect("writing to a Vec cannot fail");
        } else {
            let pflags = emulate_open_pflags(req, self.protocol_version)?;
            payload
                .write_u32::<BE>(pflags.bits())
                .expect("writing to a Vec cannot fail");
        }
        self.attr_codec
            .emit(attrs, &mut payload)
            .expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::OPEN, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::HANDLE), id)?;
        let data = wire::read_bytes(&mut resp.reader())
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated HANDLE: {e}")))?;
        Ok(Handle(data))
    }

    /// OPENDIR: open `path` for READDIR.
    pub fn opendir(&self, path: &str) -> Result<Handle, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::OPENDIR, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::HANDLE), id)?;
        let data = wire::read_bytes(&mut resp.reader())
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated HANDLE: {e}")))?;
        Ok(Handle(data))
    }

    /// READDIR: one batch of directory entries, or `None` at EOF.
    pub fn readdir(&self, handle: &Handle) -> Result<Option<Vec<DirEntry>>, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::READDIR, id, &payload)?;
        let resp = self.engine.recv(None, id)?;
        if resp.kind == MsgType::STATUS {
            let status = crate::request::RequestEngine::parse_status(&resp.body)?;
            if status.code.is_eof() {
                return Ok(None);
            }
            return Err(SftpError::RemoteError {
                code: status.code,
                message: status.message,
            });
        }
        if resp.kind != MsgType::NAME {
            return Err(SftpError::ProtocolFatal(format!(
                "expected NAME or STATUS from READDIR, got {:?}",
                resp.kind
            )));
        }
        let mut r = resp.reader();
        let count = r
            .read_u32::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated NAME count: {e}")))?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let filename = wire::read_path(&mut r).map_err(|e| SftpError::ProtocolFatal(e.to_string()))?;
            let longname = if self.protocol_version == 3 {
                Some(wire::read_path(&mut r).map_err(|e| SftpError::ProtocolFatal(e.to_string()))?)
            } else {
                None
            };
            let attrs = self
                .attr_codec
                .parse(&mut r)
                .map_err(|e| SftpError::ProtocolFatal(format!("truncated ATTRS in NAME: {e}")))?;
            entries.push(DirEntry {
                filename,
                longname,
                attrs,
            });
        }
        Ok(Some(entries))
    }

    /// CLOSE: release a handle. Always called on every exit path that
    /// opened one (spec.md §3 "Handle").
    pub fn close(&self, handle: &Handle) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::CLOSE, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// READ: one chunk of data, or `None` at EOF (used directly only
    /// outside the pipelined transfer engine, e.g. tests).
    pub fn read(&self, handle: &Handle, offset: u64, len: u32) -> Result<Option<Vec<u8>>, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        payload.write_u64::<BE>(offset).expect("writing to a Vec cannot fail");
        payload.write_u32::<BE>(len).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::READ, id, &payload)?;
        let resp = self.engine.recv(None, id)?;
        if resp.kind == MsgType::STATUS {
            let status = crate::request::RequestEngine::parse_status(&resp.body)?;
            if status.code.is_eof() {
                return Ok(None);
            }
            return Err(SftpError::RemoteError {
                code: status.code,
                message: status.message,
            });
        }
        if resp.kind != MsgType::DATA {
            return Err(SftpError::ProtocolFatal(format!(
                "expected DATA or STATUS from READ, got {:?}",
                resp.kind
            )));
        }
        let data = wire::read_bytes(&mut resp.reader())
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated DATA: {e}")))?;
        Ok(Some(data))
    }

    /// WRITE: one chunk of data at `offset`.
    pub fn write(&self, handle: &Handle, offset: u64, data: &[u8]) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        payload.write_u64::<BE>(offset).expect("writing to a Vec cannot fail");
        wire::write_bytes(&mut payload, data).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::WRITE, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// SETSTAT: apply `attrs` to `path`.
    pub fn setstat(&self, path: &str, attrs: &Attrs) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.attr_codec
            .emit(attrs, &mut payload)
            .expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::SETSTAT, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// FSETSTAT: apply `attrs` to an open handle.
    pub fn fsetstat(&self, handle: &Handle, attrs: &Attrs) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
        self.attr_codec
            .emit(attrs, &mut payload)
            .expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::FSETSTAT, id, &payload)?;
        self.engine.recv_status(id)
    }

    fn path_only_op(&self, msg: MsgType, path: &str) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.engine.send(msg, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// REMOVE: delete a regular file.
    pub fn remove(&self, path: &str) -> Result<(), SftpError> {
        self.path_only_op(MsgType::REMOVE, path)
    }

    /// RMDIR: delete an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.path_only_op(MsgType::RMDIR, path)
    }

    /// MKDIR: create a directory with the given attributes (usually just
    /// permissions).
    pub fn mkdir(&self, path: &str, attrs: &Attrs) -> Result<(), SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.attr_codec
            .emit(attrs, &mut payload)
            .expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::MKDIR, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// RENAME, honoring the v≤4 "implicitly atomic, no overwrite" rule
    /// (spec.md §4.5).
    pub fn rename(&self, old: &str, new: &str, flags: RenameFlags) -> Result<(), SftpError> {
        if self.protocol_version <= 4 && !(flags & !RenameFlags::ATOMIC).is_empty() {
            return Err(SftpError::EmulationError(format!(
                "cannot emulate rename flags {:#x} in protocol {}",
                flags.bits(),
                self.protocol_version
            )));
        }
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(old)).expect("writing to a Vec cannot fail");
        wire::write_path(&mut payload, &self.resolve(new)).expect("writing to a Vec cannot fail");
        if self.protocol_version >= 5 {
            payload.write_u32::<BE>(flags.bits()).expect("writing to a Vec cannot fail");
        }
        self.engine.send(MsgType::RENAME, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// LINK (v≥6) or SYMLINK (v≤5). `is_symlink = false` requires v≥6.
    /// Applies the `quirk_reverse_symlink` operand swap for v3 servers that
    /// implemented SYMLINK's argument order backwards (spec.md §4.5).
    pub fn link(&self, target: &str, linkpath: &str, is_symlink: bool) -> Result<(), SftpError> {
        if self.protocol_version < 6 && !is_symlink {
            return Err(SftpError::EmulationError(format!(
                "hard links require protocol 6, negotiated protocol is {}",
                self.protocol_version
            )));
        }
        let id = self.next_id();
        let mut payload = Vec::new();
        let resolved_link = self.resolve(linkpath);
        let resolved_target = if is_symlink {
            target.to_string()
        } else {
            self.resolve(target)
        };
        if self.options.quirk_reverse_symlink && self.protocol_version == 3 {
            wire::write_path(&mut payload, target).expect("writing to a Vec cannot fail");
            wire::write_path(&mut payload, &resolved_link).expect("writing to a Vec cannot fail");
        } else {
            wire::write_path(&mut payload, &resolved_link).expect("writing to a Vec cannot fail");
            wire::write_path(&mut payload, &resolved_target).expect("writing to a Vec cannot fail");
        }
        let msg = if self.protocol_version >= 6 {
            MsgType::LINK
        } else {
            MsgType::SYMLINK
        };
        if self.protocol_version >= 6 {
            payload.push(u8::from(is_symlink));
        }
        self.engine.send(msg, id, &payload)?;
        self.engine.recv_status(id)
    }

    /// READLINK: the target of a symbolic link.
    pub fn readlink(&self, path: &str) -> Result<String, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::READLINK, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::NAME), id)?;
        let mut r = resp.reader();
        let count = r
            .read_u32::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated NAME count: {e}")))?;
        if count != 1 {
            return Err(SftpError::ProtocolFatal(format!(
                "expected exactly 1 NAME entry from READLINK, got {count}"
            )));
        }
        wire::read_path(&mut r).map_err(|e| SftpError::ProtocolFatal(e.to_string()))
    }

    /// The `space-available` extended request (spec.md §4.5).
    pub fn space_available(&self, path: &str) -> Result<SpaceAvailable, SftpError> {
        let id = self.next_id();
        let mut payload = Vec::new();
        wire::write_string(&mut payload, "space-available").expect("writing to a Vec cannot fail");
        wire::write_path(&mut payload, &self.resolve(path)).expect("writing to a Vec cannot fail");
        self.engine.send(MsgType::EXTENDED, id, &payload)?;
        let resp = self.engine.recv(Some(MsgType::EXTENDED_REPLY), id)?;
        let mut r = resp.reader();
        let bytes_on_device = r
            .read_u64::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(format!("truncated space-available reply: {e}")))?;
        let unused_bytes_on_device = r
            .read_u64::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(e.to_string()))?;
        let bytes_available_to_user = r
            .read_u64::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(e.to_string()))?;
        let unused_bytes_available_to_user = r
            .read_u64::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(e.to_string()))?;
        let bytes_per_allocation_unit = r
            .read_u32::<BE>()
            .map_err(|e| SftpError::ProtocolFatal(e.to_string()))?;
        Ok(SpaceAvailable {
            bytes_on_device,
            unused_bytes_on_device,
            bytes_available_to_user,
            unused_bytes_available_to_user,
            bytes_per_allocation_unit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulate_open_create_new() {
        let req = OpenRequest {
            desired_access: DesiredAccess::READ_DATA,
            flags: OpenFlags::CREATE_NEW,
        };
        let pflags = emulate_open_pflags(req, 3).unwrap();
        assert!(pflags.contains(PFlags::READ | PFlags::CREAT | PFlags::EXCL));
    }

    #[test]
    fn emulate_open_truncate_existing_fails() {
        let req = OpenRequest {
            desired_access: DesiredAccess::WRITE_DATA,
            flags: OpenFlags::TRUNCATE_EXISTING,
        };
        assert!(matches!(
            emulate_open_pflags(req, 3),
            Err(SftpError::EmulationError(_))
        ));
    }

    #[test]
    fn emulate_open_text_mode_fails_on_v3() {
        let req = OpenRequest {
            desired_access: DesiredAccess::READ_DATA,
            flags: OpenFlags::OPEN_EXISTING | OpenFlags::TEXT_MODE,
        };
        assert!(matches!(
            emulate_open_pflags(req, 3),
            Err(SftpError::EmulationError(_))
        ));
    }

    #[test]
    fn emulate_open_text_mode_ok_on_v4() {
        let req = OpenRequest {
            desired_access: DesiredAccess::READ_DATA,
            flags: OpenFlags::OPEN_EXISTING | OpenFlags::TEXT_MODE,
        };
        let pflags = emulate_open_pflags(req, 4).unwrap();
        assert!(pflags.contains(PFlags::TEXT));
    }

    #[test]
    fn emulate_open_append_atomic_maps_to_append() {
        let req = OpenRequest {
            desired_access: DesiredAccess::WRITE_DATA,
            flags: OpenFlags::OPEN_OR_CREATE | OpenFlags::APPEND_DATA_ATOMIC,
        };
        let pflags = emulate_open_pflags(req, 4).unwrap();
        assert!(pflags.contains(PFlags::APPEND | PFlags::CREAT));
    }
}
