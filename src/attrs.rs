//! Attribute codec (C2): the `ATTRS` structure and its four per-version wire
//! encodings. See SPEC_FULL.md §4.2 for the version-by-version field table.
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::proto::{AttrFlagsV3, AttrFlagsV4, FileType};

/// A timestamp: seconds since the epoch, with an optional nanosecond
/// component present only when `SUBSECOND_TIMES` is negotiated (v4+).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Time {
    pub seconds: i64,
    pub nanos: Option<u32>,
}

/// Attributes of a remote file, a superset of every protocol version's
/// `ATTRS` structure. Every field is an `Option`; reading one always goes
/// through the `Option`, which is the Rust expression of "consult `valid`
/// before reading an attribute" (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs {
    pub file_type: Option<FileType>,
    pub size: Option<u64>,
    pub allocation_size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<u32>,
    pub atime: Option<Time>,
    pub createtime: Option<Time>,
    pub mtime: Option<Time>,
    pub ctime: Option<Time>,
    pub attrib_bits: Option<u32>,
    pub link_count: Option<u32>,
    pub symlink_target: Option<String>,
}

impl Attrs {
    /// Attributes describing nothing (an empty `valid` mask).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Attributes carrying only a permission bit pattern, as `chmod` sends.
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Self::default()
        }
    }

    /// True if this looks like a directory, inferring from `file_type` when
    /// present and falling back to the permission bits otherwise.
    pub fn is_directory(&self) -> bool {
        match self.file_type {
            Some(t) => t == FileType::DIRECTORY,
            None => self
                .permissions
                .map(|p| FileType::from_permissions(p) == FileType::DIRECTORY)
                .unwrap_or(false),
        }
    }
}

fn read_time<R: Read>(mut r: R, subsecond: bool) -> io::Result<Time> {
    let seconds = r.read_u32::<BE>()? as i64;
    let nanos = if subsecond {
        Some(r.read_u32::<BE>()?)
    } else {
        None
    };
    Ok(Time { seconds, nanos })
}

fn write_time<W: Write>(mut w: W, t: Time, subsecond: bool) -> io::Result<()> {
    w.write_u32::<BE>(t.seconds as u32)?;
    if subsecond {
        w.write_u32::<BE>(t.nanos.unwrap_or(0))?;
    }
    Ok(())
}

/// The four per-version attribute encodings, resolved once at negotiation
/// (spec.md §9 "protocol-version polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrCodec {
    V3,
    V4,
    V5,
    V6,
}

impl AttrCodec {
    pub fn for_version(version: u32) -> Self {
        match version {
            3 => Self::V3,
            4 => Self::V4,
            5 => Self::V5,
            _ => Self::V6,
        }
    }

    pub fn parse<R: Read>(self, r: &mut R) -> io::Result<Attrs> {
        match self {
            Self::V3 => self.parse_v3(r),
            Self::V4 => self.parse_v4_plus(r, false, false),
            Self::V5 => self.parse_v4_plus(r, true, false),
            Self::V6 => self.parse_v4_plus(r, true, true),
        }
    }

    pub fn emit<W: Write>(self, attrs: &Attrs, w: &mut W) -> io::Result<()> {
        match self {
            Self::V3 => self.emit_v3(attrs, w),
            Self::V4 => self.emit_v4_plus(attrs, w, false, false),
            Self::V5 => self.emit_v4_plus(attrs, w, true, false),
            Self::V6 => self.emit_v4_plus(attrs, w, true, true),
        }
    }

    fn parse_v3<R: Read>(self, r: &mut R) -> io::Result<Attrs> {
        let valid = AttrFlagsV3::from_bits_truncate(r.read_u32::<BE>()?);
        let mut a = Attrs::empty();
        if valid.contains(AttrFlagsV3::SIZE) {
            a.size = Some(r.read_u64::<BE>()?);
        }
        if valid.contains(AttrFlagsV3::UIDGID) {
            a.uid = Some(r.read_u32::<BE>()?);
            a.gid = Some(r.read_u32::<BE>()?);
        }
        if valid.contains(AttrFlagsV3::PERMISSIONS) {
            let perm = r.read_u32::<BE>()?;
            a.permissions = Some(perm);
            a.file_type = Some(FileType::from_permissions(perm));
        }
        if valid.contains(AttrFlagsV3::ACMODTIME) {
            a.atime = Some(read_time(&mut *r, false)?);
            a.mtime = Some(read_time(&mut *r, false)?);
        }
        if valid.contains(AttrFlagsV3::EXTENDED) {
            skip_extended(r)?;
        }
        Ok(a)
    }

    fn emit_v3<W: Write>(self, a: &Attrs, w: &mut W) -> io::Result<()> {
        let mut valid = AttrFlagsV3::empty();
        if a.size.is_some() {
            valid |= AttrFlagsV3::SIZE;
        }
        if a.uid.is_some() && a.gid.is_some() {
            valid |= AttrFlagsV3::UIDGID;
        }
        if a.permissions.is_some() {
            valid |= AttrFlagsV3::PERMISSIONS;
        }
        if a.atime.is_some() && a.mtime.is_some() {
            valid |= AttrFlagsV3::ACMODTIME;
        }
        w.write_u32::<BE>(valid.bits())?;
        if let Some(size) = a.size {
            w.write_u64::<BE>(size)?;
        }
        if let (Some(uid), Some(gid)) = (a.uid, a.gid) {
            w.write_u32::<BE>(uid)?;
            w.write_u32::<BE>(gid)?;
        }
        if let Some(perm) = a.permissions {
            w.write_u32::<BE>(perm)?;
        }
        if let (Some(atime), Some(mtime)) = (a.atime, a.mtime) {
            write_time(&mut *w, atime, false)?;
            write_time(&mut *w, mtime, false)?;
        }
        Ok(())
    }

    fn parse_v4_plus<R: Read>(self, r: &mut R, has_v5_fields: bool, has_ctime: bool) -> io::Result<Attrs> {
        let valid = AttrFlagsV4::from_bits_truncate(r.read_u32::<BE>()?);
        let mut a = Attrs::empty();
        let type_byte = r.read_u8()?;
        a.file_type = FileType::try_from(type_byte).ok();
        if valid.contains(AttrFlagsV4::SIZE) {
            a.size = Some(r.read_u64::<BE>()?);
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::ALLOCATION_SIZE) {
            a.allocation_size = Some(r.read_u64::<BE>()?);
        }
        if valid.contains(AttrFlagsV4::OWNERGROUP) {
            a.owner = Some(crate::wire::read_string(&mut *r)?);
            a.group = Some(crate::wire::read_string(&mut *r)?);
        }
        if valid.contains(AttrFlagsV4::PERMISSIONS) {
            a.permissions = Some(r.read_u32::<BE>()?);
        }
        let subsecond = valid.contains(AttrFlagsV4::SUBSECOND_TIMES);
        if valid.contains(AttrFlagsV4::ACCESSTIME) {
            a.atime = Some(read_time(&mut *r, subsecond)?);
        }
        if valid.contains(AttrFlagsV4::CREATETIME) {
            a.createtime = Some(read_time(&mut *r, subsecond)?);
        }
        if valid.contains(AttrFlagsV4::MODIFYTIME) {
            a.mtime = Some(read_time(&mut *r, subsecond)?);
        }
        if has_ctime && valid.contains(AttrFlagsV4::CTIME) {
            a.ctime = Some(read_time(&mut *r, subsecond)?);
        }
        if valid.contains(AttrFlagsV4::ACL) {
            // Raw ACL blob: not modeled, but must be consumed to stay framed.
            let _ = crate::wire::read_bytes(&mut *r)?;
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::BITS) {
            a.attrib_bits = Some(r.read_u32::<BE>()?);
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::TEXT_HINT) {
            let _ = r.read_u8()?;
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::MIME_TYPE) {
            let _ = crate::wire::read_string(&mut *r)?;
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::LINK_COUNT) {
            a.link_count = Some(r.read_u32::<BE>()?);
        }
        if has_v5_fields && valid.contains(AttrFlagsV4::UNTRANSLATED_NAME) {
            let _ = crate::wire::read_string(&mut *r)?;
        }
        if valid.contains(AttrFlagsV4::EXTENDED) {
            skip_extended(r)?;
        }
        Ok(a)
    }

    fn emit_v4_plus<W: Write>(
        self,
        a: &Attrs,
        w: &mut W,
        has_v5_fields: bool,
        has_ctime: bool,
    ) -> io::Result<()> {
        let mut valid = AttrFlagsV4::empty();
        if a.size.is_some() {
            valid |= AttrFlagsV4::SIZE;
        }
        if has_v5_fields && a.allocation_size.is_some() {
            valid |= AttrFlagsV4::ALLOCATION_SIZE;
        }
        if a.owner.is_some() && a.group.is_some() {
            valid |= AttrFlagsV4::OWNERGROUP;
        }
        if a.permissions.is_some() {
            valid |= AttrFlagsV4::PERMISSIONS;
        }
        let subsecond = [a.atime, a.createtime, a.mtime, a.ctime]
            .iter()
            .flatten()
            .any(|t| t.nanos.is_some());
        if subsecond {
            valid |= AttrFlagsV4::SUBSECOND_TIMES;
        }
        if a.atime.is_some() {
            valid |= AttrFlagsV4::ACCESSTIME;
        }
        if a.createtime.is_some() {
            valid |= AttrFlagsV4::CREATETIME;
        }
        if a.mtime.is_some() {
            valid |= AttrFlagsV4::MODIFYTIME;
        }
        if has_ctime && a.ctime.is_some() {
            valid |= AttrFlagsV4::CTIME;
        }
        if has_v5_fields && a.attrib_bits.is_some() {
            valid |= AttrFlagsV4::BITS;
        }
        if has_v5_fields && a.link_count.is_some() {
            valid |= AttrFlagsV4::LINK_COUNT;
        }
        w.write_u32::<BE>(valid.bits())?;
        w.write_u8(a.file_type.map(u8::from).unwrap_or(u8::from(FileType::UNKNOWN)))?;
        if let Some(size) = a.size {
            w.write_u64::<BE>(size)?;
        }
        if has_v5_fields {
            if let Some(alloc) = a.allocation_size {
                w.write_u64::<BE>(alloc)?;
            }
        }
        if let (Some(owner), Some(group)) = (&a.owner, &a.group) {
            crate::wire::write_string(&mut *w, owner)?;
            crate::wire::write_string(&mut *w, group)?;
        }
        if let Some(perm) = a.permissions {
            w.write_u32::<BE>(perm)?;
        }
        if let Some(t) = a.atime {
            write_time(&mut *w, t, subsecond)?;
        }
        if let Some(t) = a.createtime {
            write_time(&mut *w, t, subsecond)?;
        }
        if let Some(t) = a.mtime {
            write_time(&mut *w, t, subsecond)?;
        }
        if has_ctime {
            if let Some(t) = a.ctime {
                write_time(&mut *w, t, subsecond)?;
            }
        }
        if has_v5_fields {
            if let Some(bits) = a.attrib_bits {
                w.write_u32::<BE>(bits)?;
            }
            if let Some(count) = a.link_count {
                w.write_u32::<BE>(count)?;
            }
        }
        Ok(())
    }
}

fn skip_extended<R: Read>(r: &mut R) -> io::Result<()> {
    let count = r.read_u32::<BE>()?;
    for _ in 0..count {
        let _ = crate::wire::read_bytes(&mut *r)?;
        let _ = crate::wire::read_bytes(&mut *r)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: AttrCodec, a: &Attrs) -> Attrs {
        let mut buf = Vec::new();
        codec.emit(a, &mut buf).unwrap();
        codec.parse(&mut &buf[..]).unwrap()
    }

    #[test]
    fn v3_size_and_permissions_roundtrip() {
        let a = Attrs {
            size: Some(4096),
            permissions: Some(0o100644),
            uid: Some(1000),
            gid: Some(1000),
            ..Attrs::empty()
        };
        let got = roundtrip(AttrCodec::V3, &a);
        assert_eq!(got.size, Some(4096));
        assert_eq!(got.permissions, Some(0o100644));
        assert_eq!(got.uid, Some(1000));
        assert_eq!(got.gid, Some(1000));
        assert_eq!(got.file_type, Some(FileType::REGULAR));
    }

    #[test]
    fn v4_owner_group_roundtrip() {
        let a = Attrs {
            size: Some(10),
            owner: Some("alice".into()),
            group: Some("staff".into()),
            mtime: Some(Time {
                seconds: 1_700_000_000,
                nanos: None,
            }),
            ..Attrs::empty()
        };
        let got = roundtrip(AttrCodec::V4, &a);
        assert_eq!(got.owner.as_deref(), Some("alice"));
        assert_eq!(got.group.as_deref(), Some("staff"));
        assert_eq!(got.mtime.unwrap().seconds, 1_700_000_000);
    }

    #[test]
    fn v6_subsecond_times_and_link_count_roundtrip() {
        let a = Attrs {
            mtime: Some(Time {
                seconds: 5,
                nanos: Some(123),
            }),
            ctime: Some(Time {
                seconds: 6,
                nanos: Some(456),
            }),
            link_count: Some(3),
            attrib_bits: Some(0xABCD),
            ..Attrs::empty()
        };
        let got = roundtrip(AttrCodec::V6, &a);
        assert_eq!(got.mtime.unwrap().nanos, Some(123));
        assert_eq!(got.ctime.unwrap().nanos, Some(456));
        assert_eq!(got.link_count, Some(3));
        assert_eq!(got.attrib_bits, Some(0xABCD));
    }

    #[test]
    fn empty_attrs_roundtrip_every_version() {
        for codec in [AttrCodec::V3, AttrCodec::V4, AttrCodec::V5, AttrCodec::V6] {
            let got = roundtrip(codec, &Attrs::empty());
            assert_eq!(got.size, None);
            assert_eq!(got.permissions, None);
        }
    }

    #[test]
    fn is_directory_from_file_type() {
        let a = Attrs {
            file_type: Some(FileType::DIRECTORY),
            ..Attrs::empty()
        };
        assert!(a.is_directory());
    }

    #[test]
    fn is_directory_falls_back_to_permissions() {
        let a = Attrs {
            permissions: Some(0o040755),
            ..Attrs::empty()
        };
        assert!(a.is_directory());
    }
}
