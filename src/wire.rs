//! Primitive wire codec (C1): the u8/u32/u64/string/path building blocks
//! every higher-level message is assembled from.
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::locale;

/// Read a length-prefixed byte string.
pub fn read_bytes<R: Read>(mut r: R) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<BE>()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a length-prefixed byte string.
pub fn write_bytes<W: Write>(mut w: W, data: &[u8]) -> io::Result<()> {
    w.write_u32::<BE>(data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string<R: Read>(r: R) -> io::Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed UTF-8 string.
pub fn write_string<W: Write>(w: W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

/// Read a path: wire bytes are always UTF-8; translate to the local encoding.
pub fn read_path<R: Read>(r: R) -> io::Result<String> {
    let wire = read_string(r)?;
    Ok(locale::from_wire(&wire))
}

/// Write a path: translate from the local encoding to wire UTF-8.
pub fn write_path<W: Write>(w: W, path: &str) -> io::Result<()> {
    write_string(w, &locale::to_wire(path))
}

/// A request/response body has at most `buffer_size + 1024` bytes of
/// headroom (spec.md §4.3); reject absurd frame lengths before allocating.
pub fn check_frame_len(len: u32, ceiling: u32) -> io::Result<()> {
    if len > ceiling {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds ceiling {ceiling}"),
        ));
    }
    Ok(())
}
