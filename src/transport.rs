//! Framed transport (C3) and the minimal transport constructors standing in
//! for the "launch a subprocess or open a socket" collaborator (C13).
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, Result, WrapErr};
use log::trace;

use crate::wire;

/// Extra frame-length headroom above the negotiated buffer size, per
/// spec.md §4.3.
const FRAME_HEADROOM: u32 = 1024;

/// Reads and writes whole length-prefixed frames over a pair of byte
/// streams. The write side is serialized with a mutex since the transfer
/// engine issues requests from more than one thread (spec.md §4.3/§5).
///
/// Boxed trait objects let one `Session` speak to either a subprocess's
/// split stdin/stdout or a socket's cloned halves without threading a
/// generic parameter through every component above it.
pub struct FramedTransport {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    frame_ceiling: u32,
}

impl FramedTransport {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        buffer_size: u32,
    ) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            frame_ceiling: buffer_size.saturating_add(FRAME_HEADROOM),
        }
    }

    /// Read one complete frame's payload. A short read anywhere is treated
    /// as a transport-fatal condition by the caller (request engine).
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap();
        let len = reader
            .read_u32::<BE>()
            .wrap_err("reading frame length")?;
        wire::check_frame_len(len, self.frame_ceiling).wrap_err("frame length check")?;
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .wrap_err("reading frame payload")?;
        trace!("read frame of {len} bytes");
        Ok(buf)
    }

    /// Write one complete frame (payload already includes any opcode/id
    /// prefix the caller wants framed).
    pub fn write_frame(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_u32::<BE>(payload.len() as u32)?;
        writer.write_all(payload)?;
        writer.flush()?;
        trace!("wrote frame of {} bytes", payload.len());
        Ok(())
    }
}

/// Either end of a subprocess transport: the process's stdin is our write
/// side, its stdout is our read side.
pub struct SubprocessTransport {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Options controlling how the secure-shell subprocess is invoked
/// (spec.md §6 "Subprocess").
#[derive(Debug, Clone, Default)]
pub struct SubprocessOptions {
    pub program: String,
    pub subsystem: String,
    pub host: String,
    pub user: Option<String>,
    pub config_file: Option<String>,
    pub extra_opts: Vec<String>,
    pub ipv4_only: bool,
    pub ipv6_only: bool,
    pub verbosity: u32,
    pub compress: bool,
}

/// Spawn the configured secure-shell client and hand back its stdio as the
/// two framed streams.
pub fn spawn_subprocess(opts: &SubprocessOptions) -> Result<SubprocessTransport> {
    let mut cmd = Command::new(&opts.program);
    if opts.ipv4_only {
        cmd.arg("-4");
    }
    if opts.ipv6_only {
        cmd.arg("-6");
    }
    if opts.compress {
        cmd.arg("-C");
    }
    if let Some(config) = &opts.config_file {
        cmd.arg("-F").arg(config);
    }
    for opt in &opts.extra_opts {
        cmd.arg("-o").arg(opt);
    }
    for _ in 0..opts.verbosity {
        cmd.arg("-v");
    }
    cmd.arg("-s");
    let target = match &opts.user {
        Some(user) => format!("{}@{}", user, opts.host),
        None => opts.host.clone(),
    };
    cmd.arg(target);
    cmd.arg(&opts.subsystem);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());

    let mut child = cmd
        .spawn()
        .wrap_err_with(|| format!("spawning transport program {}", opts.program))?;
    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    Ok(SubprocessTransport {
        child,
        stdin,
        stdout,
    })
}

/// Address family constraint for `connect_socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Any,
    V4Only,
    V6Only,
}

/// Resolve `host:port` and connect a TCP stream, optionally constrained to
/// one address family (spec.md §6 "Direct socket").
pub fn connect_socket(host: &str, port: u16, family: AddrFamily) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs().wrap_err("resolving host")? {
        let ok = match family {
            AddrFamily::Any => true,
            AddrFamily::V4Only => addr.is_ipv4(),
            AddrFamily::V6Only => addr.is_ipv6(),
        };
        if !ok {
            continue;
        }
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).wrap_err("connecting to server"),
        None => bail!("no addresses for {host}:{port} matched the requested address family"),
    }
}
