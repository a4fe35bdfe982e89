//! Transfer engine (C6): pipelined GET and PUT, reassembly, text-mode
//! translation, and the -P preservation option (spec.md §4.6).
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use byteorder::WriteBytesExt;
use byteorder::BE;
use log::{debug, warn};

use crate::attrs::Attrs;
use crate::ops::{Handle, OpenRequest};
use crate::proto::MsgType;
use crate::request::RequestEngine;
use crate::session::{SftpError, Session};
use crate::wire;

/// The per-slot bookkeeping the transfer engine tracks for one outstanding
/// request: for GET, `meta` is the read's starting offset; for PUT it's
/// the number of bytes the write carried.
struct SlotInfo {
    id: u32,
    meta: u64,
}

/// Shared state behind one mutex and two condvars, per spec.md §9: one
/// condvar fires when a response is consumed (frees a slot), the other
/// when a new request is sent (there's something to reap).
struct TransferState {
    slots: Vec<Option<SlotInfo>>,
    outstanding: usize,
    cursor: u64,
    eof: bool,
    finished: bool,
    failed: bool,
    error: Option<SftpError>,
}

impl TransferState {
    fn new(max_in_flight: usize) -> Self {
        Self {
            slots: (0..max_in_flight).map(|_| None).collect(),
            outstanding: 0,
            cursor: 0,
            eof: false,
            finished: false,
            failed: false,
            error: None,
        }
    }

    fn fail(&mut self, err: SftpError) {
        self.failed = true;
        self.error.get_or_insert(err);
    }

    fn free_slot(&mut self) -> usize {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .expect("driver only sends when a slot is known free")
    }

    fn take_slot_for(&mut self, id: u32) -> Option<SlotInfo> {
        let pos = self.slots.iter().position(|s| matches!(s, Some(si) if si.id == id))?;
        self.slots[pos].take()
    }
}

struct Shared {
    state: Mutex<TransferState>,
    resp_received: Condvar,
    req_sent: Condvar,
}

impl Shared {
    fn new(max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransferState::new(max_in_flight)),
            resp_received: Condvar::new(),
            req_sent: Condvar::new(),
        })
    }
}

/// Streaming newline matcher: translates an inbound byte-by-byte server
/// line terminator into `\n`. A pure state machine over "how many bytes of
/// `newline` have matched so far" (spec.md §4.6 "Text translation").
struct NewlineTranslator<'a> {
    newline: &'a [u8],
    matched: usize,
}

impl<'a> NewlineTranslator<'a> {
    fn new(newline: &'a [u8]) -> Self {
        Self { newline, matched: 0 }
    }

    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &byte in data {
            self.feed_one(byte, out);
        }
    }

    fn feed_one(&mut self, byte: u8, out: &mut Vec<u8>) {
        loop {
            if byte == self.newline[self.matched] {
                self.matched += 1;
                if self.matched == self.newline.len() {
                    out.push(b'\n');
                    self.matched = 0;
                }
                return;
            } else if self.matched > 0 {
                out.extend_from_slice(&self.newline[..self.matched]);
                self.matched = 0;
                continue;
            } else {
                out.push(byte);
                return;
            }
        }
    }

    /// Flush a pending partial match as literal bytes (spec.md §4.6:
    /// "on finalisation flush any pending partial match as literal bytes").
    fn finish(&mut self, out: &mut Vec<u8>) {
        if self.matched > 0 {
            out.extend_from_slice(&self.newline[..self.matched]);
            self.matched = 0;
        }
    }
}

/// Reads local bytes and translates `\n` into the server's `newline`
/// sequence, never splitting a translated terminator across two chunks
/// (spec.md §4.6 PUT).
struct TextPutEncoder<'a, R> {
    reader: R,
    newline: &'a [u8],
    pending: Option<u8>,
}

impl<'a, R: Read> TextPutEncoder<'a, R> {
    fn new(reader: R, newline: &'a [u8]) -> Self {
        Self {
            reader,
            newline,
            pending: None,
        }
    }

    fn next_raw_byte(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(b) = self.pending.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        match self.reader.read(&mut buf)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    /// Build one outgoing chunk of at most `buffer_size` bytes. Returns an
    /// empty vec only at true local EOF.
    fn next_chunk(&mut self, buffer_size: usize) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(buffer_size);
        loop {
            if out.len() >= buffer_size {
                break;
            }
            match self.next_raw_byte()? {
                None => break,
                Some(b'\n') => {
                    if out.len() + self.newline.len() > buffer_size {
                        self.pending = Some(b'\n');
                        break;
                    }
                    out.extend_from_slice(self.newline);
                }
                Some(b) => {
                    if out.len() + 1 > buffer_size {
                        self.pending = Some(b);
                        break;
                    }
                    out.push(b);
                }
            }
        }
        Ok(out)
    }
}

fn print_progress(enabled: bool, label: &str, sofar: u64, total: Option<u64>) {
    if !enabled {
        return;
    }
    match total {
        None => print!("\r{label}: {sofar}b"),
        Some(total) if total == 0 => print!("\r{label}: {sofar}b 100%"),
        Some(total) => {
            let pct = (100 * sofar / total).min(100);
            print!("\r{label}: {sofar}b {pct}%")
        }
    }
    let _ = std::io::stdout().flush();
}

fn clear_progress(enabled: bool) {
    if enabled {
        println!();
    }
}

impl Session {
    /// `get`: download `remote` to `local` (or its basename), writing
    /// through a `.new` temp file renamed into place on success
    /// (spec.md §4.6 GET).
    pub fn get(&self, remote: &str, local: Option<&str>, preserve: bool) -> Result<u64, SftpError> {
        let local_path = local
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                Path::new(remote)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| remote.to_string())
            });
        let tmp_path = format!("{local_path}.new");

        let mut open_req = OpenRequest::read_existing();
        if self.text_mode {
            open_req = open_req.with_text_mode();
        }
        let handle = self.open(remote, open_req, &Attrs::empty())?;
        let result = self.get_inner(&handle, &local_path, &tmp_path, preserve);
        if result.is_err() {
            let _ = self.close(&handle);
            let _ = std::fs::remove_file(&tmp_path);
            return result;
        }
        result
    }

    fn get_inner(&self, handle: &Handle, local_path: &str, tmp_path: &str, preserve: bool) -> Result<u64, SftpError> {
        let attrs = self.fstat(handle)?;
        let size = attrs.size;

        let max_in_flight = if self.text_mode { 1 } else { self.options.max_in_flight };
        let shared = Shared::new(max_in_flight.max(1));
        {
            let mut state = shared.state.lock().unwrap();
            if size == Some(0) {
                state.eof = true;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)
            .map_err(SftpError::LocalIoError)?;

        let driver_engine = Arc::clone(&self.engine);
        let driver_handle = handle.clone();
        let driver_shared = Arc::clone(&shared);
        let buffer_size = self.options.buffer_size;
        let driver = thread::spawn(move || {
            get_driver(driver_engine, driver_handle, driver_shared, buffer_size, max_in_flight, size);
        });

        let written = self.get_reap(&shared, &file, local_path, size);

        driver.join().expect("GET driver thread panicked");

        let state = shared.state.lock().unwrap();
        if state.failed {
            drop(state);
            clear_progress(self.options.progress_enabled);
            let mut guard = shared.state.lock().unwrap();
            return Err(guard.error.take().unwrap_or(SftpError::TransportFatal(
                "transfer failed with no recorded error".into(),
            )));
        }
        drop(state);
        clear_progress(self.options.progress_enabled);

        self.close(handle)?;

        if preserve {
            // `-P` preserves remote permissions on the local copy; the
            // standard library has no portable way to set local mtime/atime
            // without pulling in a dependency the rest of the crate has no
            // other use for, so preservation here covers permissions only.
            apply_local_attrs(tmp_path, &attrs)?;
        }
        std::fs::rename(tmp_path, local_path).map_err(SftpError::LocalIoError)?;
        Ok(written)
    }

    fn get_reap(&self, shared: &Arc<Shared>, file: &File, label: &str, total: Option<u64>) -> u64 {
        let mut written = 0u64;
        let mut translator = NewlineTranslator::new(&self.newline);
        let mut guard = shared.state.lock().unwrap();
        loop {
            if !(guard.outstanding > 0 || (!guard.eof && !guard.failed)) {
                break;
            }
            while guard.outstanding == 0 && !guard.failed {
                guard = shared.req_sent.wait(guard).unwrap();
            }
            if guard.outstanding == 0 {
                break;
            }
            drop(guard);
            let resp = self.engine.recv(None, 0);
            guard = shared.state.lock().unwrap();
            guard.outstanding -= 1;
            match resp {
                Err(e) => guard.fail(e),
                Ok(resp) if resp.kind == MsgType::STATUS => match RequestEngine::parse_status(&resp.body) {
                    Ok(status) if status.code.is_eof() => guard.eof = true,
                    Ok(status) => guard.fail(SftpError::RemoteError {
                        code: status.code,
                        message: status.message,
                    }),
                    Err(e) => guard.fail(e),
                },
                Ok(resp) if resp.kind == MsgType::DATA => {
                    let slot = guard.take_slot_for(resp.id);
                    match slot {
                        None => guard.fail(SftpError::ProtocolFatal(format!(
                            "DATA response for unknown request id {}",
                            resp.id
                        ))),
                        Some(slot) => match wire::read_bytes(&mut resp.reader()) {
                            Err(e) => guard.fail(SftpError::ProtocolFatal(format!("truncated DATA: {e}"))),
                            Ok(data) => {
                                let write_result = if self.text_mode {
                                    let mut out = Vec::new();
                                    translator.feed(&data, &mut out);
                                    file_append(file, &out)
                                } else {
                                    file.write_at(&data, slot.meta).map(|_| ())
                                };
                                match write_result {
                                    Err(e) => guard.fail(SftpError::LocalIoError(e)),
                                    Ok(()) => {
                                        written += data.len() as u64;
                                        print_progress(self.options.progress_enabled, label, written, total);
                                    }
                                }
                            }
                        },
                    }
                }
                Ok(resp) => guard.fail(SftpError::ProtocolFatal(format!(
                    "expected DATA or STATUS in reply to READ, got {:?}",
                    resp.kind
                ))),
            }
            shared.resp_received.notify_all();
        }
        if self.text_mode && !guard.failed {
            let mut tail = Vec::new();
            translator.finish(&mut tail);
            if !tail.is_empty() {
                let _ = file_append(file, &tail);
            }
        }
        written
    }

    /// `put`: upload `local` to `remote` (or its basename). Mirror of
    /// `get`: this thread drives reads and issues WRITEs, a background
    /// thread reaps STATUS (spec.md §4.6 PUT).
    pub fn put(&self, local: &str, remote: Option<&str>, preserve: bool) -> Result<u64, SftpError> {
        let remote_path = remote
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                Path::new(local)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| local.to_string())
            });
        let local_file = File::open(local).map_err(SftpError::LocalIoError)?;
        let local_meta = local_file.metadata().map_err(SftpError::LocalIoError)?;

        let mut open_req = OpenRequest::write_create_truncate();
        if self.text_mode {
            open_req = open_req.with_text_mode();
        }
        let handle = self.open(&remote_path, open_req, &Attrs::empty())?;

        let result = self.put_inner(&handle, local_file, local_meta.len(), &remote_path);
        match &result {
            Ok(_) => {
                if preserve {
                    let mut attrs = Attrs::empty();
                    attrs.permissions = local_meta.permissions().mode_bits();
                    let _ = self.fsetstat(&handle, &attrs);
                }
                self.close(&handle)?;
            }
            Err(_) => {
                let _ = self.close(&handle);
                let _ = self.remove(&remote_path);
            }
        }
        result
    }

    fn put_inner(&self, handle: &Handle, local_file: File, total: u64, label: &str) -> Result<u64, SftpError> {
        let max_in_flight = self.options.max_in_flight.max(1);
        let shared = Shared::new(max_in_flight);

        let reaper_engine = Arc::clone(&self.engine);
        let reaper_shared = Arc::clone(&shared);
        let progress_enabled = self.options.progress_enabled;
        let label_owned = label.to_string();
        let reaper = thread::spawn(move || put_reaper(reaper_engine, reaper_shared, progress_enabled, label_owned, total));

        let mut encoder_text;
        let mut encoder_binary;
        let mut use_text = false;
        if self.text_mode {
            encoder_text = Some(TextPutEncoder::new(local_file, &self.newline));
            encoder_binary = None;
            use_text = true;
        } else {
            encoder_binary = Some(local_file);
            encoder_text = None;
        }

        let mut offset = 0u64;
        let buffer_size = self.options.buffer_size as usize;
        loop {
            {
                let mut guard = shared.state.lock().unwrap();
                while guard.outstanding >= max_in_flight && !guard.failed {
                    guard = shared.resp_received.wait(guard).unwrap();
                }
                if guard.failed {
                    break;
                }
            }

            let chunk = if use_text {
                encoder_text.as_mut().unwrap().next_chunk(buffer_size)
            } else {
                let mut buf = vec![0u8; buffer_size];
                match encoder_binary.as_mut().unwrap().read(&mut buf) {
                    Ok(0) => Ok(Vec::new()),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(e) => Err(e),
                }
            };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let mut guard = shared.state.lock().unwrap();
                    guard.fail(SftpError::LocalIoError(e));
                    break;
                }
            };
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len() as u64;
            let id = self.engine.alloc_id();
            let mut payload = Vec::new();
            wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
            payload.write_u64::<BE>(offset).expect("writing to a Vec cannot fail");
            wire::write_bytes(&mut payload, &chunk).expect("writing to a Vec cannot fail");
            // Sent directly (not via `Session::write`, which blocks for its
            // own STATUS reply) so multiple WRITEs can be outstanding at
            // once; the background reaper thread collects their STATUS
            // replies out of order.
            if let Err(e) = self.engine.send(MsgType::WRITE, id, &payload) {
                let mut guard = shared.state.lock().unwrap();
                guard.fail(e);
                break;
            }
            offset += n;
            {
                let mut guard = shared.state.lock().unwrap();
                let slot_idx = guard.free_slot();
                guard.slots[slot_idx] = Some(SlotInfo { id, meta: n });
                guard.outstanding += 1;
                guard.cursor = offset;
            }
            shared.req_sent.notify_all();
        }
        {
            let mut guard = shared.state.lock().unwrap();
            guard.finished = true;
        }
        shared.req_sent.notify_all();

        reaper.join().expect("PUT reaper thread panicked");

        let mut guard = shared.state.lock().unwrap();
        if guard.failed {
            return Err(guard
                .error
                .take()
                .unwrap_or(SftpError::TransportFatal("transfer failed with no recorded error".into())));
        }
        Ok(guard.cursor)
    }
}

fn get_driver(
    engine: Arc<RequestEngine>,
    handle: Handle,
    shared: Arc<Shared>,
    buffer_size: u32,
    max_in_flight: usize,
    size: Option<u64>,
) {
    let mut guard = shared.state.lock().unwrap();
    loop {
        while guard.outstanding < max_in_flight && !guard.eof && !guard.failed {
            let slot_idx = guard.free_slot();
            let id = engine.alloc_id();
            let offset = guard.cursor;
            let len: u32 = match size {
                Some(total) => total.saturating_sub(offset).min(buffer_size as u64) as u32,
                None => buffer_size,
            };
            if len == 0 {
                guard.eof = true;
                break;
            }
            drop(guard);
            let mut payload = Vec::new();
            wire::write_bytes(&mut payload, &handle.0).expect("writing to a Vec cannot fail");
            payload.write_u64::<BE>(offset).expect("writing to a Vec cannot fail");
            payload.write_u32::<BE>(len).expect("writing to a Vec cannot fail");
            let sent = engine.send(MsgType::READ, id, &payload);
            guard = shared.state.lock().unwrap();
            if let Err(e) = sent {
                guard.fail(e);
                break;
            }
            guard.slots[slot_idx] = Some(SlotInfo { id, meta: offset });
            guard.outstanding += 1;
            guard.cursor = offset + len as u64;
            if let Some(total) = size {
                if guard.cursor >= total {
                    guard.eof = true;
                }
            }
            shared.req_sent.notify_all();
        }
        if guard.eof || guard.failed {
            break;
        }
        guard = shared.resp_received.wait(guard).unwrap();
    }
    debug!("GET driver exiting (eof={}, failed={})", guard.eof, guard.failed);
}

fn put_reaper(engine: Arc<RequestEngine>, shared: Arc<Shared>, progress_enabled: bool, label: String, total: u64) {
    let mut written = 0u64;
    let mut guard = shared.state.lock().unwrap();
    loop {
        while guard.outstanding == 0 && !guard.finished {
            guard = shared.req_sent.wait(guard).unwrap();
        }
        if guard.outstanding == 0 && guard.finished {
            break;
        }
        drop(guard);
        let resp = engine.recv(Some(MsgType::STATUS), 0);
        guard = shared.state.lock().unwrap();
        guard.outstanding -= 1;
        match resp {
            Err(e) => guard.fail(e),
            Ok(resp) => {
                let slot = guard.take_slot_for(resp.id);
                match RequestEngine::parse_status(&resp.body) {
                    Err(e) => guard.fail(e),
                    Ok(status) if status.code.is_ok() => {
                        if let Some(slot) = slot {
                            written += slot.meta;
                            print_progress(progress_enabled, &label, written, Some(total));
                        } else {
                            warn!("WRITE STATUS for unknown request id {}", resp.id);
                        }
                    }
                    Ok(status) => guard.fail(SftpError::RemoteError {
                        code: status.code,
                        message: status.message,
                    }),
                }
            }
        }
        shared.resp_received.notify_all();
    }
    clear_progress(progress_enabled);
}

fn file_append(file: &File, data: &[u8]) -> std::io::Result<()> {
    // `File` doesn't track a cursor the transfer engine relies on elsewhere
    // (GET's binary path writes by explicit offset), so text mode tracks
    // its own append position via the file's current length.
    let offset = file.metadata()?.len();
    file.write_at(data, offset)
}

fn apply_local_attrs(path: &str, attrs: &Attrs) -> Result<(), SftpError> {
    if let Some(perm) = attrs.permissions {
        let mode = perm & 0o7777;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(SftpError::LocalIoError)?;
    }
    Ok(())
}

use std::os::unix::fs::PermissionsExt;

trait ModeBits {
    fn mode_bits(&self) -> Option<u32>;
}

impl ModeBits for std::fs::Permissions {
    fn mode_bits(&self) -> Option<u32> {
        Some(self.mode() & 0o7777)
    }
}
