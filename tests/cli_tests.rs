//! Batch-mode error handling against a minimal in-process fake server.
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::Command;
use std::thread;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len = stream.read_u32::<BE>().unwrap();
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) {
    stream.write_u32::<BE>(body.len() as u32).unwrap();
    stream.write_all(body).unwrap();
    stream.flush().unwrap();
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<BE>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn accept_and_negotiate(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().unwrap();
    let init = read_frame(&mut stream);
    assert_eq!(init[0], 1); // INIT
    let mut body = Vec::new();
    body.push(2u8); // VERSION
    body.write_u32::<BE>(6).unwrap();
    write_frame(&mut stream, &body);
    stream
}

fn answer_realpath(stream: &mut TcpStream, reply_path: &str) {
    let req = read_frame(stream);
    assert_eq!(req[0], 16); // REALPATH
    let id = u32::from_be_bytes([req[1], req[2], req[3], req[4]]);
    let mut body = Vec::new();
    body.push(104u8); // NAME
    body.write_u32::<BE>(id).unwrap();
    body.write_u32::<BE>(1).unwrap();
    write_string(&mut body, reply_path);
    write_string(&mut body, reply_path);
    body.write_u32::<BE>(0).unwrap();
    write_frame(stream, &body);
}

/// An unrecognized batch command is a non-fatal `UsageError`: the session
/// keeps going, but the process must still report failure via exit status.
#[test]
fn unknown_command_in_batch_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "frobnicate").unwrap();
    writeln!(batch, "quit").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_sftp"))
        .args(["--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--batch", batch.path().to_str().unwrap()])
        .output()
        .expect("failed to run sftp");

    server.join().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown command"));
}

/// `--stop-on-error` halts the batch at the first failing command instead
/// of continuing to the next line.
#[test]
fn stop_on_error_halts_batch_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");
        // if the client stopped after the bad command, `pwd` never hits the
        // wire; if it kept going, this recv would hang until the test panics
        // on join, so we just drop the stream once negotiation is done.
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "frobnicate").unwrap();
    writeln!(batch, "pwd").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_sftp"))
        .args(["--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--batch", batch.path().to_str().unwrap()])
        .arg("--stop-on-error")
        .output()
        .expect("failed to run sftp");

    server.join().unwrap();
    assert!(!out.status.success());
    assert!(!cmd_stdout(out).contains("Remote directory"));
}

fn cmd_stdout(out: std::process::Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

fn frame_id(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]])
}

fn answer_status_ok(stream: &mut TcpStream, id: u32) {
    let mut body = Vec::new();
    body.push(101u8); // STATUS
    body.write_u32::<BE>(id).unwrap();
    body.write_u32::<BE>(0).unwrap(); // FX_OK
    write_string(&mut body, "");
    write_string(&mut body, "");
    write_frame(stream, &body);
}

/// `chown` on a v3 server: the `UIDGID` valid bit covers the pair, so the
/// client must stat the target first and resend the untouched `gid`
/// alongside the new `uid` rather than sending `uid` alone with an empty
/// valid mask.
#[test]
fn chown_preserves_gid_on_protocol_v3() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");

        let stat_req = read_frame(&mut stream);
        assert_eq!(stat_req[0], 17); // STAT
        let mut attrs = Vec::new();
        attrs.push(105u8); // ATTRS
        attrs.write_u32::<BE>(frame_id(&stat_req)).unwrap();
        attrs.write_u32::<BE>(0x0000_0002).unwrap(); // valid = UIDGID
        attrs.write_u32::<BE>(1000).unwrap(); // uid
        attrs.write_u32::<BE>(1000).unwrap(); // gid
        write_frame(&mut stream, &attrs);

        let setstat_req = read_frame(&mut stream);
        assert_eq!(setstat_req[0], 9); // SETSTAT
        let id = frame_id(&setstat_req);
        let path_len =
            u32::from_be_bytes(setstat_req[5..9].try_into().unwrap()) as usize;
        let mut pos = 9 + path_len;
        let valid = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap());
        pos += 4;
        assert_eq!(valid, 0x0000_0002); // UIDGID, nothing else
        let uid = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let gid = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap());
        assert_eq!((uid, gid), (9999, 1000));
        answer_status_ok(&mut stream, id);
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "chown 9999 remote.bin").unwrap();
    writeln!(batch, "quit").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_sftp"))
        .args(["--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--sftp-version", "3"])
        .args(["--batch", batch.path().to_str().unwrap()])
        .output()
        .expect("failed to run sftp");

    server.join().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
}

/// `chgrp` on a v4+ server: the group name travels as a string under the
/// shared `OWNERGROUP` bit, so the existing owner must be carried forward.
#[test]
fn chgrp_preserves_owner_on_protocol_v4_plus() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");

        let stat_req = read_frame(&mut stream);
        assert_eq!(stat_req[0], 17); // STAT
        let mut attrs = Vec::new();
        attrs.push(105u8); // ATTRS
        attrs.write_u32::<BE>(frame_id(&stat_req)).unwrap();
        attrs.write_u32::<BE>(0x0000_0080).unwrap(); // valid = OWNERGROUP
        attrs.push(1u8); // type = REGULAR
        write_string(&mut attrs, "alice");
        write_string(&mut attrs, "staff");
        write_frame(&mut stream, &attrs);

        let setstat_req = read_frame(&mut stream);
        assert_eq!(setstat_req[0], 9); // SETSTAT
        let id = frame_id(&setstat_req);
        let path_len =
            u32::from_be_bytes(setstat_req[5..9].try_into().unwrap()) as usize;
        let mut pos = 9 + path_len;
        let valid = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap());
        pos += 4;
        assert_eq!(valid, 0x0000_0080); // OWNERGROUP, nothing else
        let owner_len = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let owner = std::str::from_utf8(&setstat_req[pos..pos + owner_len]).unwrap();
        pos += owner_len;
        assert_eq!(owner, "alice");
        let group_len = u32::from_be_bytes(setstat_req[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let group = std::str::from_utf8(&setstat_req[pos..pos + group_len]).unwrap();
        assert_eq!(group, "devs");
        answer_status_ok(&mut stream, id);
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "chgrp devs remote.bin").unwrap();
    writeln!(batch, "quit").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_sftp"))
        .args(["--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--batch", batch.path().to_str().unwrap()])
        .output()
        .expect("failed to run sftp");

    server.join().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
}
