//! End-to-end GET/PUT tests against a minimal in-process fake server,
//! exercising the properties spec.md §8 calls out: binary GET reassembly
//! regardless of DATA reply order, and text-mode PUT newline translation.
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

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.write_u32::<BE>(data.len() as u32).unwrap();
    out.extend_from_slice(data);
}

fn frame_id(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]])
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
    let id = frame_id(&req);
    let mut body = Vec::new();
    body.push(104u8); // NAME
    body.write_u32::<BE>(id).unwrap();
    body.write_u32::<BE>(1).unwrap();
    write_string(&mut body, reply_path);
    write_string(&mut body, reply_path);
    body.write_u32::<BE>(0).unwrap(); // empty ATTRS
    write_frame(stream, &body);
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

fn answer_handle(stream: &mut TcpStream, id: u32, handle: &[u8]) {
    let mut body = Vec::new();
    body.push(102u8); // HANDLE
    body.write_u32::<BE>(id).unwrap();
    write_bytes(&mut body, handle);
    write_frame(stream, &body);
}

/// Parse a READ request's handle/offset/length, ignoring the handle bytes.
fn parse_read_request(req: &[u8]) -> (u32, u64, u32) {
    let id = frame_id(req);
    let mut pos = 5usize;
    let handle_len = u32::from_be_bytes(req[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4 + handle_len;
    let offset = u64::from_be_bytes(req[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let len = u32::from_be_bytes(req[pos..pos + 4].try_into().unwrap());
    (id, offset, len)
}

fn answer_data(stream: &mut TcpStream, id: u32, data: &[u8]) {
    let mut body = Vec::new();
    body.push(103u8); // DATA
    body.write_u32::<BE>(id).unwrap();
    write_bytes(&mut body, data);
    write_frame(stream, &body);
}

fn cmd_stdout(out: std::process::Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

/// GET of a 100-byte file pipelined two requests deep, with DATA replies
/// answered out of (request) order: binary mode writes by absolute offset,
/// so the reconstructed file must come out correct regardless (spec.md §8
/// property 4).
#[test]
fn get_reassembles_out_of_order_data_replies() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let content: Vec<u8> = (0..100u32).map(|i| (i % 256) as u8).collect();
    let content_for_server = content.clone();

    let out_dir = tempfile::tempdir().unwrap();
    let local_path = out_dir.path().join("remote.bin");
    let local_path_str = local_path.to_str().unwrap().to_string();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");

        let open_req = read_frame(&mut stream);
        assert_eq!(open_req[0], 3); // OPEN
        answer_handle(&mut stream, frame_id(&open_req), b"h1");

        let fstat_req = read_frame(&mut stream);
        assert_eq!(fstat_req[0], 8); // FSTAT
        let mut attrs = Vec::new();
        attrs.push(105u8); // ATTRS
        attrs.write_u32::<BE>(frame_id(&fstat_req)).unwrap();
        attrs.write_u32::<BE>(0x0000_0001).unwrap(); // valid = SIZE
        attrs.push(1u8); // type = REGULAR
        attrs.write_u64::<BE>(content_for_server.len() as u64).unwrap();
        write_frame(&mut stream, &attrs);

        // Two READs pipelined (--requests 2, --buffer 40): offsets 0 and 40.
        let r1 = read_frame(&mut stream);
        let r2 = read_frame(&mut stream);
        let (id1, off1, len1) = parse_read_request(&r1);
        let (id2, off2, len2) = parse_read_request(&r2);
        assert_eq!((off1, len1), (0, 40));
        assert_eq!((off2, len2), (40, 40));

        // Answer the *second* request first to exercise reassembly by offset.
        answer_data(
            &mut stream,
            id2,
            &content_for_server[off2 as usize..(off2 + len2 as u64) as usize],
        );
        answer_data(
            &mut stream,
            id1,
            &content_for_server[off1 as usize..(off1 + len1 as u64) as usize],
        );

        // A slot freed, so the third (final, 20-byte) read follows.
        let r3 = read_frame(&mut stream);
        let (id3, off3, len3) = parse_read_request(&r3);
        assert_eq!((off3, len3), (80, 20));
        answer_data(
            &mut stream,
            id3,
            &content_for_server[off3 as usize..(off3 + len3 as u64) as usize],
        );

        let close_req = read_frame(&mut stream);
        assert_eq!(close_req[0], 4); // CLOSE
        answer_status_ok(&mut stream, frame_id(&close_req));
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "get remote.bin {local_path_str}").unwrap();
    writeln!(batch, "quit").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_sftp"))
        .args(["--host", "127.0.0.1", "--port"])
        .arg(port.to_string())
        .args(["--buffer", "40", "--requests", "2"])
        .args(["--batch", batch.path().to_str().unwrap()])
        .output()
        .expect("failed to run sftp");

    server.join().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let got = std::fs::read(&local_path).unwrap();
    assert_eq!(got, content);
    assert!(!cmd_stdout(out).is_empty());
}

/// PUT in text mode on a server whose newline is the default "\r\n": every
/// `\n` in the local file must appear as `\r\n` on the wire (spec.md §8
/// property 6 / scenario S4).
#[test]
fn put_text_mode_translates_newlines_on_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut local_file = tempfile::NamedTempFile::new().unwrap();
    write!(local_file, "line1\nline2\n").unwrap();
    let local_path = local_file.path().to_str().unwrap().to_string();

    let server = thread::spawn(move || {
        let mut stream = accept_and_negotiate(&listener);
        answer_realpath(&mut stream, "/home/remote");

        let open_req = read_frame(&mut stream);
        assert_eq!(open_req[0], 3); // OPEN
        answer_handle(&mut stream, frame_id(&open_req), b"h2");

        let write_req = read_frame(&mut stream);
        assert_eq!(write_req[0], 6); // WRITE
        let id = frame_id(&write_req);
        let mut pos = 5usize;
        let handle_len = u32::from_be_bytes(write_req[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4 + handle_len;
        pos += 8; // offset, unused
        let data_len = u32::from_be_bytes(write_req[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let data = &write_req[pos..pos + data_len];
        assert_eq!(data, b"line1\r\nline2\r\n");
        answer_status_ok(&mut stream, id);

        let close_req = read_frame(&mut stream);
        assert_eq!(close_req[0], 4); // CLOSE
        answer_status_ok(&mut stream, frame_id(&close_req));
    });

    let mut batch = tempfile::NamedTempFile::new().unwrap();
    writeln!(batch, "ascii").unwrap();
    writeln!(batch, "put {local_path} remote.txt").unwrap();
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
