//! Command table & dispatch (C9): the static command roster, argv
//! splitting, batch-file processing, and the handlers themselves
//! (spec.md §4.9).
use std::io::{BufRead, Write};
use std::path::Path;

use crate::attrs::Attrs;
use crate::proto::{FileType, RenameFlags, StatusCode};
use crate::session::{SftpError, Session};

/// What the REPL or batch runner should do after a dispatched command.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit,
}

type Handler = fn(&mut Session, &[String]) -> Result<Outcome, SftpError>;

struct Command {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    handler: Handler,
    help: &'static str,
}

static COMMANDS: &[Command] = &[
    Command { name: "ls", min_args: 0, max_args: 2, handler: cmd_ls, help: "ls [-laSdtr1f] [path]     list remote directory" },
    Command { name: "cd", min_args: 1, max_args: 1, handler: cmd_cd, help: "cd path                   change remote directory" },
    Command { name: "lcd", min_args: 1, max_args: 1, handler: cmd_lcd, help: "lcd path                  change local directory" },
    Command { name: "pwd", min_args: 0, max_args: 0, handler: cmd_pwd, help: "pwd                       print remote directory" },
    Command { name: "lpwd", min_args: 0, max_args: 0, handler: cmd_lpwd, help: "lpwd                      print local directory" },
    Command { name: "get", min_args: 1, max_args: 3, handler: cmd_get, help: "get [-P] remote [local]  download a file" },
    Command { name: "put", min_args: 1, max_args: 3, handler: cmd_put, help: "put [-P] local [remote]  upload a file" },
    Command { name: "mkdir", min_args: 1, max_args: 1, handler: cmd_mkdir, help: "mkdir path                create a remote directory" },
    Command { name: "rmdir", min_args: 1, max_args: 1, handler: cmd_rmdir, help: "rmdir path                remove a remote directory" },
    Command { name: "rm", min_args: 1, max_args: 1, handler: cmd_rm, help: "rm path                   remove a remote file" },
    Command { name: "rename", min_args: 2, max_args: 2, handler: cmd_rename, help: "rename old new            rename a remote file" },
    Command { name: "mv", min_args: 2, max_args: 3, handler: cmd_mv, help: "mv [-o] old new           rename, -o overwrites" },
    Command { name: "ln", min_args: 2, max_args: 2, handler: cmd_ln, help: "ln target linkpath        create a hard link" },
    Command { name: "symlink", min_args: 2, max_args: 2, handler: cmd_symlink, help: "symlink target linkpath   create a symbolic link" },
    Command { name: "chmod", min_args: 2, max_args: 2, handler: cmd_chmod, help: "chmod mode path           change permissions" },
    Command { name: "chown", min_args: 2, max_args: 2, handler: cmd_chown, help: "chown uid path            change owner" },
    Command { name: "chgrp", min_args: 2, max_args: 2, handler: cmd_chgrp, help: "chgrp gid path            change group" },
    Command { name: "df", min_args: 0, max_args: 1, handler: cmd_df, help: "df [path]                 show remote free space" },
    Command { name: "ascii", min_args: 0, max_args: 0, handler: cmd_ascii, help: "ascii                     transfer get/put with newline translation" },
    Command { name: "binary", min_args: 0, max_args: 0, handler: cmd_binary, help: "binary                    transfer get/put byte-for-byte (the default)" },
    Command { name: "lls", min_args: 0, max_args: 1, handler: cmd_lls, help: "lls [path]                local directory listing" },
    Command { name: "lmkdir", min_args: 1, max_args: 1, handler: cmd_lmkdir, help: "lmkdir path               create a local directory" },
    Command { name: "version", min_args: 0, max_args: 0, handler: cmd_version, help: "version                   show negotiated protocol version" },
    Command { name: "help", min_args: 0, max_args: 0, handler: cmd_help, help: "help                      show this list" },
    Command { name: "?", min_args: 0, max_args: 0, handler: cmd_help, help: "?                         show this list" },
    Command { name: "exit", min_args: 0, max_args: 0, handler: cmd_exit, help: "exit                      end the session" },
    Command { name: "quit", min_args: 0, max_args: 0, handler: cmd_exit, help: "quit                      end the session" },
    Command { name: "bye", min_args: 0, max_args: 0, handler: cmd_exit, help: "bye                       end the session" },
];

/// Split one command line into an argv, honoring double-quoted strings and
/// backslash escapes within them.
pub fn split_argv(line: &str) -> Result<Vec<String>, SftpError> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(SftpError::UsageError("unterminated quoted string".into())),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => return Err(SftpError::UsageError("unterminated quoted string".into())),
                    },
                    Some(other) => token.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        out.push(token);
    }
    Ok(out)
}

/// Find a command by exact name, check arity, and run its handler. `!...`
/// lines shell out directly and never reach the table.
pub fn dispatch(session: &mut Session, argv: &[String]) -> Result<Outcome, SftpError> {
    let Some(name) = argv.first() else {
        return Ok(Outcome::Continue);
    };
    let command = COMMANDS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| SftpError::UsageError(format!("unknown command: {name}")))?;
    let args = &argv[1..];
    if args.len() < command.min_args || args.len() > command.max_args {
        return Err(SftpError::UsageError(format!(
            "{}: wrong number of arguments",
            command.name
        )));
    }
    (command.handler)(session, args)
}

/// Run a single already-split line, including `!shell` escapes and `#`
/// comments, which never reach `dispatch`.
pub fn run_line(session: &mut Session, line: &str) -> Result<Outcome, SftpError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Outcome::Continue);
    }
    if let Some(shell_cmd) = trimmed.strip_prefix('!') {
        return run_shell(shell_cmd).map(|()| Outcome::Continue);
    }
    let argv = split_argv(trimmed)?;
    dispatch(session, &argv)
}

/// Drain a batch file line by line, stopping at EOF. Returns `Ok(true)` if
/// every line succeeded (or `stop_on_error` was false and failures were
/// merely reported).
pub fn run_batch<R: BufRead>(session: &mut Session, reader: R, stop_on_error: bool) -> Result<bool, SftpError> {
    let mut all_ok = true;
    for line in reader.lines() {
        let line = line.map_err(SftpError::LocalIoError)?;
        match run_line(session, &line) {
            Ok(Outcome::Exit) => break,
            Ok(Outcome::Continue) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                eprintln!("{e}");
                all_ok = false;
                if stop_on_error {
                    break;
                }
            }
        }
    }
    Ok(all_ok)
}

fn run_shell(command: &str) -> Result<(), SftpError> {
    let status = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
        .map_err(SftpError::LocalIoError)?;
    if !status.success() {
        return Err(SftpError::UsageError(format!("command exited with {status}")));
    }
    Ok(())
}

fn cmd_ls(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let mut args = args;
    let mut opts = "";
    if let Some(first) = args.first() {
        if let Some(flags) = first.strip_prefix('-') {
            opts = flags;
            args = &args[1..];
        }
    }
    let path = args.first().map(|s| s.as_str()).unwrap_or(".");
    let top_attrs = session.lstat(path)?;
    let show_as_dir = !opts.contains('d') && top_attrs.is_directory();

    let mut entries: Vec<(String, Attrs)> = Vec::new();
    if show_as_dir {
        let show_all = opts.contains('a');
        let handle = session.opendir(path)?;
        loop {
            match session.readdir(&handle) {
                Ok(Some(batch)) => {
                    for e in batch {
                        if !show_all && e.filename.starts_with('.') {
                            continue;
                        }
                        entries.push((e.filename, e.attrs));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = session.close(&handle);
                    return Err(e);
                }
            }
        }
        session.close(&handle)?;
    } else {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        entries.push((name, top_attrs));
    }

    if !opts.contains('f') {
        if opts.contains('S') {
            entries.sort_by(|a, b| b.1.size.unwrap_or(0).cmp(&a.1.size.unwrap_or(0)));
        } else if opts.contains('t') {
            let secs = |a: &Attrs| a.mtime.map(|t| t.seconds).unwrap_or(0);
            entries.sort_by(|a, b| secs(&b.1).cmp(&secs(&a.1)));
        } else {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
        }
        if opts.contains('r') {
            entries.reverse();
        }
    }

    if opts.contains('l') || opts.contains('n') {
        for (name, attrs) in &mut entries {
            if attrs.file_type == Some(FileType::SYMLINK) {
                let target_path = if show_as_dir {
                    if path == "." {
                        name.clone()
                    } else {
                        format!("{}/{name}", path.trim_end_matches('/'))
                    }
                } else {
                    path.to_string()
                };
                if let Ok(target) = session.readlink(&target_path) {
                    attrs.symlink_target = Some(target);
                }
            }
        }
        for (name, attrs) in &entries {
            println!("{}", format_long(name, attrs));
        }
    } else if opts.contains('1') {
        for (name, _) in &entries {
            println!("{name}");
        }
    } else {
        print_columns(&entries);
    }
    Ok(Outcome::Continue)
}

fn mode_string(file_type: Option<FileType>, perm: Option<u32>) -> String {
    let perm = perm.unwrap_or(0);
    let type_char = match file_type {
        Some(FileType::DIRECTORY) => 'd',
        Some(FileType::SYMLINK) => 'l',
        Some(FileType::CHAR_DEVICE) => 'c',
        Some(FileType::BLOCK_DEVICE) => 'b',
        Some(FileType::FIFO) => 'p',
        Some(FileType::SOCKET) => 's',
        _ => '-',
    };
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for (mask, ch) in BITS {
        s.push(if perm & mask != 0 { ch } else { '-' });
    }
    s
}

fn format_long(name: &str, attrs: &Attrs) -> String {
    let mode = mode_string(attrs.file_type, attrs.permissions);
    let links = attrs.link_count.unwrap_or(1);
    let owner = attrs
        .owner
        .clone()
        .or_else(|| attrs.uid.map(|u| u.to_string()))
        .unwrap_or_else(|| "?".to_string());
    let group = attrs
        .group
        .clone()
        .or_else(|| attrs.gid.map(|g| g.to_string()))
        .unwrap_or_else(|| "?".to_string());
    let size = attrs.size.unwrap_or(0);
    let mtime = attrs.mtime.map(|t| t.seconds).unwrap_or(0);
    let suffix = if attrs.file_type == Some(FileType::SYMLINK) {
        attrs
            .symlink_target
            .as_deref()
            .map(|t| format!(" -> {t}"))
            .unwrap_or_default()
    } else {
        String::new()
    };
    format!("{mode} {links:>3} {owner:<8} {group:<8} {size:>10} {mtime:>12} {name}{suffix}")
}

/// Lay out names in as many columns as fit an 80-column terminal, filled
/// down each column before moving to the next (spec.md §4.9 `ls`).
fn print_columns(entries: &[(String, Attrs)]) {
    if entries.is_empty() {
        return;
    }
    let max_width = entries
        .iter()
        .map(|(n, _)| crate::locale::display_width(n))
        .max()
        .unwrap_or(0);
    let terminal_width = 80usize;
    let mut cols = (terminal_width + 1) / (max_width + 1);
    if cols == 0 {
        cols = 1;
    }
    let rows = (entries.len() + cols - 1) / cols;
    for row in 0..rows {
        for col in 0..cols {
            let i = row + col * rows;
            if i >= entries.len() {
                continue;
            }
            let (name, _) = &entries[i];
            let w = crate::locale::display_width(name);
            let pad = if col + 1 < cols && i + rows < entries.len() {
                max_width - w + 1
            } else {
                0
            };
            print!("{name}{:pad$}", "", pad = pad);
        }
        println!();
    }
}

fn cmd_cd(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let resolved = session.realpath(&args[0])?;
    let attrs = session.stat(&resolved)?;
    if !attrs.is_directory() {
        return Err(SftpError::RemoteError {
            code: StatusCode::Failure,
            message: format!("{resolved} is not a directory"),
        });
    }
    session.cwd = resolved;
    Ok(Outcome::Continue)
}

fn cmd_lcd(_session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    std::env::set_current_dir(&args[0]).map_err(SftpError::LocalIoError)?;
    Ok(Outcome::Continue)
}

fn cmd_pwd(session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    println!("Remote directory: {}", session.cwd);
    Ok(Outcome::Continue)
}

fn cmd_lpwd(_session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    let cwd = std::env::current_dir().map_err(SftpError::LocalIoError)?;
    println!("Local directory: {}", cwd.display());
    Ok(Outcome::Continue)
}

fn split_preserve_flag(args: &[String]) -> (bool, &[String]) {
    if args.first().map(|s| s.as_str()) == Some("-P") {
        (true, &args[1..])
    } else {
        (false, args)
    }
}

fn cmd_get(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let (preserve, rest) = split_preserve_flag(args);
    if rest.is_empty() || rest.len() > 2 {
        return Err(SftpError::UsageError("get: wrong number of arguments".into()));
    }
    let remote = &rest[0];
    let local = rest.get(1).map(|s| s.as_str());
    let written = session.get(remote, local, preserve)?;
    println!("{remote}: {written} bytes");
    Ok(Outcome::Continue)
}

fn cmd_put(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let (preserve, rest) = split_preserve_flag(args);
    if rest.is_empty() || rest.len() > 2 {
        return Err(SftpError::UsageError("put: wrong number of arguments".into()));
    }
    let local = &rest[0];
    let remote = rest.get(1).map(|s| s.as_str());
    let written = session.put(local, remote, preserve)?;
    println!("{local}: {written} bytes");
    Ok(Outcome::Continue)
}

fn cmd_mkdir(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.mkdir(&args[0], &Attrs::empty())?;
    Ok(Outcome::Continue)
}

fn cmd_rmdir(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.rmdir(&args[0])?;
    Ok(Outcome::Continue)
}

fn cmd_rm(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.remove(&args[0])?;
    Ok(Outcome::Continue)
}

fn cmd_rename(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.rename(&args[0], &args[1], RenameFlags::ATOMIC)?;
    Ok(Outcome::Continue)
}

fn cmd_mv(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let overwrite = args.first().map(|s| s.as_str()) == Some("-o");
    let rest = if overwrite { &args[1..] } else { args };
    if rest.len() != 2 {
        return Err(SftpError::UsageError("mv: wrong number of arguments".into()));
    }
    let flags = if overwrite {
        RenameFlags::ATOMIC | RenameFlags::OVERWRITE
    } else {
        RenameFlags::ATOMIC
    };
    session.rename(&rest[0], &rest[1], flags)?;
    Ok(Outcome::Continue)
}

fn cmd_ln(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.link(&args[0], &args[1], false)?;
    Ok(Outcome::Continue)
}

fn cmd_symlink(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    session.link(&args[0], &args[1], true)?;
    Ok(Outcome::Continue)
}

fn cmd_chmod(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let mode = u32::from_str_radix(&args[0], 8)
        .map_err(|_| SftpError::UsageError(format!("chmod: invalid mode {:?}", args[0])))?;
    session.setstat(&args[1], &Attrs::with_permissions(mode))?;
    Ok(Outcome::Continue)
}

/// Both `uid`/`gid` (v3) and `owner`/`group` (v4+) travel under a single
/// valid bit covering the pair, so setting just one half sends an empty
/// valid mask and the server reports success while changing nothing. Stat
/// the target first and carry the unchanged half forward.
fn cmd_chown(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let existing = session.stat(&args[1])?;
    let attrs = if session.protocol_version >= 4 {
        let group = existing.group.clone().ok_or_else(|| SftpError::RemoteError {
            code: StatusCode::Failure,
            message: "chown: cannot determine former owner/group".to_string(),
        })?;
        Attrs {
            owner: Some(args[0].clone()),
            group: Some(group),
            ..Attrs::empty()
        }
    } else {
        let gid = existing.gid.ok_or_else(|| SftpError::RemoteError {
            code: StatusCode::Failure,
            message: "chown: cannot determine former UID/GID".to_string(),
        })?;
        let uid: u32 = args[0]
            .parse()
            .map_err(|_| SftpError::UsageError(format!("chown: invalid uid {:?}", args[0])))?;
        Attrs {
            uid: Some(uid),
            gid: Some(gid),
            ..Attrs::empty()
        }
    };
    session.setstat(&args[1], &attrs)?;
    Ok(Outcome::Continue)
}

fn cmd_chgrp(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let existing = session.stat(&args[1])?;
    let attrs = if session.protocol_version >= 4 {
        let owner = existing.owner.clone().ok_or_else(|| SftpError::RemoteError {
            code: StatusCode::Failure,
            message: "chgrp: cannot determine former owner/group".to_string(),
        })?;
        Attrs {
            owner: Some(owner),
            group: Some(args[0].clone()),
            ..Attrs::empty()
        }
    } else {
        let uid = existing.uid.ok_or_else(|| SftpError::RemoteError {
            code: StatusCode::Failure,
            message: "chgrp: cannot determine former UID/GID".to_string(),
        })?;
        let gid: u32 = args[0]
            .parse()
            .map_err(|_| SftpError::UsageError(format!("chgrp: invalid gid {:?}", args[0])))?;
        Attrs {
            uid: Some(uid),
            gid: Some(gid),
            ..Attrs::empty()
        }
    };
    session.setstat(&args[1], &attrs)?;
    Ok(Outcome::Continue)
}

fn cmd_df(session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let path = args.first().map(|s| s.as_str()).unwrap_or(".");
    let space = session.space_available(path)?;
    println!(
        "{:>14} {:>14} {:>14} {:>14}",
        "size", "used", "avail", "avail(user)"
    );
    let used = space.bytes_on_device.saturating_sub(space.unused_bytes_on_device);
    println!(
        "{:>14} {:>14} {:>14} {:>14}",
        space.bytes_on_device, used, space.unused_bytes_on_device, space.unused_bytes_available_to_user
    );
    Ok(Outcome::Continue)
}

fn cmd_ascii(session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    session.text_mode = true;
    Ok(Outcome::Continue)
}

fn cmd_binary(session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    session.text_mode = false;
    Ok(Outcome::Continue)
}

fn cmd_lls(_session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    let mut cmd = std::process::Command::new("ls");
    if let Some(path) = args.first() {
        cmd.arg(path);
    }
    let status = cmd.status().map_err(SftpError::LocalIoError)?;
    if !status.success() {
        return Err(SftpError::UsageError(format!("ls exited with {status}")));
    }
    Ok(Outcome::Continue)
}

fn cmd_lmkdir(_session: &mut Session, args: &[String]) -> Result<Outcome, SftpError> {
    std::fs::create_dir(&args[0]).map_err(SftpError::LocalIoError)?;
    Ok(Outcome::Continue)
}

fn cmd_version(session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    println!("Remote protocol version: {}", session.protocol_version);
    if let Some(id) = &session.server_identity {
        println!("Server: {} {} {} (build {})", id.vendor, id.name, id.version, id.build);
    }
    Ok(Outcome::Continue)
}

fn cmd_help(_session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    for command in COMMANDS {
        println!("{}", command.help);
    }
    let _ = std::io::stdout().flush();
    Ok(Outcome::Continue)
}

fn cmd_exit(_session: &mut Session, _args: &[String]) -> Result<Outcome, SftpError> {
    Ok(Outcome::Exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_argv_handles_plain_tokens() {
        assert_eq!(split_argv("get a b").unwrap(), vec!["get", "a", "b"]);
    }

    #[test]
    fn split_argv_handles_quoted_spaces() {
        assert_eq!(
            split_argv(r#"get "a file.txt" out"#).unwrap(),
            vec!["get", "a file.txt", "out"]
        );
    }

    #[test]
    fn split_argv_handles_backslash_escape_in_quotes() {
        assert_eq!(split_argv(r#"ls "a\"b""#).unwrap(), vec!["ls", "a\"b"]);
    }

    #[test]
    fn split_argv_rejects_unterminated_quote() {
        assert!(split_argv(r#"get "unterminated"#).is_err());
    }

    #[test]
    fn mode_string_directory() {
        assert_eq!(mode_string(Some(FileType::DIRECTORY), Some(0o755)), "drwxr-xr-x");
    }

    #[test]
    fn mode_string_plain_file() {
        assert_eq!(mode_string(Some(FileType::REGULAR), Some(0o644)), "-rw-r--r--");
    }

    #[test]
    fn ascii_and_binary_toggle_text_mode() {
        let transport = crate::transport::FramedTransport::new(
            Box::new(std::io::Cursor::new(Vec::<u8>::new())),
            Box::new(Vec::<u8>::new()),
            4096,
        );
        let engine = std::sync::Arc::new(crate::request::RequestEngine::new(std::sync::Arc::new(transport)));
        let mut session = Session::new(
            engine,
            6,
            b"\r\n".to_vec(),
            None,
            "/".to_string(),
            crate::session::SessionOptions::default(),
        );
        assert!(!session.text_mode);
        cmd_ascii(&mut session, &[]).unwrap();
        assert!(session.text_mode);
        cmd_binary(&mut session, &[]).unwrap();
        assert!(!session.text_mode);
    }
}
