//! Entry point (C12): parse arguments, build the transport, negotiate,
//! and run either a batch file or the interactive loop (spec.md §4.12).
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use log::{error, info};

use sftp_client::cli::Args;
use sftp_client::commands::{self, Outcome};
use sftp_client::negotiate;
use sftp_client::request::RequestEngine;
use sftp_client::session::{Session, SessionOptions};
use sftp_client::transport::{self, AddrFamily, FramedTransport, SubprocessOptions};

fn init_logging(debug: u8) {
    let default_level = match debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn build_transport(args: &Args) -> color_eyre::Result<FramedTransport> {
    let family = if args.ipv4 {
        AddrFamily::V4Only
    } else if args.ipv6 {
        AddrFamily::V6Only
    } else {
        AddrFamily::Any
    };

    if let Some(host) = &args.host {
        let stream = transport::connect_socket(host, args.port, family)?;
        let read_half = stream.try_clone().wrap_err("cloning socket for reading")?;
        Ok(FramedTransport::new(Box::new(read_half), Box::new(stream), args.buffer))
    } else {
        let destination = args
            .destination
            .clone()
            .ok_or_else(|| color_eyre::eyre::eyre!("a destination (user@host) is required"))?;
        let (user, host) = match destination.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, destination),
        };
        let opts = SubprocessOptions {
            program: args.program.clone(),
            subsystem: args.subsystem.clone(),
            host,
            user,
            config_file: None,
            extra_opts: Vec::new(),
            ipv4_only: args.ipv4,
            ipv6_only: args.ipv6,
            verbosity: args.debug as u32,
            compress: false,
        };
        let child = transport::spawn_subprocess(&opts)?;
        Ok(FramedTransport::new(Box::new(child.stdout), Box::new(child.stdin), args.buffer))
    }
}

fn run() -> color_eyre::Result<i32> {
    let args = Args::parse();
    init_logging(args.debug);

    if !(3..=6).contains(&args.sftp_version) {
        bail!("--sftp-version must be between 3 and 6");
    }

    let transport = build_transport(&args)?;
    let engine = Arc::new(RequestEngine::new(Arc::new(transport)));

    let (negotiated, buffer_size) = negotiate::negotiate(&engine, args.sftp_version, args.buffer)
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    info!(
        "negotiated protocol version {} (buffer_size={buffer_size})",
        negotiated.protocol_version
    );

    let options = SessionOptions {
        buffer_size,
        max_in_flight: args.requests.max(1),
        stop_on_error: args.stop_on_error(),
        progress_enabled: args.progress_enabled(),
        quirk_reverse_symlink: args.quirk_reverse_symlink,
    };
    let mut session = Session::new(
        Arc::clone(&engine),
        negotiated.protocol_version,
        negotiated.newline,
        negotiated.server_identity,
        "/".to_string(),
        options,
    );
    match session.realpath(".") {
        Ok(cwd) => session.cwd = cwd,
        Err(e) => error!("could not resolve initial working directory: {e}"),
    }

    let all_ok = if let Some(batch_path) = &args.batch {
        let file = std::fs::File::open(batch_path).wrap_err_with(|| format!("opening batch file {batch_path}"))?;
        commands::run_batch(&mut session, io::BufReader::new(file), args.stop_on_error())
            .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?
    } else {
        if let Some(id) = &session.server_identity {
            println!("Connected to {} ({} {}).", id.name, id.vendor, id.version);
        } else {
            println!("Connected.");
        }
        run_interactive(&mut session, args.stop_on_error())?
    };

    Ok(if all_ok { 0 } else { 1 })
}

/// The interactive REPL: print a prompt, read one line, dispatch it. Batch
/// mode goes through `commands::run_batch` instead, which has no prompt.
fn run_interactive(session: &mut Session, stop_on_error: bool) -> color_eyre::Result<bool> {
    let mut all_ok = true;
    let stdin = io::stdin();
    loop {
        print!("sftp> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        let n = stdin.lock().read_line(&mut line)?;
        if n == 0 {
            println!();
            break;
        }
        match commands::run_line(session, &line) {
            Ok(Outcome::Exit) => break,
            Ok(Outcome::Continue) => {}
            Err(e) if e.is_fatal() => return Err(color_eyre::eyre::eyre!(e.to_string())),
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

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    match run() {
        Ok(code) => std::process::exit(code),
        Err(report) => {
            error!("{report}");
            eprintln!("{report}");
            std::process::exit(1);
        }
    }
}
