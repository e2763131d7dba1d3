use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sham::app::{ChatSink, ChatSource, FileSource, NullSink};
use sham::{Connection, DatagramIo, Error, LossPolicy, TraceLog};

/// Opens a SHAM connection and streams either keyboard chat or a file to
/// the responder.
#[derive(Debug, Parser)]
#[command(name = "initiator")]
struct Args {
    /// Responder host name or address.
    host: String,

    /// Responder port.
    port: u16,

    /// File to transmit (file mode).
    #[arg(required_unless_present = "chat")]
    input: Option<PathBuf>,

    /// Name the responder is suggested to store the file under. Stays
    /// local; the responder decides its own output path.
    output_name: Option<String>,

    /// Interactive chat instead of file transfer.
    #[arg(long)]
    chat: bool,

    /// Probability in [0, 1] of dropping each outgoing datagram.
    #[arg(long, default_value_t = 0.0, value_parser = parse_loss)]
    loss: f64,
}

fn parse_loss(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("loss rate {rate} is outside [0, 1]"))
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Io(std::io::Error::other(format!("cannot resolve {host}:{port}"))))
}

fn run(args: &Args) -> Result<(), Error> {
    let peer = resolve(&args.host, args.port)?;
    let trace = TraceLog::from_env("initiator_trace.log")?;
    let io = DatagramIo::ephemeral(LossPolicy::new(args.loss))?;

    let mut conn = Connection::open(io, peer, trace)?;

    if args.chat {
        println!("Connected. Type messages; /quit ends the session.");
        let mut source = ChatSource::stdin()?;
        let mut sink = ChatSink::stdout();
        conn.run(&mut source, &mut sink)?;
    } else {
        let input = args.input.as_deref().expect("clap enforces input in file mode");
        if let Some(name) = &args.output_name {
            info!(name, "suggested output name");
        }

        let mut source = FileSource::open(input)?;
        let mut sink = NullSink;
        conn.run(&mut source, &mut sink)?;

        if let Some(digest) = source.digest() {
            println!("MD5: {digest}");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("initiator: {err}");
            ExitCode::FAILURE
        }
    }
}
