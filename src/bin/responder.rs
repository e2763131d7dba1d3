use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sham::app::{ChatSink, FileSink, SilentSource};
use sham::{Connection, DatagramIo, Error, LossPolicy, TraceLog};

/// Accepts one SHAM connection and receives keyboard chat or a file from
/// the initiator.
#[derive(Debug, Parser)]
#[command(name = "responder")]
struct Args {
    /// Port to listen on.
    port: u16,

    /// Interactive chat instead of file transfer.
    #[arg(long)]
    chat: bool,

    /// Where to store a received file.
    #[arg(long, default_value = "received_file.dat")]
    output: PathBuf,

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

fn run(args: &Args) -> Result<(), Error> {
    let trace = TraceLog::from_env("responder_trace.log")?;
    let io = DatagramIo::bind(args.port, LossPolicy::new(args.loss))?;
    println!("Listening on port {}...", args.port);

    let mut conn = Connection::accept(io, trace)?;
    let mut source = SilentSource;

    if args.chat {
        let mut sink = ChatSink::stdout();
        conn.run(&mut source, &mut sink)?;
    } else {
        let mut sink = FileSink::create(&args.output)?;
        let result = conn.run(&mut source, &mut sink);

        // The file and its digest are final once the FIN closed the
        // stream, even if the teardown itself ran out of retries.
        if conn.digest().is_some() {
            println!("File saved as: {}", args.output.display());
        }
        if let Some(digest) = conn.digest() {
            println!("MD5: {digest}");
        }
        result?;
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
            eprintln!("responder: {err}");
            ExitCode::FAILURE
        }
    }
}
