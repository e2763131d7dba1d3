//! End-to-end transfers with both endpoints running in-process over
//! loopback UDP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use sham::app::{FileSink, FileSource, NullSink, SilentSource};
use sham::{Connection, DatagramIo, Error, LossPolicy, TraceLog};

fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 997 + 7) as u8).collect()
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Accepts one connection and receives into `out`. The loss policy is
/// swapped in after the handshake so connection setup stays deterministic.
fn spawn_responder(
    io: DatagramIo,
    out: PathBuf,
    loss: Option<LossPolicy>,
) -> JoinHandle<Result<Option<String>, Error>> {
    thread::spawn(move || {
        let mut conn = Connection::accept(io, TraceLog::disabled())?;
        if let Some(loss) = loss {
            conn.set_loss(loss);
        }

        let mut source = SilentSource;
        let mut sink = FileSink::create(&out)?;
        conn.run(&mut source, &mut sink)
    })
}

fn send_file(
    peer: SocketAddr,
    input: &Path,
    loss: Option<LossPolicy>,
) -> Result<Option<String>, Error> {
    let io = DatagramIo::ephemeral(LossPolicy::off())?;
    let mut conn = Connection::open(io, peer, TraceLog::disabled())?;
    if let Some(loss) = loss {
        conn.set_loss(loss);
    }

    let mut source = FileSource::open(input)?;
    let mut sink = NullSink;
    conn.run(&mut source, &mut sink)?;
    Ok(source.digest().map(str::to_owned))
}

#[test]
fn file_transfer_without_loss_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");

    let content = test_bytes(64 * 1024);
    std::fs::write(&input, &content).unwrap();

    let responder_io = DatagramIo::bind(0, LossPolicy::off()).unwrap();
    let port = responder_io.local_addr().unwrap().port();
    let responder = spawn_responder(responder_io, output.clone(), None);

    let sent_digest = send_file(loopback(port), &input, None).unwrap();
    let received_digest = responder.join().unwrap().unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), content);
    assert!(received_digest.is_some());
    assert_eq!(received_digest, sent_digest);
}

#[test]
fn file_transfer_survives_loss_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");

    let content = test_bytes(16 * 1024);
    std::fs::write(&input, &content).unwrap();

    let responder_io = DatagramIo::bind(0, LossPolicy::off()).unwrap();
    let port = responder_io.local_addr().unwrap().port();
    let responder = spawn_responder(
        responder_io,
        output.clone(),
        Some(LossPolicy::seeded(0.15, 11)),
    );

    let sent_digest = send_file(
        loopback(port),
        &input,
        Some(LossPolicy::seeded(0.15, 23)),
    )
    .unwrap();

    // The teardown's final ACK may die on the lossy wire; the transfer
    // itself must still be complete and byte-identical.
    match responder.join().unwrap() {
        Ok(received_digest) => assert_eq!(received_digest, sent_digest),
        Err(Error::CloseTimeout(_)) => {}
        Err(other) => panic!("responder failed: {other}"),
    }
    assert_eq!(std::fs::read(&output).unwrap(), content);
}

#[test]
fn empty_stream_closes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty.bin");
    let output = dir.path().join("output.bin");
    std::fs::write(&input, b"").unwrap();

    let responder_io = DatagramIo::bind(0, LossPolicy::off()).unwrap();
    let port = responder_io.local_addr().unwrap().port();
    let responder = spawn_responder(responder_io, output.clone(), None);

    let sent_digest = send_file(loopback(port), &input, None).unwrap();
    let received_digest = responder.join().unwrap().unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), b"");
    // MD5 of the empty input on both ends.
    assert_eq!(sent_digest.as_deref(), Some("d41d8cd98f00b204e9800998ecf8427e"));
    assert_eq!(received_digest, sent_digest);
}

#[test]
fn handshake_times_out_against_a_silent_peer() {
    // Bound but never reads: the SYN goes nowhere.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer = silent.local_addr().unwrap();

    let io = DatagramIo::ephemeral(LossPolicy::off()).unwrap();
    let started = Instant::now();
    let result = Connection::open(io, peer, TraceLog::disabled());

    assert!(matches!(result, Err(Error::HandshakeTimeout)));
    assert!(started.elapsed().as_millis() >= 2900);
}
