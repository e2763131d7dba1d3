//! Byte-stream producers and consumers fed to the connection.
//!
//! The endpoint core is mode-agnostic; chat and file transfer differ only
//! in the `Source` it pulls payloads from and the `Sink` it delivers them
//! to. Sources must never block the event loop: a source either has a
//! payload, has nothing right now, or is finished.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::path::Path;

use md5::{Digest, Md5};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::debug;

use crate::wire::MAX_PAYLOAD;

/// What a source produced when asked for the next payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Fetch {
    Ready(Vec<u8>),
    /// Nothing available right now; more may come.
    Idle,
    /// The byte stream has ended.
    Done,
}

pub trait Source {
    /// Descriptor to watch for readiness, when the source is fed by one.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn fetch(&mut self) -> io::Result<Fetch>;
}

pub trait Sink {
    fn deliver(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Close the stream. Returns the hex digest of everything delivered,
    /// when the sink computes one.
    fn finish(&mut self) -> io::Result<Option<String>>;
}

/// Chat command that ends the session from the keyboard.
const QUIT_COMMAND: &str = "/quit";

fn io_err(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Splits completed lines out of `buf` into wire messages. Each message
/// carries a trailing `\0` that counts in sequence space; this convention
/// is confined to the chat adapters on both ends. Returns true when a
/// quit command was seen.
fn drain_lines(buf: &mut Vec<u8>, pending: &mut VecDeque<Vec<u8>>) -> bool {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();

        if line == QUIT_COMMAND.as_bytes() {
            buf.clear();
            return true;
        }
        if line.is_empty() {
            continue;
        }

        // Lines longer than one payload travel as several messages.
        for chunk in line.chunks(MAX_PAYLOAD - 1) {
            let mut msg = chunk.to_vec();
            msg.push(0);
            pending.push_back(msg);
        }
    }

    false
}

/// Keyboard producer: non-blocking line input on stdin.
pub struct ChatSource {
    fd: RawFd,
    buf: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    eof: bool,
}

impl ChatSource {
    pub fn stdin() -> io::Result<Self> {
        let fd = 0;

        // Line input must not stall the event loop while timers are
        // pending, so stdin goes non-blocking and is polled like the
        // socket.
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;

        Ok(ChatSource {
            fd,
            buf: Vec::new(),
            pending: VecDeque::new(),
            eof: false,
        })
    }
}

impl Source for ChatSource {
    fn poll_fd(&self) -> Option<RawFd> {
        (!self.eof).then_some(self.fd)
    }

    fn fetch(&mut self) -> io::Result<Fetch> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Fetch::Ready(msg));
        }
        if self.eof {
            return Ok(Fetch::Done);
        }

        let mut chunk = [0u8; 4096];
        loop {
            match nix::unistd::read(self.fd, &mut chunk) {
                Ok(0) => {
                    // Terminal closed; a partial last line still ships.
                    if !self.buf.is_empty() {
                        self.buf.push(b'\n');
                        drain_lines(&mut self.buf, &mut self.pending);
                    }
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if drain_lines(&mut self.buf, &mut self.pending) {
                        self.eof = true;
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(err) => return Err(io_err(err)),
            }
        }

        match self.pending.pop_front() {
            Some(msg) => Ok(Fetch::Ready(msg)),
            None if self.eof => Ok(Fetch::Done),
            None => Ok(Fetch::Idle),
        }
    }
}

/// File producer: fixed-size chunks, hashing as it reads so the operator
/// can compare digests across the transfer.
pub struct FileSource {
    file: File,
    hasher: Md5,
    digest: Option<String>,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(FileSource {
            file: File::open(path)?,
            hasher: Md5::new(),
            digest: None,
        })
    }

    /// Hex digest of the bytes read so far; complete once the source has
    /// reported `Done`.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl Source for FileSource {
    fn fetch(&mut self) -> io::Result<Fetch> {
        let mut chunk = vec![0u8; MAX_PAYLOAD];
        let n = self.file.read(&mut chunk)?;

        if n == 0 {
            if self.digest.is_none() {
                self.digest = Some(format!("{:x}", self.hasher.finalize_reset()));
            }
            return Ok(Fetch::Done);
        }

        chunk.truncate(n);
        self.hasher.update(&chunk);
        Ok(Fetch::Ready(chunk))
    }
}

/// Producer of the purely receiving role: never yields, never ends. The
/// responder's shutdown is driven by the peer's FIN instead.
pub struct SilentSource;

impl Source for SilentSource {
    fn fetch(&mut self) -> io::Result<Fetch> {
        Ok(Fetch::Idle)
    }
}

/// Chat consumer: prints each message, minus the wire terminator.
pub struct ChatSink<W: Write> {
    out: W,
}

impl ChatSink<io::Stdout> {
    pub fn stdout() -> Self {
        ChatSink { out: io::stdout() }
    }
}

impl<W: Write> Sink for ChatSink<W> {
    fn deliver(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        self.out.write_all(text)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    fn finish(&mut self) -> io::Result<Option<String>> {
        Ok(None)
    }
}

/// File consumer: writes through to disk while hashing incrementally, so
/// the digest is ready the moment the stream closes.
pub struct FileSink {
    file: File,
    hasher: Md5,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(FileSink {
            file: File::create(path)?,
            hasher: Md5::new(),
        })
    }
}

impl Sink for FileSink {
    fn deliver(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<Option<String>> {
        self.file.flush()?;
        Ok(Some(format!("{:x}", self.hasher.finalize_reset())))
    }
}

/// Consumer for a side that expects no data.
pub struct NullSink;

impl Sink for NullSink {
    fn deliver(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug!(len = bytes.len(), "discarding unexpected payload");
        Ok(())
    }

    fn finish(&mut self) -> io::Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_become_nul_terminated_messages() {
        let mut buf = b"hello\nworld\n".to_vec();
        let mut pending = VecDeque::new();

        assert!(!drain_lines(&mut buf, &mut pending));
        assert_eq!(pending, [b"hello\0".to_vec(), b"world\0".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_stays_buffered() {
        let mut buf = b"hel".to_vec();
        let mut pending = VecDeque::new();

        drain_lines(&mut buf, &mut pending);
        assert!(pending.is_empty());
        assert_eq!(buf, b"hel");
    }

    #[test]
    fn empty_lines_are_skipped_and_quit_ends_stream() {
        let mut buf = b"\n\nhi\n/quit\nafter\n".to_vec();
        let mut pending = VecDeque::new();

        assert!(drain_lines(&mut buf, &mut pending));
        assert_eq!(pending, [b"hi\0".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn long_line_is_split_across_payloads() {
        let mut buf = vec![b'x'; MAX_PAYLOAD + 10];
        buf.push(b'\n');
        let mut pending = VecDeque::new();

        drain_lines(&mut buf, &mut pending);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].len(), MAX_PAYLOAD);
        assert_eq!(*pending[0].last().unwrap(), 0);
        assert_eq!(pending[1].len(), 12);
    }

    #[test]
    fn file_source_chunks_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let mut src = FileSource::open(&path).unwrap();
        assert_eq!(src.fetch().unwrap(), Fetch::Ready(b"hello world".to_vec()));
        assert_eq!(src.fetch().unwrap(), Fetch::Done);
        assert_eq!(src.digest(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[test]
    fn file_sink_digest_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(&path).unwrap();
        sink.deliver(b"hello ").unwrap();
        sink.deliver(b"world").unwrap();
        let digest = sink.finish().unwrap();

        assert_eq!(digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn chat_sink_strips_terminator() {
        let mut out = Vec::new();
        {
            let mut sink = ChatSink { out: &mut out };
            sink.deliver(b"hello\0").unwrap();
        }
        assert_eq!(out, b"hello\n");
    }
}
