#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: datagram of {0} bytes is shorter than the header")]
    MalformedFrame(usize),

    #[error("oversized payload: {0} bytes exceeds the 1024-byte limit")]
    OversizedPayload(usize),

    #[error("handshake timed out waiting for SYN-ACK")]
    HandshakeTimeout,

    #[error("teardown abandoned after {0} FIN retries")]
    CloseTimeout(u32),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("poll error: {0}")]
    Sys(#[from] nix::Error),
}
