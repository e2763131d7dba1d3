//! Optional wire-event trace file.
//!
//! A truthy `TRACE_LOG` environment variable opens a per-role append-mode
//! log (`initiator_trace.log` / `responder_trace.log`). Each line records
//! one wire event with a microsecond wall-clock stamp:
//!
//! ```text
//! [2024-05-01 13:37:00.123456] [LOG] SND DATA SEQ=1 LEN=6
//! [2024-05-01 13:37:00.291034] [LOG] RCV ACK=7 WIN=8192
//! ```
//!
//! Disabled tracing costs one `Option` check per event.

use std::fmt::Arguments;
use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::wire::{Flags, Packet};

pub const ENV_VAR: &str = "TRACE_LOG";

#[derive(Debug)]
pub struct TraceLog {
    file: Option<File>,
}

impl TraceLog {
    /// Open the trace file when `TRACE_LOG` is set to anything but an
    /// empty string, `0`, or `false`.
    pub fn from_env(path: &str) -> std::io::Result<Self> {
        let enabled = std::env::var(ENV_VAR)
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);

        let file = if enabled {
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        } else {
            None
        };

        Ok(TraceLog { file })
    }

    /// A sink that records nothing, for tests and embedded use.
    pub fn disabled() -> Self {
        TraceLog { file: None }
    }

    pub fn snd(&mut self, pkt: &Packet) {
        self.packet_event("SND", pkt);
    }

    pub fn rcv(&mut self, pkt: &Packet) {
        self.packet_event("RCV", pkt);
    }

    pub fn snd_data(&mut self, seq: u32, len: usize) {
        self.write(format_args!("SND DATA SEQ={seq} LEN={len}"));
    }

    pub fn retx(&mut self, seq: u32, len: usize) {
        self.write(format_args!("RETX DATA SEQ={seq} LEN={len}"));
    }

    pub fn drop_data(&mut self, seq: u32) {
        self.write(format_args!("DROP DATA SEQ={seq}"));
    }

    pub fn dropped(&mut self, pkt: &Packet) {
        self.packet_event("DROP", pkt);
    }

    pub fn timeout(&mut self, seq: u32) {
        self.write(format_args!("TIMEOUT SEQ={seq}"));
    }

    fn packet_event(&mut self, event: &str, pkt: &Packet) {
        if self.file.is_none() {
            return;
        }

        let h = &pkt.header;
        match pkt.kind() {
            "DATA" => self.write(format_args!(
                "{event} DATA SEQ={} LEN={}",
                h.seq,
                pkt.payload_len()
            )),
            "ACK" => self.write(format_args!("{event} ACK={} WIN={}", h.ack, h.window)),
            kind if h.flags.contains(Flags::ACK) => self.write(format_args!(
                "{event} {kind} SEQ={} ACK={}",
                h.seq, h.ack
            )),
            kind => self.write(format_args!("{event} {kind} SEQ={}", h.seq)),
        }
    }

    fn write(&mut self, args: Arguments<'_>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
        // Trace loss is not worth killing the connection over.
        let _ = writeln!(file, "[{stamp}] [LOG] {args}");
        let _ = file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn disabled_log_ignores_events() {
        let mut log = TraceLog::disabled();
        log.snd(&Packet::control(Flags::SYN, 50, 0, 1024));
        log.timeout(1);
    }

    #[test]
    fn records_have_event_and_kind_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        std::env::set_var(ENV_VAR, "1");
        let mut log = TraceLog::from_env(path.to_str().unwrap()).unwrap();
        std::env::remove_var(ENV_VAR);

        log.snd(&Packet::data(1, 0, 1024, Bytes::from_static(b"hi\0")));
        log.rcv(&Packet::control(Flags::ACK, 0, 4, 8192));
        log.retx(1, 3);
        log.timeout(1);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("SND DATA SEQ=1 LEN=3"));
        assert!(lines[1].contains("RCV ACK=4 WIN=8192"));
        assert!(lines[2].contains("RETX DATA SEQ=1 LEN=3"));
        assert!(lines[3].contains("TIMEOUT SEQ=1"));
        assert!(lines.iter().all(|l| l.contains("[LOG]")));
    }
}
