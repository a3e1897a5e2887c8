use tracing::trace;

use crate::command::{Command, ErrorCode, KeepaliveStatus};
use crate::error::{Result, WireError};
use crate::packet::{CONT_HEADER_SIZE, INIT_HEADER_SIZE, MAX_PAYLOAD, REPORT_SIZE};

/// Raw outbound transport: accepts one fixed-size report at a time.
///
/// Fire-and-forget; the physical driver is assumed to always succeed at this
/// layer's boundary.
pub trait ReportSink {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]);
}

impl<S: ReportSink + ?Sized> ReportSink for &mut S {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) {
        (**self).write_report(report);
    }
}

/// Serializes one logical response into a sequence of fixed-size reports.
///
/// The first report carries the command byte and the declared total length;
/// subsequent reports carry an incrementing sequence counter starting at 0.
/// The final partial report is zero-padded. Created per response and consumed
/// by [`ReportWriter::finish`].
#[derive(Debug)]
pub struct ReportWriter {
    channel: u32,
    command: Command,
    total: u16,
    sequence: u8,
    written: usize,
    offset: usize,
    buf: [u8; REPORT_SIZE],
}

impl ReportWriter {
    /// Start a response of `total` payload bytes on `channel`.
    pub fn new(channel: u32, command: Command, total: usize) -> Result<Self> {
        if total > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: total,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            channel,
            command,
            total: total as u16,
            sequence: 0,
            written: 0,
            offset: 0,
            buf: [0u8; REPORT_SIZE],
        })
    }

    /// Append payload bytes, flushing every report that fills.
    pub fn write<S: ReportSink>(&mut self, sink: &mut S, mut data: &[u8]) {
        while !data.is_empty() {
            if self.offset == 0 {
                self.start_report();
            }
            let room = REPORT_SIZE - self.offset;
            let take = room.min(data.len());
            self.buf[self.offset..self.offset + take].copy_from_slice(&data[..take]);
            self.offset += take;
            self.written += take;
            data = &data[take..];

            if self.offset == REPORT_SIZE {
                sink.write_report(&self.buf);
                self.offset = 0;
            }
        }
    }

    /// Flush whatever is pending, zero-padded to the report size.
    ///
    /// A response with no payload emits a single header-only report; a
    /// response whose length is an exact multiple of the report capacity
    /// emits nothing further.
    pub fn finish<S: ReportSink>(mut self, sink: &mut S) {
        if self.offset == 0 && self.written == 0 {
            self.start_report();
        }
        if self.offset > 0 {
            self.buf[self.offset..].fill(0);
            sink.write_report(&self.buf);
        }
        trace!(
            channel = self.channel,
            command = ?self.command,
            total = self.total,
            "response flushed"
        );
    }

    fn start_report(&mut self) {
        self.buf[0..4].copy_from_slice(&self.channel.to_le_bytes());
        if self.written == 0 {
            self.buf[4] = u8::from(self.command) | 0x80;
            self.buf[5..7].copy_from_slice(&self.total.to_be_bytes());
            self.offset = INIT_HEADER_SIZE;
        } else {
            self.buf[4] = self.sequence;
            self.sequence = self.sequence.wrapping_add(1);
            self.offset = CONT_HEADER_SIZE;
        }
    }
}

/// Emit a one-shot error frame on `channel`.
///
/// Both the dispatcher's per-packet error paths and the timeout sweeper
/// funnel through here.
pub fn write_error<S: ReportSink>(sink: &mut S, channel: u32, code: ErrorCode) {
    trace!(channel, ?code, "error frame");
    // A 1-byte body always fits, so construction cannot fail.
    let mut writer =
        ReportWriter::new(channel, Command::Error, 1).expect("1-byte error frame fits");
    writer.write(sink, &[u8::from(code)]);
    writer.finish(sink);
}

/// Emit a 1-byte keepalive status frame on `channel`.
///
/// Used by a long-running handler's surroundings to signal liveness to the
/// host without releasing the in-flight flag.
pub fn write_keepalive<S: ReportSink>(sink: &mut S, channel: u32, status: KeepaliveStatus) {
    trace!(channel, ?status, "keepalive frame");
    let mut writer =
        ReportWriter::new(channel, Command::Keepalive, 1).expect("1-byte keepalive frame fits");
    writer.write(sink, &[u8::from(status)]);
    writer.finish(sink);
}
