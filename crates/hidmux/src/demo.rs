use std::time::Instant;

use rand::RngCore;

use hidmux_engine::{CborReply, Platform};
use hidmux_wire::{ReportSink, REPORT_SIZE};

/// In-process stand-in for the firmware collaborators.
///
/// Echo processors, a real RNG, a counting indicator, and a wall-clock
/// monotonic source — enough to exercise every transport path without
/// hardware. Emitted reports are captured for the caller to drain.
pub struct DemoPlatform {
    started: Instant,
    rng: rand::rngs::ThreadRng,
    reports: Vec<[u8; REPORT_SIZE]>,
    winks: usize,
}

impl Default for DemoPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoPlatform {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rng: rand::thread_rng(),
            reports: Vec::new(),
            winks: 0,
        }
    }

    /// Take every report emitted since the last drain.
    pub fn drain(&mut self) -> Vec<[u8; REPORT_SIZE]> {
        std::mem::take(&mut self.reports)
    }

    pub fn winks(&self) -> usize {
        self.winks
    }
}

impl ReportSink for DemoPlatform {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) {
        self.reports.push(*report);
    }
}

impl Platform for DemoPlatform {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn wink(&mut self) {
        self.winks += 1;
    }

    fn process_cbor(&mut self, payload: &[u8]) -> CborReply {
        CborReply {
            status: 0x00,
            data: payload.to_vec(),
        }
    }

    fn process_msg(&mut self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}
