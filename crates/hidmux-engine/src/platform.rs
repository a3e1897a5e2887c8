use hidmux_wire::ReportSink;

/// Reply from the CBOR command processor: a one-byte status code followed by
/// the response body. The status byte is written back to the host as a
/// prefix of the response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CborReply {
    pub status: u8,
    pub data: Vec<u8>,
}

/// The external collaborators the engine runs against.
///
/// Everything here is synchronous and assumed non-blocking; the engine is
/// single-threaded and run-to-completion, so implementations are never called
/// concurrently. The raw outbound transport comes in through the
/// [`ReportSink`] supertrait.
///
/// A long-running processor that wants to signal liveness mid-computation can
/// emit keepalive frames itself through [`hidmux_wire::write_keepalive`]; the
/// engine does not interrupt or time out a processor that fails to return.
pub trait Platform: ReportSink {
    /// Monotonic time in milliseconds.
    fn now_ms(&self) -> u64;

    /// Fill `buf` from the device RNG.
    fn fill_random(&mut self, buf: &mut [u8]);

    /// Trigger the hardware indicator (wink).
    fn wink(&mut self);

    /// Process a reassembled CTAP2 CBOR message.
    fn process_cbor(&mut self, payload: &[u8]) -> CborReply;

    /// Process a reassembled U2F/APDU message.
    fn process_msg(&mut self, payload: &[u8]) -> Vec<u8>;

    /// Hook given first refusal on legacy messages. Returning `Some`
    /// short-circuits [`Platform::process_msg`] and the reply is written
    /// back verbatim.
    fn intercept_msg(&mut self, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }
}
