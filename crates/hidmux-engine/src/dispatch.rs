use tracing::{debug, trace, warn};

use hidmux_wire::{
    write_error, write_keepalive, Command, ErrorCode, KeepaliveStatus, Packet, ReportSink,
    ReportWriter, BROADCAST_CHANNEL, CAPABILITY_CBOR, CAPABILITY_WINK, MAX_PAYLOAD, REPORT_SIZE,
};

use crate::assembly::{Assembler, AssemblyStatus, Message};
use crate::error::{AssemblyError, EngineError, Result};
use crate::platform::Platform;
use crate::registry::ChannelRegistry;

/// RNG response size substituted when the host requests zero bytes.
const DEFAULT_RNG_LEN: usize = 57;

/// Allocation handshake payload: an 8-byte nonce.
const ALLOCATION_NONCE_LEN: u16 = 8;

/// Allocation response body: nonce (8) + channel (4) + versions (4) + caps (1).
const ALLOCATION_RESPONSE_LEN: usize = 17;

/// Protocol version byte reported in the allocation response.
const PROTOCOL_VERSION: u8 = 2;

/// Engine policy knobs. Defaults carry the reference firmware policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum reassembled payload size in bytes.
    pub max_payload: usize,
    /// Idle deadline after which a channel is evicted, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Device version reported in the allocation response (major, minor, build).
    pub version: (u8, u8, u8),
    /// Capability flags reported in the allocation response.
    pub capabilities: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            idle_timeout_ms: 750,
            version: (0, 0, 0),
            capabilities: CAPABILITY_WINK | CAPABILITY_CBOR,
        }
    }
}

/// Outcome of classifying one physical report.
enum Classified {
    /// Deliberate no-reply outcomes: stray continuations, handled handshakes.
    Ignore,
    /// A protocol error to report on `channel`.
    Reject { channel: u32, code: ErrorCode },
    /// Fragment accepted, message still incomplete.
    Buffering,
    /// A complete logical message ready for command routing.
    Complete(Message),
}

/// The per-packet protocol state machine.
///
/// Owns the channel registry, the reassembly buffer, and the in-flight flag —
/// all the shared mutable state of the transport layer — and drives them from
/// exactly one call site at a time: [`Engine::handle_report`] for inbound
/// traffic and [`Engine::check_timeouts`] between packets. No interior
/// locking; single-threaded by construction.
#[derive(Debug)]
pub struct Engine {
    registry: ChannelRegistry,
    assembler: Assembler,
    /// At most one CBOR or legacy-message command may be in progress.
    /// Advisory: cancellation clears it, nothing preempts a running handler.
    busy: bool,
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            assembler: Assembler::new(config.max_payload),
            busy: false,
            config,
        }
    }

    /// Current engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while a long-running command is conceptually in progress.
    pub fn in_flight(&self) -> bool {
        self.busy
    }

    /// Process one physical report to completion.
    ///
    /// Every protocol-level outcome — accepted fragments, error frames,
    /// deliberate ignores — returns `Ok(())`. `Err` is reserved for faults
    /// the device cannot translate into an error frame (see
    /// [`EngineError`]); channel and buffer state are cleaned up before any
    /// such return.
    pub fn handle_report<P: Platform>(
        &mut self,
        platform: &mut P,
        report: &[u8; REPORT_SIZE],
    ) -> Result<()> {
        let packet = Packet::parse(report)?;
        trace!(
            channel = packet.channel(),
            init = packet.is_init(),
            "report received"
        );

        match self.classify(platform, packet)? {
            Classified::Ignore => Ok(()),
            Classified::Reject { channel, code } => {
                debug!(channel, ?code, "rejecting fragment");
                self.registry.release(channel);
                // Only a sequence violation belongs to the exchange that owns
                // the buffer; other rejections must not clobber it.
                if code == ErrorCode::InvalidSequence {
                    self.assembler.reset();
                }
                write_error(platform, channel, code);
                Ok(())
            }
            Classified::Buffering => Ok(()),
            Classified::Complete(message) => self.route(platform, message),
        }
    }

    /// Evict channels idle past the deadline.
    ///
    /// Invoked periodically by the surrounding runtime, never concurrently
    /// with [`Engine::handle_report`]. Each evicted channel receives exactly
    /// one timeout error frame; if it owned the reassembly buffer, the buffer
    /// is cleared.
    pub fn check_timeouts<P: Platform>(&mut self, platform: &mut P) -> Result<()> {
        let now = platform.now_ms();
        for channel in self.registry.sweep(now, self.config.idle_timeout_ms) {
            warn!(channel, "channel timed out");
            if self.assembler.owner() == Some(channel) {
                self.assembler.reset();
            }
            write_error(platform, channel, ErrorCode::Timeout);
        }
        Ok(())
    }

    /// Signal liveness for the exchange currently holding the reassembly
    /// buffer. No-op when nothing is staged.
    pub fn send_keepalive<P: Platform>(&mut self, platform: &mut P, status: KeepaliveStatus) {
        if let Some(channel) = self.assembler.owner() {
            write_keepalive(platform, channel, status);
        }
    }

    /// Steps 1–8: classify the fragment and drive registry + assembler.
    fn classify<P: Platform>(&mut self, platform: &mut P, packet: Packet<'_>) -> Result<Classified> {
        let now = platform.now_ms();

        // The allocation command is handled entirely here and never queued.
        if let Packet::Init {
            channel,
            command,
            length,
            payload,
        } = packet
        {
            if command == u8::from(Command::Init) {
                return self.handle_allocation(platform, channel, length, payload, now);
            }
        }

        let channel = packet.channel();
        if channel == BROADCAST_CHANNEL {
            // Only the allocation handshake may address the broadcast id.
            return Ok(Classified::Reject {
                channel,
                code: ErrorCode::InvalidChannel,
            });
        }

        // Lazy creation on first contact — but only while no reassembly is
        // staged. A full registry is reported as busy by the fall-through.
        if !self.registry.exists(channel)
            && packet.is_init()
            && self.assembler.status() == AssemblyStatus::Empty
        {
            let _ = self.registry.ensure(channel, now);
        }

        if !self.registry.exists(channel) {
            if !packet.is_init() {
                trace!(channel, "ignoring continuation for unknown channel");
                return Ok(Classified::Ignore);
            }
            return Ok(Classified::Reject {
                channel,
                code: ErrorCode::ChannelBusy,
            });
        }

        if self.assembler.status() == AssemblyStatus::Buffering {
            let owner = self.assembler.owner();
            if owner == Some(channel) && packet.is_init() {
                // A host must not restart reassembly mid-stream.
                return Ok(Classified::Reject {
                    channel,
                    code: ErrorCode::InvalidSequence,
                });
            }
            if owner != Some(channel) {
                if packet.is_init() {
                    return Ok(Classified::Reject {
                        channel,
                        code: ErrorCode::ChannelBusy,
                    });
                }
                trace!(channel, "ignoring continuation for non-owner channel");
                return Ok(Classified::Ignore);
            }
        }

        match packet {
            Packet::Init {
                command,
                length,
                payload,
                ..
            } => {
                if length as usize > self.config.max_payload {
                    return Ok(Classified::Reject {
                        channel,
                        code: ErrorCode::InvalidLength,
                    });
                }
                match self.assembler.begin(channel, command, length, payload) {
                    Ok(_) => {}
                    Err(AssemblyError::Oversize { .. }) => {
                        return Ok(Classified::Reject {
                            channel,
                            code: ErrorCode::InvalidLength,
                        });
                    }
                    Err(_) => {
                        return Err(EngineError::InternalInvariant(
                            "reassembly begin rejected an accepted fragment",
                        ));
                    }
                }
            }
            Packet::Cont {
                sequence, payload, ..
            } => {
                if self.assembler.owner() != Some(channel) {
                    trace!(channel, "ignoring unwarranted continuation");
                    return Ok(Classified::Ignore);
                }
                match self.assembler.append(channel, sequence, payload) {
                    Ok(_) => {}
                    Err(AssemblyError::BadSequence { expected, got }) => {
                        debug!(channel, expected, got, "sequence violation");
                        return Ok(Classified::Reject {
                            channel,
                            code: ErrorCode::InvalidSequence,
                        });
                    }
                    Err(_) => {
                        return Err(EngineError::InternalInvariant(
                            "reassembly append rejected an accepted fragment",
                        ));
                    }
                }
            }
        }

        self.registry.touch(channel, now).map_err(|_| {
            EngineError::InternalInvariant("refresh failed for a registered channel")
        })?;

        match self.assembler.status() {
            AssemblyStatus::Buffering => Ok(Classified::Buffering),
            AssemblyStatus::Buffered => {
                let message = self.assembler.take().map_err(|_| {
                    EngineError::InternalInvariant("buffered message could not be taken")
                })?;
                Ok(Classified::Complete(message))
            }
            AssemblyStatus::Empty => Err(EngineError::InternalInvariant(
                "assembler empty after accepting a fragment",
            )),
        }
    }

    /// Step 2: the channel-allocation handshake.
    fn handle_allocation<P: Platform>(
        &mut self,
        platform: &mut P,
        channel: u32,
        length: u16,
        payload: &[u8],
        now: u64,
    ) -> Result<Classified> {
        if length != ALLOCATION_NONCE_LEN {
            return Ok(Classified::Reject {
                channel,
                code: ErrorCode::InvalidLength,
            });
        }
        if channel == 0 {
            return Ok(Classified::Reject {
                channel,
                code: ErrorCode::InvalidChannel,
            });
        }

        // An allocation command aborts whatever reassembly was in progress.
        self.assembler.reset();

        let assigned = if channel == BROADCAST_CHANNEL {
            match self.registry.allocate_new(now) {
                Ok(id) => id,
                Err(_) => {
                    return Ok(Classified::Reject {
                        channel,
                        code: ErrorCode::ChannelBusy,
                    });
                }
            }
        } else {
            // Directed handshake: synchronize to the concrete id.
            if self.registry.exists(channel) {
                self.registry.touch(channel, now).map_err(|_| {
                    EngineError::InternalInvariant("refresh failed for a registered channel")
                })?;
            } else if self.registry.ensure(channel, now).is_err() {
                return Ok(Classified::Reject {
                    channel,
                    code: ErrorCode::ChannelBusy,
                });
            }
            channel
        };

        let mut body = [0u8; ALLOCATION_RESPONSE_LEN];
        body[..8].copy_from_slice(&payload[..8]);
        body[8..12].copy_from_slice(&assigned.to_le_bytes());
        body[12] = PROTOCOL_VERSION;
        body[13] = self.config.version.0;
        body[14] = self.config.version.1;
        body[15] = self.config.version.2;
        body[16] = self.config.capabilities;

        let mut writer = ReportWriter::new(channel, Command::Init, body.len())?;
        writer.write(platform, &body);
        writer.finish(platform);

        // Not a standing reservation: the id survives only until the next
        // initial fragment that references it re-registers it lazily.
        self.registry.release(assigned);
        debug!(requested = channel, assigned, "allocation handshake complete");
        Ok(Classified::Ignore)
    }

    /// Steps 9–10: route a complete message, then retire its channel.
    fn route<P: Platform>(&mut self, platform: &mut P, message: Message) -> Result<()> {
        let result = self.run_command(platform, &message);
        // Each exchange permanently consumes its channel reservation,
        // success or not; the next initial fragment re-establishes it.
        self.registry.release(message.channel);
        result
    }

    fn run_command<P: Platform>(&mut self, platform: &mut P, message: &Message) -> Result<()> {
        let command = match Command::try_from(message.command) {
            Ok(command) => command,
            Err(raw) => {
                debug!(raw, channel = message.channel, "unrecognized command");
                write_error(platform, message.channel, ErrorCode::InvalidCommand);
                return Ok(());
            }
        };
        trace!(
            ?command,
            channel = message.channel,
            len = message.payload.len(),
            "dispatching command"
        );

        match command {
            Command::Init => Err(EngineError::InternalInvariant(
                "allocation command escaped the handshake path",
            )),
            Command::Ping => respond(platform, message.channel, Command::Ping, &[&message.payload]),
            Command::Wink => {
                platform.wink();
                respond(platform, message.channel, Command::Wink, &[])
            }
            Command::Cbor => {
                if message.payload.is_empty() {
                    write_error(platform, message.channel, ErrorCode::InvalidLength);
                    return Ok(());
                }
                if self.busy {
                    debug!(channel = message.channel, "command already in flight");
                    write_error(platform, message.channel, ErrorCode::ChannelBusy);
                    return Ok(());
                }
                self.busy = true;
                let reply = platform.process_cbor(&message.payload);
                let result = respond(
                    platform,
                    message.channel,
                    Command::Cbor,
                    &[&[reply.status], &reply.data],
                );
                self.busy = false;
                result
            }
            Command::Msg => {
                if message.payload.is_empty() {
                    write_error(platform, message.channel, ErrorCode::InvalidLength);
                    return Ok(());
                }
                if self.busy {
                    debug!(channel = message.channel, "command already in flight");
                    write_error(platform, message.channel, ErrorCode::ChannelBusy);
                    return Ok(());
                }
                self.busy = true;
                let response = match platform.intercept_msg(&message.payload) {
                    Some(response) => response,
                    None => platform.process_msg(&message.payload),
                };
                let result = respond(platform, message.channel, Command::Msg, &[&response]);
                self.busy = false;
                result
            }
            Command::Cancel => {
                // Cooperative only: lets the next long-running command
                // through. No reply frame.
                self.busy = false;
                Ok(())
            }
            Command::GetRng => {
                let mut len = message.payload.first().copied().unwrap_or(0) as usize;
                if len == 0 {
                    len = DEFAULT_RNG_LEN;
                }
                let mut buf = vec![0u8; len];
                platform.fill_random(&mut buf);
                respond(platform, message.channel, Command::GetRng, &[&buf])
            }
            #[cfg(feature = "probe")]
            Command::Probe => {
                let digest = crate::probe::run(&message.payload)?;
                respond(platform, message.channel, Command::Probe, &[&digest])
            }
            #[cfg(not(feature = "probe"))]
            Command::Probe => {
                write_error(platform, message.channel, ErrorCode::InvalidCommand);
                Ok(())
            }
            Command::Keepalive | Command::Error => {
                // Device-to-host frames; a host must not send them.
                write_error(platform, message.channel, ErrorCode::InvalidCommand);
                Ok(())
            }
        }
    }
}

/// Serialize one response from its parts and flush it.
fn respond<S: ReportSink>(
    sink: &mut S,
    channel: u32,
    command: Command,
    parts: &[&[u8]],
) -> Result<()> {
    let total = parts.iter().map(|part| part.len()).sum();
    let mut writer = ReportWriter::new(channel, command, total)?;
    for part in parts {
        writer.write(sink, part);
    }
    writer.finish(sink);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CborReply;
    use hidmux_wire::{cont_report, init_report, CONT_PAYLOAD_SIZE, INIT_PAYLOAD_SIZE};

    #[derive(Default)]
    struct TestPlatform {
        now: u64,
        reports: Vec<[u8; REPORT_SIZE]>,
        winks: usize,
        cbor_calls: usize,
        msg_calls: usize,
        intercept: Option<Vec<u8>>,
    }

    impl ReportSink for TestPlatform {
        fn write_report(&mut self, report: &[u8; REPORT_SIZE]) {
            self.reports.push(*report);
        }
    }

    impl Platform for TestPlatform {
        fn now_ms(&self) -> u64 {
            self.now
        }

        fn fill_random(&mut self, buf: &mut [u8]) {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = (i as u8) ^ 0xa5;
            }
        }

        fn wink(&mut self) {
            self.winks += 1;
        }

        fn process_cbor(&mut self, payload: &[u8]) -> CborReply {
            self.cbor_calls += 1;
            CborReply {
                status: 0x00,
                data: payload.to_vec(),
            }
        }

        fn process_msg(&mut self, payload: &[u8]) -> Vec<u8> {
            self.msg_calls += 1;
            payload.iter().rev().copied().collect()
        }

        fn intercept_msg(&mut self, _payload: &[u8]) -> Option<Vec<u8>> {
            self.intercept.clone()
        }
    }

    /// Reassemble emitted reports into (channel, command, body) responses.
    fn decode_responses(reports: &[[u8; REPORT_SIZE]]) -> Vec<(u32, u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut iter = reports.iter();
        while let Some(report) = iter.next() {
            match Packet::parse(report).unwrap() {
                Packet::Init {
                    channel,
                    command,
                    length,
                    payload,
                } => {
                    let mut body = payload.to_vec();
                    while body.len() < length as usize {
                        match Packet::parse(iter.next().expect("continuation report")).unwrap() {
                            Packet::Cont { payload, .. } => {
                                let need = length as usize - body.len();
                                body.extend_from_slice(&payload[..need.min(payload.len())]);
                            }
                            other => panic!("expected continuation, got {other:?}"),
                        }
                    }
                    out.push((channel, command, body));
                }
                other => panic!("response must start with an initial fragment, got {other:?}"),
            }
        }
        out
    }

    fn expect_single_error(platform: &TestPlatform, channel: u32, code: ErrorCode) {
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses.len(), 1, "expected exactly one frame");
        assert_eq!(
            responses[0],
            (channel, u8::from(Command::Error), vec![u8::from(code)])
        );
    }

    /// Feed a full logical message through the engine, fragmenting as a
    /// conformant host would.
    fn send_message(
        engine: &mut Engine,
        platform: &mut TestPlatform,
        channel: u32,
        command: u8,
        payload: &[u8],
    ) -> Result<()> {
        let first = payload.len().min(INIT_PAYLOAD_SIZE);
        engine.handle_report(
            platform,
            &init_report(channel, command, payload.len() as u16, &payload[..first]),
        )?;
        let mut offset = first;
        let mut seq = 0u8;
        while offset < payload.len() {
            let take = (payload.len() - offset).min(CONT_PAYLOAD_SIZE);
            engine.handle_report(
                platform,
                &cont_report(channel, seq, &payload[offset..offset + take]),
            )?;
            seq += 1;
            offset += take;
        }
        Ok(())
    }

    #[test]
    fn allocation_handshake_assigns_fresh_channel() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];

        engine
            .handle_report(
                &mut platform,
                &init_report(BROADCAST_CHANNEL, u8::from(Command::Init), 8, &nonce),
            )
            .unwrap();

        let responses = decode_responses(&platform.reports);
        assert_eq!(responses.len(), 1);
        let (channel, command, body) = &responses[0];
        assert_eq!(*channel, BROADCAST_CHANNEL);
        assert_eq!(*command, u8::from(Command::Init));
        assert_eq!(body.len(), 17);
        assert_eq!(&body[..8], &nonce);

        let assigned = u32::from_le_bytes(body[8..12].try_into().unwrap());
        assert_ne!(assigned, 0);
        assert_ne!(assigned, BROADCAST_CHANNEL);
        assert_eq!(body[12], PROTOCOL_VERSION);
        assert_eq!(body[16], CAPABILITY_WINK | CAPABILITY_CBOR);

        // The handshake holds no standing reservation.
        assert_eq!(engine.registry.occupied(), 0);
    }

    #[test]
    fn allocation_rejects_bad_nonce_length() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(
                &mut platform,
                &init_report(BROADCAST_CHANNEL, u8::from(Command::Init), 7, &[0; 7]),
            )
            .unwrap();

        expect_single_error(&platform, BROADCAST_CHANNEL, ErrorCode::InvalidLength);
    }

    #[test]
    fn allocation_rejects_zero_channel() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(
                &mut platform,
                &init_report(0, u8::from(Command::Init), 8, &[0; 8]),
            )
            .unwrap();

        expect_single_error(&platform, 0, ErrorCode::InvalidChannel);
    }

    #[test]
    fn directed_allocation_synchronizes_to_concrete_id() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(
                &mut platform,
                &init_report(42, u8::from(Command::Init), 8, &[9; 8]),
            )
            .unwrap();

        let responses = decode_responses(&platform.reports);
        assert_eq!(responses.len(), 1);
        let (channel, _, body) = &responses[0];
        assert_eq!(*channel, 42);
        assert_eq!(u32::from_le_bytes(body[8..12].try_into().unwrap()), 42);
        assert_eq!(engine.registry.occupied(), 0);
    }

    #[test]
    fn allocation_aborts_reassembly_in_progress() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        // Channel 5 starts a fragmented message.
        engine
            .handle_report(&mut platform, &init_report(5, 0x01, 200, &[0; 57]))
            .unwrap();
        assert_eq!(engine.assembler.status(), AssemblyStatus::Buffering);

        engine
            .handle_report(
                &mut platform,
                &init_report(BROADCAST_CHANNEL, u8::from(Command::Init), 8, &[0; 8]),
            )
            .unwrap();
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);

        // A different channel can start fresh immediately.
        platform.reports.clear();
        send_message(&mut engine, &mut platform, 6, u8::from(Command::Ping), b"ok").unwrap();
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses[0], (6, u8::from(Command::Ping), b"ok".to_vec()));
    }

    #[test]
    fn ping_echoes_single_fragment() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 7, u8::from(Command::Ping), b"hello").unwrap();

        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(7, u8::from(Command::Ping), b"hello".to_vec())]);
        // The exchange consumed the channel reservation.
        assert_eq!(engine.registry.occupied(), 0);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);
    }

    #[test]
    fn ping_echoes_multi_fragment_payload() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();
        let payload: Vec<u8> = (0..200u8).collect();

        send_message(&mut engine, &mut platform, 7, u8::from(Command::Ping), &payload).unwrap();

        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(7, u8::from(Command::Ping), payload)]);
    }

    #[test]
    fn wink_triggers_indicator_and_replies_empty() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 3, u8::from(Command::Wink), &[]).unwrap();

        assert_eq!(platform.winks, 1);
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(3, u8::from(Command::Wink), vec![])]);
    }

    #[test]
    fn cbor_reply_carries_status_prefix() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 4, u8::from(Command::Cbor), &[1, 2, 3]).unwrap();

        assert_eq!(platform.cbor_calls, 1);
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(4, u8::from(Command::Cbor), vec![0, 1, 2, 3])]);
    }

    #[test]
    fn cbor_rejects_empty_payload() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 4, u8::from(Command::Cbor), &[]).unwrap();

        assert_eq!(platform.cbor_calls, 0);
        expect_single_error(&platform, 4, ErrorCode::InvalidLength);
    }

    #[test]
    fn in_flight_flag_rejects_until_cancelled() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();
        engine.busy = true;

        send_message(&mut engine, &mut platform, 4, u8::from(Command::Cbor), &[1]).unwrap();
        assert_eq!(platform.cbor_calls, 0);
        expect_single_error(&platform, 4, ErrorCode::ChannelBusy);

        // Cancel is a cooperative signal with no reply frame.
        platform.reports.clear();
        send_message(&mut engine, &mut platform, 4, u8::from(Command::Cancel), &[]).unwrap();
        assert!(platform.reports.is_empty());
        assert!(!engine.in_flight());

        send_message(&mut engine, &mut platform, 4, u8::from(Command::Cbor), &[1]).unwrap();
        assert_eq!(platform.cbor_calls, 1);
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(4, u8::from(Command::Cbor), vec![0, 1])]);
    }

    #[test]
    fn in_flight_flag_rejects_legacy_messages_too() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();
        engine.busy = true;

        send_message(&mut engine, &mut platform, 4, u8::from(Command::Msg), &[1]).unwrap();
        assert_eq!(platform.msg_calls, 0);
        expect_single_error(&platform, 4, ErrorCode::ChannelBusy);
    }

    #[test]
    fn msg_routes_through_apdu_processor() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 8, u8::from(Command::Msg), &[1, 2, 3]).unwrap();

        assert_eq!(platform.msg_calls, 1);
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(8, u8::from(Command::Msg), vec![3, 2, 1])]);
    }

    #[test]
    fn msg_hook_short_circuits_processor() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform {
            intercept: Some(vec![0xca, 0xfe]),
            ..TestPlatform::default()
        };

        send_message(&mut engine, &mut platform, 8, u8::from(Command::Msg), &[1, 2, 3]).unwrap();

        assert_eq!(platform.msg_calls, 0);
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(8, u8::from(Command::Msg), vec![0xca, 0xfe])]);
    }

    #[test]
    fn rng_request_sizes() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 2, u8::from(Command::GetRng), &[0]).unwrap();
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses[0].2.len(), DEFAULT_RNG_LEN);

        platform.reports.clear();
        send_message(&mut engine, &mut platform, 2, u8::from(Command::GetRng), &[4]).unwrap();
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses[0].2.len(), 4);
    }

    #[test]
    fn unknown_command_resets_state() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        send_message(&mut engine, &mut platform, 5, 0x2a, b"xx").unwrap();
        expect_single_error(&platform, 5, ErrorCode::InvalidCommand);

        // A fresh message can begin immediately after.
        platform.reports.clear();
        send_message(&mut engine, &mut platform, 5, u8::from(Command::Ping), b"ok").unwrap();
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(5, u8::from(Command::Ping), b"ok".to_vec())]);
    }

    #[test]
    fn second_channel_rejected_while_buffering() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();
        let payload: Vec<u8> = (0..150u8).collect();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &payload[..57]))
            .unwrap();

        engine
            .handle_report(&mut platform, &init_report(2, 0x01, 4, b"nope"))
            .unwrap();
        expect_single_error(&platform, 2, ErrorCode::ChannelBusy);

        // Channel 1's reassembly is unaffected.
        platform.reports.clear();
        engine
            .handle_report(&mut platform, &cont_report(1, 0, &payload[57..116]))
            .unwrap();
        engine
            .handle_report(&mut platform, &cont_report(1, 1, &payload[116..]))
            .unwrap();
        let responses = decode_responses(&platform.reports);
        assert_eq!(responses, vec![(1, 0x01, payload)]);
    }

    #[test]
    fn restarting_own_reassembly_is_a_sequence_error() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();
        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();

        expect_single_error(&platform, 1, ErrorCode::InvalidSequence);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);
    }

    #[test]
    fn out_of_order_continuation_aborts_reassembly() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();
        engine
            .handle_report(&mut platform, &cont_report(1, 1, &[0; 59]))
            .unwrap();

        expect_single_error(&platform, 1, ErrorCode::InvalidSequence);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);

        // The buffer is free for the next message.
        platform.reports.clear();
        send_message(&mut engine, &mut platform, 1, u8::from(Command::Ping), b"ok").unwrap();
        assert_eq!(decode_responses(&platform.reports).len(), 1);
    }

    #[test]
    fn stray_continuations_are_silently_ignored() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        // Unknown channel, nothing buffering.
        engine
            .handle_report(&mut platform, &cont_report(9, 0, &[0; 59]))
            .unwrap();
        assert!(platform.reports.is_empty());

        // Non-owner channel while another reassembly is in progress.
        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();
        engine
            .handle_report(&mut platform, &cont_report(2, 0, &[0; 59]))
            .unwrap();
        assert!(platform.reports.is_empty());
        assert_eq!(engine.assembler.owner(), Some(1));
    }

    #[test]
    fn broadcast_is_only_for_allocation() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(
                &mut platform,
                &init_report(BROADCAST_CHANNEL, u8::from(Command::Ping), 2, b"no"),
            )
            .unwrap();

        expect_single_error(&platform, BROADCAST_CHANNEL, ErrorCode::InvalidChannel);
    }

    #[test]
    fn oversized_declared_length_rejected() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 8000, &[0; 57]))
            .unwrap();

        expect_single_error(&platform, 1, ErrorCode::InvalidLength);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);
    }

    #[test]
    fn idle_channel_is_evicted_with_one_timeout_frame() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();
        platform.now = 750;
        engine.check_timeouts(&mut platform).unwrap();

        expect_single_error(&platform, 1, ErrorCode::Timeout);
        assert_eq!(engine.registry.occupied(), 0);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);

        // Sweeping again emits nothing further.
        platform.reports.clear();
        engine.check_timeouts(&mut platform).unwrap();
        assert!(platform.reports.is_empty());
    }

    #[test]
    fn touched_channel_survives_the_sweep() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        engine
            .handle_report(&mut platform, &init_report(1, 0x01, 150, &[0; 57]))
            .unwrap();

        // A continuation refreshes the deadline.
        platform.now = 700;
        engine
            .handle_report(&mut platform, &cont_report(1, 0, &[0; 59]))
            .unwrap();

        platform.now = 1449;
        engine.check_timeouts(&mut platform).unwrap();
        assert!(platform.reports.is_empty());
        assert!(engine.registry.exists(1));

        platform.now = 1450;
        engine.check_timeouts(&mut platform).unwrap();
        expect_single_error(&platform, 1, ErrorCode::Timeout);
    }

    #[test]
    fn keepalive_targets_the_buffer_owner() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        // Nothing staged: no frame.
        engine.send_keepalive(&mut platform, KeepaliveStatus::Processing);
        assert!(platform.reports.is_empty());

        engine
            .handle_report(&mut platform, &init_report(9, 0x10, 150, &[0; 57]))
            .unwrap();
        engine.send_keepalive(&mut platform, KeepaliveStatus::UserPresenceNeeded);

        let responses = decode_responses(&platform.reports);
        assert_eq!(
            responses,
            vec![(
                9,
                u8::from(Command::Keepalive),
                vec![u8::from(KeepaliveStatus::UserPresenceNeeded)]
            )]
        );
    }

    #[cfg(feature = "probe")]
    #[test]
    fn probe_parse_failure_is_fatal_but_cleaned_up() {
        let mut engine = Engine::default();
        let mut platform = TestPlatform::default();

        let err = send_message(
            &mut engine,
            &mut platform,
            6,
            u8::from(Command::Probe),
            &[0xff, 0x00],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Probe(_)));

        // State was retired before the error surfaced.
        assert_eq!(engine.registry.occupied(), 0);
        assert_eq!(engine.assembler.status(), AssemblyStatus::Empty);
    }
}
