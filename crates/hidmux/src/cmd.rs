use std::io::BufRead;

use clap::{Args, Subcommand};
use tracing::info;

use hidmux_engine::Engine;
use hidmux_wire::{
    cont_report, init_report, Command as WireCommand, ErrorCode, Packet, BROADCAST_CHANNEL,
    CONT_PAYLOAD_SIZE, INIT_PAYLOAD_SIZE, MAX_PAYLOAD, REPORT_SIZE,
};

use crate::demo::DemoPlatform;
use crate::exit::{engine_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, USAGE};
use crate::output::{print_checks, Check, OutputFormat};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scripted protocol exchange against an in-process engine.
    Selftest(SelftestArgs),
    /// Feed hex-encoded 64-byte reports from stdin to an engine and write
    /// every emitted report back as a hex line.
    Pump(PumpArgs),
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    /// Payload length for the fragmented echo exchange.
    #[arg(long, default_value_t = 1024)]
    pub ping_len: usize,
}

#[derive(Args, Debug)]
pub struct PumpArgs {}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Selftest(args) => selftest(args, format),
        Command::Pump(args) => pump(args),
    }
}

fn selftest(args: SelftestArgs, format: OutputFormat) -> CliResult<i32> {
    if args.ping_len > MAX_PAYLOAD {
        return Err(CliError::new(
            USAGE,
            format!("--ping-len must be at most {MAX_PAYLOAD}"),
        ));
    }

    let mut engine = Engine::default();
    let mut platform = DemoPlatform::new();
    let mut checks = Vec::new();

    // Allocation handshake on the broadcast channel.
    let nonce = [0x5a; 8];
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        BROADCAST_CHANNEL,
        u8::from(WireCommand::Init),
        &nonce,
    )?;
    let assigned = if body.len() == 17 {
        u32::from_le_bytes(body[8..12].try_into().expect("4-byte field"))
    } else {
        0
    };
    checks.push(Check {
        name: "allocation",
        passed: command == u8::from(WireCommand::Init)
            && body.len() == 17
            && body[..8] == nonce
            && assigned != 0
            && assigned != BROADCAST_CHANNEL,
        detail: format!("assigned {assigned:#010x}"),
    });

    // Single-fragment echo on the assigned channel.
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::Ping),
        b"hidmux",
    )?;
    checks.push(Check {
        name: "echo",
        passed: command == u8::from(WireCommand::Ping) && body == b"hidmux",
        detail: format!("{} bytes", body.len()),
    });

    // Fragmented echo.
    let payload: Vec<u8> = (0..args.ping_len).map(|i| (i % 256) as u8).collect();
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::Ping),
        &payload,
    )?;
    checks.push(Check {
        name: "echo-fragmented",
        passed: command == u8::from(WireCommand::Ping) && body == payload,
        detail: format!("{} bytes", body.len()),
    });

    // Indicator.
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::Wink),
        &[],
    )?;
    checks.push(Check {
        name: "wink",
        passed: command == u8::from(WireCommand::Wink) && body.is_empty() && platform.winks() == 1,
        detail: format!("{} wink(s)", platform.winks()),
    });

    // CBOR round-trip: echo processor, status prefix 0x00.
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::Cbor),
        &[0x04],
    )?;
    checks.push(Check {
        name: "cbor",
        passed: command == u8::from(WireCommand::Cbor) && body == [0x00, 0x04],
        detail: format!("status {:#04x}", body.first().copied().unwrap_or(0xff)),
    });

    // Legacy message round-trip.
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::Msg),
        &[0x00, 0x01, 0x03, 0x00, 0x00],
    )?;
    checks.push(Check {
        name: "msg",
        passed: command == u8::from(WireCommand::Msg) && body == [0x00, 0x01, 0x03, 0x00, 0x00],
        detail: format!("{} bytes", body.len()),
    });

    // RNG: default size when the host asks for zero bytes, exact otherwise.
    let (_, _, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::GetRng),
        &[0],
    )?;
    let default_ok = body.len() == 57;
    let (_, _, body) = exchange(
        &mut engine,
        &mut platform,
        assigned,
        u8::from(WireCommand::GetRng),
        &[16],
    )?;
    checks.push(Check {
        name: "rng",
        passed: default_ok && body.len() == 16,
        detail: format!("{} bytes", body.len()),
    });

    // Unknown command must come back as an error frame.
    let (_, command, body) = exchange(&mut engine, &mut platform, assigned, 0x2a, &[1, 2])?;
    checks.push(Check {
        name: "unknown-command",
        passed: command == u8::from(WireCommand::Error)
            && body == [u8::from(ErrorCode::InvalidCommand)],
        detail: format!("code {:#04x}", body.first().copied().unwrap_or(0xff)),
    });

    // Single-flight reassembly: a second channel is busy while the first is
    // mid-message.
    let long: Vec<u8> = (0..200u8).collect();
    let reports = fragments(assigned, u8::from(WireCommand::Ping), &long);
    engine
        .handle_report(&mut platform, &reports[0])
        .map_err(|err| engine_error("selftest", err))?;
    let (_, command, body) = exchange(
        &mut engine,
        &mut platform,
        assigned.wrapping_add(1),
        u8::from(WireCommand::Ping),
        b"intruder",
    )?;
    let busy_ok = command == u8::from(WireCommand::Error)
        && body == [u8::from(ErrorCode::ChannelBusy)];
    for report in &reports[1..] {
        engine
            .handle_report(&mut platform, report)
            .map_err(|err| engine_error("selftest", err))?;
    }
    let (_, command, body) = reassemble(&platform.drain())?;
    checks.push(Check {
        name: "single-flight",
        passed: busy_ok && command == u8::from(WireCommand::Ping) && body == long,
        detail: "busy rejection then completion".to_string(),
    });

    let all_passed = checks.iter().all(|check| check.passed);
    print_checks(&checks, format);
    Ok(if all_passed { SUCCESS } else { FAILURE })
}

fn pump(_args: PumpArgs) -> CliResult<i32> {
    let mut engine = Engine::default();
    let mut platform = DemoPlatform::new();
    let stdin = std::io::stdin();
    let mut processed = 0usize;

    for line in stdin.lock().lines() {
        let line = line.map_err(|err| CliError::new(FAILURE, format!("stdin: {err}")))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let bytes = hex::decode(line)
            .map_err(|err| CliError::new(USAGE, format!("bad hex report: {err}")))?;
        let report: [u8; REPORT_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CliError::new(
                USAGE,
                format!("report must be {REPORT_SIZE} bytes, got {}", bytes.len()),
            )
        })?;

        engine
            .check_timeouts(&mut platform)
            .map_err(|err| engine_error("sweep", err))?;
        engine
            .handle_report(&mut platform, &report)
            .map_err(|err| engine_error("report", err))?;
        processed += 1;

        for reply in platform.drain() {
            println!("{}", hex::encode(reply));
        }
    }

    info!(processed, "pump finished");
    Ok(SUCCESS)
}

/// Fragment a logical message the way a conformant host does.
fn fragments(channel: u32, command: u8, payload: &[u8]) -> Vec<[u8; REPORT_SIZE]> {
    let first = payload.len().min(INIT_PAYLOAD_SIZE);
    let mut out = vec![init_report(
        channel,
        command,
        payload.len() as u16,
        &payload[..first],
    )];
    let mut offset = first;
    let mut seq = 0u8;
    while offset < payload.len() {
        let take = (payload.len() - offset).min(CONT_PAYLOAD_SIZE);
        out.push(cont_report(channel, seq, &payload[offset..offset + take]));
        seq += 1;
        offset += take;
    }
    out
}

/// Run one request/response exchange and reassemble the reply.
fn exchange(
    engine: &mut Engine,
    platform: &mut DemoPlatform,
    channel: u32,
    command: u8,
    payload: &[u8],
) -> CliResult<(u32, u8, Vec<u8>)> {
    for report in fragments(channel, command, payload) {
        engine
            .handle_report(platform, &report)
            .map_err(|err| engine_error("exchange", err))?;
    }
    reassemble(&platform.drain())
}

/// Reassemble one device response from captured reports.
fn reassemble(reports: &[[u8; REPORT_SIZE]]) -> CliResult<(u32, u8, Vec<u8>)> {
    let mut iter = reports.iter();
    let first = iter
        .next()
        .ok_or_else(|| CliError::new(FAILURE, "device sent no response"))?;

    let (channel, command, length, mut body) = match Packet::parse(first) {
        Ok(Packet::Init {
            channel,
            command,
            length,
            payload,
        }) => (channel, command, length as usize, payload.to_vec()),
        Ok(other) => {
            return Err(CliError::new(
                DATA_INVALID,
                format!("response began with a continuation: {other:?}"),
            ));
        }
        Err(err) => return Err(CliError::new(DATA_INVALID, format!("bad response: {err}"))),
    };

    for report in iter {
        match Packet::parse(report) {
            Ok(Packet::Cont { payload, .. }) => {
                let need = length - body.len();
                body.extend_from_slice(&payload[..need.min(payload.len())]);
            }
            Ok(other) => {
                return Err(CliError::new(
                    DATA_INVALID,
                    format!("expected continuation, got {other:?}"),
                ));
            }
            Err(err) => return Err(CliError::new(DATA_INVALID, format!("bad response: {err}"))),
        }
    }

    if body.len() != length {
        return Err(CliError::new(
            DATA_INVALID,
            format!("incomplete response ({} of {length} bytes)", body.len()),
        ));
    }
    Ok((channel, command, body))
}
