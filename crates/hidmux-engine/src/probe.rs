//! Diagnostic hash probe (vendor command, `probe` feature).
//!
//! The host sends a two-key CBOR map `{"subcommand": text, "data": bytes}`
//! and receives the digest of `data` under the selected hash. Malformed input
//! is fatal to the command: the error propagates as
//! [`crate::EngineError::Probe`] instead of an error frame.

use ciborium::Value;
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

/// Upper bound on the probed data, well below the transport ceiling.
pub const MAX_PROBE_DATA: usize = 6 * 1024;

/// Parse failures of the probe payload.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The payload is not decodable CBOR.
    #[error("payload is not valid CBOR: {0}")]
    Decode(String),

    /// The top-level value is not a map.
    #[error("payload is not a CBOR map")]
    NotAMap,

    /// The map does not have exactly the two expected entries.
    #[error("expected a two-entry map, got {0} entries")]
    WrongEntryCount(usize),

    /// A required entry is absent or has the wrong type.
    #[error("missing or malformed '{0}' entry")]
    MissingEntry(&'static str),

    /// The subcommand does not name a supported hash.
    #[error("unknown subcommand '{0}'")]
    UnknownSubcommand(String),

    /// The data field exceeds the probe limit.
    #[error("data exceeds {max} bytes (got {size})")]
    OversizedData { size: usize, max: usize },
}

/// Compute the digest requested by a probe payload.
pub(crate) fn run(payload: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let value: Value =
        ciborium::from_reader(payload).map_err(|err| ProbeError::Decode(err.to_string()))?;
    let entries = value.as_map().ok_or(ProbeError::NotAMap)?;
    if entries.len() != 2 {
        return Err(ProbeError::WrongEntryCount(entries.len()));
    }

    let mut subcommand = None;
    let mut data = None;
    for (key, val) in entries {
        match key.as_text() {
            Some("subcommand") => subcommand = val.as_text(),
            Some("data") => data = val.as_bytes(),
            _ => {}
        }
    }
    let subcommand = subcommand.ok_or(ProbeError::MissingEntry("subcommand"))?;
    let data = data.ok_or(ProbeError::MissingEntry("data"))?;

    if data.len() > MAX_PROBE_DATA {
        return Err(ProbeError::OversizedData {
            size: data.len(),
            max: MAX_PROBE_DATA,
        });
    }

    debug!(subcommand, len = data.len(), "hash probe");
    match subcommand {
        "SHA256" => Ok(Sha256::digest(data).to_vec()),
        "SHA512" => Ok(Sha512::digest(data).to_vec()),
        other => Err(ProbeError::UnknownSubcommand(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_payload(subcommand: &str, data: &[u8]) -> Vec<u8> {
        let map = Value::Map(vec![
            (
                Value::Text("subcommand".into()),
                Value::Text(subcommand.into()),
            ),
            (Value::Text("data".into()), Value::Bytes(data.to_vec())),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&map, &mut out).unwrap();
        out
    }

    #[test]
    fn sha256_known_answer() {
        let digest = run(&probe_payload("SHA256", b"abc")).unwrap();
        assert_eq!(
            digest,
            hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .unwrap()
        );
    }

    #[test]
    fn sha512_known_answer() {
        let digest = run(&probe_payload("SHA512", b"abc")).unwrap();
        assert_eq!(
            digest,
            hex::decode(
                "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                 2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
            )
            .unwrap()
        );
    }

    #[test]
    fn unknown_subcommand_rejected() {
        let err = run(&probe_payload("SHA1", b"abc")).unwrap_err();
        assert!(matches!(err, ProbeError::UnknownSubcommand(name) if name == "SHA1"));
    }

    #[test]
    fn oversized_data_rejected() {
        let err = run(&probe_payload("SHA256", &vec![0u8; MAX_PROBE_DATA + 1])).unwrap_err();
        assert!(matches!(err, ProbeError::OversizedData { .. }));
    }

    #[test]
    fn non_map_payload_rejected() {
        let mut out = Vec::new();
        ciborium::into_writer(&Value::Text("nope".into()), &mut out).unwrap();
        assert!(matches!(run(&out).unwrap_err(), ProbeError::NotAMap));
    }

    #[test]
    fn wrong_entry_count_rejected() {
        let map = Value::Map(vec![(
            Value::Text("subcommand".into()),
            Value::Text("SHA256".into()),
        )]);
        let mut out = Vec::new();
        ciborium::into_writer(&map, &mut out).unwrap();
        assert!(matches!(
            run(&out).unwrap_err(),
            ProbeError::WrongEntryCount(1)
        ));
    }

    #[test]
    fn garbage_payload_rejected() {
        assert!(matches!(
            run(&[0xff, 0x00, 0x01]).unwrap_err(),
            ProbeError::Decode(_)
        ));
    }

    #[test]
    fn wrong_value_types_rejected() {
        let map = Value::Map(vec![
            (Value::Text("subcommand".into()), Value::Integer(1.into())),
            (Value::Text("data".into()), Value::Bytes(vec![])),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&map, &mut out).unwrap();
        assert!(matches!(
            run(&out).unwrap_err(),
            ProbeError::MissingEntry("subcommand")
        ));
    }
}
