//! Fuzz target for envelope decoding.
//!
//! Broker payloads are untrusted: `Envelope::from_slice` must reject
//! anything malformed with an error, never a panic, and every envelope it
//! accepts must encode again.

#![no_main]

use cqrs_replication::envelope::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::from_slice(data) {
        let _ = envelope.revision();
        let _ = envelope.updated_at();
        let _ = envelope.key_or_field("id");
        let _ = envelope.is_expired(chrono::Utc::now());

        let encoded = envelope.to_vec().expect("decoded envelope re-encodes");
        let _ = Envelope::from_slice(&encoded);
    }
});
