//! Bundle parser: demultiplexes a received bundle back into its inner
//! packets.

use crate::config::Flavor;
use crate::separator::{self, SIZE_PROTOCOL_FIELD};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    /// Separator or Protocol bits do not fit the remaining bytes.
    #[error("malformed separator at offset {0}")]
    MalformedSeparator(usize),
    /// A separator claims more payload than the bundle holds. Fatal on TCP
    /// transports, where resynchronisation is impossible.
    #[error("bundle truncated at offset {offset}: packet claims {claimed} bytes, {available} remain")]
    BundleMalformed {
        offset: usize,
        claimed: usize,
        available: usize,
    },
}

/// Splits a Normal or Fast bundle into `(protocol, packet)` pairs, in
/// arrival order. Blast traffic has its own single-packet header and is
/// handled by the blast tracker instead.
pub fn parse_bundle(flavor: Flavor, bundle: &[u8]) -> Result<Vec<(u8, Vec<u8>)>, DemuxError> {
    match flavor {
        Flavor::Normal => parse_normal(bundle),
        Flavor::Fast => parse_fast(bundle),
        Flavor::Blast => {
            debug_assert!(false, "blast bundles are parsed by the blast tracker");
            Ok(Vec::new())
        }
    }
}

fn parse_normal(bundle: &[u8]) -> Result<Vec<(u8, Vec<u8>)>, DemuxError> {
    let mut packets = Vec::new();
    let mut pos = 0;
    let mut first_read = false;
    let mut shared_protocol: Option<u8> = None;

    while pos < bundle.len() {
        let decoded = separator::decode_normal(bundle, pos, !first_read)
            .map_err(|_| DemuxError::MalformedSeparator(pos))?;
        pos += decoded.consumed;

        let protocol = if !first_read {
            first_read = true;
            let protocol = *bundle
                .get(pos)
                .ok_or(DemuxError::MalformedSeparator(pos))?;
            pos += SIZE_PROTOCOL_FIELD;
            if decoded.single_protocol {
                shared_protocol = Some(protocol);
            }
            protocol
        } else if let Some(shared) = shared_protocol {
            shared
        } else {
            let protocol = *bundle
                .get(pos)
                .ok_or(DemuxError::MalformedSeparator(pos))?;
            pos += SIZE_PROTOCOL_FIELD;
            protocol
        };

        let end = pos + decoded.packet_len;
        if end > bundle.len() {
            return Err(DemuxError::BundleMalformed {
                offset: pos,
                claimed: decoded.packet_len,
                available: bundle.len() - pos,
            });
        }
        packets.push((protocol, bundle[pos..end].to_vec()));
        pos = end;
    }

    Ok(packets)
}

fn parse_fast(bundle: &[u8]) -> Result<Vec<(u8, Vec<u8>)>, DemuxError> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < bundle.len() {
        let (packet_len, protocol) =
            separator::decode_fast(bundle, pos).map_err(|_| DemuxError::MalformedSeparator(pos))?;
        pos += separator::FAST_SEPARATOR_SIZE;

        let end = pos + packet_len;
        if end > bundle.len() {
            return Err(DemuxError::BundleMalformed {
                offset: pos,
                claimed: packet_len,
                available: bundle.len() - pos,
            });
        }
        packets.push((protocol, bundle[pos..end].to_vec()));
        pos = end;
    }

    Ok(packets)
}
