//! Seam for the external ROHC compressor/decompressor.
//!
//! The engine treats header compression as a black box: inner packets go
//! in, ROHC packets (protocol 142 on the wire) come out, and feedback
//! flows over a dedicated UDP channel. An implementation is installed by
//! the embedding caller; none ships in this crate.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RohcError {
    #[error("no decompression context for this packet")]
    NoContext,
    #[error("output buffer too small for the decompressed packet")]
    OutputTooSmall,
    #[error("malformed ROHC packet")]
    Malformed,
    #[error("CRC check failed")]
    BadCrc,
    #[error("ROHC failure: {0}")]
    Other(String),
}

/// Result of decompressing one ROHC packet.
#[derive(Debug, Default)]
pub struct DecompressOutcome {
    /// The rebuilt IP packet; absent for feedback-only ROHC packets.
    pub packet: Option<Vec<u8>>,
    /// Feedback the peer piggybacked for the local compressor.
    pub received_feedback: Option<Vec<u8>>,
    /// Feedback generated by the local decompressor, to be sent to the
    /// peer's compressor over the feedback channel.
    pub feedback_to_send: Option<Vec<u8>>,
}

/// A header compressor/decompressor pair with a feedback path.
pub trait RohcCodec {
    fn compress(&mut self, ip_packet: &[u8]) -> Result<Vec<u8>, RohcError>;

    fn decompress(&mut self, rohc_packet: &[u8]) -> Result<DecompressOutcome, RohcError>;

    /// Delivers feedback received from the peer's decompressor to the
    /// local compressor.
    fn deliver_feedback(&mut self, feedback: &[u8]) -> Result<(), RohcError>;
}
