//! Byte-oriented resumable reader for Fast packets on a TCP stream.
//!
//! TCP delivers a byte stream, so a single read may stop anywhere: inside
//! the 3-byte separator or inside the payload it announces. The reader
//! buffers whatever arrived and picks up where it left off on the next
//! readiness cycle.

use crate::config::BUFSIZE;
use crate::separator::FAST_SEPARATOR_SIZE;
use std::io::{self, Read};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The announced length cannot be a packet: the byte stream no longer
    /// lines up with separators and cannot be resynchronised.
    #[error("TCP stream desynchronised: separator announces {0} bytes")]
    Desync(usize),
}

/// One step of the resumable reader.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Bytes were buffered but no packet is complete yet.
    Pending,
    /// A complete Fast packet.
    Packet { protocol: u8, payload: Vec<u8> },
    /// The peer closed the connection.
    Eof,
}

/// Reassembles `length || protocol || payload` records from arbitrary
/// stream partitionings.
pub struct FastStreamReader {
    separator: [u8; FAST_SEPARATOR_SIZE],
    separator_read: usize,
    protocol: u8,
    payload: Vec<u8>,
    payload_read: usize,
    in_payload: bool,
}

impl FastStreamReader {
    pub fn new() -> Self {
        Self {
            separator: [0; FAST_SEPARATOR_SIZE],
            separator_read: 0,
            protocol: 0,
            payload: Vec::new(),
            payload_read: 0,
            in_payload: false,
        }
    }

    /// Performs at most one separator read and one payload read against
    /// the stream. Short reads yield `Pending`; a zero-byte read is EOF.
    pub fn read_from<R: Read>(&mut self, stream: &mut R) -> Result<StreamEvent, StreamError> {
        if !self.in_payload {
            let read = stream.read(&mut self.separator[self.separator_read..])?;
            if read == 0 {
                return Ok(StreamEvent::Eof);
            }
            self.separator_read += read;
            if self.separator_read < FAST_SEPARATOR_SIZE {
                return Ok(StreamEvent::Pending);
            }

            let length = u16::from_be_bytes([self.separator[0], self.separator[1]]) as usize;
            if length > BUFSIZE {
                return Err(StreamError::Desync(length));
            }
            self.protocol = self.separator[2];
            self.payload.clear();
            self.payload.resize(length, 0);
            self.payload_read = 0;
            self.in_payload = true;

            if length == 0 {
                return Ok(self.finish_packet());
            }
        }

        let read = stream.read(&mut self.payload[self.payload_read..])?;
        if read == 0 {
            return Ok(StreamEvent::Eof);
        }
        self.payload_read += read;
        if self.payload_read < self.payload.len() {
            return Ok(StreamEvent::Pending);
        }
        Ok(self.finish_packet())
    }

    fn finish_packet(&mut self) -> StreamEvent {
        self.separator_read = 0;
        self.payload_read = 0;
        self.in_payload = false;
        StreamEvent::Packet {
            protocol: self.protocol,
            payload: std::mem::take(&mut self.payload),
        }
    }
}

impl Default for FastStreamReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separator::encode_fast;

    /// Serves a byte stream in slices of at most `chunk` bytes.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = (self.pos + self.chunk).min(self.data.len());
            let slice = &self.data[self.pos..end];
            let take = slice.len().min(buf.len());
            buf[..take].copy_from_slice(&slice[..take]);
            self.pos += take;
            Ok(take)
        }
    }

    fn stream_of(packets: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (protocol, payload) in packets {
            data.extend_from_slice(&encode_fast(payload.len() as u16, *protocol));
            data.extend_from_slice(payload);
        }
        data
    }

    fn drain(reader: &mut FastStreamReader, source: &mut ChunkedReader) -> Vec<(u8, Vec<u8>)> {
        let mut packets = Vec::new();
        loop {
            match reader.read_from(source).unwrap() {
                StreamEvent::Packet { protocol, payload } => packets.push((protocol, payload)),
                StreamEvent::Pending => {}
                StreamEvent::Eof => break,
            }
        }
        packets
    }

    #[test]
    fn every_partitioning_yields_the_same_packets() {
        let packets = vec![
            (4u8, vec![0x11; 40]),
            (143u8, vec![0x22; 1500]),
            (4u8, vec![0x33; 1]),
            (142u8, Vec::new()),
            (4u8, vec![0x44; 7]),
        ];
        let data = stream_of(&packets);

        for chunk in [1, 2, 3, 4, 5, 7, 16, 64, 1499, data.len()] {
            let mut source = ChunkedReader {
                data: data.clone(),
                pos: 0,
                chunk,
            };
            let mut reader = FastStreamReader::new();
            assert_eq!(drain(&mut reader, &mut source), packets, "chunk size {chunk}");
        }
    }

    #[test]
    fn eof_midway_stops_without_a_packet() {
        let data = stream_of(&[(4, vec![0xAA; 100])]);
        let mut source = ChunkedReader {
            data: data[..40].to_vec(),
            pos: 0,
            chunk: 10,
        };
        let mut reader = FastStreamReader::new();
        let packets = drain(&mut reader, &mut source);
        assert!(packets.is_empty());
    }

    #[test]
    fn oversized_length_is_a_desync() {
        let mut data = ((BUFSIZE + 1) as u16).to_be_bytes().to_vec();
        data.push(4);
        let mut source = ChunkedReader {
            data,
            pos: 0,
            chunk: 3,
        };
        let mut reader = FastStreamReader::new();
        match reader.read_from(&mut source) {
            Err(StreamError::Desync(length)) => assert_eq!(length, BUFSIZE + 1),
            other => panic!("expected desync, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_packet_completes_without_payload_read() {
        let data = stream_of(&[(142, Vec::new()), (4, vec![1, 2])]);
        let mut source = ChunkedReader {
            data,
            pos: 0,
            chunk: 3,
        };
        let mut reader = FastStreamReader::new();
        assert_eq!(
            reader.read_from(&mut source).unwrap(),
            StreamEvent::Packet {
                protocol: 142,
                payload: Vec::new()
            }
        );
    }
}
