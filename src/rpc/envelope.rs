//! Wire envelope and length-prefixed framing.
//!
//! Every message on a connection is `[u32 big-endian length][Envelope]`,
//! where the envelope is protobuf-encoded and carries the correlation id,
//! direction, service and method names, and the opaque call payload.

use prost::Message;

use super::buffer::ReadBuffer;
use crate::error::{DistbuildError, Result};

/// Size of the big-endian length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EnvelopeKind {
    Request = 0,
    Response = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(enumeration = "EnvelopeKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(string, tag = "4")]
    pub method: String,
    #[prost(oneof = "Payload", tags = "5, 6")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(bytes, tag = "5")]
    Request(Vec<u8>),
    #[prost(bytes, tag = "6")]
    Response(Vec<u8>),
}

impl Envelope {
    pub fn request(id: u32, service: &str, method: &str, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Request as i32,
            service: service.to_string(),
            method: method.to_string(),
            payload: Some(Payload::Request(payload)),
        }
    }

    pub fn response(id: u32, service: &str, method: &str, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: EnvelopeKind::Response as i32,
            service: service.to_string(),
            method: method.to_string(),
            payload: Some(Payload::Response(payload)),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == EnvelopeKind::Request
    }

    /// Takes the payload bytes, whichever direction they were sent in.
    pub fn into_payload(self) -> Vec<u8> {
        match self.payload {
            Some(Payload::Request(bytes)) | Some(Payload::Response(bytes)) => bytes,
            None => Vec::new(),
        }
    }

    /// Serializes the envelope behind its length prefix.
    pub fn to_frame(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.extend_from_slice(&self.encode_to_vec());
        frame
    }
}

/// Incremental frame parser over a [`ReadBuffer`].
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: ReadBuffer,
}

impl FrameDecoder {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: ReadBuffer::new(max_buffer_size),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn spare_mut(&mut self) -> Result<&mut [u8]> {
        self.buffer.spare_mut()
    }

    pub fn did_read(&mut self, n: usize) {
        self.buffer.did_read(n);
    }

    /// Parses the next complete frame, if one has fully arrived.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        let data = self.buffer.data();
        if data.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let total = FRAME_HEADER_LEN + len;
        if total > self.buffer.max_size() {
            return Err(DistbuildError::FrameTooLarge {
                len: total,
                max: self.buffer.max_size(),
            });
        }
        if data.len() < total {
            return Ok(None);
        }
        let envelope = Envelope::decode(&data[FRAME_HEADER_LEN..total])?;
        self.buffer.consume(total);
        Ok(Some(envelope))
    }

    /// Feeds raw bytes and returns every envelope they complete.
    pub fn deliver(&mut self, mut bytes: &[u8]) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();
        while !bytes.is_empty() {
            let spare = self.buffer.spare_mut()?;
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.buffer.did_read(n);
            bytes = &bytes[n..];
            while let Some(envelope) = self.next_envelope()? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }
}
