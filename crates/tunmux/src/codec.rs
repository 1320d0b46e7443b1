use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tunmux_proto::Envelope;

/// Frames envelopes on a byte stream using their leading `msgSize` field.
///
/// A frame with a valid size but a malformed envelope is consumed and yielded as an `Err` item,
/// so the stream stays usable. Only framing violations are decoder errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, tunmux_proto::Error>;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

        if src.len() < Envelope::HEADER_SIZE {
            // Not enough data to read the header.
            return Ok(None);
        }

        // Read length marker
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Envelope::MAXIMUM_SIZE {
            return Err(io::Error::other(format!(
                "envelope oversized: max is {}, got {length}",
                Envelope::MAXIMUM_SIZE
            )));
        }

        if length < Envelope::HEADER_SIZE {
            return Err(io::Error::other(format!(
                "envelope size {length} is smaller than the header"
            )));
        }

        if src.len() < length {
            // The full envelope has not arrived yet.
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, length - src.len());
            src.reserve(additional);
            return Ok(None);
        }

        let envelope_bytes = src.split_to(length).freeze();

        Ok(Some(Envelope::decode(envelope_bytes)))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst).map_err(io::Error::other)
    }
}
