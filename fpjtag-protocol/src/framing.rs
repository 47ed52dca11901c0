//! [`tokio_util::codec`] integration for the companion side of a connection.
//!
//! [`RequestCodec`] splits a byte stream into [`Request`]s and frames
//! [`Response`]s. It works on any [`BytesMut`] buffer, so it can be used with
//! `Framed` on an async stream or driven by hand from a blocking socket.
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::MAX_FRAME_SIZE,
    error::ReadError,
    protocol::{Request, Response},
};

const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_frame_size: usize,
}

impl RequestCodec {
    pub fn new(max_frame_size: usize) -> RequestCodec {
        RequestCodec { max_frame_size }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        RequestCodec::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = ReadError;

    /// Decodes the next request.
    ///
    /// A frame is removed from `src` before its payload is parsed, so after a
    /// recoverable error the buffer still starts at a frame boundary.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ReadError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame_size {
            return Err(ReadError::TooManyBytes {
                max: self.max_frame_size,
                got: len,
            });
        }
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len);
        Request::decode_payload(&payload).map(Some)
    }
}

impl Encoder<Response> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = item.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32_le(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Opcode, Operation};
    use crate::tap::TapState;

    fn framed(request: &Request) -> Vec<u8> {
        let mut out = Vec::new();
        request.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn waits_for_complete_frame() {
        let bytes = framed(&Request::SetPort {
            port: "usb".to_string(),
        });
        let mut codec = RequestCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[6..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::SetPort {
                port: "usb".to_string()
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&framed(&Request::Hello));
        buf.extend_from_slice(&framed(&Request::Execute(Operation::StateMove {
            end_state: TapState::Idle,
        })));
        let mut codec = RequestCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Request::Hello));
        assert_eq!(
            codec.decode(&mut buf).unwrap().map(|r| r.opcode()),
            Some(Opcode::StateMove)
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn malformed_payload_keeps_alignment() {
        let mut buf = BytesMut::new();
        // hello with a stray trailing field
        buf.extend_from_slice(&[4, 0, 0, 0, 0x20, 0, 0x20, 0]);
        buf.extend_from_slice(&framed(&Request::Quit));
        let mut codec = RequestCodec::default();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Request::Quit));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::from(&100u32.to_le_bytes()[..]);
        let mut codec = RequestCodec::new(16);
        match codec.decode(&mut buf) {
            Err(ReadError::TooManyBytes { max: 16, got: 100 }) => {}
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn encodes_response_frame() {
        let mut codec = RequestCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Response::ok(), &mut dst).unwrap();
        let mut expected = Vec::new();
        Response::ok().write_to(&mut expected).unwrap();
        assert_eq!(&dst[..], &expected[..]);
    }
}
