//! Line-delimited JSON framing for [`BridgeFrame`].
//!
//! Bad input never poisons the stream: a line that is not a valid frame
//! decodes to [`Decoded::Malformed`], an over-long line to
//! [`Decoded::Oversized`], and the codec resynchronizes on the next newline.
//! Only real I/O errors are returned as `Err`.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{BridgeFrame, MAX_FRAME_BYTES};

/// Result of decoding one line.
#[derive(Debug)]
pub enum Decoded {
    Frame(BridgeFrame),
    /// The line was not a valid frame.  Carries the parse error.
    Malformed(String),
    /// The line exceeded the configured maximum; it was discarded.
    Oversized,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn map_line(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Decoded>, io::Error> {
        match result {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    return Ok(Some(Decoded::Malformed("empty line".into())));
                }
                Ok(Some(match serde_json::from_str::<BridgeFrame>(line) {
                    Ok(frame) => Decoded::Frame(frame),
                    Err(e) => Decoded::Malformed(e.to_string()),
                }))
            }
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Decoded::Oversized)),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Decoded::Malformed(e.to_string())))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        let line = self.lines.decode(src);
        Self::map_line(line)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        let line = self.lines.decode_eof(src);
        Self::map_line(line)
    }
}

impl Encoder<BridgeFrame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: BridgeFrame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} frame is {} bytes (max {})",
                    frame.kind(),
                    json.len(),
                    self.max_frame_bytes
                ),
            ));
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn decodes_frame_and_waits_for_newline() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&br#"{"type":"ping","ts":5}"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_u8(b'\n');
        match codec.decode(&mut buf).unwrap() {
            Some(Decoded::Frame(BridgeFrame::Ping { ts })) => assert_eq!(ts, 5),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_does_not_stop_decoding() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"not json\n{\"type\":\"pong\",\"ts\":1}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Frame(BridgeFrame::Pong { ts: 1 }))
        ));
    }

    #[test]
    fn oversized_line_is_skipped() {
        let mut codec = FrameCodec::new(32);
        let long = format!("{}\n{{\"type\":\"pong\",\"ts\":2}}\n", "x".repeat(100));
        let mut buf = BytesMut::from(long.as_bytes());
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Decoded::Oversized)));
        let mut next = codec.decode(&mut buf).unwrap();
        // The codec may need one more pass to finish discarding.
        while matches!(next, Some(Decoded::Oversized)) {
            next = codec.decode(&mut buf).unwrap();
        }
        assert!(matches!(next, Some(Decoded::Frame(BridgeFrame::Pong { ts: 2 }))));
    }

    #[test]
    fn encode_refuses_frames_over_the_limit() {
        let mut codec = FrameCodec::new(16);
        let mut dst = BytesMut::new();
        let frame = BridgeFrame::Event {
            event: "voicewake.changed".into(),
            payload_json: Some("{}".into()),
        };
        assert!(codec.encode(frame, &mut dst).is_err());
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn framed_pipe_carries_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, FrameCodec::default());
        let mut reader = FramedRead::new(server, FrameCodec::default());

        writer
            .send(BridgeFrame::Event {
                event: "presence".into(),
                payload_json: None,
            })
            .await
            .unwrap();

        match reader.next().await {
            Some(Ok(Decoded::Frame(BridgeFrame::Event { event, .. }))) => {
                assert_eq!(event, "presence")
            }
            other => panic!("expected event, got {other:?}"),
        }
    }
}
