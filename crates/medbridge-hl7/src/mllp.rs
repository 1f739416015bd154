//! MLLP帧编解码器
//!
//! 帧格式: START_BLOCK (0x0B) + 载荷 + END_BLOCK (0x1C) + CR (0x0D)。
//! 半帧跨读缓冲, 超过最大帧长按帧错误拒绝。

use bytes::{Buf, BufMut, BytesMut};
use medbridge_core::{BridgeError, Result};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

pub const START_BLOCK: u8 = 0x0B;
pub const END_BLOCK: u8 = 0x1C;
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// 默认最大帧长 (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// MLLP编解码器
#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_bytes: usize,
}

impl MllpCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MllpCodec {
    type Item = Vec<u8>;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // 丢弃起始块之前的杂散字节
        match src.iter().position(|&b| b == START_BLOCK) {
            Some(0) => {}
            Some(pos) => {
                warn!("丢弃MLLP起始块前的{}个杂散字节", pos);
                src.advance(pos);
            }
            None => {
                if !src.is_empty() {
                    warn!("丢弃无起始块的{}个字节", src.len());
                    src.clear();
                }
                return Ok(None);
            }
        }

        // 查找END_BLOCK + CR
        let mut idx = 1;
        while idx + 1 < src.len() {
            if src[idx] == END_BLOCK && src[idx + 1] == CARRIAGE_RETURN {
                let frame = src.split_to(idx + 2);
                let payload = frame[1..idx].to_vec();
                if payload.len() > self.max_frame_bytes {
                    return Err(BridgeError::Framing(format!(
                        "frame of {} bytes exceeds limit of {}",
                        payload.len(),
                        self.max_frame_bytes
                    )));
                }
                return Ok(Some(payload));
            }
            idx += 1;
        }

        // 帧未完成: 先检查是否已超限
        if src.len() > self.max_frame_bytes + 3 {
            return Err(BridgeError::Framing(format!(
                "unterminated frame exceeds limit of {} bytes",
                self.max_frame_bytes
            )));
        }
        Ok(None)
    }
}

impl Encoder<Vec<u8>> for MllpCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.put_slice(&item);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        MllpCodec::new().encode(payload.to_vec(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = MllpCodec::new();
        let mut buf = frame(b"MSH|^~\\&|A|B");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, b"MSH|^~\\&|A|B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_buffered() {
        let mut codec = MllpCodec::new();
        let full = frame(b"MSH|^~\\&|A|B");
        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[5..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut codec = MllpCodec::new();
        let mut buf = frame(b"ONE");
        buf.extend_from_slice(&frame(b"TWO"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"ONE");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"TWO");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_garbage_before_start_discarded() {
        let mut codec = MllpCodec::new();
        let mut buf = BytesMut::from(&b"xxxx"[..]);
        buf.extend_from_slice(&frame(b"MSG"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"MSG");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = MllpCodec::with_max_frame(8);
        let mut buf = frame(b"0123456789ABCDEF");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, BridgeError::Framing(_)));
    }

    #[test]
    fn test_unterminated_oversized_rejected() {
        let mut codec = MllpCodec::with_max_frame(8);
        let mut buf = BytesMut::new();
        buf.put_u8(START_BLOCK);
        buf.put_slice(&[b'A'; 32]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, BridgeError::Framing(_)));
    }
}
