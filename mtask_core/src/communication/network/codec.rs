//! Length-prefixed bincode framing.
//!
//! Every frame is a little-endian `u32` byte count followed by the bincode
//! encoding of a [`Frame`].

use crate::communication::network::protocol::Frame;
use crate::error::{MtaskError, MtaskResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused on both ends
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode `frame` with its length prefix
pub fn encode_frame(frame: &Frame) -> MtaskResult<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(MtaskError::Serialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut buffer = Vec::with_capacity(LEN_PREFIX + body.len());
    buffer.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&body);
    Ok(buffer)
}

/// Decode a frame body (without the length prefix)
pub fn decode_frame(body: &[u8]) -> MtaskResult<Frame> {
    Ok(bincode::deserialize(body)?)
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> MtaskResult<Option<Frame>> {
    let mut len_bytes = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MtaskError::network(format!(
            "peer announced a {} byte frame (limit {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body).map(Some)
}

/// Write an already encoded frame
pub async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> MtaskResult<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::network::protocol::{Request, Response};

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let mut wire = Vec::new();
        wire.extend(encode_frame(&Frame::Notify(Request::Ping)).unwrap());
        wire.extend(
            encode_frame(&Frame::Response {
                id: 9,
                response: Response::Done,
            })
            .unwrap(),
        );

        let mut reader = &wire[..];
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Frame::Notify(Request::Ping))
        );
        match read_frame(&mut reader).await.unwrap() {
            Some(Frame::Response { id, response }) => {
                assert_eq!(id, 9);
                assert_eq!(response, Response::Done);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let wire = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut reader = &wire[..];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut wire = encode_frame(&Frame::Notify(Request::ListProcesses)).unwrap();
        wire.truncate(wire.len() - 1);
        let mut reader = &wire[..];
        assert!(read_frame(&mut reader).await.is_err());
    }
}
