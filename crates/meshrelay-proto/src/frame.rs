//! Data-Plane Frame Codec
//!
//! Authenticated framing on relay TCP connections. Every frame carries an
//! HMAC-SHA256 trailer keyed with the allocation token, proving the sender
//! received the stream handle over an authenticated channel.
//!
//! Layout (little-endian):
//!
//! ```text
//! Magic "FLYR" (4B)
//! Length (LE16) -- length of Data only, excludes header and HMAC
//! Version (1B) -- fixed 0x01
//! Type (1B)
//! Data (NB) -- protobuf-encoded payload
//! HMAC (32B) -- HMAC-SHA256(key=token, msg = Magic||Length||Version||Type||Data)
//! ```

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, ProtoResult};

/// First four bytes of every data-plane frame
pub const FRAME_MAGIC: [u8; 4] = *b"FLYR";

/// Data-plane protocol version
pub const FRAME_VERSION: u8 = 0x01;

/// Frame type: handshake request
pub const FRAME_TYPE_HANDSHAKE_REQUEST: u8 = 0x01;

/// Frame type: handshake ack
pub const FRAME_TYPE_HANDSHAKE_ACK: u8 = 0x02;

/// Length of the HMAC-SHA256 trailer
pub const HMAC_LEN: usize = 32;

/// Maximum payload representable in the 16-bit length field
pub const MAX_DATA_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 8;

type HmacSha256 = Hmac<Sha256>;

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length
    pub length: u16,
    /// Protocol version
    pub version: u8,
    /// Frame type
    pub frame_type: u8,
}

/// Write one authenticated frame.
///
/// The HMAC is computed over the header and payload with `token` as the key.
pub async fn write_frame<W>(
    w: &mut W,
    frame_type: u8,
    token: &[u8],
    data: &[u8],
) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_DATA_LEN {
        return Err(ProtoError::PayloadTooLarge(data.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len() + HMAC_LEN);
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u16_le(data.len() as u16);
    buf.put_u8(FRAME_VERSION);
    buf.put_u8(frame_type);
    buf.put_slice(data);

    let tag = compute_hmac(token, &buf);
    buf.put_slice(&tag);

    w.write_all(&buf).await?;
    Ok(())
}

/// Read exactly one frame under `timeout`, without verifying the HMAC.
///
/// The reader cannot know which token to verify against until the stream id
/// inside the payload has been decoded, so verification is the caller's job
/// via [`verify_frame`].
pub async fn read_frame<R>(
    r: &mut R,
    timeout: Duration,
) -> ProtoResult<(FrameHeader, Vec<u8>, [u8; HMAC_LEN])>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_frame_inner(r))
        .await
        .map_err(|_| ProtoError::Timeout)?
}

async fn read_frame_inner<R>(r: &mut R) -> ProtoResult<(FrameHeader, Vec<u8>, [u8; HMAC_LEN])>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if magic != FRAME_MAGIC {
        return Err(ProtoError::BadMagic);
    }

    let length = r.read_u16_le().await?;

    let version = r.read_u8().await?;
    if version != FRAME_VERSION {
        return Err(ProtoError::BadVersion(version));
    }
    let frame_type = r.read_u8().await?;

    let mut data = vec![0u8; length as usize];
    r.read_exact(&mut data).await?;

    let mut tag = [0u8; HMAC_LEN];
    r.read_exact(&mut tag).await?;

    Ok((
        FrameHeader {
            length,
            version,
            frame_type,
        },
        data,
        tag,
    ))
}

/// Verify the HMAC trailer of a frame read by [`read_frame`].
///
/// Comparison is constant-time.
pub fn verify_frame(
    header: &FrameHeader,
    data: &[u8],
    tag: &[u8; HMAC_LEN],
    token: &[u8],
) -> ProtoResult<()> {
    let mut mac = HmacSha256::new_from_slice(token).expect("HMAC accepts any key length");
    mac.update(&FRAME_MAGIC);
    mac.update(&header.length.to_le_bytes());
    mac.update(&[header.version, header.frame_type]);
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| ProtoError::HmacMismatch)
}

fn compute_hmac(token: &[u8], msg: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(token).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}
