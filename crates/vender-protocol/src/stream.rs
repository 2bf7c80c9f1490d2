//! Reading single frames from a byte stream without a codec.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SlimError};
use crate::frame::{FixedHeader, Frame, HEADER_FIXED, SecretSource};

/// Read exactly one frame.
///
/// Returns `Ok(None)` when the stream ends before the first byte.
///
/// # Errors
///
/// [`SlimError::UnexpectedEof`] when the stream ends inside a frame,
/// [`SlimError::TooLarge`] when the declared length exceeds `max`, plus
/// everything [`Frame::unmarshal`] reports.
pub async fn read_frame<R>(
    r: &mut R,
    max: usize,
    secret: Option<&dyn SecretSource>,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_FIXED];
    let mut got = 0;
    while got < HEADER_FIXED {
        let n = r.read(&mut header[got..]).await?;
        if n == 0 {
            if got == 0 {
                return Ok(None);
            }
            return Err(SlimError::eof("header"));
        }
        got += n;
    }

    let fixed = FixedHeader::decode(&header)?;
    if fixed.length > max {
        return Err(SlimError::TooLarge {
            length: fixed.length,
            max,
        });
    }
    let mut buf = vec![0u8; fixed.length];
    buf[..HEADER_FIXED].copy_from_slice(&header);
    match r.read_exact(&mut buf[HEADER_FIXED..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SlimError::eof("frame body"));
        }
        Err(e) => return Err(e.into()),
    }
    Frame::unmarshal(&buf, secret).map(Some)
}
