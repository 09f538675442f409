use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time,
};

use super::codec::{self, ProtocolError, Result};
use super::legacy::{LEGACY_PING_ID, LegacyPing, LegacyQuery};

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// How long a bare `FE` or `FE 01` may sit before it is taken as a pre-1.6
/// query that will send nothing more.
pub const LEGACY_QUERY_GRACE: Duration = Duration::from_millis(250);

/// One length-prefixed packet as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: i32,
    /// Payload after the packet id.
    pub body: Bytes,
    /// The complete frame including the length prefix.
    pub raw: Bytes,
}

/// First message of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initial {
    Frame(Frame),
    LegacyPing(LegacyPing),
    LegacyQuery(LegacyQuery),
}

/// Reads frames from a stream while keeping every byte it pulled off the
/// socket but has not handed out yet.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes already read from the stream that no frame has consumed.
    #[cfg(test)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

    /// Reads the first message, switching to the legacy layout when the
    /// connection starts with `0xFE`.
    pub async fn read_initial(&mut self) -> Result<Initial> {
        if self.buf.is_empty() {
            self.fill(1).await?;
        }
        if self.buf[0] != LEGACY_PING_ID {
            return self.read_frame().await.map(Initial::Frame);
        }
        loop {
            if let Some((ping, used)) = LegacyPing::parse(&self.buf)? {
                let _ = self.buf.split_to(used);
                return Ok(Initial::LegacyPing(ping));
            }
            if let Some(query) = LegacyQuery::from_prefix(&self.buf) {
                match time::timeout(LEGACY_QUERY_GRACE, self.fill(1)).await {
                    Ok(res) => res?,
                    Err(_) => {
                        self.buf.clear();
                        return Ok(Initial::LegacyQuery(query));
                    }
                }
                continue;
            }
            self.fill(1).await?;
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let missing = match codec::peek_var_int(&self.buf)? {
                Some((len, prefix)) => {
                    if len < 0 {
                        return Err(ProtocolError::NegativeLength(len));
                    }
                    let len = len as usize;
                    if len > self.max_frame_len {
                        return Err(ProtocolError::FrameTooLarge {
                            len,
                            max: self.max_frame_len,
                        });
                    }
                    let total = prefix + len;
                    if self.buf.len() >= total {
                        return split_frame(self.buf.split_to(total).freeze(), prefix);
                    }
                    total - self.buf.len()
                }
                None => 1,
            };
            self.fill(missing).await?;
        }
    }

    async fn fill(&mut self, missing: usize) -> Result<()> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            if self.buf.is_empty() {
                return Err(ProtocolError::Eof);
            }
            return Err(ProtocolError::TooFewBytes { missing });
        }
        Ok(())
    }
}

fn split_frame(raw: Bytes, prefix: usize) -> Result<Frame> {
    let mut body = raw.slice(prefix..);
    if body.is_empty() {
        return Err(ProtocolError::UnexpectedContent("empty frame".into()));
    }
    let id = codec::read_var_int(&mut body)?;
    Ok(Frame { id, body, raw })
}
