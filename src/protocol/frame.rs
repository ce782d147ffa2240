use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{decode_bets, MessageType, Request, Response, MAX_PAYLOAD_LEN};
use crate::{Error, Result};

/// Raw two-byte request header, before the type byte is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: u8,
    pub agency: u8,
}

/// Frame reader/writer over one connection.
///
/// Every read and write is bounded by `timeout`: a peer that declares more
/// bytes than it sends fails with [`Error::Timeout`] instead of parking the
/// task forever. Reads accumulate until the exact byte count arrives, however
/// the transport splits it.
pub struct FrameIo<S> {
    stream: S,
    timeout: Duration,
}

impl<S> FrameIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self { stream, timeout }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn read_header(&mut self) -> Result<RequestHeader> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(RequestHeader {
            kind: buf[0],
            agency: buf[1],
        })
    }

    /// Reads whatever follows `header` and decodes the full request.
    pub async fn read_request(&mut self, header: RequestHeader) -> Result<Request> {
        let agency = header.agency;
        match MessageType::try_from(header.kind)? {
            MessageType::Bets => {
                let payload = self.read_payload().await?;
                let bets = decode_bets(agency, &payload)?;
                Ok(Request::Bets { agency, bets })
            }
            MessageType::Finish => Ok(Request::Finish { agency }),
            MessageType::AskWinners => Ok(Request::AskWinners { agency }),
            MessageType::Error | MessageType::Success => {
                Err(Error::Malformed("response type sent as a request"))
            }
        }
    }

    pub async fn read_response(&mut self) -> Result<Response> {
        let mut kind = [0u8; 1];
        self.read_exact(&mut kind).await?;
        let kind = MessageType::try_from(kind[0])?;
        let payload = self.read_payload().await?;
        match kind {
            MessageType::Success => Ok(Response::Success(payload)),
            MessageType::Error => String::from_utf8(payload)
                .map(Response::Error)
                .map_err(|_| Error::Malformed("error reason is not utf-8")),
            _ => Err(Error::Malformed("request type sent as a response")),
        }
    }

    /// Reads a length field and its payload. A declared length above
    /// [`MAX_PAYLOAD_LEN`] fails before any payload byte is consumed.
    pub async fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut len = [0u8; 2];
        self.read_exact(&mut len).await?;
        let declared = u16::from_le_bytes(len) as usize;
        if declared > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge { declared });
        }
        let mut payload = vec![0u8; declared];
        self.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Consumes and drops up to `len` inbound bytes, stopping early at EOF.
    pub async fn discard(&mut self, len: usize) -> Result<u64> {
        let timeout = self.timeout;
        let mut limited = (&mut self.stream).take(len as u64);
        with_timeout(timeout, tokio::io::copy(&mut limited, &mut tokio::io::sink())).await
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        let frame = request.encode()?;
        self.write_frame(&frame).await
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<()> {
        let frame = response.encode()?;
        self.write_frame(&frame).await
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        let timeout = self.timeout;
        with_timeout(timeout, async move {
            stream.write_all(frame).await?;
            stream.flush().await
        })
        .await
    }

    /// Half-closes the write side so the peer sees EOF after our last frame.
    pub async fn shutdown(&mut self) -> Result<()> {
        let timeout = self.timeout;
        with_timeout(timeout, self.stream.shutdown()).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.timeout;
        with_timeout(timeout, self.stream.read_exact(buf)).await?;
        Ok(())
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
