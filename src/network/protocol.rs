//! Framed stream protocols: Store, Retrieve, Compute
//!
//! All three protocols share one framing discipline: big-endian u32
//! length prefixes around raw bytes, and a single status byte on
//! acknowledgement frames (0 = success, 1 = error). The codecs below put
//! exactly those bytes on the stream; nothing else is read or written.
//!
//! Wire formats:
//! - Store:    req `u32 keyLen | key | u32 dataLen | data`, resp `u8 status`
//! - Retrieve: req `u32 keyLen | key`, resp `u8 status [u32 dataLen | data]`
//! - Compute:  req `u32 txIdLen | txId | u32 wasmLen | wasm | u32 inLen | in`,
//!             resp `u8 status | u32 outLen | out` (status 1 = payment
//!             rejected; execution failures travel as status 0 with an
//!             "ERROR: " payload)

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response::Codec;
use libp2p::StreamProtocol;
use std::io;
use std::time::Duration;

pub const STORE_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/decentralized-net/store/1.0.0");
pub const RETRIEVE_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/decentralized-net/retrieve/1.0.0");
pub const COMPUTE_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/decentralized-net/compute/1.0.0");

/// Deadline applied to every request/response exchange.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Reserved transaction id that bypasses payment verification (testing).
pub const FREE_PASS_TX_ID: &str = "FREE_PASS";
/// Minimum confirmed payment for a compute job.
pub const MIN_COMPUTE_FEE: u64 = 5;

/// Upper bound on any single length-prefixed frame.
const MAX_FRAME: u32 = 32 * 1024 * 1024;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponse {
    Stored,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveResponse {
    Found(Vec<u8>),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeRequest {
    pub tx_id: String,
    pub wasm: Vec<u8>,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeResponse {
    /// Job executed; payload is stdout or an "ERROR: " line.
    Completed(Vec<u8>),
    /// Payment verification failed; nothing was executed.
    Rejected(String),
}

async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<T>(io: &mut T, bytes: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(bytes).await
}

async fn read_status<T>(io: &mut T) -> io::Result<u8>
where
    T: AsyncRead + Unpin + Send,
{
    let mut status = [0u8; 1];
    io.read_exact(&mut status).await?;
    match status[0] {
        STATUS_OK | STATUS_ERROR => Ok(status[0]),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown status byte {other}"),
        )),
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreCodec;

#[async_trait]
impl Codec for StoreCodec {
    type Protocol = StreamProtocol;
    type Request = StoreRequest;
    type Response = StoreResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let key = read_frame(io).await?;
        let data = read_frame(io).await?;
        Ok(StoreRequest { key, data })
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        match read_status(io).await? {
            STATUS_OK => Ok(StoreResponse::Stored),
            _ => Ok(StoreResponse::Failed),
        }
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req.key).await?;
        write_frame(io, &req.data).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let status = match res {
            StoreResponse::Stored => STATUS_OK,
            StoreResponse::Failed => STATUS_ERROR,
        };
        io.write_all(&[status]).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveCodec;

#[async_trait]
impl Codec for RetrieveCodec {
    type Protocol = StreamProtocol;
    type Request = RetrieveRequest;
    type Response = RetrieveResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let key = read_frame(io).await?;
        Ok(RetrieveRequest { key })
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        match read_status(io).await? {
            STATUS_OK => Ok(RetrieveResponse::Found(read_frame(io).await?)),
            _ => Ok(RetrieveResponse::NotFound),
        }
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req.key).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        match res {
            RetrieveResponse::Found(data) => {
                io.write_all(&[STATUS_OK]).await?;
                write_frame(io, &data).await
            }
            RetrieveResponse::NotFound => io.write_all(&[STATUS_ERROR]).await,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComputeCodec;

#[async_trait]
impl Codec for ComputeCodec {
    type Protocol = StreamProtocol;
    type Request = ComputeRequest;
    type Response = ComputeResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let tx_id = String::from_utf8(read_frame(io).await?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let wasm = read_frame(io).await?;
        let input = read_frame(io).await?;
        Ok(ComputeRequest { tx_id, wasm, input })
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let status = read_status(io).await?;
        let payload = read_frame(io).await?;
        match status {
            STATUS_OK => Ok(ComputeResponse::Completed(payload)),
            _ => Ok(ComputeResponse::Rejected(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
        }
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, req.tx_id.as_bytes()).await?;
        write_frame(io, &req.wasm).await?;
        write_frame(io, &req.input).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        match res {
            ComputeResponse::Completed(out) => {
                io.write_all(&[STATUS_OK]).await?;
                write_frame(io, &out).await
            }
            ComputeResponse::Rejected(reason) => {
                io.write_all(&[STATUS_ERROR]).await?;
                write_frame(io, reason.as_bytes()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    #[test]
    fn test_store_request_wire_format() {
        block_on(async {
            let mut codec = StoreCodec;
            let mut buf = Cursor::new(Vec::new());
            let req = StoreRequest {
                key: b"k".to_vec(),
                data: b"vv".to_vec(),
            };
            codec
                .write_request(&STORE_PROTOCOL, &mut buf, req.clone())
                .await
                .unwrap();

            let written = buf.into_inner();
            assert_eq!(written, vec![0, 0, 0, 1, b'k', 0, 0, 0, 2, b'v', b'v']);

            let mut reader = Cursor::new(written);
            let decoded = codec.read_request(&STORE_PROTOCOL, &mut reader).await.unwrap();
            assert_eq!(decoded, req);
        });
    }

    #[test]
    fn test_no_bytes_read_past_last_field() {
        block_on(async {
            let mut codec = StoreCodec;
            let mut wire = vec![0, 0, 0, 1, b'k', 0, 0, 0, 2, b'v', b'v'];
            let payload_len = wire.len() as u64;
            wire.extend_from_slice(b"trailing garbage");

            let mut reader = Cursor::new(wire);
            codec.read_request(&STORE_PROTOCOL, &mut reader).await.unwrap();
            assert_eq!(reader.position(), payload_len);
        });
    }

    #[test]
    fn test_store_response_is_one_status_byte() {
        block_on(async {
            let mut codec = StoreCodec;

            let mut buf = Cursor::new(Vec::new());
            codec
                .write_response(&STORE_PROTOCOL, &mut buf, StoreResponse::Stored)
                .await
                .unwrap();
            assert_eq!(buf.into_inner(), vec![0]);

            let mut buf = Cursor::new(Vec::new());
            codec
                .write_response(&STORE_PROTOCOL, &mut buf, StoreResponse::Failed)
                .await
                .unwrap();
            assert_eq!(buf.into_inner(), vec![1]);
        });
    }

    #[test]
    fn test_retrieve_roundtrip() {
        block_on(async {
            let mut codec = RetrieveCodec;

            let mut buf = Cursor::new(Vec::new());
            codec
                .write_request(
                    &RETRIEVE_PROTOCOL,
                    &mut buf,
                    RetrieveRequest { key: b"abc".to_vec() },
                )
                .await
                .unwrap();
            assert_eq!(buf.get_ref().as_slice(), &[0, 0, 0, 3, b'a', b'b', b'c']);

            for response in [
                RetrieveResponse::Found(b"payload".to_vec()),
                RetrieveResponse::NotFound,
            ] {
                let mut buf = Cursor::new(Vec::new());
                codec
                    .write_response(&RETRIEVE_PROTOCOL, &mut buf, response.clone())
                    .await
                    .unwrap();
                let mut reader = Cursor::new(buf.into_inner());
                let decoded = codec
                    .read_response(&RETRIEVE_PROTOCOL, &mut reader)
                    .await
                    .unwrap();
                assert_eq!(decoded, response);
            }
        });
    }

    #[test]
    fn test_retrieve_not_found_has_no_body() {
        block_on(async {
            let mut codec = RetrieveCodec;
            let mut buf = Cursor::new(Vec::new());
            codec
                .write_response(&RETRIEVE_PROTOCOL, &mut buf, RetrieveResponse::NotFound)
                .await
                .unwrap();
            assert_eq!(buf.into_inner(), vec![1]);
        });
    }

    #[test]
    fn test_compute_request_field_order() {
        block_on(async {
            let mut codec = ComputeCodec;
            let req = ComputeRequest {
                tx_id: "tx1".to_string(),
                wasm: vec![0x00, 0x61, 0x73, 0x6d],
                input: b"in".to_vec(),
            };

            let mut buf = Cursor::new(Vec::new());
            codec
                .write_request(&COMPUTE_PROTOCOL, &mut buf, req.clone())
                .await
                .unwrap();

            let written = buf.into_inner();
            let mut expected = Vec::new();
            expected.extend_from_slice(&[0, 0, 0, 3]);
            expected.extend_from_slice(b"tx1");
            expected.extend_from_slice(&[0, 0, 0, 4, 0x00, 0x61, 0x73, 0x6d]);
            expected.extend_from_slice(&[0, 0, 0, 2]);
            expected.extend_from_slice(b"in");
            assert_eq!(written, expected);

            let mut reader = Cursor::new(written);
            let decoded = codec
                .read_request(&COMPUTE_PROTOCOL, &mut reader)
                .await
                .unwrap();
            assert_eq!(decoded, req);
        });
    }

    #[test]
    fn test_compute_rejection_carries_status_byte() {
        block_on(async {
            let mut codec = ComputeCodec;
            let mut buf = Cursor::new(Vec::new());
            codec
                .write_response(
                    &COMPUTE_PROTOCOL,
                    &mut buf,
                    ComputeResponse::Rejected("payment not found".to_string()),
                )
                .await
                .unwrap();

            let written = buf.into_inner();
            assert_eq!(written[0], 1);

            let mut reader = Cursor::new(written);
            let decoded = codec
                .read_response(&COMPUTE_PROTOCOL, &mut reader)
                .await
                .unwrap();
            assert_eq!(
                decoded,
                ComputeResponse::Rejected("payment not found".to_string())
            );
        });
    }

    #[test]
    fn test_short_read_is_framing_error() {
        block_on(async {
            let mut codec = StoreCodec;
            // Length prefix promises 10 bytes, only 2 follow.
            let mut reader = Cursor::new(vec![0, 0, 0, 10, b'a', b'b']);
            let err = codec
                .read_request(&STORE_PROTOCOL, &mut reader)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        });
    }

    #[test]
    fn test_oversize_frame_rejected() {
        block_on(async {
            let mut codec = StoreCodec;
            let huge = (MAX_FRAME + 1).to_be_bytes().to_vec();
            let mut reader = Cursor::new(huge);
            let err = codec
                .read_request(&STORE_PROTOCOL, &mut reader)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        });
    }
}
