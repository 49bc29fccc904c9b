//! Client side of the PKI directory protocol.
//!
//! One short-lived TCP connection per request, against the well-known
//! PKI port. Replies are read field by field; the protocol is
//! self-delimiting, so no framing or connection close is required.
//! Lookup failures are fatal to the originating operation only; callers
//! log and may retry.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use cascade_proto::pki::{PkiRequest, PKI_PORT};
use cascade_proto::wire::WireEncode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Replies longer than this are malformed.
const MAX_REPLY_FIELD: u32 = 1024 * 1024;

/// Errors from PKI operations.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Network failure talking to the directory.
    #[error("pki i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The directory rejected or could not answer the request.
    #[error("pki lookup failed for {id}")]
    NotFound {
        /// The identity that was looked up.
        id: String,
    },

    /// The reply did not parse.
    #[error("malformed pki reply: {0}")]
    Malformed(String),
}

async fn request(pki_host: &str, req: &PkiRequest) -> Result<TcpStream, PkiError> {
    let mut stream = TcpStream::connect((pki_host, PKI_PORT)).await?;
    stream.write_all(&req.encode_to_bytes()).await?;
    Ok(stream)
}

async fn read_length_prefixed(stream: &mut TcpStream) -> Result<Bytes, PkiError> {
    let len = stream.read_u32().await?;
    if len > MAX_REPLY_FIELD {
        return Err(PkiError::Malformed(format!("reply field of {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn read_address(stream: &mut TcpStream) -> Result<SocketAddr, PkiError> {
    let ip = Ipv4Addr::from(stream.read_u32().await?);
    let port = stream.read_u16().await?;
    Ok(SocketAddr::from((ip, port)))
}

/// Publish our reachability and key package.
pub async fn publish(
    pki_host: &str,
    id: &str,
    port: u16,
    key_package: Bytes,
) -> Result<(), PkiError> {
    let req = PkiRequest::Publish { id: id.to_string(), port, keys: vec![key_package] };
    let mut stream = request(pki_host, &req).await?;

    if stream.read_u8().await? == 0 {
        return Err(PkiError::NotFound { id: id.to_string() });
    }
    Ok(())
}

/// Look up a member's address and consume one of its key packages.
pub async fn query(pki_host: &str, id: &str) -> Result<(SocketAddr, Bytes), PkiError> {
    let req = PkiRequest::Query { id: id.to_string() };
    let mut stream = request(pki_host, &req).await?;

    if stream.read_u8().await? == 0 {
        return Err(PkiError::NotFound { id: id.to_string() });
    }
    let addr = read_address(&mut stream).await?;
    let prekey = read_length_prefixed(&mut stream).await?;
    Ok((addr, prekey))
}

/// Look up a member's address only.
pub async fn query_addr(pki_host: &str, id: &str) -> Result<SocketAddr, PkiError> {
    let req = PkiRequest::Addr { id: id.to_string() };
    let mut stream = request(pki_host, &req).await?;

    if stream.read_u8().await? == 0 {
        return Err(PkiError::NotFound { id: id.to_string() });
    }
    read_address(&mut stream).await
}
