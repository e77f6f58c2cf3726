//! Per-resolver validity probes
//!
//! A probe decides whether a candidate resolver answers a minimal DNS query
//! over the requested transport. The check is intentionally weak: any
//! well-formed response with the QR bit set counts, RCODE is ignored. The
//! tunnel uses names public resolvers will refuse (NXDOMAIN) yet still
//! proxy, so answer content says nothing about tunnelability.

use crate::resolver::ResolverKind;
use rand::Rng;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Largest DNS message accepted over DoT / DoH.
const MAX_DNS_RESPONSE: usize = 4096;

/// DNS header is 12 bytes; anything shorter is not a message.
const MIN_DNS_RESPONSE: usize = 12;

/// Why a probe failed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("probe timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("not a DNS response")]
    NotDns,

    #[error("unexpected HTTP status: {0}")]
    Status(u16),
}

/// Build a minimal A-record query for example.com with RD set and a random
/// transaction id.
fn build_query() -> [u8; 29] {
    let id: u16 = rand::thread_rng().gen();
    let mut query = [
        0x00, 0x00, // Transaction ID (filled below)
        0x01, 0x00, // Standard query, RD=1
        0x00, 0x01, // Questions: 1
        0x00, 0x00, // Answer RRs: 0
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', // example
        0x03, b'c', b'o', b'm', // com
        0x00, // root
        0x00, 0x01, // Type A
        0x00, 0x01, // Class IN
    ];
    query[0] = (id >> 8) as u8;
    query[1] = id as u8;
    query
}

/// Accept iff the message is at least a DNS header and the QR bit is set.
fn validate_response(response: &[u8]) -> Result<(), ProbeError> {
    if response.len() < MIN_DNS_RESPONSE {
        return Err(ProbeError::Malformed(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }
    if response[2] & 0x80 == 0 {
        return Err(ProbeError::NotDns);
    }
    Ok(())
}

/// Probe a resolver over the given transport. Returns the round-trip time
/// between sending the query and the first response byte.
pub async fn probe(
    address: &str,
    kind: ResolverKind,
    deadline: Duration,
) -> Result<Duration, ProbeError> {
    match kind {
        ResolverKind::Udp => probe_udp(address, deadline).await,
        ResolverKind::Dot => probe_dot(address, deadline).await,
        ResolverKind::Doh => probe_doh(address, deadline).await,
    }
}

async fn probe_udp(address: &str, deadline: Duration) -> Result<Duration, ProbeError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProbeError::Dial(e.to_string()))?;
    socket
        .connect(address)
        .await
        .map_err(|e| ProbeError::Dial(e.to_string()))?;

    let query = build_query();
    let start = Instant::now();
    socket
        .send(&query)
        .await
        .map_err(|e| ProbeError::Write(e.to_string()))?;

    let mut response = [0u8; 512];
    let n = timeout(deadline, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Read(e.to_string()))?;
    let latency = start.elapsed();

    validate_response(&response[..n])?;
    Ok(latency)
}

async fn probe_dot(address: &str, deadline: Duration) -> Result<Duration, ProbeError> {
    let host = address.split(':').next().unwrap_or(address).to_string();
    let server_name =
        ServerName::try_from(host).map_err(|e| ProbeError::Dial(e.to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = timeout(deadline, TcpStream::connect(address))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Dial(e.to_string()))?;
    let mut stream = timeout(deadline, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Dial(e.to_string()))?;

    // DoT frames messages with a two-octet length prefix
    let query = build_query();
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);

    let start = Instant::now();
    stream
        .write_all(&framed)
        .await
        .map_err(|e| ProbeError::Write(e.to_string()))?;

    let mut len_buf = [0u8; 2];
    timeout(deadline, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Read(e.to_string()))?;
    let latency = start.elapsed();

    let resp_len = u16::from_be_bytes(len_buf) as usize;
    if !(MIN_DNS_RESPONSE..=MAX_DNS_RESPONSE).contains(&resp_len) {
        return Err(ProbeError::Malformed(format!(
            "invalid response length: {}",
            resp_len
        )));
    }

    let mut response = vec![0u8; resp_len];
    timeout(deadline, stream.read_exact(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Read(e.to_string()))?;

    validate_response(&response)?;
    Ok(latency)
}

async fn probe_doh(url: &str, deadline: Duration) -> Result<Duration, ProbeError> {
    use futures::StreamExt;

    let client = reqwest::Client::builder()
        .timeout(deadline)
        .build()
        .map_err(|e| ProbeError::Dial(e.to_string()))?;

    let query = build_query();
    let start = Instant::now();
    let resp = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
        .header(reqwest::header::ACCEPT, "application/dns-message")
        .body(query.to_vec())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Dial(e.to_string())
            }
        })?;
    let latency = start.elapsed();

    if resp.status() != reqwest::StatusCode::OK {
        return Err(ProbeError::Status(resp.status().as_u16()));
    }

    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProbeError::Read(e.to_string()))?;
        body.extend_from_slice(&chunk);
        if body.len() >= MAX_DNS_RESPONSE {
            body.truncate(MAX_DNS_RESPONSE);
            break;
        }
    }

    validate_response(&body)?;
    Ok(latency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_shape() {
        let query = build_query();
        assert_eq!(query.len(), 29);
        // RD set, QR clear
        assert_eq!(query[2], 0x01);
        assert_eq!(query[3], 0x00);
        // one question, no records
        assert_eq!(&query[4..12], &[0, 1, 0, 0, 0, 0, 0, 0]);
        // QNAME example.com
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
    }

    #[test]
    fn test_validate_rejects_short_response() {
        let err = validate_response(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[test]
    fn test_validate_rejects_query_bit() {
        // QR bit clear means this is a query, not a response
        let mut msg = [0u8; 12];
        msg[2] = 0x01;
        let err = validate_response(&msg).unwrap_err();
        assert!(matches!(err, ProbeError::NotDns));
    }

    #[test]
    fn test_validate_accepts_response_regardless_of_rcode() {
        // NXDOMAIN (RCODE=3) with QR set must pass
        let mut msg = [0u8; 12];
        msg[2] = 0x80;
        msg[3] = 0x03;
        assert!(validate_response(&msg).is_ok());
    }

    #[tokio::test]
    async fn test_udp_probe_reports_dial_or_timeout_on_dead_target() {
        // Reserved TEST-NET-1 address, nothing listens there
        let err = probe("192.0.2.1:53", ResolverKind::Udp, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Timeout | ProbeError::Dial(_) | ProbeError::Read(_)
        ));
    }

    #[tokio::test]
    async fn test_udp_probe_against_local_responder() {
        // Minimal in-process DNS responder echoing the id with QR set
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            buf[2] |= 0x80;
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let latency = probe(&addr.to_string(), ResolverKind::Udp, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(latency <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_udp_probe_rejects_non_dns_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            // QR bit left clear
            server.send_to(&buf[..12], peer).await.unwrap();
        });

        let err = probe(&addr.to_string(), ResolverKind::Udp, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotDns));
    }
}
