//! Minimal STUN binding client
//!
//! Only what NAT discovery needs: Binding requests (optionally carrying a
//! CHANGE-REQUEST) and decoding of the address attributes in Binding
//! success responses (RFC 5389, RFC 5780 and the RFC 3489 fallbacks).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const HEADER_LEN: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_XOR_MAPPED_ADDRESS_LEGACY: u16 = 0x8020;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Requests sent per transaction before giving up
const TRANSMISSIONS: u32 = 3;

pub type TransactionId = [u8; 12];

#[derive(Error, Debug)]
pub enum StunError {
    #[error("no response from {0} within {1:?}")]
    Timeout(SocketAddr, Duration),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// Response to a different (usually earlier) transaction
    #[error("unexpected transaction id")]
    UnexpectedTransaction,

    #[error("server returned error {0}")]
    ErrorResponse(u16),

    #[error("response carries no mapped address")]
    NoMappedAddress,

    /// The server cannot run the RFC 5780 behavior tests
    #[error("server {0} advertises no alternate address")]
    NoAlternateAddress(SocketAddr),
}

/// Flags of the CHANGE-REQUEST attribute
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeRequest {
    pub change_ip: bool,
    pub change_port: bool,
}

impl ChangeRequest {
    pub const NONE: ChangeRequest = ChangeRequest {
        change_ip: false,
        change_port: false,
    };
    pub const IP_AND_PORT: ChangeRequest = ChangeRequest {
        change_ip: true,
        change_port: true,
    };
    pub const PORT: ChangeRequest = ChangeRequest {
        change_ip: false,
        change_port: true,
    };

    fn is_set(&self) -> bool {
        self.change_ip || self.change_port
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.change_ip {
            flags |= 0x04;
        }
        if self.change_port {
            flags |= 0x02;
        }
        flags
    }
}

#[derive(Clone, Debug)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    pub change: ChangeRequest,
}

impl BindingRequest {
    pub fn new(change: ChangeRequest) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            transaction_id,
            change,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let attrs_len: u16 = if self.change.is_set() { 8 } else { 0 };
        let mut buf = Vec::with_capacity(HEADER_LEN + attrs_len as usize);
        buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        buf.extend_from_slice(&attrs_len.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        if self.change.is_set() {
            buf.extend_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&self.change.flags().to_be_bytes());
        }
        buf
    }
}

/// Addresses reported in a Binding success response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingResponse {
    /// Our address as seen by the server
    pub mapped: SocketAddr,
    /// The server's alternate address, used for behavior discovery
    pub other: Option<SocketAddr>,
}

impl BindingResponse {
    pub fn decode(buf: &[u8], expected: &TransactionId) -> Result<Self, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::Malformed(format!(
                "{} bytes is shorter than a header",
                buf.len()
            )));
        }
        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
            return Err(StunError::Malformed("bad magic cookie".to_string()));
        }
        if &buf[8..HEADER_LEN] != expected {
            return Err(StunError::UnexpectedTransaction);
        }
        let end = HEADER_LEN + body_len;
        if buf.len() < end {
            return Err(StunError::Malformed("truncated body".to_string()));
        }

        let mut xor_mapped = None;
        let mut mapped = None;
        let mut other = None;
        let mut error_code = None;

        let mut offset = HEADER_LEN;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let start = offset + 4;
            if start + attr_len > end {
                return Err(StunError::Malformed(format!(
                    "attribute 0x{attr_type:04x} overruns message"
                )));
            }
            let value = &buf[start..start + attr_len];
            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS | ATTR_XOR_MAPPED_ADDRESS_LEGACY => {
                    xor_mapped = Some(decode_address(value, Some(expected))?)
                }
                ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
                ATTR_OTHER_ADDRESS | ATTR_CHANGED_ADDRESS => {
                    other = Some(decode_address(value, None)?)
                }
                ATTR_ERROR_CODE if value.len() >= 4 => {
                    error_code = Some(u16::from(value[2] & 0x07) * 100 + u16::from(value[3]))
                }
                _ => trace!("skipping STUN attribute 0x{:04x}", attr_type),
            }
            // attributes are padded to 32-bit boundaries
            offset = start + attr_len.div_ceil(4) * 4;
        }

        match msg_type {
            BINDING_SUCCESS => {}
            BINDING_ERROR => return Err(StunError::ErrorResponse(error_code.unwrap_or(0))),
            other_type => {
                return Err(StunError::Malformed(format!(
                    "unexpected message type 0x{other_type:04x}"
                )))
            }
        }

        let mapped = xor_mapped.or(mapped).ok_or(StunError::NoMappedAddress)?;
        Ok(Self { mapped, other })
    }
}

fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Malformed("address attribute too short".to_string()));
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 if value.len() >= 8 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor.is_some() {
                for (b, k) in octets.iter_mut().zip(cookie.iter()) {
                    *b ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(tid) = xor {
                let key = cookie.iter().chain(tid.iter());
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(StunError::Malformed(format!(
                "unsupported address family {family} ({} bytes)",
                value.len()
            )))
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// Resolve `host:port`, preferring IPv4
pub async fn resolve(server: &str) -> Result<SocketAddr, StunError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
        .await
        .map_err(|e| StunError::Resolve(format!("{server}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| StunError::Resolve(server.to_string()))
}

/// Run one Binding transaction against `server` from `socket`.
///
/// The request is retransmitted up to three times within `timeout`. Replies
/// from other transactions and garbage datagrams are ignored. A reply is
/// accepted from any source address, since CHANGE-REQUEST answers arrive from
/// the server's alternate address.
pub async fn binding(
    socket: &UdpSocket,
    server: SocketAddr,
    change: ChangeRequest,
    timeout: Duration,
) -> Result<BindingResponse, StunError> {
    let request = BindingRequest::new(change);
    let payload = request.encode();
    let per_try = timeout / TRANSMISSIONS;
    let mut buf = [0u8; 1024];

    for attempt in 1..=TRANSMISSIONS {
        socket.send_to(&payload, server).await?;
        let deadline = tokio::time::Instant::now() + per_try;
        loop {
            let (len, from) =
                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
            match BindingResponse::decode(&buf[..len], &request.transaction_id) {
                Ok(response) => {
                    debug!(
                        server = %server,
                        from = %from,
                        mapped = %response.mapped,
                        "STUN binding succeeded"
                    );
                    return Ok(response);
                }
                Err(StunError::UnexpectedTransaction | StunError::Malformed(_)) => {
                    trace!(from = %from, "ignoring stray datagram");
                }
                Err(e) => return Err(e),
            }
        }
        trace!(server = %server, attempt, "no STUN response, retransmitting");
    }

    Err(StunError::Timeout(server, timeout))
}

/// Encode a Binding success response the way a server would
#[cfg(test)]
pub(crate) fn encode_success_response(
    transaction_id: &TransactionId,
    mapped: SocketAddr,
    other: Option<SocketAddr>,
) -> Vec<u8> {
    fn address_attr(buf: &mut Vec<u8>, attr_type: u16, addr: SocketAddr, xor: bool) {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = if xor {
            addr.port() ^ (MAGIC_COOKIE >> 16) as u16
        } else {
            addr.port()
        };
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.extend_from_slice(&attr_type.to_be_bytes());
                buf.extend_from_slice(&8u16.to_be_bytes());
                buf.extend_from_slice(&[0, FAMILY_IPV4]);
                buf.extend_from_slice(&port.to_be_bytes());
                let mut octets = ip.octets();
                if xor {
                    for (b, k) in octets.iter_mut().zip(cookie.iter()) {
                        *b ^= k;
                    }
                }
                buf.extend_from_slice(&octets);
            }
            IpAddr::V6(_) => unimplemented!("test servers only speak IPv4"),
        }
    }

    let mut body = Vec::new();
    address_attr(&mut body, ATTR_XOR_MAPPED_ADDRESS, mapped, true);
    if let Some(other) = other {
        address_attr(&mut body, ATTR_OTHER_ADDRESS, other, false);
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf.extend_from_slice(&body);
    buf
}
