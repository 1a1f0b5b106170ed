//! NAT behavior discovery (RFC 5780)
//!
//! Mapping behavior is found by comparing the addresses the server reports
//! when queried on its primary and alternate addresses. Filtering behavior is
//! found by asking the server to answer from another address or port.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use super::stun::{binding, ChangeRequest, StunError};

/// NAT classification published on the gateway endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NatType {
    NoNat,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatType::NoNat => write!(f, "Not behind a NAT"),
            NatType::FullCone => write!(f, "Full cone"),
            NatType::RestrictedCone => write!(f, "Restricted cone"),
            NatType::PortRestrictedCone => write!(f, "Port restricted cone"),
            NatType::Symmetric => write!(f, "Symmetric"),
        }
    }
}

/// How a NAT maps (or filters) traffic depending on the remote endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dependency {
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
}

/// Combine mapping and filtering behavior into the classic NAT type
pub fn classify(mapping: Dependency, filtering: Dependency) -> NatType {
    match (mapping, filtering) {
        (Dependency::EndpointIndependent, Dependency::EndpointIndependent) => NatType::FullCone,
        (Dependency::EndpointIndependent, Dependency::AddressDependent) => NatType::RestrictedCone,
        (Dependency::EndpointIndependent, Dependency::AddressAndPortDependent) => {
            NatType::PortRestrictedCone
        }
        _ => NatType::Symmetric,
    }
}

/// Classify the NAT between `socket` and `server`.
pub async fn behavior_test(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<NatType, StunError> {
    let first = binding(socket, server, ChangeRequest::NONE, timeout).await?;

    let local = local_address_towards(server, socket.local_addr()?.port()).await?;
    if first.mapped == local {
        return Ok(NatType::NoNat);
    }

    let other = first.other.ok_or(StunError::NoAlternateAddress(server))?;

    let alternate_ip = SocketAddr::new(other.ip(), server.port());
    let second = binding(socket, alternate_ip, ChangeRequest::NONE, timeout).await?;
    let mapping = if second.mapped == first.mapped {
        Dependency::EndpointIndependent
    } else {
        let third = binding(socket, other, ChangeRequest::NONE, timeout).await?;
        if third.mapped == second.mapped {
            Dependency::AddressDependent
        } else {
            Dependency::AddressAndPortDependent
        }
    };

    let filtering = match binding(socket, server, ChangeRequest::IP_AND_PORT, timeout).await {
        Ok(_) => Dependency::EndpointIndependent,
        Err(StunError::Timeout(..)) => {
            match binding(socket, server, ChangeRequest::PORT, timeout).await {
                Ok(_) => Dependency::AddressDependent,
                Err(StunError::Timeout(..)) => Dependency::AddressAndPortDependent,
                Err(e) => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };

    debug!(?mapping, ?filtering, "NAT behavior discovered");
    Ok(classify(mapping, filtering))
}

/// The local address the kernel would use to reach `server`
async fn local_address_towards(server: SocketAddr, port: u16) -> Result<SocketAddr, StunError> {
    let any: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let probe = UdpSocket::bind(any).await?;
    probe.connect(server).await?;
    Ok(SocketAddr::new(probe.local_addr()?.ip(), port))
}
