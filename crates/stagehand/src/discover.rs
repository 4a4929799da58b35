//! One-shot console discovery: scatter `/xinfo` across a /24 and collect
//! whoever answers inside the window.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

use x32osc::{osc, ConsoleIdentity, IDENTITY_ADDRESS};

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredConsole {
    pub ip: String,
    pub name: String,
    pub model: String,
    pub firmware: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("invalid subnet {0:?}; expected e.g. \"192.168.1\"")]
    InvalidSubnet(String),
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probe every host of `subnet` (three dotted octets) on `port`.
pub async fn probe_subnet(
    subnet: &str,
    port: u16,
    window: Duration,
) -> Result<Vec<DiscoveredConsole>, DiscoverError> {
    let octets: Vec<&str> = subnet.split('.').collect();
    if octets.len() != 3 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(DiscoverError::InvalidSubnet(subnet.to_string()));
    }

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let probe = osc::encode(IDENTITY_ADDRESS, &[]);

    info!("probing {}.1-254:{} for consoles", subnet, port);
    for host in 1..=254u16 {
        let target = format!("{}.{}:{}", subnet, host, port);
        let _ = socket.send_to(&probe, &target).await;
        // Light pacing; 254 datagrams at once can overflow small send
        // queues on embedded APs.
        if host % 32 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let deadline = Instant::now() + window;
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut buf = vec![0u8; 2048];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(recv) = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await else {
            break;
        };
        let Ok((n, peer)) = recv else { continue };
        let Ok(messages) = osc::decode_packet(&buf[..n]) else {
            continue;
        };
        for msg in messages {
            if msg.address != IDENTITY_ADDRESS {
                continue;
            }
            let Some(identity) = ConsoleIdentity::from_args(&msg.args) else {
                continue;
            };
            let ip = peer.ip().to_string();
            if seen.insert(ip.clone()) {
                debug!("discovered {} ({}) at {}", identity.name, identity.model, ip);
                found.push(DiscoveredConsole {
                    ip,
                    name: identity.name,
                    model: identity.model,
                    firmware: identity.firmware,
                });
            }
        }
    }

    info!("discovery finished: {} console(s)", found.len());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_malformed_subnets() {
        for subnet in ["", "10.0", "10.0.0.0", "a.b.c", "300.1.1"] {
            let err = probe_subnet(subnet, 10023, Duration::from_millis(10)).await;
            assert!(
                matches!(err, Err(DiscoverError::InvalidSubnet(_))),
                "{} accepted",
                subnet
            );
        }
    }

    #[tokio::test]
    async fn finds_emulator_on_loopback() {
        let handle = x32osc::mock::spawn(
            x32osc::mock::MockConsole::new().with_identity("127.0.0.1", "Rack", "X32R", "4.06"),
        )
        .await
        .unwrap();

        let found = probe_subnet("127.0.0", handle.addr.port(), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Rack");
        assert_eq!(found[0].model, "X32R");
    }
}
