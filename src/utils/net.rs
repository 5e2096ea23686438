//! Loopback port allocation

use crate::error::Result;
use std::net::{Ipv4Addr, TcpListener};

/// Reserve `count` distinct free loopback ports.
///
/// All listeners are held open until every port is known, so the returned
/// ports are distinct; they are released before returning.
pub fn available_ports(count: usize) -> Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<std::io::Result<Vec<_>>>()?;

    let ports = listeners
        .iter()
        .map(|listener| listener.local_addr().map(|addr| addr.port()))
        .collect::<std::io::Result<Vec<_>>>()?;

    Ok(ports)
}
