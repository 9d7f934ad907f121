//! NAT-PMP client used by `natpmpd probe`
//!
//! Retransmits with the RFC 6886 schedule: the first wait is 250ms and each
//! retry doubles it.

use crate::protocol::{Opcode, Request, Response};
use crate::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
pub const MAX_ATTEMPTS: u32 = 9;

pub struct Client {
    socket: UdpSocket,
    gateway: SocketAddr,
    initial_timeout: Duration,
    attempts: u32,
}

impl Client {
    pub async fn connect(gateway: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(gateway).await?;
        Ok(Self {
            socket,
            gateway,
            initial_timeout: INITIAL_TIMEOUT,
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Override the retransmission schedule
    pub fn with_retries(mut self, initial_timeout: Duration, attempts: u32) -> Self {
        self.initial_timeout = initial_timeout;
        self.attempts = attempts.max(1);
        self
    }

    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Send `request` and wait for the matching response
    pub async fn request(&self, request: &Request) -> Result<Response> {
        let data = request.to_bytes();
        let expected = request.opcode() as u8;
        let mut wait = self.initial_timeout;
        let mut buf = [0u8; 64];

        for attempt in 1..=self.attempts {
            self.socket.send(&data).await?;
            debug!("Sent {} request to {} (attempt {})", request.opcode().label(), self.gateway, attempt);

            let deadline = tokio::time::Instant::now() + wait;
            loop {
                let len = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(received) => received?,
                };
                let response = Response::parse(&buf[..len])
                    .map_err(|e| Error::Parse(format!("bad response from {}: {}", self.gateway, e)))?;
                if response_opcode(&response) == expected {
                    return Ok(response);
                }
                debug!("Ignoring response for another request: {:?}", response);
            }
            wait *= 2;
        }

        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no response from {} after {} attempts", self.gateway, self.attempts),
        )))
    }
}

fn response_opcode(response: &Response) -> u8 {
    match response {
        Response::Info { .. } => Opcode::Info as u8,
        Response::Map { transport, .. } => transport.opcode() as u8,
        Response::Error { opcode, .. } => *opcode,
    }
}
