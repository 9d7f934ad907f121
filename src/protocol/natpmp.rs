//! NAT-PMP - RFC 6886
//!
//! Request decoding and response encoding for the fixed-layout NAT-PMP
//! messages. All multi-byte fields are network byte order.
//!
//! ```text
//! Map request (12 bytes)
//!  0       1       2       3
//! +-------+-------+-------+-------+
//! | Vers  |  OP   |   Reserved    |
//! +-------+-------+-------+-------+
//! | Internal Port | Suggested Ext |
//! +-------+-------+-------+-------+
//! |   Requested Lifetime (secs)   |
//! +-------+-------+-------+-------+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Only protocol version spoken
pub const VERSION: u8 = 0;

/// Well-known server port
pub const SERVER_PORT: u16 = 5351;

/// Response opcode = request opcode | 0x80
pub const RESPONSE_FLAG: u8 = 0x80;

pub const INFO_REQUEST_SIZE: usize = 2;
pub const MAP_REQUEST_SIZE: usize = 12;
pub const INFO_RESPONSE_SIZE: usize = 12;
pub const MAP_RESPONSE_SIZE: usize = 16;
pub const ERROR_RESPONSE_SIZE: usize = 8;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Udp, Transport::Tcp];

    /// Lowercase name, as used by nft and the state file
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }

    /// Map opcode for this transport
    pub fn opcode(&self) -> Opcode {
        match self {
            Transport::Udp => Opcode::MapUdp,
            Transport::Tcp => Opcode::MapTcp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Transport {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => Err(crate::Error::Parse(format!("unknown transport: {}", other))),
        }
    }
}

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Info = 0,
    MapUdp = 1,
    MapTcp = 2,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Info),
            1 => Some(Opcode::MapUdp),
            2 => Some(Opcode::MapTcp),
            _ => None,
        }
    }

    /// Transport for map opcodes, `None` for Info
    pub fn transport(&self) -> Option<Transport> {
        match self {
            Opcode::Info => None,
            Opcode::MapUdp => Some(Transport::Udp),
            Opcode::MapTcp => Some(Transport::Tcp),
        }
    }

    /// Request type label used in telemetry
    pub fn label(&self) -> &'static str {
        match self {
            Opcode::Info => "info",
            Opcode::MapUdp => "map_udp",
            Opcode::MapTcp => "map_tcp",
        }
    }
}

/// Response result codes (RFC 6886 section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    /// Not authorized / refused
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl ResultCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Success),
            1 => Some(ResultCode::UnsupportedVersion),
            2 => Some(ResultCode::NotAuthorized),
            3 => Some(ResultCode::NetworkFailure),
            4 => Some(ResultCode::OutOfResources),
            5 => Some(ResultCode::UnsupportedOpcode),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::UnsupportedVersion => "unsupported version",
            ResultCode::NotAuthorized => "not authorized/refused",
            ResultCode::NetworkFailure => "network failure",
            ResultCode::OutOfResources => "out of resources",
            ResultCode::UnsupportedOpcode => "unsupported opcode",
        };
        f.write_str(name)
    }
}

/// Decoding failures. Each maps to the result code answered on the wire,
/// except `TooShort` which cannot be answered at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("unsupported version {version}")]
    UnsupportedVersion { version: u8, opcode: u8 },

    #[error("unsupported opcode {opcode}")]
    UnsupportedOpcode { opcode: u8 },

    #[error("opcode {opcode} truncated at {len} bytes")]
    Truncated { opcode: u8, len: usize },

    #[error("opcode {opcode} is not a response")]
    NotAResponse { opcode: u8 },

    #[error("unknown result code {code}")]
    UnknownResult { code: u16 },
}

impl DecodeError {
    /// Result code to answer with, if the packet deserves an answer
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            DecodeError::UnsupportedVersion { .. } => Some(ResultCode::UnsupportedVersion),
            DecodeError::UnsupportedOpcode { .. } => Some(ResultCode::UnsupportedOpcode),
            DecodeError::Truncated { .. } => Some(ResultCode::NetworkFailure),
            DecodeError::TooShort { .. }
            | DecodeError::NotAResponse { .. }
            | DecodeError::UnknownResult { .. } => None,
        }
    }

    /// Raw request opcode, echoed in the error response
    pub fn opcode(&self) -> Option<u8> {
        match self {
            DecodeError::UnsupportedVersion { opcode, .. }
            | DecodeError::UnsupportedOpcode { opcode }
            | DecodeError::Truncated { opcode, .. }
            | DecodeError::NotAResponse { opcode } => Some(*opcode),
            DecodeError::TooShort { .. } | DecodeError::UnknownResult { .. } => None,
        }
    }
}

/// Body of a Map request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub transport: Transport,
    pub internal_port: u16,
    /// Suggested external port, 0 = same as internal
    pub external_port: u16,
    /// Requested lifetime in seconds, 0 = delete
    pub lifetime: u32,
}

/// Decoded client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Info,
    Map(MapRequest),
}

impl Request {
    /// Decode a request datagram
    pub fn parse(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < INFO_REQUEST_SIZE {
            return Err(DecodeError::TooShort { len: buffer.len() });
        }

        let version = buffer[0];
        let opcode = buffer[1];

        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion { version, opcode });
        }

        match Opcode::from_u8(opcode) {
            Some(Opcode::Info) => Ok(Request::Info),
            Some(op @ (Opcode::MapUdp | Opcode::MapTcp)) => {
                if buffer.len() < MAP_REQUEST_SIZE {
                    return Err(DecodeError::Truncated {
                        opcode,
                        len: buffer.len(),
                    });
                }
                let transport = match op.transport() {
                    Some(t) => t,
                    None => return Err(DecodeError::UnsupportedOpcode { opcode }),
                };
                // bytes 2-3 reserved
                Ok(Request::Map(MapRequest {
                    transport,
                    internal_port: u16::from_be_bytes([buffer[4], buffer[5]]),
                    external_port: u16::from_be_bytes([buffer[6], buffer[7]]),
                    lifetime: u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
                }))
            }
            None => Err(DecodeError::UnsupportedOpcode { opcode }),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Info => Opcode::Info,
            Request::Map(map) => map.transport.opcode(),
        }
    }

    /// Encode as sent by a client
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Request::Info => vec![VERSION, Opcode::Info as u8],
            Request::Map(map) => {
                let mut buffer = vec![0u8; MAP_REQUEST_SIZE];
                buffer[0] = VERSION;
                buffer[1] = map.transport.opcode() as u8;
                buffer[4..6].copy_from_slice(&map.internal_port.to_be_bytes());
                buffer[6..8].copy_from_slice(&map.external_port.to_be_bytes());
                buffer[8..12].copy_from_slice(&map.lifetime.to_be_bytes());
                buffer
            }
        }
    }
}

/// Server response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Info {
        epoch: u32,
        external_address: Ipv4Addr,
    },
    Map {
        transport: Transport,
        epoch: u32,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    },
    Error {
        /// Raw request opcode (may be one we do not understand)
        opcode: u8,
        result: ResultCode,
        epoch: u32,
    },
}

impl Response {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Response::Info { .. } | Response::Map { .. } => ResultCode::Success,
            Response::Error { result, .. } => *result,
        }
    }

    pub fn epoch(&self) -> u32 {
        match self {
            Response::Info { epoch, .. }
            | Response::Map { epoch, .. }
            | Response::Error { epoch, .. } => *epoch,
        }
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Response::Info {
                epoch,
                external_address,
            } => {
                let mut buffer = header(Opcode::Info as u8, ResultCode::Success, epoch, INFO_RESPONSE_SIZE);
                buffer[8..12].copy_from_slice(&external_address.octets());
                buffer
            }
            Response::Map {
                transport,
                epoch,
                internal_port,
                external_port,
                lifetime,
            } => {
                let mut buffer = header(
                    transport.opcode() as u8,
                    ResultCode::Success,
                    epoch,
                    MAP_RESPONSE_SIZE,
                );
                buffer[8..10].copy_from_slice(&internal_port.to_be_bytes());
                buffer[10..12].copy_from_slice(&external_port.to_be_bytes());
                buffer[12..16].copy_from_slice(&lifetime.to_be_bytes());
                buffer
            }
            Response::Error {
                opcode,
                result,
                epoch,
            } => header(opcode, result, epoch, ERROR_RESPONSE_SIZE),
        }
    }

    /// Decode a response datagram (client side)
    pub fn parse(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < ERROR_RESPONSE_SIZE {
            return Err(DecodeError::TooShort { len: buffer.len() });
        }

        let version = buffer[0];
        let opcode = buffer[1];
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion { version, opcode });
        }
        if opcode & RESPONSE_FLAG == 0 {
            return Err(DecodeError::NotAResponse { opcode });
        }
        let request_opcode = opcode & !RESPONSE_FLAG;

        let code = u16::from_be_bytes([buffer[2], buffer[3]]);
        let result = ResultCode::from_u16(code).ok_or(DecodeError::UnknownResult { code })?;
        let epoch = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);

        if result != ResultCode::Success {
            return Ok(Response::Error {
                opcode: request_opcode,
                result,
                epoch,
            });
        }

        match Opcode::from_u8(request_opcode) {
            Some(Opcode::Info) => {
                if buffer.len() < INFO_RESPONSE_SIZE {
                    return Err(DecodeError::Truncated {
                        opcode,
                        len: buffer.len(),
                    });
                }
                Ok(Response::Info {
                    epoch,
                    external_address: Ipv4Addr::new(buffer[8], buffer[9], buffer[10], buffer[11]),
                })
            }
            Some(op) => {
                if buffer.len() < MAP_RESPONSE_SIZE {
                    return Err(DecodeError::Truncated {
                        opcode,
                        len: buffer.len(),
                    });
                }
                let transport = op
                    .transport()
                    .ok_or(DecodeError::UnsupportedOpcode { opcode: request_opcode })?;
                Ok(Response::Map {
                    transport,
                    epoch,
                    internal_port: u16::from_be_bytes([buffer[8], buffer[9]]),
                    external_port: u16::from_be_bytes([buffer[10], buffer[11]]),
                    lifetime: u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]),
                })
            }
            None => Err(DecodeError::UnsupportedOpcode {
                opcode: request_opcode,
            }),
        }
    }
}

/// Common 8-byte response header, zero padded to `size`
fn header(opcode: u8, result: ResultCode, epoch: u32, size: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; size];
    buffer[0] = VERSION;
    buffer[1] = opcode | RESPONSE_FLAG;
    buffer[2..4].copy_from_slice(&(result as u16).to_be_bytes());
    buffer[4..8].copy_from_slice(&epoch.to_be_bytes());
    buffer
}
