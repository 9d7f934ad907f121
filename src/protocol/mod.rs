//! Wire protocols
//!
//! Only NAT-PMP is spoken; the codec is stateless.

pub mod natpmp;

pub use natpmp::{
    DecodeError, MapRequest, Opcode, Request, Response, ResultCode, Transport, SERVER_PORT,
};
