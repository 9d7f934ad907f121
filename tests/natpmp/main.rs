//! NAT-PMP integration tests
//!
//! The daemon runs in process on 127.0.0.1 with an in-memory firewall.
//! The nftables tests need root and the nft binary:
//! cargo test --test natpmp -- --ignored

mod harness;
mod lifecycle;
mod nftables;
mod requests;
