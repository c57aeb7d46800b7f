//! CoAP (RFC 7252) message exchange engine with Observe (RFC 7641) and block-wise transfer
//! (RFC 7959), usable as a server via [`CoapServer`] and [`app`] or as a client via
//! [`CoapClient`].

pub use client::{ClientConfig, ClientError, CoapClient};
pub use server::{CoapServer, FatalServerError};
pub use udp::UdpTransport;

pub mod app;
pub mod client;
pub mod exchange;
pub mod msg;
pub mod packet_handler;
pub mod server;
pub mod transport;
pub mod udp;
