//! Request/response transport consumed by the parameter protocol.
//!
//! A [`Connection`] carries one conversation with a service port on a node:
//! each `send` issues a request and `receive` yields its answers in order.
//! Dropping the connection closes it.

pub mod loopback;
pub mod zenoh;

use std::time::Duration;

use bitflags::bitflags;

use crate::error::Result;

pub use self::loopback::{LoopbackNetwork, LoopbackTransport};
pub use self::zenoh::ZenohTransport;

/// Delivery priority of a connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, strum::FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Norm = 2,
    Low = 3,
}

bitflags! {
    /// Per-connection options requested by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnOptions: u32 {
        const RDP = 1 << 0;
        const HMAC = 1 << 1;
        const CRC32 = 1 << 2;
    }
}

pub trait Connection: Send {
    fn send(&mut self, packet: Vec<u8>) -> Result<()>;

    /// Next packet of the conversation, or `None` once `timeout` expires.
    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;
}

pub trait Listener: Send {
    /// Next incoming request, or `None` once `timeout` expires.
    fn accept(&mut self, timeout: Duration) -> Option<Box<dyn Connection>>;
}

pub trait Transport: Send + Sync {
    /// Node address of this end.
    fn address(&self) -> u16;

    /// Open a conversation with `port` on `node`. `None` when the node is unreachable.
    fn connect(
        &self,
        prio: Priority,
        node: u16,
        port: u8,
        timeout: Duration,
        opts: ConnOptions,
    ) -> Option<Box<dyn Connection>>;

    fn listen(&self, port: u8) -> Result<Box<dyn Listener>>;
}
