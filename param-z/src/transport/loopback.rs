//! In-process transport connecting contexts of the same process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{ConnOptions, Connection, Listener, Priority, Transport};
use crate::error::{Error, Result};

struct Request {
    packet: Vec<u8>,
    reply: flume::Sender<Vec<u8>>,
}

/// Shared switchboard of listening (node, port) pairs.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    ports: Arc<Mutex<HashMap<(u16, u8), flume::Sender<Request>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint of this network with address `node`.
    pub fn transport(&self, node: u16) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            node,
        }
    }
}

#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    node: u16,
}

impl Transport for LoopbackTransport {
    fn address(&self) -> u16 {
        self.node
    }

    fn connect(
        &self,
        _prio: Priority,
        node: u16,
        port: u8,
        _timeout: Duration,
        _opts: ConnOptions,
    ) -> Option<Box<dyn Connection>> {
        let target = self.network.ports.lock().get(&(node, port)).cloned();
        let Some(target) = target else {
            debug!("[LBT] nothing listens on {node}:{port}");
            return None;
        };
        Some(Box::new(LoopbackConnection { target, rx: None }))
    }

    fn listen(&self, port: u8) -> Result<Box<dyn Listener>> {
        let mut ports = self.network.ports.lock();
        let (tx, rx) = flume::unbounded();
        if ports
            .get(&(self.node, port))
            .is_some_and(|existing| !existing.is_disconnected())
        {
            return Err(Error::Transport(format!(
                "port {port} of node {} is already bound",
                self.node
            )));
        }
        ports.insert((self.node, port), tx);
        Ok(Box::new(LoopbackListener { rx }))
    }
}

struct LoopbackConnection {
    target: flume::Sender<Request>,
    rx: Option<flume::Receiver<Vec<u8>>>,
}

impl Connection for LoopbackConnection {
    fn send(&mut self, packet: Vec<u8>) -> Result<()> {
        let (reply, rx) = flume::unbounded();
        self.target
            .send(Request { packet, reply })
            .map_err(|_| Error::Transport("listener is gone".into()))?;
        self.rx = Some(rx);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.as_ref()?.recv_timeout(timeout).ok()
    }
}

struct LoopbackListener {
    rx: flume::Receiver<Request>,
}

impl Listener for LoopbackListener {
    fn accept(&mut self, timeout: Duration) -> Option<Box<dyn Connection>> {
        let request = self.rx.recv_timeout(timeout).ok()?;
        Some(Box::new(LoopbackReply {
            request: Some(request.packet),
            reply: request.reply,
        }))
    }
}

struct LoopbackReply {
    request: Option<Vec<u8>>,
    reply: flume::Sender<Vec<u8>>,
}

impl Connection for LoopbackReply {
    fn send(&mut self, packet: Vec<u8>) -> Result<()> {
        self.reply
            .send(packet)
            .map_err(|_| Error::Transport("requester is gone".into()))
    }

    fn receive(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
        self.request.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_reply() {
        let net = LoopbackNetwork::new();
        let server = net.transport(5);
        let client = net.transport(1);
        let mut listener = server.listen(10).unwrap();

        let mut conn = client
            .connect(Priority::Norm, 5, 10, Duration::from_millis(100), ConnOptions::empty())
            .unwrap();
        conn.send(vec![1, 2]).unwrap();

        let mut incoming = listener.accept(Duration::from_millis(100)).unwrap();
        assert_eq!(incoming.receive(Duration::ZERO), Some(vec![1, 2]));
        incoming.send(vec![3]).unwrap();
        drop(incoming);

        assert_eq!(conn.receive(Duration::from_millis(100)), Some(vec![3]));
        assert_eq!(conn.receive(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_unbound_port_is_unreachable() {
        let net = LoopbackNetwork::new();
        let client = net.transport(1);
        assert!(
            client
                .connect(Priority::Norm, 9, 10, Duration::ZERO, ConnOptions::empty())
                .is_none()
        );
    }
}
