#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use param_z::transport::{ConnOptions, Connection, Listener, LoopbackNetwork, Priority, Transport};
use param_z::{Builder, Context, ContextBuilder, Result};

pub const TIMEOUT: Duration = Duration::from_millis(500);

/// A transport whose peers never answer.
pub struct SilentTransport;

struct SilentConnection;

impl Connection for SilentConnection {
    fn send(&mut self, _packet: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        None
    }
}

struct SilentListener;

impl Listener for SilentListener {
    fn accept(&mut self, timeout: Duration) -> Option<Box<dyn Connection>> {
        std::thread::sleep(timeout);
        None
    }
}

impl Transport for SilentTransport {
    fn address(&self) -> u16 {
        1
    }

    fn connect(
        &self,
        _prio: Priority,
        _node: u16,
        _port: u8,
        _timeout: Duration,
        _opts: ConnOptions,
    ) -> Option<Box<dyn Connection>> {
        Some(Box::new(SilentConnection))
    }

    fn listen(&self, _port: u8) -> Result<Box<dyn Listener>> {
        Ok(Box::new(SilentListener))
    }
}

/// Counts connection attempts and forwards them to an inner transport.
pub struct CountingTransport<T> {
    pub inner: T,
    pub connects: AtomicUsize,
}

impl<T> CountingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl<T: Transport> Transport for CountingTransport<T> {
    fn address(&self) -> u16 {
        self.inner.address()
    }

    fn connect(
        &self,
        prio: Priority,
        node: u16,
        port: u8,
        timeout: Duration,
        opts: ConnOptions,
    ) -> Option<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(prio, node, port, timeout, opts)
    }

    fn listen(&self, port: u8) -> Result<Box<dyn Listener>> {
        self.inner.listen(port)
    }
}

/// Initialized context on an in-process network.
pub fn node(network: &LoopbackNetwork, address: u16, builder: ContextBuilder) -> Context {
    let ctx = builder
        .with_node(address)
        .with_loopback(network)
        .with_timeout(TIMEOUT)
        .build()
        .unwrap();
    ctx.init().unwrap();
    ctx
}

/// Initialized context that serves nothing and talks through `transport`.
pub fn with_transport(transport: Arc<dyn Transport>, builder: ContextBuilder) -> Context {
    let ctx = builder
        .with_transport(transport)
        .with_servers(false)
        .with_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    ctx.init().unwrap();
    ctx
}
