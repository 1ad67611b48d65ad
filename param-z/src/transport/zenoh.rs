//! Transport over a zenoh session.
//!
//! Service `port` of node `n` is the queryable `csp/{n}/{port}`. Every request
//! is a query; each packet of the answer is one reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::AcqRel};
use std::time::Duration;

use ::zenoh::key_expr::KeyExpr;
use ::zenoh::query::{ConsolidationMode, Query, Queryable};
use ::zenoh::{Session, Wait};
use tracing::{debug, warn};

use super::{ConnOptions, Connection, Listener, Priority, Transport};
use crate::attachment::Attachment;
use crate::error::{Error, Result};

pub const KEY_PREFIX: &str = "csp";

pub fn service_key_expr(node: u16, port: u8) -> Result<KeyExpr<'static>> {
    Ok(KeyExpr::new(format!("{KEY_PREFIX}/{node}/{port}"))?)
}

pub struct ZenohTransport {
    session: Arc<Session>,
    node: u16,
    sn: Arc<AtomicUsize>,
}

impl ZenohTransport {
    pub fn new(session: Arc<Session>, node: u16) -> Self {
        Self {
            session,
            node,
            sn: Arc::new(AtomicUsize::new(1)),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Transport for ZenohTransport {
    fn address(&self) -> u16 {
        self.node
    }

    fn connect(
        &self,
        prio: Priority,
        node: u16,
        port: u8,
        timeout: Duration,
        opts: ConnOptions,
    ) -> Option<Box<dyn Connection>> {
        let key_expr = match service_key_expr(node, port) {
            Ok(ke) => ke,
            Err(e) => {
                warn!("[ZTP] cannot address node {node} port {port}: {e}");
                return None;
            }
        };
        if !opts.is_empty() {
            debug!("[ZTP] options {opts:?} are provided by the session, ignoring");
        }
        debug!("[ZTP] connect {key_expr}");
        Some(Box::new(ZenohConnection {
            session: self.session.clone(),
            key_expr,
            timeout,
            prio,
            source: self.node,
            sn: self.sn.clone(),
            rx: None,
        }))
    }

    fn listen(&self, port: u8) -> Result<Box<dyn Listener>> {
        let key_expr = service_key_expr(self.node, port)?;
        debug!("[ZTP] listen {key_expr}");
        let (tx, rx) = flume::unbounded();
        let queryable = self
            .session
            .declare_queryable(&key_expr)
            .complete(true)
            .callback(move |query| {
                let _ = tx.send(query);
            })
            .wait()?;
        Ok(Box::new(ZenohListener {
            _queryable: queryable,
            rx,
        }))
    }
}

struct ZenohConnection {
    session: Arc<Session>,
    key_expr: KeyExpr<'static>,
    timeout: Duration,
    prio: Priority,
    source: u16,
    sn: Arc<AtomicUsize>,
    rx: Option<flume::Receiver<Vec<u8>>>,
}

impl Connection for ZenohConnection {
    fn send(&mut self, packet: Vec<u8>) -> Result<()> {
        let (tx, rx) = flume::unbounded();
        let attachment = Attachment::new(self.sn.fetch_add(1, AcqRel) as _, self.source, self.prio);
        let key_expr = self.key_expr.clone();
        self.session
            .get(self.key_expr.clone())
            .payload(packet)
            .attachment(attachment)
            .consolidation(ConsolidationMode::None)
            .timeout(self.timeout)
            .callback(move |reply| match reply.into_result() {
                Ok(sample) => {
                    let _ = tx.send(sample.payload().to_bytes().into_owned());
                }
                Err(e) => warn!("[ZTP] error reply on {key_expr}: {:?}", e.payload()),
            })
            .wait()
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.rx = Some(rx);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.rx.as_ref()?.recv_timeout(timeout).ok()
    }
}

struct ZenohListener {
    _queryable: Queryable<()>,
    rx: flume::Receiver<Query>,
}

impl Listener for ZenohListener {
    fn accept(&mut self, timeout: Duration) -> Option<Box<dyn Connection>> {
        let query = self.rx.recv_timeout(timeout).ok()?;
        if let Some(attachment) = query.attachment() {
            match Attachment::try_from(attachment) {
                Ok(att) => debug!(
                    "[ZTP] request #{} from node {} on {}",
                    att.sequence_number,
                    att.source_node,
                    query.key_expr()
                ),
                Err(e) => debug!("[ZTP] unreadable attachment on {}: {e}", query.key_expr()),
            }
        }
        let request = query.payload().map(|p| p.to_bytes().into_owned());
        Some(Box::new(ZenohReply { query, request }))
    }
}

/// Server side of one query. Dropping it finalizes the query.
struct ZenohReply {
    query: Query,
    request: Option<Vec<u8>>,
}

impl Connection for ZenohReply {
    fn send(&mut self, packet: Vec<u8>) -> Result<()> {
        self.query
            .reply(self.query.key_expr().clone(), packet)
            .wait()
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn receive(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
        self.request.take()
    }
}
