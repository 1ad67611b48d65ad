//! Caller-facing parameter operations.
//!
//! Node 0 is this process: reads and writes go straight to the registry.
//! Other nodes are reached through the context's transport, one blocking
//! round trip per call. Queue and registry locks are taken only around
//! mutations, never across a round trip.

use std::io::{BufRead, Write};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::ParamHandle;
use crate::param::ParamMeta;
use crate::queue::Queue;
use crate::registry::RawWrite;
use crate::types::{LOCAL_NODE, ParamIdent, ParamMask, QueueDirection};
use crate::value::Value;
use crate::vmem::{self, RegionInfo};

/// How a `set` reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    /// Immediate when autosend is on, queued otherwise.
    #[default]
    Default,
    /// Apply now, whatever the autosend mode.
    Immediate,
    /// Stage into the shared SET queue.
    Queued,
}

impl Context {
    fn deferred(&self, mode: SetMode) -> bool {
        match mode {
            SetMode::Default => !self.autosend(),
            SetMode::Immediate => false,
            SetMode::Queued => true,
        }
    }

    fn transient(&self, direction: QueueDirection) -> Queue {
        Queue::new(direction, self.config().version, self.config().queue_capacity)
    }

    /// Resolve a handle's current metadata and the address to contact.
    fn target(&self, param: &ParamHandle, host: Option<u16>) -> Result<(ParamMeta, u16)> {
        let meta = self.registry().meta(param.key())?;
        let node = host.or(param.host()).unwrap_or(meta.node);
        Ok((meta, node))
    }

    fn pull_queue(&self, queue: &Queue, node: u16, timeout: Duration) -> Result<usize> {
        let writes = client::pull(self.transport().as_ref(), queue, node, timeout)?;
        self.registry().apply(writes)
    }

    fn push_queue(&self, queue: &Queue, node: u16, timeout: Duration, hwid: Option<u32>) -> Result<usize> {
        if node != LOCAL_NODE {
            client::push(self.transport().as_ref(), queue, node, timeout, hwid, true)?;
        }
        // Keep the local cache in step with what the node accepted.
        self.registry().apply(queue.to_writes())
    }

    /// Look up a parameter by name, id or key. `node` defaults to the default node.
    pub fn find<I: Into<ParamIdent>>(&self, ident: I, node: Option<u16>) -> Result<ParamHandle> {
        self.check_init()?;
        let node = node.unwrap_or_else(|| self.default_node());
        let meta = self.registry().find(&ident.into(), node)?;
        Ok(ParamHandle::new(self.clone(), meta))
    }

    /// Read a parameter, pulling it first when it is remote and `autopull` is set.
    ///
    /// Arrays read without an offset return every slot.
    pub fn get(
        &self,
        param: &ParamHandle,
        offset: Option<i32>,
        autopull: bool,
        host: Option<u16>,
    ) -> Result<Value> {
        self.check_init()?;
        let (meta, node) = self.target(param, host)?;
        let offset = meta.resolve_offset(offset)?;
        if meta.is_array() && offset.is_none() {
            return self.get_array(param, autopull, host);
        }

        if meta.node != LOCAL_NODE && autopull {
            let mut queue = self.transient(QueueDirection::Get);
            queue.add(&meta, offset, None)?;
            if self.autosend() {
                self.pull_queue(&queue, node, self.timeout())?;
            } else {
                self.inner.get_queue.lock().append(queue)?;
                debug!("[SYN] queued get of {}", meta.name);
            }
        }
        self.registry().read(meta.key(), offset)
    }

    /// Write a parameter.
    ///
    /// Local parameters are written directly, remote ones are pushed in a
    /// single-entry exchange. Deferred writes go to the shared SET queue,
    /// local ones included.
    pub fn set(
        &self,
        param: &ParamHandle,
        value: &Value,
        offset: Option<i32>,
        host: Option<u16>,
        mode: SetMode,
    ) -> Result<()> {
        self.check_init()?;
        let (meta, node) = self.target(param, host)?;
        if meta.mask.contains(ParamMask::READONLY) {
            return Err(Error::ReadOnly(meta.name));
        }
        let offset = meta.resolve_offset(offset)?;
        if meta.is_array() && offset.is_none() {
            let values = value
                .as_array()
                .ok_or_else(|| Error::TypeMismatch {
                    expected: meta.ty,
                    value: value.to_string(),
                })?;
            return self.set_array(param, values, host, mode);
        }

        let mut queue = self.transient(QueueDirection::Set);
        queue.add(&meta, offset, Some(value))?;
        if self.deferred(mode) {
            self.inner.set_queue.lock().append(queue)?;
            debug!("[SYN] queued set of {}", meta.name);
            return Ok(());
        }
        let node = if meta.node == LOCAL_NODE { LOCAL_NODE } else { node };
        self.push_queue(&queue, node, self.timeout(), None)?;
        Ok(())
    }

    /// Read every slot of an array in one exchange.
    pub fn get_array(&self, param: &ParamHandle, autopull: bool, host: Option<u16>) -> Result<Value> {
        self.check_init()?;
        let (meta, node) = self.target(param, host)?;
        if !meta.is_array() {
            return Err(Error::NotArray(meta.name));
        }
        if meta.node != LOCAL_NODE && autopull {
            // A whole-parameter entry is answered with every slot.
            let mut queue = self.transient(QueueDirection::Get);
            queue.add(&meta, None, None)?;
            if self.autosend() {
                self.pull_queue(&queue, node, self.timeout())?;
            } else {
                self.inner.get_queue.lock().append(queue)?;
            }
        }
        self.registry().read(meta.key(), None)
    }

    /// Write every slot of an array, all or nothing.
    ///
    /// A sequence of the wrong length or an unconvertible element is
    /// reported before anything is queued or sent. The array travels as one
    /// whole-parameter entry; one too large for a queue is sent slot by slot
    /// over several exchanges, and the local cache is updated only once every
    /// exchange succeeded.
    pub fn set_array(
        &self,
        param: &ParamHandle,
        values: &[Value],
        host: Option<u16>,
        mode: SetMode,
    ) -> Result<()> {
        self.check_init()?;
        let (meta, node) = self.target(param, host)?;
        if !meta.is_array() {
            return Err(Error::NotArray(meta.name));
        }
        if meta.mask.contains(ParamMask::READONLY) {
            return Err(Error::ReadOnly(meta.name));
        }
        if values.len() != meta.array_len as usize {
            return Err(Error::LengthMismatch {
                expected: meta.array_len as usize,
                actual: values.len(),
            });
        }

        if meta.node == LOCAL_NODE && !self.deferred(mode) {
            let bytes = meta.encode(&Value::Array(values.to_vec()), None)?;
            self.registry().apply(vec![RawWrite {
                key: meta.key(),
                offset: None,
                bytes,
                timestamp: None,
            }])?;
            return Ok(());
        }

        let deferred = self.deferred(mode);
        let mut whole = self.transient(QueueDirection::Set);
        let batches = match whole.add(&meta, None, Some(&Value::Array(values.to_vec()))) {
            Ok(()) => vec![whole],
            Err(Error::QueueFull { .. }) if !deferred => self.slot_batches(&meta, values)?,
            Err(e) => return Err(e),
        };
        if deferred {
            let mut shared = self.inner.set_queue.lock();
            for batch in batches {
                shared.append(batch)?;
            }
            debug!("[SYN] queued {} slots of {}", values.len(), meta.name);
            return Ok(());
        }

        let timeout = self.timeout();
        for batch in &batches {
            client::push(self.transport().as_ref(), batch, node, timeout, None, true)?;
        }
        if batches.len() > 1 {
            debug!("[SYN] {} sent in {} exchanges", meta.name, batches.len());
        }
        self.registry()
            .apply(batches.iter().flat_map(Queue::to_writes).collect())?;
        Ok(())
    }

    /// Split an array too large for one queue into per-slot queues that each fit.
    fn slot_batches(&self, meta: &ParamMeta, values: &[Value]) -> Result<Vec<Queue>> {
        let mut batches = Vec::new();
        let mut queue = self.transient(QueueDirection::Set);
        for (i, value) in values.iter().enumerate() {
            match queue.add(meta, Some(i as u16), Some(value)) {
                Err(Error::QueueFull { .. }) if !queue.is_empty() => {
                    batches.push(std::mem::replace(&mut queue, self.transient(QueueDirection::Set)));
                    queue.add(meta, Some(i as u16), Some(value))?;
                }
                other => other?,
            }
        }
        batches.push(queue);
        Ok(batches)
    }

    /// Flush the shared GET queue against `node`.
    ///
    /// On failure the queue is kept for a retry.
    pub fn pull(&self, node: Option<u16>, timeout: Option<Duration>) -> Result<usize> {
        self.check_init()?;
        let node = node.unwrap_or_else(|| self.default_node());
        let snapshot = self.inner.get_queue.lock().clone();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let applied = if node == LOCAL_NODE {
            0
        } else {
            self.pull_queue(&snapshot, node, timeout.unwrap_or_else(|| self.timeout()))?
        };
        self.inner.get_queue.lock().drain_front(snapshot.len());
        Ok(applied)
    }

    /// Flush the shared SET queue to `node`. Node 0 applies locally.
    ///
    /// With `hwid`, only a node carrying that hardware id applies the values.
    pub fn push(&self, node: Option<u16>, timeout: Option<Duration>, hwid: Option<u32>) -> Result<usize> {
        self.check_init()?;
        let node = node.unwrap_or_else(|| self.default_node());
        let snapshot = self.inner.set_queue.lock().clone();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let applied = self.push_queue(
            &snapshot,
            node,
            timeout.unwrap_or_else(|| self.timeout()),
            hwid,
        )?;
        self.inner.set_queue.lock().drain_front(snapshot.len());
        info!("[SYN] pushed {} entries to node {node}", snapshot.len());
        Ok(applied)
    }

    /// Pull every parameter of `node` selected by the masks.
    ///
    /// A non-empty GET queue takes precedence: only its entries are pulled.
    /// `include` defaults to everything, `exclude` to remote and hardware
    /// register parameters.
    pub fn pull_all(
        &self,
        node: Option<u16>,
        include: Option<ParamMask>,
        exclude: Option<ParamMask>,
        timeout: Option<Duration>,
        version: Option<u8>,
    ) -> Result<usize> {
        self.check_init()?;
        if !self.inner.get_queue.lock().is_empty() {
            debug!("[SYN] pull-all served from the pending get queue");
            return self.pull(node, timeout);
        }
        let node = node.unwrap_or_else(|| self.default_node());
        let include = include.unwrap_or(ParamMask::from_bits_retain(u32::MAX));
        let exclude = exclude.unwrap_or(ParamMask::DEFAULT_EXCLUDE);
        if node == LOCAL_NODE {
            return Ok(self.registry().select(include, exclude, LOCAL_NODE).len());
        }
        let writes = client::pull_all(
            self.transport().as_ref(),
            node,
            include,
            exclude,
            timeout.unwrap_or_else(|| self.timeout()),
            version.unwrap_or(self.config().version),
        )?;
        self.registry().apply(writes)
    }

    /// Fetch the parameter list of `node`, adding unknown entries to the registry.
    ///
    /// Returns the number of entries added.
    pub fn download(
        &self,
        node: Option<u16>,
        timeout: Option<Duration>,
        version: Option<u8>,
        include_remotes: bool,
    ) -> Result<usize> {
        self.check_init()?;
        let node = node.unwrap_or_else(|| self.default_node());
        let metas = client::download(
            self.transport().as_ref(),
            node,
            timeout.unwrap_or_else(|| self.timeout()),
            version.unwrap_or(self.config().version),
            include_remotes,
        )?;
        let total = metas.len();
        let mut added = 0;
        for meta in metas {
            let name = meta.name.clone();
            if self.registry().insert_if_absent(meta) {
                added += 1;
            } else {
                debug!("[SYN] {name} from node {node} already known");
            }
        }
        info!("[SYN] downloaded {total} parameters from node {node}, {added} new");
        Ok(added)
    }

    /// Drop cached entries of `node`, or of every remote node.
    pub fn forget(&self, node: Option<u16>, verbose: bool) -> Result<usize> {
        self.check_init()?;
        let removed = self.registry().forget(node, verbose);
        info!("[SYN] forgot {removed} parameters");
        Ok(removed)
    }

    /// Handles of the parameters matching a mask, an optional node and a name glob.
    pub fn list(&self, mask: ParamMask, node: Option<u16>, glob: Option<&str>) -> Result<Vec<ParamHandle>> {
        self.check_init()?;
        Ok(self
            .registry()
            .list(mask, node, glob)?
            .into_iter()
            .map(|meta| ParamHandle::new(self.clone(), meta))
            .collect())
    }

    /// Write the registry as `list add` lines.
    pub fn list_save<W: Write>(&self, out: &mut W, node: Option<u16>, include_node: bool) -> Result<usize> {
        self.check_init()?;
        self.registry().save_list(out, node, include_node)
    }

    /// Register parameters from `list add` lines. Lines without `-n` use the default node.
    pub fn list_load<R: BufRead>(&self, input: R) -> Result<usize> {
        self.check_init()?;
        self.registry().load_list(input, self.default_node())
    }

    /// Regions of `node`. Node 0 lists this process's regions.
    pub fn vmem(&self, node: Option<u16>, timeout: Option<Duration>) -> Result<Vec<RegionInfo>> {
        self.check_init()?;
        match node.unwrap_or_else(|| self.default_node()) {
            LOCAL_NODE => Ok(self.vmem_table().enumerate_regions()),
            node => vmem::client::list(
                self.transport().as_ref(),
                node,
                timeout.unwrap_or_else(|| self.timeout()),
                self.config().version,
            ),
        }
    }

    /// Snapshot the contents of a region.
    pub fn backup(&self, node: u16, region: u16, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.check_init()?;
        if node == LOCAL_NODE {
            return self.vmem_table().read_region(region);
        }
        vmem::client::backup(
            self.transport().as_ref(),
            node,
            region,
            timeout.unwrap_or_else(|| self.timeout()),
        )
    }

    /// Write a snapshot back into a region.
    pub fn restore(&self, node: u16, region: u16, timeout: Option<Duration>, bytes: &[u8]) -> Result<()> {
        self.check_init()?;
        if node == LOCAL_NODE {
            self.vmem_table().write_region(region, bytes)?;
            self.registry().reload_region(region, 0..bytes.len() as u32)?;
            return Ok(());
        }
        vmem::client::restore(
            self.transport().as_ref(),
            node,
            region,
            timeout.unwrap_or_else(|| self.timeout()),
            bytes,
        )
    }

    /// Run the unlock handshake with `node`. Not retried on failure.
    pub fn unlock(&self, node: u16, timeout: Option<Duration>) -> Result<()> {
        self.check_init()?;
        if node == LOCAL_NODE {
            return Err(Error::Config("unlock needs a remote node".into()));
        }
        vmem::client::unlock(
            self.transport().as_ref(),
            node,
            timeout.unwrap_or_else(|| self.timeout()),
        )
        .inspect_err(|e| warn!("[SYN] unlock of node {node} failed: {e}"))
    }
}
