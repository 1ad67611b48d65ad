use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};
use zenoh::{Session, Wait};

use crate::collector;
use crate::config::{self, ENV_ZENOH_CONFIG, ParamConfig};
use crate::error::{Error, Result};
use crate::param::ParamMeta;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::server::{self, ListService, ParamService, Service};
use crate::transport::{LoopbackNetwork, Transport, ZenohTransport};
use crate::types::{ParamMask, ParamType, QueueDirection, Storage, well_known};
use crate::value::Value;
use crate::vmem::server::VmemService;
use crate::vmem::{FileVmem, RamVmem, Vmem, VmemTable};
use crate::wire;
use crate::Builder;

/// Name of the region backing the collector configuration string.
pub const COLLECTOR_REGION: &str = "col";
const COLLECTOR_REGION_ID: u16 = 255;
const COLLECTOR_REGION_SIZE: u32 = 128;
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

enum TransportChoice {
    Zenoh {
        config_file: Option<PathBuf>,
        overrides: Vec<(String, serde_json::Value)>,
    },
    Loopback(LoopbackNetwork),
    Custom(Arc<dyn Transport>),
}

enum Backing {
    Ram(u32),
    File(PathBuf, u32),
}

struct RegionSpec {
    id: u16,
    name: String,
    backing: Backing,
    protected: bool,
}

pub struct ContextBuilder {
    config: ParamConfig,
    overrides: Vec<(String, serde_json::Value)>,
    transport: TransportChoice,
    regions: Vec<RegionSpec>,
    params: Vec<(ParamMeta, Option<Value>)>,
    builtin_params: bool,
    serve: bool,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            config: ParamConfig::default(),
            overrides: Vec::new(),
            transport: TransportChoice::Zenoh {
                config_file: None,
                overrides: Vec::new(),
            },
            regions: Vec::new(),
            params: Vec::new(),
            builtin_params: true,
            serve: true,
        }
    }
}

impl ContextBuilder {
    /// Address of this process.
    pub fn with_node(mut self, node: u16) -> Self {
        self.config.node = node;
        self
    }

    pub fn with_default_node(mut self, node: u16) -> Self {
        self.config.dfl_node = node;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_autosend(mut self, autosend: bool) -> Self {
        self.config.autosend = autosend;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn with_hwid(mut self, hwid: u32) -> Self {
        self.config.hwid = Some(hwid);
        self
    }

    pub fn with_collector_tick(mut self, tick: Duration) -> Self {
        self.config.collector_tick_ms = tick.as_millis() as u64;
        self
    }

    /// Override one [`ParamConfig`] setting by name.
    pub fn with_setting<K: Into<String>, V: serde::Serialize>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        match serde_json::to_value(&value) {
            Ok(value) => self.overrides.push((key, value)),
            Err(e) => warn!("[CTX] dropping setting '{key}': {e}"),
        }
        self
    }

    /// Load the zenoh session configuration from a file.
    pub fn with_zenoh_config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        if let TransportChoice::Zenoh { config_file, .. } = &mut self.transport {
            *config_file = Some(path.into());
        } else {
            self.transport = TransportChoice::Zenoh {
                config_file: Some(path.into()),
                overrides: Vec::new(),
            };
        }
        self
    }

    /// Add a JSON override of the zenoh session configuration.
    pub fn with_zenoh_json<K: Into<String>, V: serde::Serialize>(mut self, key: K, value: V) -> Self {
        let key = key.into();
        let value = match serde_json::to_value(&value) {
            Ok(value) => value,
            Err(e) => {
                warn!("[CTX] dropping zenoh override '{key}': {e}");
                return self;
            }
        };
        match &mut self.transport {
            TransportChoice::Zenoh { overrides, .. } => overrides.push((key, value)),
            _ => {
                self.transport = TransportChoice::Zenoh {
                    config_file: None,
                    overrides: vec![(key, value)],
                }
            }
        }
        self
    }

    /// Zenoh session mode: "peer", "client" or "router".
    pub fn with_mode<S: Into<String>>(self, mode: S) -> Self {
        self.with_zenoh_json("mode", json!(mode.into()))
    }

    /// Convenience method: disable multicast scouting
    pub fn disable_multicast_scouting(self) -> Self {
        self.with_zenoh_json("scouting/multicast/enabled", json!(false))
    }

    pub fn with_connect_endpoints<I, S>(self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints.into_iter().map(|s| s.into()).collect();
        self.with_zenoh_json("connect/endpoints", json!(endpoints))
    }

    /// Join an in-process network instead of opening a zenoh session.
    pub fn with_loopback(mut self, network: &LoopbackNetwork) -> Self {
        self.transport = TransportChoice::Loopback(network.clone());
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = TransportChoice::Custom(transport);
        self
    }

    pub fn with_ram_region(mut self, id: u16, name: &str, size: u32) -> Self {
        self.regions.push(RegionSpec {
            id,
            name: name.to_owned(),
            backing: Backing::Ram(size),
            protected: false,
        });
        self
    }

    pub fn with_file_region<P: Into<PathBuf>>(mut self, id: u16, name: &str, path: P, size: u32) -> Self {
        self.regions.push(RegionSpec {
            id,
            name: name.to_owned(),
            backing: Backing::File(path.into(), size),
            protected: false,
        });
        self
    }

    /// A RAM region that refuses remote writes until unlocked.
    pub fn with_protected_region(mut self, id: u16, name: &str, size: u32) -> Self {
        self.regions.push(RegionSpec {
            id,
            name: name.to_owned(),
            backing: Backing::Ram(size),
            protected: true,
        });
        self
    }

    pub fn with_param(mut self, meta: ParamMeta, initial: Option<Value>) -> Self {
        self.params.push((meta, initial));
        self
    }

    /// Skip the debug and collector parameters every context registers by default.
    pub fn without_builtin_params(mut self) -> Self {
        self.builtin_params = false;
        self
    }

    /// Whether `init` starts the parameter, list and vmem servers.
    pub fn with_servers(mut self, serve: bool) -> Self {
        self.serve = serve;
        self
    }

    fn open_zenoh(
        config_file: Option<PathBuf>,
        overrides: Vec<(String, serde_json::Value)>,
    ) -> Result<Session> {
        // Priority order:
        // 1. Config file passed via with_zenoh_config_file()
        // 2. PARAMZ_ZENOH_CONFIG environment variable
        // 3. Default config
        let mut config = if let Some(ref config_file) = config_file {
            zenoh::Config::from_file(config_file)?
        } else if let Ok(path) = std::env::var(ENV_ZENOH_CONFIG) {
            zenoh::Config::from_file(path)?
        } else {
            zenoh::Config::default()
        };

        for (key, value) in overrides {
            let value_str = serde_json::to_string(&value)
                .map_err(|e| Error::Config(format!("cannot serialize '{key}': {e}")))?;
            config.insert_json5(&key, &value_str).map_err(|e| {
                Error::Config(format!(
                    "failed to apply zenoh override '{key}' = '{value_str}': {e}"
                ))
            })?;
        }
        Ok(zenoh::open(config).wait()?)
    }

    fn build_vmem(regions: Vec<RegionSpec>, builtin: bool) -> Result<VmemTable> {
        let table = VmemTable::new();
        for spec in regions {
            let store: Arc<dyn Vmem> = match spec.backing {
                Backing::Ram(size) => Arc::new(RamVmem::new(size)),
                Backing::File(path, size) => Arc::new(FileVmem::open(path, size)?),
            };
            table.add(spec.id, &spec.name, store, spec.protected)?;
        }
        if builtin && table.find_by_name(COLLECTOR_REGION).is_none() {
            table.add(
                COLLECTOR_REGION_ID,
                COLLECTOR_REGION,
                Arc::new(RamVmem::new(COLLECTOR_REGION_SIZE)),
                false,
            )?;
        }
        Ok(table)
    }

    fn register_builtin(registry: &Registry, vmem: &VmemTable) -> Result<()> {
        registry.register(
            ParamMeta::new(well_known::TEST_ARRAY_PARAM, "test_array_param", ParamType::Uint8)
                .with_array_len(8)
                .with_mask(ParamMask::DEBUG),
            Some(&Value::array(1u8..=8)),
        )?;
        registry.register(
            ParamMeta::new(well_known::TEST_STR, "test_str", ParamType::String)
                .with_array_len(80)
                .with_mask(ParamMask::DEBUG),
            None,
        )?;
        let region = vmem
            .find_by_name(COLLECTOR_REGION)
            .ok_or_else(|| Error::Config(format!("no '{COLLECTOR_REGION}' region")))?;
        registry.register(
            ParamMeta::new(well_known::COLLECTOR_CNFSTR, "col_cnfstr", ParamType::String)
                .with_array_len(100)
                .with_mask(ParamMask::CONF)
                .with_storage(Storage::Vmem {
                    region: region.id,
                    address: 0,
                }),
            None,
        )?;
        registry.register(
            ParamMeta::new(well_known::COLLECTOR_RUN, "col_run", ParamType::Uint8)
                .with_mask(ParamMask::CONF),
            Some(&Value::Uint(0)),
        )?;
        registry.register(
            ParamMeta::new(well_known::COLLECTOR_VERBOSE, "col_verbose", ParamType::Uint8)
                .with_mask(ParamMask::CONF),
            Some(&Value::Uint(0)),
        )?;
        Ok(())
    }
}


impl Builder for ContextBuilder {
    type Output = Context;

    fn build(mut self) -> Result<Context> {
        // Environment overrides come after the builder's own settings.
        self.overrides.extend(config::env_overrides()?);
        for (key, value) in &self.overrides {
            self.config.apply(key, value)?;
        }
        self.config.validate()?;

        let vmem = Arc::new(Self::build_vmem(self.regions, self.builtin_params)?);
        let registry = Arc::new(Registry::new(vmem.clone()));
        if self.builtin_params {
            Self::register_builtin(&registry, &vmem)?;
        }
        for (meta, initial) in self.params {
            registry.register(meta, initial.as_ref())?;
        }

        let (transport, session): (Arc<dyn Transport>, _) = match self.transport {
            TransportChoice::Zenoh {
                config_file,
                overrides,
            } => {
                let session = Arc::new(Self::open_zenoh(config_file, overrides)?);
                let transport = ZenohTransport::new(session.clone(), self.config.node);
                (Arc::new(transport), Some(session))
            }
            TransportChoice::Loopback(network) => (Arc::new(network.transport(self.config.node)), None),
            TransportChoice::Custom(transport) => (transport, None),
        };

        let config = self.config;
        debug!("[CTX] built context for node {} ({config:?})", config.node);
        Ok(Context {
            inner: Arc::new(Inner {
                get_queue: Mutex::new(Queue::new(
                    QueueDirection::Get,
                    config.version,
                    config.queue_capacity,
                )),
                set_queue: Mutex::new(Queue::new(
                    QueueDirection::Set,
                    config.version,
                    config.queue_capacity,
                )),
                autosend: AtomicBool::new(config.autosend),
                dfl_node: AtomicU16::new(config.dfl_node),
                dfl_timeout_ms: AtomicU64::new(config.timeout_ms),
                initialized: AtomicBool::new(false),
                running: Arc::new(AtomicBool::new(false)),
                workers: Mutex::new(Vec::new()),
                serve: self.serve,
                config,
                registry,
                vmem,
                transport,
                session,
            }),
        })
    }
}

pub(crate) struct Inner {
    pub(crate) config: ParamConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) vmem: Arc<VmemTable>,
    pub(crate) transport: Arc<dyn Transport>,
    session: Option<Arc<Session>>,
    pub(crate) get_queue: Mutex<Queue>,
    pub(crate) set_queue: Mutex<Queue>,
    pub(crate) autosend: AtomicBool,
    dfl_node: AtomicU16,
    dfl_timeout_ms: AtomicU64,
    initialized: AtomicBool,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    serve: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Handle to one parameter runtime: registry, default queues, transport and
/// background workers. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<Inner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Context {
    pub(crate) fn from_weak(weak: &Weak<Inner>) -> Option<Context> {
        weak.upgrade().map(|inner| Context { inner })
    }

    /// Start the background workers. May be called once.
    pub fn init(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInitialized);
        }
        self.inner.running.store(true, Ordering::Release);
        let mut workers = self.inner.workers.lock();

        let running = self.inner.running.clone();
        let vmem = self.inner.vmem.clone();
        workers.push(spawn("housekeeping", move || housekeeping(vmem, running))?);

        if self.inner.serve {
            let services: [(u8, Arc<dyn Service>); 3] = [
                (
                    wire::PORT_PARAM,
                    Arc::new(ParamService::new(
                        self.inner.registry.clone(),
                        self.inner.config.node,
                        self.inner.config.hwid,
                        self.inner.config.queue_capacity,
                    )),
                ),
                (wire::PORT_LIST, Arc::new(ListService::new(self.inner.registry.clone()))),
                (wire::PORT_VMEM, Arc::new(VmemService::new(self.inner.registry.clone()))),
            ];
            for (port, service) in services {
                let listener = self.inner.transport.listen(port)?;
                let running = self.inner.running.clone();
                workers.push(spawn(service.name(), move || server::serve(service, listener, running))?);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let tick = Duration::from_millis(self.inner.config.collector_tick_ms);
        workers.push(spawn("collector", move || collector::run(weak, tick))?);

        info!(
            "[CTX] node {} initialized ({} parameters, {} regions)",
            self.inner.config.node,
            self.inner.registry.len(),
            self.inner.vmem.enumerate_regions().len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn check_init(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::Uninitialized)
        }
    }

    /// Stop the workers, flush vmem and close the zenoh session.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("[CTX] a worker panicked");
            }
        }
        let failed = self.inner.vmem.flush_all();
        if failed > 0 {
            warn!("[CTX] {failed} vmem regions failed to flush");
        }
        if let Some(session) = &self.inner.session {
            session.close().wait()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &ParamConfig {
        &self.inner.config
    }

    /// Address of this process.
    pub fn address(&self) -> u16 {
        self.inner.config.node
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn vmem_table(&self) -> &Arc<VmemTable> {
        &self.inner.vmem
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn default_node(&self) -> u16 {
        self.inner.dfl_node.load(Ordering::Acquire)
    }

    pub fn set_default_node(&self, node: u16) {
        self.inner.dfl_node.store(node, Ordering::Release);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.dfl_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .dfl_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn autosend(&self) -> bool {
        self.inner.autosend.load(Ordering::Acquire)
    }

    pub fn set_autosend(&self, autosend: bool) {
        self.inner.autosend.store(autosend, Ordering::Release);
    }

    /// Switch autosend until the guard is dropped.
    pub fn autosend_guard(&self, autosend: bool) -> AutosendGuard<'_> {
        let previous = self.inner.autosend.swap(autosend, Ordering::AcqRel);
        AutosendGuard { ctx: self, previous }
    }

    /// Start a named pending command, discarding whatever the queue of that
    /// direction held.
    pub fn cmd_new(&self, direction: QueueDirection, name: &str) {
        let queue = Queue::new(direction, self.inner.config.version, self.inner.config.queue_capacity)
            .named(name);
        let slot = match direction {
            QueueDirection::Get => &self.inner.get_queue,
            QueueDirection::Set => &self.inner.set_queue,
        };
        let old = std::mem::replace(&mut *slot.lock(), queue);
        if !old.is_empty() {
            debug!("[CTX] discarded {} pending {direction} entries", old.len());
        }
    }

    /// Clear both pending queues.
    pub fn cmd_done(&self) {
        self.inner.get_queue.lock().clear();
        self.inner.set_queue.lock().clear();
    }

    /// Printable view of the pending queues.
    pub fn queue(&self) -> String {
        let mut out = String::new();
        for queue in [&self.inner.get_queue, &self.inner.set_queue] {
            let queue = queue.lock();
            if !queue.is_empty() {
                out.push_str(&queue.to_string());
            }
        }
        if out.is_empty() {
            out.push_str("No pending commands\n");
        }
        out
    }

    /// Snapshot of the pending queue of one direction.
    pub fn pending(&self, direction: QueueDirection) -> Queue {
        match direction {
            QueueDirection::Get => self.inner.get_queue.lock().clone(),
            QueueDirection::Set => self.inner.set_queue.lock().clone(),
        }
    }
}

/// Restores the previous autosend mode when dropped.
pub struct AutosendGuard<'a> {
    ctx: &'a Context,
    previous: bool,
}

impl Drop for AutosendGuard<'_> {
    fn drop(&mut self) {
        self.ctx.set_autosend(self.previous);
    }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new()
        .name(format!("paramz-{name}"))
        .spawn(f)?)
}

fn housekeeping(vmem: Arc<VmemTable>, running: Arc<AtomicBool>) {
    let step = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while running.load(Ordering::Acquire) {
        thread::sleep(step);
        elapsed += step;
        if elapsed >= HOUSEKEEPING_PERIOD {
            elapsed = Duration::ZERO;
            let failed = vmem.flush_all();
            if failed > 0 {
                warn!("[CTX] housekeeping: {failed} regions failed to flush");
            }
        }
    }
    debug!("[CTX] housekeeping stopped");
}
