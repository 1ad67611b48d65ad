//! Periodic pull-all of configured nodes.
//!
//! Driven by three local parameters: `col_run` switches collection on,
//! `col_cnfstr` lists the targets as `"<node> <interval_ms> [mask]"` entries
//! separated by commas, and `col_verbose` raises the log level of each pull.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client;
use crate::context::{Context, Inner};
use crate::error::{Error, Result};
use crate::types::{LOCAL_NODE, ParamIdent, ParamMask, well_known};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectTarget {
    pub node: u16,
    pub interval: Duration,
    pub include: ParamMask,
}

/// Parse a collector configuration string.
pub fn parse_config(text: &str) -> Result<Vec<CollectTarget>> {
    let mut targets = Vec::new();
    for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let fields: Vec<&str> = item.split_whitespace().collect();
        let bad = |why: &str| Error::Config(format!("collector entry '{item}': {why}"));
        let (node, interval, mask) = match fields.as_slice() {
            [node, interval] => (node, interval, None),
            [node, interval, mask] => (node, interval, Some(mask)),
            _ => return Err(bad("expected '<node> <interval_ms> [mask]'")),
        };
        let node = node.parse::<u16>().map_err(|_| bad("bad node"))?;
        let interval = interval.parse::<u64>().map_err(|_| bad("bad interval"))?;
        let include = match mask {
            Some(mask) => ParamMask::from_str(mask)?,
            None => ParamMask::from_bits_retain(u32::MAX),
        };
        targets.push(CollectTarget {
            node,
            interval: Duration::from_millis(interval),
            include,
        });
    }
    Ok(targets)
}

struct Collector {
    config: String,
    targets: Vec<CollectTarget>,
    last: HashMap<u16, Instant>,
}

impl Collector {
    fn read_u8(ctx: &Context, id: u16) -> u64 {
        ctx.registry()
            .find(&ParamIdent::Id(id), LOCAL_NODE)
            .and_then(|meta| ctx.registry().read(meta.key(), None))
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    fn refresh(&mut self, ctx: &Context) {
        let text = ctx
            .registry()
            .find(&ParamIdent::Id(well_known::COLLECTOR_CNFSTR), LOCAL_NODE)
            .and_then(|meta| ctx.registry().read(meta.key(), None));
        let Ok(Value::Str(text)) = text else {
            return;
        };
        if text == self.config {
            return;
        }
        match parse_config(&text) {
            Ok(targets) => {
                info!("[COL] collecting from {} nodes", targets.len());
                self.targets = targets;
            }
            Err(e) => {
                warn!("[COL] {e}");
                self.targets.clear();
            }
        }
        self.config = text;
        self.last.clear();
    }

    fn tick(&mut self, ctx: &Context) {
        if Self::read_u8(ctx, well_known::COLLECTOR_RUN) == 0 {
            return;
        }
        self.refresh(ctx);
        let verbose = Self::read_u8(ctx, well_known::COLLECTOR_VERBOSE) != 0;
        let now = Instant::now();
        for target in &self.targets {
            let due = self
                .last
                .get(&target.node)
                .is_none_or(|at| now.duration_since(*at) >= target.interval);
            if !due {
                continue;
            }
            self.last.insert(target.node, now);
            let result = client::pull_all(
                ctx.transport().as_ref(),
                target.node,
                target.include,
                ParamMask::DEFAULT_EXCLUDE,
                ctx.timeout(),
                ctx.config().version,
            )
            .and_then(|writes| ctx.registry().apply(writes));
            match result {
                Ok(n) if verbose => info!("[COL] node {}: {n} values", target.node),
                Ok(n) => debug!("[COL] node {}: {n} values", target.node),
                Err(e) => warn!("[COL] node {}: {e}", target.node),
            }
        }
    }
}

/// Collector worker. Ends when the context stops or is dropped.
pub(crate) fn run(weak: Weak<Inner>, tick: Duration) {
    let mut collector = Collector {
        config: String::new(),
        targets: Vec::new(),
        last: HashMap::new(),
    };
    loop {
        thread::sleep(tick);
        let Some(ctx) = Context::from_weak(&weak) else {
            break;
        };
        if !ctx.is_running() {
            break;
        }
        collector.tick(&ctx);
    }
    debug!("[COL] collector stopped");
}
