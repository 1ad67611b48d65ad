use std::fmt;
use std::time::SystemTime;

use crate::context::Context;
use crate::error::Result;
use crate::param::ParamMeta;
use crate::sync::SetMode;
use crate::types::{ParamIdent, ParamKey, ParamMask, ParamType};
use crate::value::Value;

/// Reference to a registry-owned parameter.
///
/// The handle caches the immutable metadata; the value always lives in the
/// registry. `node` and `host` may be changed after creation.
#[derive(Clone)]
pub struct ParamHandle {
    ctx: Context,
    meta: ParamMeta,
    host: Option<u16>,
}

impl ParamHandle {
    pub(crate) fn new(ctx: Context, meta: ParamMeta) -> Self {
        Self {
            ctx,
            meta,
            host: None,
        }
    }

    pub fn key(&self) -> ParamKey {
        self.meta.key()
    }

    pub fn meta(&self) -> &ParamMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn unit(&self) -> &str {
        &self.meta.unit
    }

    pub fn docstr(&self) -> &str {
        &self.meta.docstr
    }

    pub fn id(&self) -> u16 {
        self.meta.id
    }

    pub fn node(&self) -> u16 {
        self.meta.node
    }

    /// Re-resolve this handle to the parameter of the same name on `node`.
    ///
    /// On failure the handle keeps referencing its current parameter.
    pub fn set_node(&mut self, node: u16) -> Result<()> {
        let ident = ParamIdent::Name(self.meta.name.clone());
        self.meta = self.ctx.registry().find(&ident, node)?;
        Ok(())
    }

    /// Transport address override. Does not change which parameter is referenced.
    pub fn host(&self) -> Option<u16> {
        self.host
    }

    pub fn set_host(&mut self, host: Option<u16>) {
        self.host = host;
    }

    pub fn ty(&self) -> ParamType {
        self.meta.ty
    }

    pub fn array_len(&self) -> u16 {
        self.meta.array_len
    }

    pub fn is_array(&self) -> bool {
        self.meta.is_array()
    }

    pub fn is_vmem(&self) -> bool {
        self.meta.is_vmem()
    }

    pub fn mask(&self) -> ParamMask {
        self.meta.mask
    }

    /// Time of the last local write or received value.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.ctx.registry().timestamp(self.key())
    }

    /// Current value, pulled first if the parameter is remote.
    pub fn value(&self) -> Result<Value> {
        self.ctx.get(self, None, true, None)
    }

    /// Write a value following the context's autosend mode.
    pub fn set_value(&self, value: &Value) -> Result<()> {
        self.ctx.set(self, value, None, None, SetMode::Default)
    }

    /// Cached value, without network activity.
    pub fn cached(&self) -> Result<Value> {
        self.ctx.get(self, None, false, None)
    }
}

impl PartialEq for ParamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.ctx == other.ctx
    }
}

impl Eq for ParamHandle {}

impl From<&ParamHandle> for ParamIdent {
    fn from(param: &ParamHandle) -> Self {
        Self::Key(param.key())
    }
}

impl fmt::Debug for ParamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamHandle")
            .field("key", &self.key())
            .field("name", &self.meta.name)
            .field("ty", &self.meta.ty)
            .field("host", &self.host)
            .finish()
    }
}

impl fmt::Display for ParamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4}:{:<2} {}", self.meta.id, self.meta.node, self.meta.name)?;
        if self.meta.array_len > 1 {
            write!(f, "[{}]", self.meta.array_len)?;
        }
        write!(f, " {}", self.meta.ty)?;
        if !self.meta.unit.is_empty() {
            write!(f, " [{}]", self.meta.unit)?;
        }
        if !self.meta.mask.is_empty() {
            write!(f, " {}", self.meta.mask)?;
        }
        Ok(())
    }
}
