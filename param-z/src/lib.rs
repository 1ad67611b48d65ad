pub mod attachment;
pub mod client;
pub mod codec;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod param;
pub mod queue;
pub mod registry;
pub mod server;
pub mod sync;
pub mod transport;
pub mod types;
pub mod value;
pub mod vmem;
pub mod wire;

pub use context::{AutosendGuard, Context, ContextBuilder};
pub use error::{Error, Result};
pub use handle::ParamHandle;
pub use param::ParamMeta;
pub use queue::Queue;
pub use sync::SetMode;
pub use types::{LOCAL_NODE, ParamIdent, ParamKey, ParamMask, ParamType, QueueDirection, Storage};
pub use value::Value;

pub trait Builder {
    type Output;
    fn build(self) -> Result<Self::Output>;
}
