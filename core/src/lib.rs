pub mod device;
pub mod driver;
pub mod error;
pub mod minerloop;
pub mod options;
pub mod pool;
pub mod queue;
pub mod run;
pub mod staging;
pub mod stats;
pub mod submit;
pub mod sync;
pub mod watchdog;
pub mod work;

pub use device::{DevEnable, DevLife, DevReason, Device, DeviceSet, DeviceSpec, ThreadShared};
pub use driver::{AsyncDriver, DriverBase, DriverKind, LegacyDriver, QueueDriver};
pub use error::{CoreError, Result};
pub use minerloop::{get_queue_work, ThreadCtx};
pub use options::Options;
pub use pool::{strategy::Strategy, Pool, PoolConfig, PoolEnable, PoolProtocol, PoolSet};
pub use run::{Core, CoreHandles};
pub use submit::{submit_nonce, SubmitItem};
pub use work::{NonceTest, PoolId, Template, Work};
