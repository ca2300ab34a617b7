pub mod blueprint;
pub mod data;
pub mod error;
pub mod event;
pub mod execution;
pub mod flow;
pub mod process;
pub mod signal;
pub mod stream;
mod system;
pub mod utils;

pub use blueprint::{BluePrint, Chunk, ChunkTarget, CollectRegistry};
pub use data::{DataOp, DataStore};
pub use error::{Result, TriggerFlowError};
pub use event::EventData;
pub use execution::{Execution, StartOptions, DEFAULT_TIMEOUT};
pub use flow::{ExecutionOptions, TriggerFlow};
pub use process::{
    BatchOptions, CaseCondition, CollectMode, MatchMode, Process, ToOptions, TriggerSpec, WhenMode,
};
pub use signal::{next_id, Condition, Handler, HandlerMap, HandlerTable, TriggerType, START_SIGNAL};
pub use stream::StreamFanout;
pub use utils::LoggingConfig;
