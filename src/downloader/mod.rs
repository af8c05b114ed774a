pub mod core;
pub mod error;
pub mod plan;
pub mod progress;
pub mod rate_limit;
pub mod source;
pub mod state;

pub use self::core::{DownloadReport, DownloadScheduler, SchedulerConfig};
pub use self::plan::{ChunkMode, ChunkPlan, ChunkPlanner};
pub use self::source::{ChunkSource, HttpChunkSource};
pub use self::state::DownloadState;
