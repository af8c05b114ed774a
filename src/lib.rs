pub mod common;
pub mod danmaku;
pub mod downloader;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod post_process;

pub use error::{JobError, PipelineError, Stage};
pub use pipeline::{DownloadOptions, JobDescriptor, JobSuccess, Pipeline};
