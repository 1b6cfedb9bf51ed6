pub mod config;
pub mod error;
pub mod extract;
pub mod ffmpeg;
pub mod ffprobe;
pub mod job;
pub mod joblog;
pub mod manifest;
pub mod packager;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod resolution;
pub mod scan;
pub mod selector;

pub use config::AutopackConfig;
pub use error::{PackError, Result};
pub use job::{plan, run_job, JobPlan};
pub use manifest::JobManifest;
pub use progress::{ProgressEvent, ProgressSink, Stage};
pub use resolution::{plan_ladder, Resolution};
