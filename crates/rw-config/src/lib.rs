pub mod logging;
pub mod overlay;
pub mod runner;
pub mod types;

pub use logging::{LogFormat, LoggingConfig};
pub use runner::{
    BackendKind, CallCacheConfig, ContainerConfig, DownloadCacheConfig, RunnerConfig,
    SchedulerConfig, TaskConfig,
};
pub use types::{ByteSize, HumanDuration};
