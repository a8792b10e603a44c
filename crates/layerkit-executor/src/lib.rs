//! Job execution backends for layerkit.
//!
//! Provides executor implementations for running toolchain commands:
//! - Local processes (default)
//! - Docker builder containers

pub mod docker;
pub mod local;

pub use docker::LocalDockerExecutor;
pub use layerkit_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use local::LocalProcessExecutor;
