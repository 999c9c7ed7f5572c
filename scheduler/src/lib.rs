//! A sharded execution scheduler speaking the Remote Execution API wire
//! records.
//!
//! One [Scheduler] instance is a stateless shard: every durable fact
//! lives in the [backplane::Backplane], and content (blobs, actions,
//! input trees) lives on the workers' content-addressed stores. A shard
//! admits execute requests into the prequeue, and its [queuer::Queuer]
//! drains them through the transform pipeline (cache check, blob
//! resolution, validation, queued-operation upload) into the dispatch
//! queue workers pull from.

pub mod actioncache;
pub mod backplane;
pub mod config;
pub mod errors;
mod instance;
mod pipeline;
pub mod poller;
pub mod queuer;
pub mod resolver;
pub mod validator;
pub mod workers;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::SchedulerConfig;
pub use errors::{Code, Error};
pub use instance::Scheduler;
pub use pipeline::RecentExecutions;
