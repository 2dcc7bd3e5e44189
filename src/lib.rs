//! prime-cache: a primality server with a cache-aside layer
//!
//! Each request carries one integer; the answer is `prime` or `composite`.
//!
//! Features:
//! - Answers cached in Redis under `primecache:<n>` (or in-process for local runs)
//! - Cache misses computed in a fresh worker process, off the event loop
//! - Per-request failures logged and contained; the connection stays usable
//! - Configuration via CLI arguments or TOML file

pub mod cache;
pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod worker;

pub use cache::{Backend, CacheClient, CacheError};
pub use orchestrator::{Orchestrator, RequestError, StoreFailurePolicy};
pub use protocol::Answer;
pub use server::Server;
pub use worker::{Dispatcher, ProcessDispatcher, WorkerError};
