pub mod bus;
pub mod channel;
pub mod config;
pub mod consumers;
pub mod engine;
pub mod ingest;
pub mod limits;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payload;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod wal;
