pub mod cache;
pub mod config;
pub mod cooccurrence;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod locks;
pub mod mbti;
pub mod pairwise;
pub mod persistence;
pub mod pool;
pub mod protocol;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod scorer;
pub mod server;
pub mod topk;
pub mod transport;
pub mod types;
