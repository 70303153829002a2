pub mod anti_entropy;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod counter;
pub mod domain;
pub mod engine;
pub mod http;
pub mod log_store;
pub mod peer;
pub mod rpc;
pub mod version;
