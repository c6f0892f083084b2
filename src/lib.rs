pub mod bronze;
pub mod canon;
pub mod catalog;
pub mod config;
pub mod datasets;
pub mod download;
pub mod engine;
pub mod error;
pub mod extract;
pub mod frame;
pub mod fsutil;
pub mod gold;
pub mod http_client;
pub mod lines;
pub mod manifest;
pub mod pipeline;
pub mod rolling;
pub mod silver;
pub mod standardize;
pub mod store;
pub mod warehouse;
