pub mod appliance;
pub mod bluetooth;
pub mod collector;
pub mod config;
pub mod models;
pub mod query;
pub mod server;
pub mod storage;
pub mod utils;
