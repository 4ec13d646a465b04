pub mod agent;
pub mod config;
pub mod decode;
pub mod export;
pub mod fleet;
pub mod model;
pub mod proto;
