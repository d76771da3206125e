pub mod codec;
pub mod config;
pub mod error;
pub mod wire;

pub mod chunkserver_impl;
pub mod chunkserver_service;
pub mod master_heartbeat;
pub mod master_impl;
pub mod master_service;
pub mod peer;

pub mod util;
