#![doc = include_str!("../README.md")]

mod common;
pub mod connection;
pub mod pool;
pub mod propagation;
pub mod worker;

pub use common::*;
pub use connection::{Connector, LazyChannelConnector};
pub use pool::{State, TargetManager, WorkerPoolManager, distribute};
pub use propagation::{ForwardedHeaders, ForwardingInterceptor, server_interceptor};
pub use worker::Processor;
