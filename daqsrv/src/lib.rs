#[macro_use]
extern crate lazy_static;

pub mod codec;
pub mod connection;
pub mod engine;
pub mod eval;
pub mod file_catalog;
pub mod modbus;
pub mod reader;
pub mod sinks;

pub use daqsrv_protocol::{Error, Result};
