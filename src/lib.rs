pub mod buffer;
pub mod codec;
pub mod conf;
pub mod container;
pub mod core;
pub mod harness;
pub mod io;

#[cfg(feature = "testutil")]
pub mod testutil;
