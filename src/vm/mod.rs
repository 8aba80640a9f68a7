//! WebAssembly compute sandbox

pub mod sandbox;

pub use sandbox::{JobRunner, Sandbox, VmError, DEFAULT_FUEL};
