//! Sandboxed WebAssembly execution
//!
//! Jobs run under the WASI preview-1 interface with stdin fed from the
//! request input and stdout/stderr captured in memory. No filesystem is
//! preopened, no environment is exposed, and the single program argument
//! is "job". Each job gets a fuel budget so a runaway module traps
//! instead of pinning a core; wall clock stays bounded by the stream
//! deadline. Modules are compiled per request; the engine is long-lived.

use thiserror::Error;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::sync::WasiCtxBuilder;
use wasmtime_wasi::WasiCtx;

/// Instruction budget per job.
pub const DEFAULT_FUEL: u64 = 10_000_000_000;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("failed to compile wasm: {0}")]
    Compile(String),
    #[error("runtime error: {trap} (stderr: {stderr})")]
    Runtime { trap: String, stderr: String },
    #[error("sandbox init error: {0}")]
    Init(String),
}

/// The execution capability the compute protocol depends on.
pub trait JobRunner: Send + Sync {
    fn run(&self, wasm: &[u8], input: &[u8]) -> Result<Vec<u8>, VmError>;
}

pub struct Sandbox {
    engine: Engine,
    fuel: u64,
}

impl Sandbox {
    pub fn new() -> Result<Self, VmError> {
        Self::with_fuel(DEFAULT_FUEL)
    }

    pub fn with_fuel(fuel: u64) -> Result<Self, VmError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| VmError::Init(e.to_string()))?;
        Ok(Self { engine, fuel })
    }
}

impl JobRunner for Sandbox {
    /// Execute a wasm module's `_start` to completion and return its
    /// captured stdout. Compile failures, traps, and fuel exhaustion are
    /// errors carrying whatever the module wrote to stderr.
    fn run(&self, wasm: &[u8], input: &[u8]) -> Result<Vec<u8>, VmError> {
        let module =
            Module::new(&self.engine, wasm).map_err(|e| VmError::Compile(e.to_string()))?;

        let mut linker: Linker<WasiCtx> = Linker::new(&self.engine);
        wasmtime_wasi::add_to_linker(&mut linker, |ctx: &mut WasiCtx| ctx)
            .map_err(|e| VmError::Init(e.to_string()))?;

        let stdout = WritePipe::new_in_memory();
        let stderr = WritePipe::new_in_memory();

        let wasi = WasiCtxBuilder::new()
            .stdin(Box::new(ReadPipe::from(input.to_vec())))
            .stdout(Box::new(stdout.clone()))
            .stderr(Box::new(stderr.clone()))
            .arg("job")
            .map_err(|e| VmError::Init(e.to_string()))?
            .build();

        let mut store = Store::new(&self.engine, wasi);
        store
            .add_fuel(self.fuel)
            .map_err(|e| VmError::Init(e.to_string()))?;

        let outcome: anyhow::Result<()> = (|| {
            let instance = linker.instantiate(&mut store, &module)?;
            let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
            start.call(&mut store, ())?;
            Ok(())
        })();

        // Release the store's pipe clones before unwrapping the buffers.
        drop(store);

        let stderr_bytes = stderr
            .try_into_inner()
            .map(|c| c.into_inner())
            .unwrap_or_default();
        let stdout_bytes = stdout
            .try_into_inner()
            .map(|c| c.into_inner())
            .unwrap_or_default();

        match outcome {
            Ok(()) => Ok(stdout_bytes),
            Err(trap) => Err(VmError::Runtime {
                trap: trap.to_string(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_MODULE: &str = r#"(module (func (export "_start")))"#;

    // Reads up to 64 bytes from stdin and writes them back to stdout.
    const ECHO_MODULE: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_read"
            (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 100))
            (i32.store (i32.const 4) (i32.const 64))
            (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
            (i32.store (i32.const 0) (i32.const 100))
            (i32.store (i32.const 4) (i32.load (i32.const 8)))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))
    "#;

    const SPIN_MODULE: &str = r#"(module (func (export "_start") (loop $l (br $l))))"#;

    #[test]
    fn test_empty_module_runs_to_completion() {
        let vm = Sandbox::new().unwrap();
        let out = vm.run(EMPTY_MODULE.as_bytes(), b"").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_echo_module_round_trips_stdin() {
        let vm = Sandbox::new().unwrap();
        let out = vm.run(ECHO_MODULE.as_bytes(), b"hi").unwrap();
        assert_eq!(out, b"hi");
    }

    #[test]
    fn test_invalid_wasm_is_compile_error() {
        let vm = Sandbox::new().unwrap();
        let err = vm.run(b"definitely not wasm", b"").unwrap_err();
        assert!(matches!(err, VmError::Compile(_)));
    }

    #[test]
    fn test_runaway_module_exhausts_fuel() {
        let vm = Sandbox::with_fuel(100_000).unwrap();
        let err = vm.run(SPIN_MODULE.as_bytes(), b"").unwrap_err();
        assert!(matches!(err, VmError::Runtime { .. }));
    }

    #[test]
    fn test_missing_start_is_runtime_error() {
        let vm = Sandbox::new().unwrap();
        let err = vm.run(br#"(module (func (export "other")))"#, b"").unwrap_err();
        assert!(matches!(err, VmError::Runtime { .. }));
    }
}
