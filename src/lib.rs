//! An in-process host for sandboxed WebAssembly plugins.
//!
//! Plugins are loaded from local files or fetched remotely, shared efficiently across
//! worker threads, and kept running when their code misbehaves.
//!
//! # Core Concepts
//!
//! - [`Host`]: The process-wide bootstrap. Owns the registered [`VmEngine`]s, the
//! 	[`CodeCache`] of remotely fetched code and the table of shareable base VMs.
//! 	Nothing is global: tests and embedders construct as many independent hosts as
//! 	they need.
//!
//! - [`CodeCache`]: Remote code keyed by its SHA-256. At most one fetch per key is ever
//! 	in flight, failures are cached for ten seconds so a failing origin is not hammered,
//! 	and entries unused for a day are evicted.
//!
//! - [`AcquisitionPipeline`]: Resolves a plugin's code, synchronously for local sources
//! 	and through the cache for remote ones, then completes exactly once on the
//! 	requesting thread's [`Dispatcher`].
//!
//! - [`VmInstance`]: A VM. A **base** VM compiles the code once per unique
//! 	[`VmKey`]; **derived** VMs share that compiled program and own their execution
//! 	state, timers and context ids. A VM that could not be created, started or
//! 	configured, or that trapped at runtime, records why in its [`FailState`].
//!
//! - [`PluginHandle`]: A [`Plugin`] bound to a derived VM.
//!
//! - [`PluginRuntime`]: Owns a plugin's base VM and its handles (one shared handle,
//! 	or one per worker thread) and hands out [`ExecutionContext`]s according to the
//! 	plugin's [`FailurePolicy`].
//!
//! # Failure Policies
//!
//! - `FAIL_OPEN`: a failed or absent plugin is skipped; no context is created.
//! - `FAIL_CLOSED` (the default): a failed or absent plugin yields a denying context
//! 	that refuses every call instead of running guest code.
//! - `FAIL_RELOAD`: a VM that trapped at runtime is replaced with a freshly derived one,
//! 	at most once per jittered, exponentially growing backoff interval. Failures
//! 	other than runtime traps are permanent and behave like `FAIL_CLOSED`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc ;
//! use wasm_host::{ Dispatcher, Host, PluginConfig, PluginRuntime, SimulatedDispatcher, Value };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Host::new();
//! let dispatcher: Arc<dyn Dispatcher> = Arc::new( SimulatedDispatcher::new() );
//!
//! // Every guest exports `on_vm_start`; a non-zero result accepts the VM.
//! let config = PluginConfig::from_json( r#"{
//! 	"name": "adder",
//! 	"vm_config": { "code": { "local": { "inline_string":
//! 		"(module (func (export \"on_vm_start\") (param i32) (result i32) i32.const 1) (func (export \"add\") (param i32 i32) (result i32) local.get 0 local.get 1 i32.add))"
//! 	}}}
//! }"# )?;
//!
//! // Local code loads synchronously.
//! let runtime = PluginRuntime::new( &host, config, dispatcher, None )?;
//! let context = runtime.create_context().ok_or( "plugin skipped" )?;
//! assert_eq!( context.call( "add", &[ Value::I32( 2 ), Value::I32( 3 )])?, Some( Value::I32( 5 )));
//! # Ok(())
//! # }
//! ```
//!
//! # Threading
//!
//! Every worker thread runs a single-threaded [`Dispatcher`]. Plugin state is confined
//! to the dispatcher of the thread that created it: fetch completions and timer ticks
//! are delivered there. Workers announce their dispatcher with
//! [`PluginRuntime::register_worker`]; their handles are then created lazily on the
//! first request from that thread. The only state shared across threads is the code
//! cache, the base VM table and the compiled programs, which are immutable.
//!
//! # Observability
//!
//! Every transition is counted in a [`StatsHandler`] and logged through `tracing`. The
//! crate never installs a subscriber.

mod acquisition ;
mod backoff ;
mod code_cache ;
mod config ;
mod context ;
mod dispatcher ;
mod engine ;
mod host ;
mod init ;
mod plugin ;
mod runtime ;
mod stats ;
mod vm ;
mod wasmtime_engine ;

pub use acquisition::{ AcquisitionPipeline, Completion, FetchCallback, HttpFetcher, Resolution, UnavailableFetcher };
pub use backoff::{ BackoffStrategy, RandomGenerator, ThreadRandom };
pub use code_cache::{ empty_bytecode, Bytecode, CacheLookup, CodeCache, CodeCacheEntry, CACHING_TTL, NEGATIVE_CACHING_WINDOW };
pub use config::{
	BackoffConfig, CodeSource, ConfigError, FailurePolicy, HttpUri, LocalSource,
	PluginConfig, ReloadConfig, RemoteSource, RetryPolicy, VmConfig,
};
pub use context::{ ContextError, ExecutionContext };
pub use dispatcher::{ Dispatcher, SimulatedDispatcher, Task, Timer, TimerCallback };
pub use engine::{ CompiledProgram, EngineError, Value, VmEngine, VmRuntime };
pub use host::{ Host, HostBuilder, VmCompletion };
pub use init::{ InitManager, InitTarget };
pub use plugin::{ Plugin, PluginHandle };
pub use runtime::{ CreateError, PluginRuntime, SinglePluginHandle };
pub use stats::{ LifecycleStats, StatsHandler, VmEvent };
pub use vm::{ FailState, VmError, VmInstance, VmKey, VmSettings };
pub use vm::{ ON_CONFIGURE, ON_CONTEXT_CREATE, ON_DELETE, ON_TICK, ON_VM_START };
pub use wasmtime_engine::{ WasmtimeEngine, WASMTIME_RUNTIME };
