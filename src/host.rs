//! The process-wide bootstrap.
//!
//! A [`Host`] owns everything plugins share across threads: the registered engines and
//! their lifecycle accounting, the code cache and the acquisition pipeline in front of
//! it, and the table of live base VMs used to share one base between plugins with the
//! same [`VmKey`]. Nothing in the crate is global; independent hosts are independent.

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use itertools::Itertools ;

use crate::acquisition::{ AcquisitionPipeline, HttpFetcher, Resolution, UnavailableFetcher };
use crate::backoff::{ RandomGenerator, ThreadRandom };
use crate::code_cache::{ Bytecode, CodeCache };
use crate::config::ConfigError ;
use crate::dispatcher::Dispatcher ;
use crate::engine::VmEngine ;
use crate::init::InitManager ;
use crate::plugin::Plugin ;
use crate::stats::{ LifecycleStats, StatsHandler };
use crate::vm::{ VmInstance, VmKey };
use crate::wasmtime_engine::WasmtimeEngine ;



/// Receives the base VM for a plugin, or `None` if no usable VM could be created.
pub type VmCompletion = Box<dyn FnOnce( Option<Arc<VmInstance>> ) + Send>;

struct EngineSlot {
	engine: Arc<dyn VmEngine>,
	lifecycle: Arc<LifecycleStats>,
}

/// Shared state for every plugin in the process.
pub struct Host {
	engines: HashMap<String, EngineSlot>,
	pipeline: Arc<AcquisitionPipeline>,
	base_vms: Mutex<HashMap<VmKey, Weak<VmInstance>>>,
	stats: Arc<StatsHandler>,
	random: Arc<dyn RandomGenerator>,
}

/// Builds a [`Host`].
#[derive( Default )]
#[must_use = "call .build() to create the Host"]
pub struct HostBuilder {
	engines: Vec<Arc<dyn VmEngine>>,
	code_cache: Option<Arc<CodeCache>>,
	fetcher: Option<Arc<dyn HttpFetcher>>,
	random: Option<Arc<dyn RandomGenerator>>,
}

impl HostBuilder {

	/// Registers an engine under its [`name`]( VmEngine::name ). A later engine with the
	/// same name replaces an earlier one.
	pub fn with_engine( mut self, engine: Arc<dyn VmEngine> ) -> Self {
		self.engines.push( engine );
		self
	}

	/// Shares an existing code cache instead of creating a new one.
	pub fn with_code_cache( mut self, code_cache: Arc<CodeCache> ) -> Self {
		self.code_cache = Some( code_cache );
		self
	}

	/// Sets the fetcher for remote code. Without one, every remote fetch fails.
	pub fn with_fetcher( mut self, fetcher: Arc<dyn HttpFetcher> ) -> Self {
		self.fetcher = Some( fetcher );
		self
	}

	/// Sets the randomness used for backoff jitter.
	pub fn with_random( mut self, random: Arc<dyn RandomGenerator> ) -> Self {
		self.random = Some( random );
		self
	}

	pub fn build( self ) -> Arc<Host> {
		let stats = Arc::new( StatsHandler::new( "wasm." ));
		let random = self.random.unwrap_or_else(|| Arc::new( ThreadRandom ));
		let pipeline = AcquisitionPipeline::new(
			self.code_cache.unwrap_or_default(),
			self.fetcher.unwrap_or_else(|| Arc::new( UnavailableFetcher )),
			Arc::clone( &stats ),
			Arc::clone( &random ),
		);
		let engines = self.engines.into_iter()
			.map(| engine | ( engine.name().to_string(), EngineSlot {
				lifecycle: Arc::new( LifecycleStats::new( engine.name() )),
				engine,
			}))
			.collect();
		Arc::new( Host { engines, pipeline, base_vms: Mutex::new( HashMap::new() ), stats, random })
	}

}

impl Host {

	pub fn builder() -> HostBuilder { HostBuilder::default() }

	/// A host running wasmtime, without remote fetch.
	pub fn new() -> Arc<Self> { Self::builder().with_engine( Arc::new( WasmtimeEngine::new() )).build() }

	fn lock_base_vms( &self ) -> MutexGuard<'_, HashMap<VmKey, Weak<VmInstance>>> {
		self.base_vms.lock().unwrap_or_else( PoisonError::into_inner )
	}

	/// Checks that `plugin` names a registered engine.
	///
	/// # Errors
	/// [`ConfigError::UnknownRuntime`] listing the engines that are registered.
	pub fn check_runtime( &self, plugin: &Plugin ) -> Result<(), ConfigError> {
		let runtime = &plugin.vm_config().runtime ;
		match self.engines.contains_key( runtime ) {
			true => Ok(()),
			false => Err( ConfigError::UnknownRuntime( format!(
				"{} (registered: {})", runtime, self.engines.keys().sorted().join( ", " ),
			))),
		}
	}

	/// Resolves `plugin`'s code and creates its base VM, calling `completion` exactly once.
	///
	/// Returns `Ok( false )` when the code was not cached and the plugin asked not to
	/// wait for it; `completion` has then already been called with `None`.
	///
	/// # Errors
	/// [`ConfigError::UnknownRuntime`] if the plugin's engine is not registered, in which
	/// case `completion` is never called.
	pub fn create_vm(
		self: &Arc<Self>,
		plugin: &Arc<Plugin>,
		dispatcher: &Arc<dyn Dispatcher>,
		init_manager: Option<&InitManager>,
		completion: VmCompletion,
	) -> Result<bool, ConfigError> {
		self.check_runtime( plugin )?;
		let host = Arc::downgrade( self );
		let target = Arc::clone( plugin );
		let vm_dispatcher = Arc::clone( dispatcher );
		let resolution = self.pipeline.resolve( plugin.vm_config(), dispatcher, init_manager, Box::new( move | code | {
			let vm = host.upgrade().and_then(| host | host.complete_vm( &target, &code, vm_dispatcher ));
			completion( vm );
		}));
		Ok( resolution != Resolution::Rejected )
	}

	fn complete_vm( &self, plugin: &Plugin, code: &Bytecode, dispatcher: Arc<dyn Dispatcher> ) -> Option<Arc<VmInstance>> {

		if code.is_empty() {
			tracing::warn!( plugin = plugin.name(), "unable to create vm: no code" );
			return None
		}
		let slot = self.engines.get( &plugin.vm_config().runtime )?;
		let settings = plugin.vm_settings();
		let key = VmKey::new( &settings.vm_id, &settings.configuration, code );

		let vm = {
			let mut base_vms = self.lock_base_vms();
			base_vms.retain(|_, vm | vm.strong_count() > 0 );
			match base_vms.get( &key ).and_then( Weak::upgrade ).filter(| vm | !vm.is_failed() ) {
				Some( vm ) => {
					tracing::debug!( plugin = plugin.name(), key = %key, "reusing base vm" );
					vm
				},
				None => {
					let vm = VmInstance::create_base( slot.engine.as_ref(), settings.clone(), code, dispatcher, Arc::clone( &slot.lifecycle ));
					if !vm.is_failed() { base_vms.insert( key, Arc::downgrade( &vm )); }
					vm
				},
			}
		};

		self.stats.on_event( vm.fail_state().into() );
		match vm.is_failed() {
			true => {
				tracing::trace!( plugin = plugin.name(), fail_state = ?vm.fail_state(), "unable to create vm" );
				None
			},
			false => Some( vm ),
		}

	}

	/// Host-wide counters.
	#[inline] pub fn stats( &self ) -> &Arc<StatsHandler> { &self.stats }

	/// Created/destroyed accounting of the engine named `runtime`.
	pub fn lifecycle( &self, runtime: &str ) -> Option<&Arc<LifecycleStats>> {
		self.engines.get( runtime ).map(| slot | &slot.lifecycle )
	}

	#[inline] pub fn pipeline( &self ) -> &Arc<AcquisitionPipeline> { &self.pipeline }
	#[inline] pub fn code_cache( &self ) -> &Arc<CodeCache> { self.pipeline.code_cache() }
	#[inline] pub fn random( &self ) -> &Arc<dyn RandomGenerator> { &self.random }

	/// Number of base VMs currently alive and shareable.
	pub fn base_vm_count( &self ) -> usize {
		self.lock_base_vms().values().filter(| vm | vm.strong_count() > 0 ).count()
	}

}

impl std::fmt::Debug for Host {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "Host" )
			.field( "engines", &self.engines.keys().sorted().collect::<Vec<_>>() )
			.field( "pipeline", &self.pipeline )
			.field( "base_vms", &self.base_vm_count() )
			.finish_non_exhaustive()
	}
}
