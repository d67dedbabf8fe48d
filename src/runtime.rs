//! The top-level owner of a configured plugin.
//!
//! A [`PluginRuntime`] holds the plugin's base VM and a registry of [`PluginHandle`]s:
//! either one handle shared by every thread, or one per worker thread created lazily on
//! that thread's first request. Every request for an [`ExecutionContext`] runs the
//! failure-policy state machine:
//!
//! - no handle: the plugin never loaded;
//! - a handle whose VM is healthy or failed for any reason other than a runtime fault is
//!   used as is, since only runtime faults are transient;
//! - under `FAIL_RELOAD`, a handle whose VM faulted at runtime is replaced with a freshly
//!   derived one, at most once per backoff interval.
//!
//! What a failed or absent handle turns into is decided by the failure policy: no
//! context at all for `FAIL_OPEN`, a denying context otherwise.

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard };
use std::thread::{ self, ThreadId };
use std::time::{ Duration, Instant };
use thiserror::Error ;

use crate::backoff::BackoffStrategy ;
use crate::config::{ ConfigError, FailurePolicy, PluginConfig };
use crate::context::ExecutionContext ;
use crate::dispatcher::Dispatcher ;
use crate::host::Host ;
use crate::init::InitManager ;
use crate::plugin::{ Plugin, PluginHandle };
use crate::stats::{ StatsHandler, VmEvent };
use crate::vm::{ FailState, VmInstance };



/// Errors creating a [`PluginRuntime`].
#[derive( Error, Debug, Clone, PartialEq )]
pub enum CreateError {
	/// The configuration was rejected.
	#[error( "Configuration Error: {0}" )] Config( #[from] ConfigError ),
	/// Remote code was not cached and the plugin asked not to wait for it.
	#[error( "Code Unavailable: {0}" )] Unavailable( String ),
}

/// One binding slot: the current handle and when it was last (re)loaded.
pub struct SinglePluginHandle {
	handle: Option<Arc<PluginHandle>>,
	last_load: Instant,
	backoff: Option<BackoffStrategy>,
	dispatcher: Arc<dyn Dispatcher>,
}

impl SinglePluginHandle {
	/// The bound handle; `None` if the plugin never loaded.
	#[inline] pub fn handle( &self ) -> Option<&Arc<PluginHandle>> { self.handle.as_ref() }
	/// Time of the last load or reload attempt.
	#[inline] pub fn last_load( &self ) -> Instant { self.last_load }
}

impl std::fmt::Debug for SinglePluginHandle {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "SinglePluginHandle" )
			.field( "handle", &self.handle )
			.field( "last_load", &self.last_load )
			.field( "backoff", &self.backoff )
			.finish_non_exhaustive()
	}
}

type Slot = Arc<Mutex<SinglePluginHandle>>;

/// Where a runtime keeps its handles. Chosen once, when the base VM resolves.
enum PluginHandleRegistry {
	Unset,
	Singleton( Slot ),
	ThreadLocal( Mutex<HashMap<ThreadId, Slot>> ),
}

fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else( PoisonError::into_inner )
}

/// A configured plugin and all of its handles.
pub struct PluginRuntime {
	host: Arc<Host>,
	plugin: Arc<Plugin>,
	stats: StatsHandler,
	main_dispatcher: Arc<dyn Dispatcher>,
	base_vm: OnceLock<Option<Arc<VmInstance>>>,
	registry: RwLock<PluginHandleRegistry>,
	workers: Mutex<HashMap<ThreadId, Arc<dyn Dispatcher>>>,
}

impl PluginRuntime {

	/// Validates `config` and starts loading the plugin on `main_dispatcher`.
	///
	/// Local code loads before this returns. Remote code loads in the background; if
	/// `init_manager` is given, it does not report ready until loading finished.
	///
	/// # Errors
	/// [`CreateError::Config`] for an invalid configuration, [`CreateError::Unavailable`]
	/// when remote code is not cached and `nack_on_code_cache_miss` is set.
	pub fn new(
		host: &Arc<Host>,
		config: PluginConfig,
		main_dispatcher: Arc<dyn Dispatcher>,
		init_manager: Option<&InitManager>,
	) -> Result<Arc<Self>, CreateError> {

		let plugin = Arc::new( Plugin::new( config )?);
		host.check_runtime( &plugin )?;

		let runtime = Arc::new( Self {
			host: Arc::clone( host ),
			stats: StatsHandler::new( format!( "wasm.{}.", plugin.name() )),
			plugin: Arc::clone( &plugin ),
			main_dispatcher: Arc::clone( &main_dispatcher ),
			base_vm: OnceLock::new(),
			registry: RwLock::new( PluginHandleRegistry::Unset ),
			workers: Mutex::new( HashMap::new() ),
		});

		let weak = Arc::downgrade( &runtime );
		let accepted = host.create_vm( &plugin, &main_dispatcher, init_manager, Box::new( move | vm | {
			if let Some( runtime ) = weak.upgrade() { runtime.install( vm ); }
		}))?;

		match accepted {
			true => Ok( runtime ),
			false => Err( CreateError::Unavailable( format!( "code for plugin {} is not cached yet", plugin.name() ))),
		}

	}

	fn install( &self, vm: Option<Arc<VmInstance>> ) {
		if self.base_vm.set( vm.clone() ).is_err() { return }

		if vm.is_none() && !self.plugin.failure_policy().is_fail_open() {
			tracing::error!( plugin = self.plugin.name(), "plugin configured to fail closed failed to load" );
		}

		let registry = match self.plugin.is_singleton() {
			true => PluginHandleRegistry::Singleton( Arc::new( Mutex::new( self.new_slot( Arc::clone( &self.main_dispatcher ))))),
			false => PluginHandleRegistry::ThreadLocal( Mutex::new( HashMap::new() )),
		};
		*self.registry.write().unwrap_or_else( PoisonError::into_inner ) = registry ;
	}

	fn new_slot( &self, dispatcher: Arc<dyn Dispatcher> ) -> SinglePluginHandle {
		let handle = self.base_vm().map(| base | {
			let handle = PluginHandle::create( &base, Arc::clone( &self.plugin ), Arc::clone( &dispatcher ));
			self.stats.on_event( handle.fail_state().into() );
			handle
		});
		let backoff = match self.plugin.failure_policy() {
			FailurePolicy::FailReload => {
				let config = self.plugin.config().reload_backoff();
				Some( BackoffStrategy::new( config.base_interval_ms, config.max_interval_ms(), Arc::clone( self.host.random() )))
			},
			FailurePolicy::FailOpen | FailurePolicy::FailClosed => None,
		};
		SinglePluginHandle { handle, last_load: dispatcher.monotonic_time(), backoff, dispatcher }
	}

	/// Declares the calling thread a worker whose plugin state lives on `dispatcher`.
	///
	/// Threads that never register share the main dispatcher.
	pub fn register_worker( &self, dispatcher: Arc<dyn Dispatcher> ) {
		lock( &self.workers ).insert( thread::current().id(), dispatcher );
	}

	fn read_registry( &self ) -> RwLockReadGuard<'_, PluginHandleRegistry> {
		self.registry.read().unwrap_or_else( PoisonError::into_inner )
	}

	/// The calling thread's slot, created on first use. `None` until the plugin resolved.
	fn current_slot( &self ) -> Option<Slot> {
		let registry = self.read_registry();
		match &*registry {
			PluginHandleRegistry::Unset => None,
			PluginHandleRegistry::Singleton( slot ) => Some( Arc::clone( slot )),
			PluginHandleRegistry::ThreadLocal( slots ) => {
				let thread = thread::current().id();
				if let Some( slot ) = lock( slots ).get( &thread ) { return Some( Arc::clone( slot )) }
				let dispatcher = lock( &self.workers ).get( &thread ).cloned()
					.unwrap_or_else(|| Arc::clone( &self.main_dispatcher ));
				let slot = Arc::new( Mutex::new( self.new_slot( dispatcher )));
				let slot = Arc::clone( lock( slots ).entry( thread ).or_insert( slot ));
				Some( slot )
			},
		}
	}

	/// Creates an execution context for a request on the calling thread.
	///
	/// `None` means the plugin must be skipped. A denying context means the request must
	/// be rejected.
	pub fn create_context( &self ) -> Option<ExecutionContext> {
		let handle = self.current_slot().and_then(| slot | self.maybe_reload( &slot ));
		let fail_open = self.plugin.failure_policy().is_fail_open();
		match handle {
			Some( handle ) if !handle.is_failed() => Some( ExecutionContext::new( handle )),
			_ if fail_open => None,
			handle => Some( ExecutionContext::deny( handle )),
		}
	}

	/// Returns the slot's handle, replacing it first if it faulted at runtime, the policy
	/// is `FAIL_RELOAD` and the backoff interval since the last attempt has elapsed.
	fn maybe_reload( &self, slot: &Mutex<SinglePluginHandle> ) -> Option<Arc<PluginHandle>> {

		let mut slot = lock( slot );
		let handle = Arc::clone( slot.handle.as_ref()? );
		if handle.fail_state() != FailState::RuntimeError || self.plugin.failure_policy() != FailurePolicy::FailReload {
			return Some( handle )
		}

		let now = slot.dispatcher.monotonic_time();
		let elapsed = now.saturating_duration_since( slot.last_load );
		let SinglePluginHandle { backoff: Some( backoff ), .. } = &mut *slot else { return Some( handle ) };
		let interval = Duration::from_millis( backoff.current_interval_ms() );
		if elapsed < interval {
			self.stats.on_event( VmEvent::VmReloadBackoff );
			tracing::debug!( plugin = self.plugin.name(), ?elapsed, ?interval, "vm reload suppressed by backoff" );
			return Some( handle )
		}
		backoff.next_backoff_ms();
		slot.last_load = now ;

		let Some( base ) = self.base_vm() else { return Some( handle ) };
		let fresh = PluginHandle::create( &base, Arc::clone( &self.plugin ), Arc::clone( &slot.dispatcher ));
		match fresh.is_failed() {
			false => {
				self.stats.on_event( VmEvent::VmReloadSuccess );
				tracing::debug!( plugin = self.plugin.name(), "vm reloaded" );
				if let Some( backoff ) = slot.backoff.as_mut() { backoff.reset(); }
				slot.handle = Some( Arc::clone( &fresh ));
				Some( fresh )
			},
			true => {
				self.stats.on_event( VmEvent::VmReloadFailure );
				tracing::warn!( plugin = self.plugin.name(), fail_state = ?fresh.fail_state(), "vm reload failed" );
				Some( handle )
			},
		}

	}

	/// The calling thread's current handle, without running the reload state machine.
	pub fn handle_snapshot( &self ) -> Option<Arc<PluginHandle>> {
		self.current_slot().and_then(| slot | lock( &slot ).handle.clone() )
	}

	/// The calling thread's last load or reload attempt.
	pub fn last_load( &self ) -> Option<Instant> {
		self.current_slot().map(| slot | lock( &slot ).last_load )
	}

	/// The base VM, once resolved and only if it is usable.
	pub fn base_vm( &self ) -> Option<Arc<VmInstance>> { self.base_vm.get().cloned().flatten() }

	/// Whether code resolution has finished, successfully or not.
	pub fn is_loaded( &self ) -> bool { self.base_vm.get().is_some() }

	#[inline] pub fn plugin( &self ) -> &Arc<Plugin> { &self.plugin }
	#[inline] pub fn failure_policy( &self ) -> FailurePolicy { self.plugin.failure_policy() }

	/// Per-plugin counters, reported under `wasm.<plugin name>.`.
	#[inline] pub fn stats( &self ) -> &StatsHandler { &self.stats }

}

impl std::fmt::Debug for PluginRuntime {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		let registry = match &*self.read_registry() {
			PluginHandleRegistry::Unset => "unset",
			PluginHandleRegistry::Singleton( _ ) => "singleton",
			PluginHandleRegistry::ThreadLocal( _ ) => "thread-local",
		};
		f.debug_struct( "PluginRuntime" )
			.field( "plugin", &self.plugin.name() )
			.field( "failure_policy", &self.plugin.failure_policy() )
			.field( "registry", &registry )
			.field( "base_vm", &self.base_vm() )
			.finish_non_exhaustive()
	}
}
