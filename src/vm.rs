//! VM instances: a base VM per unique configuration, and per-thread VMs derived from it.
//!
//! A base VM compiles the code once. Derived VMs share that compiled program but get
//! their own execution state, timers and context ids, and belong to the dispatcher of
//! the thread that created them.
//!
//! A VM never throws on construction. Whatever goes wrong is recorded as its
//! [`FailState`], which only ever moves away from [`FailState::Ok`]: a faulted VM is
//! replaced, never repaired.
//!
//! # Guest lifecycle
//!
//! | export                                     | required | when                              |
//! |--------------------------------------------|----------|-----------------------------------|
//! | `on_vm_start( vm_config_size ) -> i32`      | yes      | once per VM, base and derived     |
//! | `on_context_create( context_id, parent_id )`| no       | per root and per request context  |
//! | `on_configure( root_id, config_size ) -> i32`| no      | once per plugin handle            |
//! | `on_tick( root_id )`                        | no       | each time a root context's timer fires |
//! | `on_delete( context_id )`                   | no       | when a request context ends       |
//!
//! A zero result from `on_vm_start` or `on_configure` is a rejection.

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use std::sync::atomic::{ AtomicU8, AtomicU32, Ordering };
use std::time::Duration ;
use pipe_trait::Pipe ;
use sha2::{ Digest, Sha256 };
use thiserror::Error ;

use crate::dispatcher::{ Dispatcher, Timer };
use crate::engine::{ CompiledProgram, EngineError, Value, VmEngine, VmRuntime };
use crate::stats::{ LifecycleStats, VmEvent };



pub const ON_VM_START: &str = "on_vm_start" ;
pub const ON_CONTEXT_CREATE: &str = "on_context_create" ;
pub const ON_CONFIGURE: &str = "on_configure" ;
pub const ON_TICK: &str = "on_tick" ;
pub const ON_DELETE: &str = "on_delete" ;

/// Sharing key for base VMs.
///
/// Two plugins whose VM id, VM configuration and resolved code are identical share one
/// base VM. This is a dedup key, not an identity.
#[derive( Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct VmKey( String );

impl VmKey {

	/// Derives the key from its three components.
	pub fn new( vm_id: &str, configuration: &[u8], code: &[u8] ) -> Self {
		let mut hasher = Sha256::new();
		hasher.update( vm_id.as_bytes() );
		hasher.update([ 0u8 ]);
		hasher.update( configuration );
		hasher.update([ 0u8 ]);
		hasher.update( code );
		hasher.finalize().pipe( hex::encode ).pipe( Self )
	}

	#[inline] pub fn as_str( &self ) -> &str { &self.0 }

}

impl std::fmt::Display for VmKey {
	fn fmt( &self, f: &mut std::fmt::Formatter ) -> std::fmt::Result { write!( f, "{}", self.0 )}
}

/// Why a VM is unusable, or [`Ok`]( FailState::Ok ) if it is not.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
#[repr( u8 )]
pub enum FailState {
	Ok = 0,
	UnableToCreateVm = 1,
	UnableToCloneVm = 2,
	MissingFunction = 3,
	UnableToInitializeCode = 4,
	StartFailed = 5,
	ConfigureFailed = 6,
	RuntimeError = 7,
}

impl FailState {
	fn from_u8( value: u8 ) -> Self { match value {
		0 => Self::Ok,
		1 => Self::UnableToCreateVm,
		2 => Self::UnableToCloneVm,
		3 => Self::MissingFunction,
		4 => Self::UnableToInitializeCode,
		5 => Self::StartFailed,
		6 => Self::ConfigureFailed,
		_ => Self::RuntimeError,
	}}
}

impl From<FailState> for VmEvent {
	fn from( state: FailState ) -> Self { match state {
		FailState::Ok => VmEvent::Ok,
		FailState::UnableToCreateVm => VmEvent::UnableToCreateVm,
		FailState::UnableToCloneVm => VmEvent::UnableToCloneVm,
		FailState::MissingFunction => VmEvent::MissingFunction,
		FailState::UnableToInitializeCode => VmEvent::UnableToInitializeCode,
		FailState::StartFailed => VmEvent::StartFailed,
		FailState::ConfigureFailed => VmEvent::ConfigureFailed,
		FailState::RuntimeError => VmEvent::RuntimeError,
	}}
}

/// Errors from calling into a VM.
#[derive( Error, Debug, Clone, PartialEq )]
pub enum VmError {
	/// Failed to acquire the lock on the VM's execution state.
	#[error( "Lock Rejected" )] LockRejected,
	/// The VM is failed and no longer runs guest code.
	#[error( "VM Failed: {0:?}" )] Failed( FailState ),
	/// The guest does not export the function.
	#[error( "Missing Function: {0}" )] MissingFunction( String ),
	/// The guest trapped.
	#[error( "Runtime Exception: {0}" )] RuntimeException( String ),
	/// The provided arguments don't match the function signature.
	#[error( "Invalid Argument List" )] InvalidArgumentList,
}

impl From<EngineError> for VmError {
	fn from( error: EngineError ) -> Self { match error {
		EngineError::MissingFunction( name ) => Self::MissingFunction( name ),
		EngineError::InvalidArgumentList => Self::InvalidArgumentList,
		EngineError::CompilationFailed( message )
		| EngineError::InstantiationFailed( message )
		| EngineError::RuntimeException( message ) => Self::RuntimeException( message ),
	}}
}

/// Identity and start-up configuration shared by a base VM and everything derived from it.
#[derive( Debug, Clone )]
pub struct VmSettings {
	pub vm_id: String,
	/// Serialised VM configuration; its length is passed to `on_vm_start`.
	pub configuration: Arc<[u8]>,
	pub allow_precompiled: bool,
}

struct TimerSlot {
	period: Duration,
	timer: Option<Box<dyn Timer>>,
}

/// One VM, base or derived.
pub struct VmInstance {
	settings: VmSettings,
	key: VmKey,
	engine_name: String,
	is_base: bool,
	program: Option<Arc<dyn CompiledProgram>>,
	runtime: Mutex<Option<Box<dyn VmRuntime>>>,
	fail_state: AtomicU8,
	dispatcher: Arc<dyn Dispatcher>,
	lifecycle: Arc<LifecycleStats>,
	timers: Mutex<HashMap<u32, TimerSlot>>,
	next_context_id: AtomicU32,
	weak_self: Weak<VmInstance>,
}

fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else( PoisonError::into_inner )
}

/// Guest ids are `u32` on the host side and `i32` on the wire.
#[allow( clippy::cast_possible_wrap )]
pub(crate) fn guest_id( id: u32 ) -> Value { Value::I32( id as i32 )}

#[allow( clippy::cast_possible_wrap, clippy::cast_possible_truncation )]
fn guest_size( size: usize ) -> Value { Value::I32( size.min( i32::MAX as usize ) as i32 )}

impl VmInstance {

	/// Compiles `code` into a new base VM and starts it.
	///
	/// Always returns a VM; check [`fail_state`]( Self::fail_state ) to see if it is usable.
	pub fn create_base(
		engine: &dyn VmEngine,
		settings: VmSettings,
		code: &[u8],
		dispatcher: Arc<dyn Dispatcher>,
		lifecycle: Arc<LifecycleStats>,
	) -> Arc<Self> {

		let key = VmKey::new( &settings.vm_id, &settings.configuration, code );
		let ( program, runtime, fail_state ) = match code.is_empty() {
			true => ( None, None, FailState::UnableToCreateVm ),
			false => match engine.compile( code, settings.allow_precompiled ) {
				Err( err ) => {
					tracing::warn!( vm_id = %settings.vm_id, error = %err, "unable to compile plugin code" );
					( None, None, FailState::UnableToInitializeCode )
				},
				Ok( program ) => match program.instantiate() {
					Ok( runtime ) => ( Some( program ), Some( runtime ), FailState::Ok ),
					Err( err ) => {
						tracing::warn!( vm_id = %settings.vm_id, error = %err, "unable to instantiate plugin code" );
						( Some( program ), None, FailState::UnableToInitializeCode )
					},
				},
			},
		};

		let vm = Self::assemble( settings, key, engine.name().to_string(), true, program, runtime, fail_state, dispatcher, lifecycle );
		vm.start();
		vm

	}

	/// Creates a VM for the thread owning `dispatcher`, sharing `base`'s compiled program.
	///
	/// Always returns a VM; a failed clone is [`FailState::UnableToCloneVm`].
	pub fn derive( base: &Arc<Self>, dispatcher: Arc<dyn Dispatcher> ) -> Arc<Self> {

		let ( runtime, fail_state ) = match ( &base.program, base.fail_state() ) {
			( Some( program ), FailState::Ok ) => match program.instantiate() {
				Ok( runtime ) => ( Some( runtime ), FailState::Ok ),
				Err( err ) => {
					tracing::warn!( vm_id = %base.settings.vm_id, error = %err, "unable to clone vm" );
					( None, FailState::UnableToCloneVm )
				},
			},
			_ => ( None, FailState::UnableToCloneVm ),
		};

		let vm = Self::assemble(
			base.settings.clone(),
			base.key.clone(),
			base.engine_name.clone(),
			false,
			base.program.clone(),
			runtime,
			fail_state,
			dispatcher,
			Arc::clone( &base.lifecycle ),
		);
		vm.start();
		vm

	}

	#[allow( clippy::too_many_arguments )]
	fn assemble(
		settings: VmSettings,
		key: VmKey,
		engine_name: String,
		is_base: bool,
		program: Option<Arc<dyn CompiledProgram>>,
		runtime: Option<Box<dyn VmRuntime>>,
		fail_state: FailState,
		dispatcher: Arc<dyn Dispatcher>,
		lifecycle: Arc<LifecycleStats>,
	) -> Arc<Self> {
		let active = lifecycle.on_vm_created();
		tracing::debug!( vm_id = %settings.vm_id, runtime = %engine_name, is_base, active, "vm created" );
		Arc::new_cyclic(| weak_self | Self {
			settings,
			key,
			engine_name,
			is_base,
			program,
			runtime: Mutex::new( runtime ),
			fail_state: AtomicU8::new( fail_state as u8 ),
			dispatcher,
			lifecycle,
			timers: Mutex::new( HashMap::new() ),
			next_context_id: AtomicU32::new( 1 ),
			weak_self: weak_self.clone(),
		})
	}

	fn start( &self ) {
		if self.is_failed() { return }
		if !self.has_function( ON_VM_START ) {
			self.fail( FailState::MissingFunction );
			return
		}
		let size = guest_size( self.settings.configuration.len() );
		match self.invoke( ON_VM_START, &[ size ]) {
			Ok( Some( Value::I32( accepted ))) if accepted != 0 => {},
			Ok( result ) => {
				tracing::warn!( vm_id = %self.settings.vm_id, ?result, "on_vm_start rejected the vm" );
				self.fail( FailState::StartFailed );
			},
			Err( err ) => {
				tracing::warn!( vm_id = %self.settings.vm_id, error = %err, "on_vm_start failed" );
				self.fail( FailState::StartFailed );
			},
		}
	}

	/// Creates the root context `root_context_id` and hands it the plugin configuration.
	///
	/// # Errors
	/// The VM is already failed, or the guest rejected the configuration, in which case
	/// the VM is now [`FailState::ConfigureFailed`].
	pub fn configure( &self, root_context_id: u32, plugin_configuration: &[u8] ) -> Result<(), VmError> {
		if let Some( state ) = self.failure() { return Err( VmError::Failed( state )) }

		if self.has_function( ON_CONTEXT_CREATE ) {
			if let Err( err ) = self.invoke( ON_CONTEXT_CREATE, &[ guest_id( root_context_id ), guest_id( 0 )]) {
				self.fail( FailState::ConfigureFailed );
				return Err( err )
			}
		}

		if !self.has_function( ON_CONFIGURE ) { return Ok(()) }
		match self.invoke( ON_CONFIGURE, &[ guest_id( root_context_id ), guest_size( plugin_configuration.len() )]) {
			Ok( Some( Value::I32( accepted ))) if accepted != 0 => Ok(()),
			Ok( _ ) => {
				self.fail( FailState::ConfigureFailed );
				Err( VmError::Failed( FailState::ConfigureFailed ))
			},
			Err( err ) => {
				self.fail( FailState::ConfigureFailed );
				Err( err )
			},
		}
	}

	/// Calls an exported guest function.
	///
	/// A trap marks the VM [`FailState::RuntimeError`].
	///
	/// # Errors
	/// The VM is failed, the function is missing, or the guest trapped.
	pub fn call( &self, name: &str, args: &[Value] ) -> Result<Option<Value>, VmError> {
		let result = self.invoke( name, args );
		if let Err( VmError::RuntimeException( message )) = &result {
			tracing::warn!( vm_id = %self.settings.vm_id, function = name, error = %message, "guest runtime error" );
			self.fail( FailState::RuntimeError );
		}
		result
	}

	fn invoke( &self, name: &str, args: &[Value] ) -> Result<Option<Value>, VmError> {
		if let Some( state ) = self.failure() { return Err( VmError::Failed( state )) }
		let mut runtime = self.runtime.lock().map_err(|_| VmError::LockRejected )?;
		let Some( runtime ) = runtime.as_mut() else { return Err( VmError::Failed( self.fail_state() )) };
		runtime.call( name, args ).map_err( VmError::from )
	}

	/// Whether the guest exports `name`.
	pub fn has_function( &self, name: &str ) -> bool {
		lock( &self.runtime ).as_ref().is_some_and(| runtime | runtime.has_function( name ))
	}

	/// Sets the tick period of root context `root_context_id`. Zero stops its timer.
	///
	/// Ticks run on this VM's dispatcher and re-arm themselves after every tick, unless
	/// the period was set to zero in the meantime.
	pub fn set_timer( &self, root_context_id: u32, period: Duration ) {
		let mut timers = lock( &self.timers );
		let slot = timers.entry( root_context_id ).or_insert_with(|| TimerSlot { period: Duration::ZERO, timer: None });
		let was_running = slot.timer.is_some() && !slot.period.is_zero();
		slot.period = period ;
		if was_running {
			if let Some( timer ) = slot.timer.as_mut() { timer.disable(); }
		}
		if period.is_zero() { return }

		let weak = Weak::clone( &self.weak_self );
		let mut timer = self.dispatcher.create_timer( Box::new( move || {
			if let Some( vm ) = weak.upgrade() { vm.tick( root_context_id ); }
		}));
		timer.enable( period );
		slot.timer = Some( timer );
	}

	/// Delivers one tick to root context `root_context_id` and re-arms its timer.
	///
	/// A failed VM is not re-armed.
	pub fn tick( &self, root_context_id: u32 ) {
		let has_timer = lock( &self.timers ).get( &root_context_id ).is_some_and(| slot | slot.timer.is_some() );
		if !has_timer || !self.has_function( ON_TICK ) || self.is_failed() { return }

		if let Err( err ) = self.call( ON_TICK, &[ guest_id( root_context_id )]) {
			tracing::debug!( vm_id = %self.settings.vm_id, root_context_id, error = %err, "tick failed" );
		}
		if self.is_failed() { return }

		let mut timers = lock( &self.timers );
		if let Some( TimerSlot { period, timer: Some( timer )}) = timers.get_mut( &root_context_id ) {
			if !period.is_zero() { timer.enable( *period ); }
		}
	}

	/// Current tick period of a root context, if one was ever set.
	pub fn timer_period( &self, root_context_id: u32 ) -> Option<Duration> {
		lock( &self.timers ).get( &root_context_id ).map(| slot | slot.period )
	}

	/// Hands out a fresh context id, unique within this VM.
	pub fn allocate_context_id( &self ) -> u32 { self.next_context_id.fetch_add( 1, Ordering::Relaxed )}

	/// Marks the VM failed. Only the first failure is kept.
	pub fn fail( &self, state: FailState ) {
		if state == FailState::Ok { return }
		let updated = self.fail_state
			.compare_exchange( FailState::Ok as u8, state as u8, Ordering::AcqRel, Ordering::Acquire )
			.is_ok();
		if updated {
			tracing::warn!( vm_id = %self.settings.vm_id, is_base = self.is_base, ?state, "vm failed" );
		}
	}

	#[inline] pub fn fail_state( &self ) -> FailState { FailState::from_u8( self.fail_state.load( Ordering::Acquire ))}
	#[inline] pub fn is_failed( &self ) -> bool { self.fail_state() != FailState::Ok }
	#[inline] pub fn is_base( &self ) -> bool { self.is_base }
	#[inline] pub fn key( &self ) -> &VmKey { &self.key }
	#[inline] pub fn vm_id( &self ) -> &str { &self.settings.vm_id }
	#[inline] pub fn engine_name( &self ) -> &str { &self.engine_name }
	#[inline] pub fn dispatcher( &self ) -> &Arc<dyn Dispatcher> { &self.dispatcher }

	fn failure( &self ) -> Option<FailState> { match self.fail_state() {
		FailState::Ok => None,
		state => Some( state ),
	}}

	/// Whether this VM and `other` run the same compiled program.
	pub fn shares_program_with( &self, other: &Self ) -> bool {
		match ( &self.program, &other.program ) {
			( Some( mine ), Some( theirs )) => Arc::as_ptr( mine ).cast::<()>() == Arc::as_ptr( theirs ).cast::<()>(),
			_ => false,
		}
	}

}

impl Drop for VmInstance {
	fn drop( &mut self ) {
		let active = self.lifecycle.on_vm_destroyed();
		tracing::debug!( vm_id = %self.settings.vm_id, runtime = %self.engine_name, is_base = self.is_base, active, "vm destroyed" );
	}
}

impl std::fmt::Debug for VmInstance {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "VmInstance" )
			.field( "vm_id", &self.settings.vm_id )
			.field( "key", &self.key )
			.field( "engine", &self.engine_name )
			.field( "is_base", &self.is_base )
			.field( "fail_state", &self.fail_state() )
			.finish_non_exhaustive()
	}
}
