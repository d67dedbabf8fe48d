//! Counters for every observable transition in the host.
//!
//! Stats are fire-and-forget: recording never fails and never affects control flow.
//! Each counter bump is mirrored as a `trace` event so the same transitions show up
//! in logs when no metrics backend is attached.

use std::sync::atomic::{ AtomicU64, Ordering };



/// An observable transition.
#[derive( Copy, Clone, Debug, Eq, PartialEq, Hash )]
pub enum VmEvent {
	/// A VM was created and is healthy.
	Ok,
	/// No VM could be created.
	UnableToCreateVm,
	/// A per-thread VM could not be cloned from its base.
	UnableToCloneVm,
	/// A required guest entry point is missing.
	MissingFunction,
	/// The code could not be compiled or instantiated.
	UnableToInitializeCode,
	/// The guest rejected or faulted during start.
	StartFailed,
	/// The guest rejected or faulted during plugin configuration.
	ConfigureFailed,
	/// The guest faulted after a successful start.
	RuntimeError,
	/// Remote code was served from the code cache.
	RemoteLoadCacheHit,
	/// A recent remote fetch failure was served from the code cache.
	RemoteLoadCacheNegativeHit,
	/// Remote code was not cached (or its fetch is still in flight).
	RemoteLoadCacheMiss,
	/// A remote fetch succeeded.
	RemoteLoadCacheFetchSuccess,
	/// A remote fetch failed.
	RemoteLoadCacheFetchFailure,
	/// A reload of a faulted VM was suppressed by backoff.
	VmReloadBackoff,
	/// A faulted VM was replaced by a healthy one.
	VmReloadSuccess,
	/// A reload attempt produced another failed VM.
	VmReloadFailure,
}

impl VmEvent {

	/// Number of distinct events.
	pub const COUNT: usize = 16 ;

	/// Every event, in declaration order.
	pub const ALL: [VmEvent; Self::COUNT] = [
		Self::Ok,
		Self::UnableToCreateVm,
		Self::UnableToCloneVm,
		Self::MissingFunction,
		Self::UnableToInitializeCode,
		Self::StartFailed,
		Self::ConfigureFailed,
		Self::RuntimeError,
		Self::RemoteLoadCacheHit,
		Self::RemoteLoadCacheNegativeHit,
		Self::RemoteLoadCacheMiss,
		Self::RemoteLoadCacheFetchSuccess,
		Self::RemoteLoadCacheFetchFailure,
		Self::VmReloadBackoff,
		Self::VmReloadSuccess,
		Self::VmReloadFailure,
	];

	/// The counter name this event is recorded under.
	pub fn stat_name( self ) -> &'static str { match self {
		Self::Ok => "created",
		Self::UnableToCreateVm => "unable_to_create_vm",
		Self::UnableToCloneVm => "unable_to_clone_vm",
		Self::MissingFunction => "missing_function",
		Self::UnableToInitializeCode => "unable_to_initialize_code",
		Self::StartFailed => "start_failed",
		Self::ConfigureFailed => "configure_failed",
		Self::RuntimeError => "runtime_error",
		Self::RemoteLoadCacheHit => "remote_load_cache_hits",
		Self::RemoteLoadCacheNegativeHit => "remote_load_cache_negative_hits",
		Self::RemoteLoadCacheMiss => "remote_load_cache_misses",
		Self::RemoteLoadCacheFetchSuccess => "remote_load_fetch_successes",
		Self::RemoteLoadCacheFetchFailure => "remote_load_fetch_failures",
		Self::VmReloadBackoff => "vm_reload_backoff",
		Self::VmReloadSuccess => "vm_reload_success",
		Self::VmReloadFailure => "vm_reload_failure",
	}}

	#[inline] fn index( self ) -> usize { self as usize }

}

impl std::fmt::Display for VmEvent {
	fn fmt( &self, f: &mut std::fmt::Formatter ) -> std::fmt::Result { write!( f, "{}", self.stat_name() )}
}

/// Counters for one stats scope (the host, or a single plugin).
#[derive( Debug )]
pub struct StatsHandler {
	prefix: String,
	counters: [AtomicU64; VmEvent::COUNT],
	remote_cache_entries: AtomicU64,
}

impl StatsHandler {

	/// Creates a zeroed scope whose counters are reported under `prefix`.
	pub fn new( prefix: impl Into<String> ) -> Self {
		Self {
			prefix: prefix.into(),
			counters: std::array::from_fn(|_| AtomicU64::new( 0 )),
			remote_cache_entries: AtomicU64::new( 0 ),
		}
	}

	/// Records one occurrence of `event`.
	pub fn on_event( &self, event: VmEvent ) {
		let total = self.counters[ event.index() ].fetch_add( 1, Ordering::Relaxed ) + 1 ;
		tracing::trace!( scope = %self.prefix, stat = %event, total, "stat incremented" );
	}

	/// Records the current number of code cache entries.
	pub fn on_remote_cache_entries_changed( &self, entries: usize ) {
		self.remote_cache_entries.store( entries as u64, Ordering::Relaxed );
	}

	/// Current value of the counter for `event`.
	pub fn counter( &self, event: VmEvent ) -> u64 {
		self.counters[ event.index() ].load( Ordering::Relaxed )
	}

	/// Last recorded number of code cache entries.
	pub fn remote_cache_entries( &self ) -> u64 { self.remote_cache_entries.load( Ordering::Relaxed ) }

	/// Prefix counters are reported under.
	#[inline] pub fn prefix( &self ) -> &str { &self.prefix }

	/// All non-zero counters as `( name, value )` pairs, with the scope prefix applied.
	pub fn snapshot( &self ) -> Vec<( String, u64 )> {
		VmEvent::ALL.iter()
			.map(| event | ( format!( "{}{}", self.prefix, event ), self.counter( *event )))
			.filter(|( _, value )| *value > 0 )
			.collect()
	}

}

/// Created/destroyed accounting for every VM of one engine, base and derived alike.
#[derive( Debug )]
pub struct LifecycleStats {
	runtime: String,
	created: AtomicU64,
	destroyed: AtomicU64,
}

impl LifecycleStats {

	/// Creates zeroed accounting for the engine named `runtime`.
	pub fn new( runtime: impl Into<String> ) -> Self {
		Self { runtime: runtime.into(), created: AtomicU64::new( 0 ), destroyed: AtomicU64::new( 0 )}
	}

	/// Records a VM creation and returns the active count.
	pub fn on_vm_created( &self ) -> u64 {
		self.created.fetch_add( 1, Ordering::Relaxed );
		self.active_vm_count()
	}

	/// Records a VM destruction and returns the active count.
	pub fn on_vm_destroyed( &self ) -> u64 {
		self.destroyed.fetch_add( 1, Ordering::Relaxed );
		self.active_vm_count()
	}

	/// VMs created and not yet destroyed.
	pub fn active_vm_count( &self ) -> u64 {
		self.created.load( Ordering::Relaxed ).saturating_sub( self.destroyed.load( Ordering::Relaxed ))
	}

	/// Total VMs ever created.
	pub fn created( &self ) -> u64 { self.created.load( Ordering::Relaxed ) }

	/// Total VMs ever destroyed.
	pub fn destroyed( &self ) -> u64 { self.destroyed.load( Ordering::Relaxed ) }

	/// Name of the engine this accounting belongs to.
	#[inline] pub fn runtime( &self ) -> &str { &self.runtime }

}

#[cfg( test )]
mod tests {

	use super::* ;

	#[test]
	fn event_indices_match_table() {
		for ( index, event ) in VmEvent::ALL.iter().enumerate() {
			assert_eq!( event.index(), index );
		}
	}

	#[test]
	fn snapshot_reports_only_touched_counters() {
		let stats = StatsHandler::new( "wasm.example." );
		stats.on_event( VmEvent::VmReloadBackoff );
		stats.on_event( VmEvent::VmReloadBackoff );
		stats.on_event( VmEvent::VmReloadSuccess );
		assert_eq!( stats.snapshot(), vec![
			( "wasm.example.vm_reload_backoff".to_string(), 2 ),
			( "wasm.example.vm_reload_success".to_string(), 1 ),
		]);
	}

	#[test]
	fn lifecycle_tracks_active_vms() {
		let lifecycle = LifecycleStats::new( "mock" );
		assert_eq!( lifecycle.on_vm_created(), 1 );
		assert_eq!( lifecycle.on_vm_created(), 2 );
		assert_eq!( lifecycle.on_vm_destroyed(), 1 );
		assert_eq!(( lifecycle.created(), lifecycle.destroyed() ), ( 2, 1 ));
	}

}
