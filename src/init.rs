//! Readiness gating for work that must finish before the host is considered ready.
//!
//! A blocking remote fetch registers an [`InitTarget`]; the [`InitManager`] reports
//! ready once every target it handed out has been released.

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };



type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Tracks outstanding initialisation targets.
#[derive( Clone, Default )]
pub struct InitManager {
	state: Arc<Mutex<InitState>>,
}

#[derive( Default )]
struct InitState {
	pending: HashMap<u64, String>,
	next_id: u64,
	watchers: Vec<ReadyCallback>,
}

fn lock_state( state: &Mutex<InitState> ) -> MutexGuard<'_, InitState> {
	state.lock().unwrap_or_else( PoisonError::into_inner )
}

impl InitManager {

	/// Creates a manager with no outstanding targets.
	pub fn new() -> Self { Self::default() }

	/// Registers a new outstanding target. Readiness waits until it is released.
	pub fn add_target( &self, name: impl Into<String> ) -> InitTarget {
		let name = name.into();
		let mut state = lock_state( &self.state );
		let id = state.next_id ;
		state.next_id += 1 ;
		tracing::debug!( target_name = %name, "init target added" );
		state.pending.insert( id, name );
		InitTarget { id, state: Arc::downgrade( &self.state )}
	}

	/// Whether every target handed out so far has been released.
	pub fn is_ready( &self ) -> bool { lock_state( &self.state ).pending.is_empty() }

	/// Names of the targets still outstanding.
	pub fn pending_targets( &self ) -> Vec<String> {
		let mut names = lock_state( &self.state ).pending.values().cloned().collect::<Vec<_>>();
		names.sort();
		names
	}

	/// Runs `callback` once no targets are outstanding, immediately if that is already the case.
	pub fn when_ready( &self, callback: impl FnOnce() + Send + 'static ) {
		let mut state = lock_state( &self.state );
		match state.pending.is_empty() {
			true => { drop( state ); callback() },
			false => state.watchers.push( Box::new( callback )),
		}
	}

}

impl std::fmt::Debug for InitManager {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "InitManager" )
			.field( "pending", &self.pending_targets() )
			.finish_non_exhaustive()
	}
}

/// An outstanding initialisation target. Released by [`ready`]( Self::ready ) or by drop.
#[must_use = "dropping an InitTarget releases it immediately"]
#[derive( Debug )]
pub struct InitTarget {
	id: u64,
	state: Weak<Mutex<InitState>>,
}

impl InitTarget {
	/// Releases the target.
	pub fn ready( self ) {}
}

impl Drop for InitTarget {
	fn drop( &mut self ) {
		let Some( state ) = self.state.upgrade() else { return };
		let watchers = {
			let mut state = lock_state( &state );
			if let Some( name ) = state.pending.remove( &self.id ) {
				tracing::debug!( target_name = %name, "init target ready" );
			}
			match state.pending.is_empty() {
				true => std::mem::take( &mut state.watchers ),
				false => Vec::with_capacity( 0 ),
			}
		};
		watchers.into_iter().for_each(| watcher | watcher() );
	}
}

#[cfg( test )]
mod tests {

	use super::* ;
	use std::sync::atomic::{ AtomicBool, Ordering };

	#[test]
	fn ready_after_all_targets_release() {
		let manager = InitManager::new();
		let fired = Arc::new( AtomicBool::new( false ));
		let first = manager.add_target( "first" );
		let second = manager.add_target( "second" );

		let flag = Arc::clone( &fired );
		manager.when_ready( move || flag.store( true, Ordering::SeqCst ));
		assert_eq!( manager.pending_targets(), vec![ "first".to_string(), "second".to_string() ]);

		first.ready();
		assert!( !manager.is_ready() );
		assert!( !fired.load( Ordering::SeqCst ));

		drop( second );
		assert!( manager.is_ready() );
		assert!( fired.load( Ordering::SeqCst ));
	}

	#[test]
	fn when_ready_runs_immediately_without_targets() {
		let manager = InitManager::new();
		let fired = Arc::new( AtomicBool::new( false ));
		let flag = Arc::clone( &fired );
		manager.when_ready( move || flag.store( true, Ordering::SeqCst ));
		assert!( fired.load( Ordering::SeqCst ));
	}

}
