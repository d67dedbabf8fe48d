//! Event-loop contract the host runs on.
//!
//! Every worker thread owns a single-threaded cooperative [`Dispatcher`]. VM callbacks,
//! timer ticks and fetch completions are always delivered through the dispatcher of
//! the thread that owns the state they touch, so nothing outside the code cache needs
//! cross-thread coordination.
//!
//! [`SimulatedDispatcher`] is a deterministic, manually-driven implementation with its
//! own clock. It is what the host's tests run on and is a reasonable building block
//! for embedders that drive their own loop.

use std::collections::{ HashMap, VecDeque };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use std::time::{ Duration, Instant };



/// A unit of work posted onto a dispatcher.
pub type Task = Box<dyn FnOnce() + Send>;

/// Callback fired each time a [`Timer`] expires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// A single-threaded, per-worker cooperative scheduler.
pub trait Dispatcher: Send + Sync {
	/// Schedules `task` to run on this dispatcher's thread. May be called from any thread.
	fn post( &self, task: Task );

	/// Creates a disabled one-shot timer whose callback runs on this dispatcher's thread.
	fn create_timer( &self, callback: TimerCallback ) -> Box<dyn Timer> ;

	/// Current monotonic time as seen by this dispatcher.
	fn monotonic_time( &self ) -> Instant ;
}

/// A one-shot timer owned by whoever created it. Dropping the timer cancels it.
pub trait Timer: Send {
	/// Arms the timer to fire once after `period`, replacing any pending expiry.
	fn enable( &mut self, period: Duration );
	/// Cancels a pending expiry, if any.
	fn disable( &mut self );
	/// Whether an expiry is pending.
	fn is_enabled( &self ) -> bool ;
}

/// A manually driven dispatcher with simulated time.
///
/// Posted tasks run when [`run_posted`]( Self::run_posted ) or [`advance`]( Self::advance )
/// is called. Timers fire in deadline order while time is advanced.
#[derive( Clone )]
pub struct SimulatedDispatcher {
	state: Arc<Mutex<SimulatedState>>,
}

struct SimulatedState {
	now: Instant,
	posted: VecDeque<Task>,
	timers: HashMap<u64, SimulatedTimerEntry>,
	next_timer_id: u64,
	next_sequence: u64,
}

struct SimulatedTimerEntry {
	/// Expiry time plus an arming sequence number to keep ties in arming order
	deadline: Option<( Instant, u64 )>,
	/// Taken out while the callback runs
	callback: Option<TimerCallback>,
}

fn lock_state( state: &Mutex<SimulatedState> ) -> MutexGuard<'_, SimulatedState> {
	state.lock().unwrap_or_else( PoisonError::into_inner )
}

impl SimulatedDispatcher {

	/// Creates a dispatcher whose clock starts at the current instant.
	pub fn new() -> Self {
		Self { state: Arc::new( Mutex::new( SimulatedState {
			now: Instant::now(),
			posted: VecDeque::new(),
			timers: HashMap::new(),
			next_timer_id: 0,
			next_sequence: 0,
		}))}
	}

	/// Runs posted tasks until the queue is empty, including tasks posted by tasks.
	///
	/// Returns the number of tasks run.
	pub fn run_posted( &self ) -> usize {
		let mut count = 0 ;
		loop {
			let Some( task ) = lock_state( &self.state ).posted.pop_front() else { return count };
			task();
			count += 1 ;
		}
	}

	/// Moves the clock forward by `by`, firing every timer that expires on the way.
	///
	/// Posted tasks are drained before the first timer and after every timer callback.
	pub fn advance( &self, by: Duration ) {
		let target = lock_state( &self.state ).now + by ;
		self.run_posted();
		loop {
			let due = {
				let mut state = lock_state( &self.state );
				let next = state.timers.iter()
					.filter_map(|( id, entry )| entry.deadline.map(| deadline | ( deadline, *id )))
					.filter(|(( at, _ ), _ )| *at <= target )
					.min();
				let Some((( at, _ ), id )) = next else { break };
				state.now = state.now.max( at );
				state.timers.get_mut( &id ).and_then(| entry | {
					entry.deadline = None ;
					entry.callback.take().map(| callback | ( id, callback ))
				})
			};
			if let Some(( id, mut callback )) = due {
				callback();
				if let Some( entry ) = lock_state( &self.state ).timers.get_mut( &id ) {
					entry.callback = Some( callback );
				}
			}
			self.run_posted();
		}
		let mut state = lock_state( &self.state );
		state.now = state.now.max( target );
	}

	/// Number of tasks waiting to run.
	pub fn pending_tasks( &self ) -> usize { lock_state( &self.state ).posted.len() }

	/// Number of timers with a pending expiry.
	pub fn armed_timers( &self ) -> usize {
		lock_state( &self.state ).timers.values().filter(| entry | entry.deadline.is_some() ).count()
	}

}

impl Default for SimulatedDispatcher {
	fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for SimulatedDispatcher {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		let state = lock_state( &self.state );
		f.debug_struct( "SimulatedDispatcher" )
			.field( "now", &state.now )
			.field( "posted", &state.posted.len() )
			.field( "timers", &state.timers.len() )
			.finish_non_exhaustive()
	}
}

impl Dispatcher for SimulatedDispatcher {

	fn post( &self, task: Task ) {
		lock_state( &self.state ).posted.push_back( task );
	}

	fn create_timer( &self, callback: TimerCallback ) -> Box<dyn Timer> {
		let mut state = lock_state( &self.state );
		let id = state.next_timer_id ;
		state.next_timer_id += 1 ;
		state.timers.insert( id, SimulatedTimerEntry { deadline: None, callback: Some( callback )});
		Box::new( SimulatedTimer { id, state: Arc::downgrade( &self.state )})
	}

	fn monotonic_time( &self ) -> Instant { lock_state( &self.state ).now }

}

struct SimulatedTimer {
	id: u64,
	state: Weak<Mutex<SimulatedState>>,
}

impl Timer for SimulatedTimer {

	fn enable( &mut self, period: Duration ) {
		let Some( state ) = self.state.upgrade() else { return };
		let mut state = lock_state( &state );
		let sequence = state.next_sequence ;
		state.next_sequence += 1 ;
		let at = state.now + period ;
		if let Some( entry ) = state.timers.get_mut( &self.id ) {
			entry.deadline = Some(( at, sequence ));
		}
	}

	fn disable( &mut self ) {
		let Some( state ) = self.state.upgrade() else { return };
		let mut state = lock_state( &state );
		if let Some( entry ) = state.timers.get_mut( &self.id ) {
			entry.deadline = None ;
		}
	}

	fn is_enabled( &self ) -> bool {
		let Some( state ) = self.state.upgrade() else { return false };
		let enabled = lock_state( &state ).timers.get( &self.id ).is_some_and(| entry | entry.deadline.is_some() );
		enabled
	}

}

impl Drop for SimulatedTimer {
	fn drop( &mut self ) {
		let Some( state ) = self.state.upgrade() else { return };
		// The callback is dropped after the lock is released.
		let removed = lock_state( &state ).timers.remove( &self.id );
		drop( removed );
	}
}

#[cfg( test )]
mod tests {

	use super::* ;
	use std::sync::atomic::{ AtomicU32, Ordering };

	fn counting_timer( dispatcher: &SimulatedDispatcher ) -> ( Box<dyn Timer>, Arc<AtomicU32> ) {
		let fired = Arc::new( AtomicU32::new( 0 ));
		let counter = Arc::clone( &fired );
		let timer = dispatcher.create_timer( Box::new( move || { counter.fetch_add( 1, Ordering::SeqCst ); }));
		( timer, fired )
	}

	#[test]
	fn posted_tasks_run_in_order() {
		let dispatcher = SimulatedDispatcher::new();
		let log = Arc::new( Mutex::new( Vec::new() ));
		for index in 0..3 {
			let log = Arc::clone( &log );
			dispatcher.post( Box::new( move || log.lock().unwrap().push( index )));
		}
		assert_eq!( dispatcher.pending_tasks(), 3 );
		assert_eq!( dispatcher.run_posted(), 3 );
		assert_eq!( *log.lock().unwrap(), vec![ 0, 1, 2 ]);
	}

	#[test]
	fn timer_fires_once_per_enable() {
		let dispatcher = SimulatedDispatcher::new();
		let ( mut timer, fired ) = counting_timer( &dispatcher );
		timer.enable( Duration::from_millis( 100 ));
		dispatcher.advance( Duration::from_millis( 99 ));
		assert_eq!( fired.load( Ordering::SeqCst ), 0 );
		dispatcher.advance( Duration::from_millis( 1 ));
		assert_eq!( fired.load( Ordering::SeqCst ), 1 );
		dispatcher.advance( Duration::from_secs( 10 ));
		assert_eq!( fired.load( Ordering::SeqCst ), 1 );
		assert!( !timer.is_enabled() );
	}

	#[test]
	fn disabled_and_dropped_timers_do_not_fire() {
		let dispatcher = SimulatedDispatcher::new();
		let ( mut disabled, disabled_fired ) = counting_timer( &dispatcher );
		let ( mut dropped, dropped_fired ) = counting_timer( &dispatcher );
		disabled.enable( Duration::from_millis( 10 ));
		dropped.enable( Duration::from_millis( 10 ));
		disabled.disable();
		drop( dropped );
		dispatcher.advance( Duration::from_millis( 50 ));
		assert_eq!( disabled_fired.load( Ordering::SeqCst ), 0 );
		assert_eq!( dropped_fired.load( Ordering::SeqCst ), 0 );
		assert_eq!( dispatcher.armed_timers(), 0 );
	}

	#[test]
	fn clock_observed_by_callback_is_the_deadline() {
		let dispatcher = SimulatedDispatcher::new();
		let start = dispatcher.monotonic_time();
		let seen = Arc::new( Mutex::new( None ));
		let observer = dispatcher.clone();
		let slot = Arc::clone( &seen );
		let mut timer = dispatcher.create_timer( Box::new( move || {
			*slot.lock().unwrap() = Some( observer.monotonic_time() );
		}));
		timer.enable( Duration::from_millis( 250 ));
		dispatcher.advance( Duration::from_secs( 1 ));
		assert_eq!( *seen.lock().unwrap(), Some( start + Duration::from_millis( 250 )));
		assert_eq!( dispatcher.monotonic_time(), start + Duration::from_secs( 1 ));
	}

}
