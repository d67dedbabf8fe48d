//! Jittered exponential backoff.
//!
//! Intervals start at a base, double with every consumed attempt and are capped at a
//! maximum. Jitter only ever lengthens an interval (by up to half of it), so the
//! un-jittered value is a lower bound on the spacing between attempts.

use std::sync::Arc ;



/// Source of randomness used for jitter.
pub trait RandomGenerator: Send + Sync {
	/// Returns a uniformly distributed random value.
	fn random( &self ) -> u64 ;
}

/// [`RandomGenerator`] backed by the thread-local generator of the `rand` crate.
#[derive( Debug, Default, Clone, Copy )]
pub struct ThreadRandom ;

impl RandomGenerator for ThreadRandom {
	fn random( &self ) -> u64 { rand::random() }
}

/// Stateful jittered backoff counter.
///
/// The interval for the current attempt is drawn once and stays stable until it is
/// consumed with [`next_backoff_ms`]( Self::next_backoff_ms ), so it can be peeked any
/// number of times with [`current_interval_ms`]( Self::current_interval_ms ).
pub struct BackoffStrategy {
	base_ms: u64,
	max_ms: u64,
	attempt: u32,
	pending_ms: Option<u64>,
	random: Arc<dyn RandomGenerator>,
}

impl BackoffStrategy {

	/// Creates a backoff starting at `base_ms` and capped at `max_ms`.
	///
	/// A maximum below the base is raised to the base.
	pub fn new( base_ms: u64, max_ms: u64, random: Arc<dyn RandomGenerator> ) -> Self {
		Self { base_ms, max_ms: max_ms.max( base_ms ), attempt: 0, pending_ms: None, random }
	}

	/// The interval for the current attempt, drawing it if it was not drawn yet.
	pub fn current_interval_ms( &mut self ) -> u64 {
		if let Some( pending ) = self.pending_ms { return pending }
		let interval = self.draw();
		self.pending_ms = Some( interval );
		interval
	}

	/// Consumes the current interval and advances to the next attempt.
	pub fn next_backoff_ms( &mut self ) -> u64 {
		let interval = self.current_interval_ms();
		self.pending_ms = None ;
		self.attempt = self.attempt.saturating_add( 1 );
		interval
	}

	/// Returns to the base interval.
	pub fn reset( &mut self ) {
		self.attempt = 0 ;
		self.pending_ms = None ;
	}

	/// Number of consumed attempts since creation or the last reset.
	#[inline] pub fn attempt( &self ) -> u32 { self.attempt }

	fn draw( &self ) -> u64 {
		let floor = self.base_ms
			.saturating_mul( 1u64.checked_shl( self.attempt ).unwrap_or( u64::MAX ))
			.min( self.max_ms );
		let jitter = match floor / 2 {
			0 => 0,
			spread => self.random.random() % spread,
		};
		floor.saturating_add( jitter ).min( self.max_ms )
	}

}

impl std::fmt::Debug for BackoffStrategy {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "BackoffStrategy" )
			.field( "base_ms", &self.base_ms )
			.field( "max_ms", &self.max_ms )
			.field( "attempt", &self.attempt )
			.field( "pending_ms", &self.pending_ms )
			.finish_non_exhaustive()
	}
}

#[cfg( test )]
mod tests {

	use super::* ;

	struct Fixed( u64 );
	impl RandomGenerator for Fixed {
		fn random( &self ) -> u64 { self.0 }
	}

	#[test]
	fn without_jitter_intervals_double_until_capped() {
		let mut backoff = BackoffStrategy::new( 1000, 5000, Arc::new( Fixed( 0 )));
		let intervals = ( 0..5 ).map(|_| backoff.next_backoff_ms() ).collect::<Vec<_>>();
		assert_eq!( intervals, vec![ 1000, 2000, 4000, 5000, 5000 ]);
	}

	#[test]
	fn peeking_does_not_advance() {
		let mut backoff = BackoffStrategy::new( 1000, 10_000, Arc::new( ThreadRandom ));
		let first = backoff.current_interval_ms();
		assert_eq!( backoff.current_interval_ms(), first );
		assert_eq!( backoff.attempt(), 0 );
		assert_eq!( backoff.next_backoff_ms(), first );
		assert_eq!( backoff.attempt(), 1 );
	}

	#[test]
	fn jitter_stays_within_half_an_interval() {
		for seed in [ 0, 1, 499, 500, 12_345, u64::MAX ] {
			let mut backoff = BackoffStrategy::new( 1000, 60_000, Arc::new( Fixed( seed )));
			let interval = backoff.current_interval_ms();
			assert!(( 1000..1500 ).contains( &interval ), "seed {} gave {}", seed, interval );
		}
	}

	#[test]
	fn reset_returns_to_base() {
		let mut backoff = BackoffStrategy::new( 200, 10_000, Arc::new( Fixed( 0 )));
		backoff.next_backoff_ms();
		backoff.next_backoff_ms();
		assert_eq!( backoff.current_interval_ms(), 800 );
		backoff.reset();
		assert_eq!( backoff.current_interval_ms(), 200 );
	}

	#[test]
	fn attempt_counter_saturates() {
		let mut backoff = BackoffStrategy::new( 1000, 60_000, Arc::new( Fixed( 7 )));
		backoff.attempt = u32::MAX ;
		assert_eq!( backoff.next_backoff_ms(), 60_000 );
		assert_eq!( backoff.attempt(), u32::MAX );
	}

	#[test]
	fn max_below_base_is_raised() {
		let mut backoff = BackoffStrategy::new( 1000, 10, Arc::new( Fixed( 0 )));
		assert_eq!( backoff.next_backoff_ms(), 1000 );
	}

}
