//! Process-wide cache of fetched remote bytecode.
//!
//! Entries are keyed by the expected SHA-256 of the code. An entry with empty code is a
//! negative entry: its fetch failed, and for [`NEGATIVE_CACHING_WINDOW`] after that no new
//! fetch is started for the key. Entries that were not used for [`CACHING_TTL`] are
//! evicted lazily on the next lookup. At most one fetch per key is in progress at any time.
//!
//! All operations take an explicit `now` so the cache follows whatever clock the calling
//! dispatcher runs on.

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::{ Duration, Instant };



/// How long a failed fetch suppresses new fetches for the same key.
pub const NEGATIVE_CACHING_WINDOW: Duration = Duration::from_secs( 10 );

/// How long an unused entry survives.
pub const CACHING_TTL: Duration = Duration::from_secs( 24 * 60 * 60 );

/// Immutable, shareable bytecode. Empty means "no code".
pub type Bytecode = Arc<[u8]>;

/// Returns a shared empty [`Bytecode`].
pub fn empty_bytecode() -> Bytecode { Arc::from( Vec::with_capacity( 0 ))}

/// A snapshot of a single cache entry.
#[derive( Debug, Clone )]
pub struct CodeCacheEntry {
	/// Cached code. Empty when the last fetch failed or no fetch completed yet.
	pub code: Bytecode,
	/// Whether a fetch for this key is currently running.
	pub in_progress: bool,
	/// Last time the entry was served or created.
	pub use_time: Instant,
	/// Time the last fetch completed, if any did.
	pub fetch_time: Option<Instant>,
}

/// Outcome of [`CodeCache::get_or_start`].
#[derive( Debug, Clone )]
pub enum CacheLookup {
	/// Code is available. Empty bytecode means a recent fetch failed.
	Cached( Bytecode ),
	/// Another caller already owns the fetch for this key.
	InProgress,
	/// The caller now owns the fetch for this key and must call [`CodeCache::complete`].
	Miss,
}

/// Shared bytecode cache with negative caching and in-flight deduplication.
pub struct CodeCache {
	entries: Mutex<HashMap<String, CodeCacheEntry>>,
	ttl: Duration,
	negative_window: Duration,
}

impl CodeCache {

	/// Creates an empty cache with the default windows.
	pub fn new() -> Self { Self::with_windows( CACHING_TTL, NEGATIVE_CACHING_WINDOW )}

	/// Creates an empty cache with custom eviction and negative-caching windows.
	pub fn with_windows( ttl: Duration, negative_window: Duration ) -> Self {
		Self { entries: Mutex::new( HashMap::new() ), ttl, negative_window }
	}

	fn lock( &self ) -> MutexGuard<'_, HashMap<String, CodeCacheEntry>> {
		self.entries.lock().unwrap_or_else( PoisonError::into_inner )
	}

	/// Looks `key` up, claiming the fetch for it when one is needed.
	///
	/// Expired entries other than `key` itself and those with a fetch in progress are
	/// evicted first.
	pub fn get_or_start( &self, key: &str, now: Instant ) -> CacheLookup {
		let mut entries = self.lock();
		Self::evict( &mut entries, self.ttl, now, Some( key ));

		let Some( entry ) = entries.get_mut( key ) else {
			entries.insert( key.to_string(), CodeCacheEntry {
				code: empty_bytecode(),
				in_progress: true,
				use_time: now,
				fetch_time: None,
			});
			tracing::debug!( key, "code cache miss" );
			return CacheLookup::Miss
		};

		if entry.in_progress { return CacheLookup::InProgress }

		if !entry.code.is_empty() {
			entry.use_time = now ;
			return CacheLookup::Cached( Arc::clone( &entry.code ))
		}

		let within_negative_window = entry.fetch_time
			.is_some_and(| fetched | now.saturating_duration_since( fetched ) < self.negative_window );
		match within_negative_window {
			true => CacheLookup::Cached( empty_bytecode() ),
			false => {
				entry.in_progress = true ;
				tracing::debug!( key, "negative entry expired, retrying fetch" );
				CacheLookup::Miss
			},
		}
	}

	/// Records the result of the fetch for `key`. Empty `code` records a failure.
	pub fn complete( &self, key: &str, code: Bytecode, now: Instant ) {
		let mut entries = self.lock();
		let entry = entries.entry( key.to_string() ).or_insert_with(|| CodeCacheEntry {
			code: empty_bytecode(),
			in_progress: false,
			use_time: now,
			fetch_time: None,
		});
		entry.in_progress = false ;
		entry.fetch_time = Some( now );
		entry.use_time = now ;
		entry.code = code ;
	}

	/// Evicts every expired entry that has no fetch in progress.
	pub fn sweep( &self, now: Instant ) {
		let mut entries = self.lock();
		Self::evict( &mut entries, self.ttl, now, None );
	}

	fn evict( entries: &mut HashMap<String, CodeCacheEntry>, ttl: Duration, now: Instant, keep: Option<&str> ) {
		entries.retain(| key, entry | {
			entry.in_progress
				|| keep == Some( key.as_str() )
				|| now.saturating_duration_since( entry.use_time ) < ttl
		});
	}

	/// Number of entries, negative and in-progress ones included.
	pub fn len( &self ) -> usize { self.lock().len() }

	/// Whether the cache holds no entries.
	pub fn is_empty( &self ) -> bool { self.lock().is_empty() }

	/// Snapshot of the entry for `key`.
	pub fn entry( &self, key: &str ) -> Option<CodeCacheEntry> { self.lock().get( key ).cloned() }

}

impl Default for CodeCache {
	fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for CodeCache {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "CodeCache" )
			.field( "entries", &self.len() )
			.field( "ttl", &self.ttl )
			.field( "negative_window", &self.negative_window )
			.finish()
	}
}

#[cfg( test )]
mod tests {

	use super::* ;
	use proptest::prelude::* ;

	fn code( bytes: &[u8] ) -> Bytecode { Arc::from( bytes.to_vec() )}

	#[test]
	fn miss_then_in_progress_then_hit() {
		let cache = CodeCache::new();
		let t0 = Instant::now();
		assert!( matches!( cache.get_or_start( "k", t0 ), CacheLookup::Miss ));
		assert!( matches!( cache.get_or_start( "k", t0 ), CacheLookup::InProgress ));
		cache.complete( "k", code( b"wasm" ), t0 );
		match cache.get_or_start( "k", t0 + Duration::from_secs( 1 )) {
			CacheLookup::Cached( bytes ) => assert_eq!( &*bytes, b"wasm" ),
			other => panic!( "Expected a hit, found: {:?}", other ),
		}
	}

	#[test]
	fn negative_entry_suppresses_fetch_within_window() {
		let cache = CodeCache::new();
		let t0 = Instant::now();
		assert!( matches!( cache.get_or_start( "k", t0 ), CacheLookup::Miss ));
		cache.complete( "k", empty_bytecode(), t0 );

		match cache.get_or_start( "k", t0 + Duration::from_secs( 9 )) {
			CacheLookup::Cached( bytes ) => assert!( bytes.is_empty() ),
			other => panic!( "Expected a negative hit, found: {:?}", other ),
		}
		assert!( matches!( cache.get_or_start( "k", t0 + Duration::from_secs( 10 )), CacheLookup::Miss ));
		assert!( cache.entry( "k" ).is_some_and(| entry | entry.in_progress ));
	}

	#[test]
	fn unused_entries_expire() {
		let cache = CodeCache::new();
		let t0 = Instant::now();
		let _ = cache.get_or_start( "old", t0 );
		cache.complete( "old", code( b"a" ), t0 );
		let _ = cache.get_or_start( "running", t0 );

		let later = t0 + CACHING_TTL + Duration::from_secs( 1 );
		let _ = cache.get_or_start( "fresh", later );
		assert!( cache.entry( "old" ).is_none() );
		assert!( cache.entry( "running" ).is_some() );
		assert_eq!( cache.len(), 2 );
	}

	#[test]
	fn expired_key_being_looked_up_is_refetched_not_evicted() {
		let cache = CodeCache::new();
		let t0 = Instant::now();
		let _ = cache.get_or_start( "k", t0 );
		cache.complete( "k", code( b"a" ), t0 );
		match cache.get_or_start( "k", t0 + CACHING_TTL * 2 ) {
			CacheLookup::Cached( bytes ) => assert_eq!( &*bytes, b"a" ),
			other => panic!( "Expected a hit, found: {:?}", other ),
		}
	}

	#[test]
	fn sweep_honours_use_time() {
		let cache = CodeCache::new();
		let t0 = Instant::now();
		let _ = cache.get_or_start( "k", t0 );
		cache.complete( "k", code( b"a" ), t0 );
		let _ = cache.get_or_start( "k", t0 + Duration::from_secs( 3600 ));
		cache.sweep( t0 + CACHING_TTL );
		assert_eq!( cache.len(), 1 );
		cache.sweep( t0 + CACHING_TTL + Duration::from_secs( 3600 ));
		assert!( cache.is_empty() );
	}

	#[derive( Debug, Clone )]
	enum Step { Lookup( u8 ), Complete( u8, bool ), Wait( u16 )}

	fn step() -> impl Strategy<Value = Step> {
		prop_oneof![
			( 0u8..3 ).prop_map( Step::Lookup ),
			(( 0u8..3 ), any::<bool>() ).prop_map(|( key, ok )| Step::Complete( key, ok )),
			( 0u16..20_000 ).prop_map( Step::Wait ),
		]
	}

	proptest! {
		#[test]
		fn at_most_one_fetch_owner_per_key( steps in proptest::collection::vec( step(), 1..64 )) {
			let cache = CodeCache::new();
			let mut now = Instant::now();
			let mut owned = [ false; 3 ];
			for step in steps {
				match step {
					Step::Lookup( key ) => {
						if let CacheLookup::Miss = cache.get_or_start( &key.to_string(), now ) {
							prop_assert!( !owned[ key as usize ], "second fetch owner for {}", key );
							owned[ key as usize ] = true ;
						}
					},
					Step::Complete( key, ok ) => if owned[ key as usize ] {
						let bytes = match ok { true => code( b"x" ), false => empty_bytecode() };
						cache.complete( &key.to_string(), bytes, now );
						owned[ key as usize ] = false ;
					},
					Step::Wait( millis ) => now += Duration::from_millis( u64::from( millis )),
				}
			}
		}
	}

}
