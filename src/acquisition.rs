//! Resolves plugin code from local or remote sources.
//!
//! Local code is read synchronously. Remote code goes through the shared [`CodeCache`]:
//! at most one fetch per content hash is ever in flight, and every caller waiting on
//! that hash is completed from the same fetch. Each caller's completion runs exactly
//! once, on the dispatcher the caller resolved from, and never while a cache or
//! pipeline lock is held. Empty bytecode always means "no code".

use std::collections::HashMap ;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use std::time::Duration ;
use sha2::{ Digest, Sha256 };

use crate::backoff::{ BackoffStrategy, RandomGenerator };
use crate::code_cache::{ empty_bytecode, Bytecode, CacheLookup, CodeCache };
use crate::config::{ CodeSource, HttpUri, RemoteSource, VmConfig };
use crate::dispatcher::{ Dispatcher, Timer };
use crate::init::{ InitManager, InitTarget };
use crate::stats::{ StatsHandler, VmEvent };



/// Receives the body of a remote fetch. Empty means the fetch failed.
pub type FetchCallback = Box<dyn FnOnce( Vec<u8> ) + Send>;

/// Receives resolved code. Empty means no code could be resolved.
pub type Completion = Box<dyn FnOnce( Bytecode ) + Send>;

/// Issues HTTP fetches for remote code.
pub trait HttpFetcher: Send + Sync {
	/// Starts fetching `uri`. `callback` must be invoked exactly once, from any thread,
	/// possibly before `fetch` returns.
	fn fetch( &self, uri: &HttpUri, sha256: &str, callback: FetchCallback );
}

/// [`HttpFetcher`] for hosts without network access: every fetch fails.
#[derive( Debug, Default, Clone, Copy )]
pub struct UnavailableFetcher ;

impl HttpFetcher for UnavailableFetcher {
	fn fetch( &self, uri: &HttpUri, _sha256: &str, callback: FetchCallback ) {
		tracing::warn!( uri = %uri.uri, "no http fetcher configured, remote code is unavailable" );
		callback( Vec::with_capacity( 0 ));
	}
}

/// How a [`resolve`]( AcquisitionPipeline::resolve ) call was handled.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Resolution {
	/// The completion already ran.
	Completed,
	/// The completion will run on the caller's dispatcher once the fetch resolves.
	Pending,
	/// The code was not cached and the caller asked not to wait. The completion already
	/// ran with empty code; a background fetch may be warming the cache.
	Rejected,
}

struct Waiter {
	dispatcher: Arc<dyn Dispatcher>,
	completion: Completion,
	init_target: Option<InitTarget>,
}

struct InFlightFetch {
	source: RemoteSource,
	dispatcher: Arc<dyn Dispatcher>,
	waiters: Vec<Waiter>,
	retries_left: u32,
	backoff: BackoffStrategy,
	retry_timer: Option<Box<dyn Timer>>,
}

/// Resolves code for VM creation.
pub struct AcquisitionPipeline {
	code_cache: Arc<CodeCache>,
	fetcher: Arc<dyn HttpFetcher>,
	stats: Arc<StatsHandler>,
	random: Arc<dyn RandomGenerator>,
	in_flight: Mutex<HashMap<String, InFlightFetch>>,
	weak_self: Weak<AcquisitionPipeline>,
}

impl AcquisitionPipeline {

	pub fn new(
		code_cache: Arc<CodeCache>,
		fetcher: Arc<dyn HttpFetcher>,
		stats: Arc<StatsHandler>,
		random: Arc<dyn RandomGenerator>,
	) -> Arc<Self> {
		Arc::new_cyclic(| weak_self | Self {
			code_cache,
			fetcher,
			stats,
			random,
			in_flight: Mutex::new( HashMap::new() ),
			weak_self: weak_self.clone(),
		})
	}

	fn lock_in_flight( &self ) -> MutexGuard<'_, HashMap<String, InFlightFetch>> {
		self.in_flight.lock().unwrap_or_else( PoisonError::into_inner )
	}

	/// Resolves the code of `vm_config`, calling `completion` exactly once.
	///
	/// When the code must be waited for, an init target is registered with
	/// `init_manager` and released after the completion runs.
	pub fn resolve(
		&self,
		vm_config: &VmConfig,
		dispatcher: &Arc<dyn Dispatcher>,
		init_manager: Option<&InitManager>,
		completion: Completion,
	) -> Resolution {
		match &vm_config.code {
			CodeSource::Local( local ) => {
				let code = local.read();
				if code.is_empty() {
					tracing::warn!( source = %local.describe(), "local plugin code is empty or unreadable" );
				}
				completion( Arc::from( code ));
				Resolution::Completed
			},
			CodeSource::Remote( remote ) => self.resolve_remote( remote, vm_config.nack_on_code_cache_miss, dispatcher, init_manager, completion ),
		}
	}

	fn resolve_remote(
		&self,
		remote: &RemoteSource,
		nack_on_cache_miss: bool,
		dispatcher: &Arc<dyn Dispatcher>,
		init_manager: Option<&InitManager>,
		completion: Completion,
	) -> Resolution {

		let key = remote.cache_key();
		let uri = remote.http_uri.uri.as_str();
		let now = dispatcher.monotonic_time();

		let mut in_flight = self.lock_in_flight();
		let lookup = self.code_cache.get_or_start( &key, now );
		self.stats.on_remote_cache_entries_changed( self.code_cache.len() );

		let nack_completion = match lookup {
			CacheLookup::Cached( code ) => {
				drop( in_flight );
				match code.is_empty() {
					true => {
						self.stats.on_event( VmEvent::RemoteLoadCacheNegativeHit );
						tracing::warn!( uri, "failed to load remote code (cached failure)" );
					},
					false => {
						self.stats.on_event( VmEvent::RemoteLoadCacheHit );
						tracing::debug!( uri, "remote code served from cache" );
					},
				}
				completion( code );
				return Resolution::Completed
			},
			CacheLookup::InProgress => {
				self.stats.on_event( VmEvent::RemoteLoadCacheMiss );
				let waiting = match nack_on_cache_miss {
					true => None,
					false => in_flight.get_mut( &key ),
				};
				if let Some( fetch ) = waiting {
					// A fetch claimed by a nacked request has no retries of its own.
					if fetch.waiters.is_empty() {
						fetch.retries_left = fetch.retries_left.max( remote.retry_policy.num_retries );
					}
					fetch.waiters.push( Waiter {
						dispatcher: Arc::clone( dispatcher ),
						completion,
						init_target: init_manager.map(| manager | manager.add_target( format!( "remote wasm {}", uri ))),
					});
					tracing::debug!( uri, waiters = fetch.waiters.len(), "joined in-flight fetch" );
					return Resolution::Pending
				}
				drop( in_flight );
				tracing::warn!( uri, "failed to load remote code (fetch in progress)" );
				completion( empty_bytecode() );
				return match nack_on_cache_miss { true => Resolution::Rejected, false => Resolution::Completed }
			},
			CacheLookup::Miss => {
				self.stats.on_event( VmEvent::RemoteLoadCacheMiss );
				let mut fetch = InFlightFetch {
					source: remote.clone(),
					dispatcher: Arc::clone( dispatcher ),
					waiters: Vec::with_capacity( 1 ),
					retries_left: match nack_on_cache_miss { true => 0, false => remote.retry_policy.num_retries },
					backoff: BackoffStrategy::new(
						remote.retry_policy.backoff.base_interval_ms,
						remote.retry_policy.backoff.max_interval_ms(),
						Arc::clone( &self.random ),
					),
					retry_timer: None,
				};
				let completion = match nack_on_cache_miss {
					true => Some( completion ),
					false => {
						fetch.waiters.push( Waiter {
							dispatcher: Arc::clone( dispatcher ),
							completion,
							init_target: init_manager.map(| manager | manager.add_target( format!( "remote wasm {}", uri ))),
						});
						None
					},
				};
				in_flight.insert( key.clone(), fetch );
				completion
			},
		};

		drop( in_flight );
		tracing::debug!( uri, sha256 = %key, "fetching remote code" );
		self.start_fetch( &key );

		match nack_completion {
			Some( completion ) => {
				tracing::warn!( uri, "failed to load remote code (fetching in background)" );
				completion( empty_bytecode() );
				Resolution::Rejected
			},
			None => Resolution::Pending,
		}

	}

	fn start_fetch( &self, key: &str ) {
		let Some(( source, dispatcher )) = self.lock_in_flight().get( key )
			.map(| fetch | ( fetch.source.clone(), Arc::clone( &fetch.dispatcher )))
			else { return };
		let pipeline = Weak::clone( &self.weak_self );
		let code_cache = Arc::clone( &self.code_cache );
		let key = key.to_string();
		self.fetcher.fetch( &source.http_uri, &source.sha256, Box::new( move | body | {
			let body = verified( &key, body );
			match pipeline.upgrade() {
				Some( pipeline ) => pipeline.on_fetch_done( &key, body ),
				// The cache may be shared with other hosts, which must not see the fetch as
				// still in progress.
				None => {
					tracing::debug!( key, "fetch finished after the pipeline was dropped" );
					code_cache.complete( &key, Arc::from( body ), dispatcher.monotonic_time() );
				},
			}
		}));
	}

	fn on_fetch_done( &self, key: &str, body: Vec<u8> ) {

		let mut in_flight = self.lock_in_flight();
		let Some( fetch ) = in_flight.get_mut( key ) else { return };

		if body.is_empty() && fetch.retries_left > 0 {
			fetch.retries_left -= 1 ;
			let delay = Duration::from_millis( fetch.backoff.next_backoff_ms() );
			tracing::debug!( uri = %fetch.source.http_uri.uri, ?delay, retries_left = fetch.retries_left, "retrying remote fetch" );
			let pipeline = Weak::clone( &self.weak_self );
			let retry_key = key.to_string();
			let mut timer = fetch.dispatcher.create_timer( Box::new( move || {
				if let Some( pipeline ) = pipeline.upgrade() { pipeline.start_fetch( &retry_key ); }
			}));
			timer.enable( delay );
			fetch.retry_timer = Some( timer );
			return
		}

		let Some( fetch ) = in_flight.remove( key ) else { return };
		let code: Bytecode = Arc::from( body );
		self.code_cache.complete( key, Arc::clone( &code ), fetch.dispatcher.monotonic_time() );
		drop( in_flight );

		match code.is_empty() {
			true => {
				self.stats.on_event( VmEvent::RemoteLoadCacheFetchFailure );
				tracing::warn!( uri = %fetch.source.http_uri.uri, "failed to load remote code (fetch failed)" );
			},
			false => {
				self.stats.on_event( VmEvent::RemoteLoadCacheFetchSuccess );
				tracing::debug!( uri = %fetch.source.http_uri.uri, bytes = code.len(), "fetched remote code" );
			},
		}
		self.stats.on_remote_cache_entries_changed( self.code_cache.len() );

		let InFlightFetch { waiters, retry_timer, .. } = fetch ;
		drop( retry_timer );
		for Waiter { dispatcher, completion, init_target } in waiters {
			let code = Arc::clone( &code );
			dispatcher.post( Box::new( move || {
				completion( code );
				drop( init_target );
			}));
		}

	}

	/// The cache this pipeline resolves remote code through.
	#[inline] pub fn code_cache( &self ) -> &Arc<CodeCache> { &self.code_cache }

	/// Number of remote fetches currently in flight, retries included.
	pub fn in_flight( &self ) -> usize { self.lock_in_flight().len() }

}

impl std::fmt::Debug for AcquisitionPipeline {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "AcquisitionPipeline" )
			.field( "code_cache", &self.code_cache )
			.field( "in_flight", &self.in_flight() )
			.finish_non_exhaustive()
	}
}

fn sha256_hex( bytes: &[u8] ) -> String { hex::encode( Sha256::digest( bytes ))}

/// `body` if it hashes to `key`, otherwise empty.
fn verified( key: &str, body: Vec<u8> ) -> Vec<u8> {
	match body.is_empty() || sha256_hex( &body ) == key {
		true => body,
		false => {
			tracing::warn!( sha256 = key, "fetched code does not match its sha256" );
			Vec::with_capacity( 0 )
		},
	}
}
