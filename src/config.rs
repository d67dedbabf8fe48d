//! Plugin configuration as accepted from operators, and its validation.
//!
//! Configuration is plain JSON deserialised with serde. Everything that can be rejected
//! is rejected by [`PluginConfig::validate`] before any code is fetched or compiled, so a
//! bad configuration fails only the setup of the plugin it belongs to.

use std::path::PathBuf ;
use serde::{ Deserialize, Serialize };
use thiserror::Error ;

use crate::wasmtime_engine::WASMTIME_RUNTIME ;



/// Default reload backoff base.
pub const DEFAULT_BASE_INTERVAL_MS: u64 = 1000 ;

/// The default maximum interval is this many times the base.
pub const DEFAULT_MAX_INTERVAL_FACTOR: u64 = 10 ;

/// Configuration errors, reported synchronously when a plugin is set up.
#[derive( Error, Debug, Clone, PartialEq, Eq )]
pub enum ConfigError {
	/// The configuration is not valid JSON of the expected shape.
	#[error( "Malformed Configuration: {0}" )] Malformed( String ),
	/// The legacy `fail_open` flag was combined with an explicit failure policy.
	#[error( "fail_open and failure_policy are both set" )] ConflictingFailurePolicy,
	/// The failure policy is not one of the known values.
	#[error( "Unknown Failure Policy: {0}" )] UnknownFailurePolicy( String ),
	/// The remote code source cannot be fetched as configured.
	#[error( "Invalid Remote Source: {0}" )] InvalidRemoteSource( String ),
	/// The local code source cannot be read as configured.
	#[error( "Invalid Local Source: {0}" )] InvalidLocalSource( String ),
	/// No engine is registered under the configured runtime name.
	#[error( "Unknown Runtime: {0}" )] UnknownRuntime( String ),
	/// A backoff or retry interval is unusable.
	#[error( "Invalid Backoff: {0}" )] InvalidBackoff( String ),
}

/// What to do when the bound VM has faulted at runtime.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum FailurePolicy {
	/// Skip plugin processing entirely.
	FailOpen,
	/// Keep serving a context bound to the failed VM, which denies instead of executing.
	FailClosed,
	/// Replace the failed VM, spaced by a jittered backoff.
	FailReload,
}

impl FailurePolicy {

	/// Resolves the effective policy from the legacy flag and the explicit value.
	///
	/// `None` and `"UNSPECIFIED"` mean no explicit policy.
	///
	/// # Errors
	/// [`ConfigError::ConflictingFailurePolicy`] when both are set,
	/// [`ConfigError::UnknownFailurePolicy`] for an unrecognised value.
	pub fn resolve( fail_open: bool, policy: Option<&str> ) -> Result<Self, ConfigError> {
		let explicit = match policy {
			None | Some( "UNSPECIFIED" ) => None,
			Some( "FAIL_OPEN" ) => Some( Self::FailOpen ),
			Some( "FAIL_CLOSED" ) => Some( Self::FailClosed ),
			Some( "FAIL_RELOAD" ) => Some( Self::FailReload ),
			Some( other ) => return Err( ConfigError::UnknownFailurePolicy( other.to_string() )),
		};
		match ( fail_open, explicit ) {
			( true, Some( _ )) => Err( ConfigError::ConflictingFailurePolicy ),
			( true, None ) => Ok( Self::FailOpen ),
			( false, Some( policy )) => Ok( policy ),
			( false, None ) => Ok( Self::FailClosed ),
		}
	}

	/// Whether a failed or absent plugin is skipped rather than denied.
	#[inline] pub fn is_fail_open( self ) -> bool { self == Self::FailOpen }

}

/// A complete plugin configuration.
#[derive( Debug, Clone, Default, PartialEq, Serialize, Deserialize )]
pub struct PluginConfig {
	/// Plugin name, used as the stats scope.
	pub name: String,
	/// Groups plugins sharing one root context in the guest.
	#[serde( default )]
	pub root_id: String,
	/// Opaque plugin configuration handed to the guest at configure time.
	#[serde( default )]
	pub configuration: Option<serde_json::Value>,
	/// Legacy switch, equivalent to `failure_policy: "FAIL_OPEN"`.
	#[serde( default )]
	pub fail_open: bool,
	/// One of `FAIL_OPEN`, `FAIL_CLOSED`, `FAIL_RELOAD`.
	#[serde( default )]
	pub failure_policy: Option<String>,
	/// Reload tuning, only consulted under `FAIL_RELOAD`. Backoff intervals are jittered
	/// upwards, so the first reload may come later than `base_interval_ms`.
	#[serde( default )]
	pub reload_config: Option<ReloadConfig>,
	/// Share one plugin handle across threads instead of one per worker.
	#[serde( default )]
	pub singleton: bool,
	/// The VM the plugin runs in.
	#[serde( default )]
	pub vm_config: VmConfig,
}

/// Configuration of the VM a plugin runs in.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct VmConfig {
	/// Identifier for VM sharing; plugins with equal ids, configuration and code share a base VM.
	#[serde( default )]
	pub vm_id: String,
	/// Name of the engine to run the code with.
	#[serde( default = "default_runtime" )]
	pub runtime: String,
	/// Opaque VM configuration handed to the guest at start.
	#[serde( default )]
	pub configuration: Option<serde_json::Value>,
	/// Permit engine-specific precompiled artifacts.
	#[serde( default )]
	pub allow_precompiled: bool,
	/// Fail immediately instead of waiting when remote code is not cached yet.
	#[serde( default )]
	pub nack_on_code_cache_miss: bool,
	/// Where the code comes from.
	#[serde( default )]
	pub code: CodeSource,
}

fn default_runtime() -> String { WASMTIME_RUNTIME.to_string() }

impl Default for VmConfig {
	fn default() -> Self {
		Self {
			vm_id: String::new(),
			runtime: default_runtime(),
			configuration: None,
			allow_precompiled: false,
			nack_on_code_cache_miss: false,
			code: CodeSource::default(),
		}
	}
}

/// Where plugin code comes from.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( rename_all = "snake_case" )]
pub enum CodeSource {
	Local( LocalSource ),
	Remote( RemoteSource ),
}

impl Default for CodeSource {
	fn default() -> Self { Self::Local( LocalSource::InlineBytes( String::new() ))}
}

/// Code available without a network round-trip.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( rename_all = "snake_case" )]
pub enum LocalSource {
	/// A file on disk.
	Filename( PathBuf ),
	/// Hex-encoded bytes.
	InlineBytes( String ),
	/// Text, typically WebAssembly text format.
	InlineString( String ),
}

impl LocalSource {

	/// Reads the code. Anything unreadable yields empty bytes.
	pub fn read( &self ) -> Vec<u8> { match self {
		Self::Filename( path ) => std::fs::read( path ).unwrap_or_else(| err | {
			tracing::warn!( path = %path.display(), error = %err, "unable to read local plugin code" );
			Vec::with_capacity( 0 )
		}),
		Self::InlineBytes( encoded ) => hex::decode( encoded ).unwrap_or_else(| err | {
			tracing::warn!( error = %err, "inline plugin code is not valid hex" );
			Vec::with_capacity( 0 )
		}),
		Self::InlineString( text ) => text.as_bytes().to_vec(),
	}}

	/// Human-readable origin for logs.
	pub fn describe( &self ) -> String { match self {
		Self::Filename( path ) => path.display().to_string(),
		Self::InlineBytes( _ ) | Self::InlineString( _ ) => "<inline>".to_string(),
	}}

}

/// Code fetched over HTTP and verified against a content hash.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct RemoteSource {
	pub http_uri: HttpUri,
	/// Lowercase or uppercase hex SHA-256 of the expected code. Also the cache key.
	pub sha256: String,
	/// Retries for a failed fetch while blocking readiness.
	#[serde( default )]
	pub retry_policy: RetryPolicy,
}

impl RemoteSource {
	/// Cache key for this source.
	pub fn cache_key( &self ) -> String { self.sha256.to_ascii_lowercase() }
}

/// Location of remote code.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
pub struct HttpUri {
	pub uri: String,
	/// Upstream the request is routed through.
	#[serde( default )]
	pub cluster: String,
	#[serde( default = "default_timeout_ms" )]
	pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 { 1000 }

/// Retry schedule for a remote fetch.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
pub struct RetryPolicy {
	#[serde( default = "default_num_retries" )]
	pub num_retries: u32,
	#[serde( default )]
	pub backoff: BackoffConfig,
}

fn default_num_retries() -> u32 { 1 }

impl Default for RetryPolicy {
	fn default() -> Self { Self { num_retries: default_num_retries(), backoff: BackoffConfig::default() }}
}

/// Reload tuning.
#[derive( Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize )]
pub struct ReloadConfig {
	#[serde( default )]
	pub backoff: BackoffConfig,
}

/// Jittered exponential backoff bounds.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
pub struct BackoffConfig {
	#[serde( default = "default_base_interval_ms" )]
	pub base_interval_ms: u64,
	/// Defaults to ten times the base.
	#[serde( default )]
	pub max_interval_ms: Option<u64>,
}

fn default_base_interval_ms() -> u64 { DEFAULT_BASE_INTERVAL_MS }

impl Default for BackoffConfig {
	fn default() -> Self { Self { base_interval_ms: DEFAULT_BASE_INTERVAL_MS, max_interval_ms: None }}
}

impl BackoffConfig {

	/// The effective maximum interval.
	pub fn max_interval_ms( &self ) -> u64 {
		self.max_interval_ms.unwrap_or_else(|| self.base_interval_ms.saturating_mul( DEFAULT_MAX_INTERVAL_FACTOR ))
	}

	fn validate( &self, owner: &str ) -> Result<(), ConfigError> {
		if self.base_interval_ms == 0 {
			return Err( ConfigError::InvalidBackoff( format!( "{}: base_interval_ms must be positive", owner )))
		}
		if self.max_interval_ms() < self.base_interval_ms {
			return Err( ConfigError::InvalidBackoff( format!( "{}: max_interval_ms is below base_interval_ms", owner )))
		}
		Ok(())
	}

}

impl PluginConfig {

	/// Parses a JSON configuration. The result still has to be [`validate`]( Self::validate )d.
	///
	/// # Errors
	/// [`ConfigError::Malformed`] when the text is not a configuration.
	pub fn from_json( text: &str ) -> Result<Self, ConfigError> {
		serde_json::from_str( text ).map_err(| err | ConfigError::Malformed( err.to_string() ))
	}

	/// Checks everything that can be checked without an engine and returns the effective
	/// failure policy.
	///
	/// # Errors
	/// The first problem found.
	pub fn validate( &self ) -> Result<FailurePolicy, ConfigError> {
		let policy = FailurePolicy::resolve( self.fail_open, self.failure_policy.as_deref() )?;
		if policy == FailurePolicy::FailReload {
			self.reload_config.clone().unwrap_or_default().backoff.validate( "reload_config" )?;
		}
		match &self.vm_config.code {
			CodeSource::Remote( remote ) => {
				if remote.http_uri.uri.trim().is_empty() {
					return Err( ConfigError::InvalidRemoteSource( "http_uri.uri is empty".to_string() ))
				}
				let is_sha256 = remote.sha256.len() == 64 && remote.sha256.chars().all(| c | c.is_ascii_hexdigit() );
				if !is_sha256 {
					return Err( ConfigError::InvalidRemoteSource( format!( "sha256 {:?} is not 64 hex digits", remote.sha256 )))
				}
				remote.retry_policy.backoff.validate( "retry_policy" )?;
			},
			CodeSource::Local( LocalSource::InlineBytes( encoded )) => {
				hex::decode( encoded ).map_err(| err | ConfigError::InvalidLocalSource( err.to_string() ))?;
			},
			CodeSource::Local( _ ) => {},
		}
		Ok( policy )
	}

	/// The reload backoff bounds in effect.
	pub fn reload_backoff( &self ) -> BackoffConfig {
		self.reload_config.as_ref().map(| config | config.backoff ).unwrap_or_default()
	}

}

/// Serialises an opaque configuration value into the bytes handed to the guest.
///
/// Strings are passed through verbatim, absent values are empty and everything else is
/// compact JSON.
pub fn configuration_bytes( value: Option<&serde_json::Value> ) -> Vec<u8> { match value {
	None | Some( serde_json::Value::Null ) => Vec::with_capacity( 0 ),
	Some( serde_json::Value::String( text )) => text.as_bytes().to_vec(),
	Some( other ) => serde_json::to_vec( other ).unwrap_or_default(),
}}

#[cfg( test )]
mod tests {

	use super::* ;

	const SHA: &str = "4f5bdf0ad8d2bd4d4b0e8b3b3bbf2f0e44d8c9ba5ac2a7f6d8f0e6b1a1c3d5e7" ;

	#[test]
	fn policy_resolution() {
		assert_eq!( FailurePolicy::resolve( false, None ), Ok( FailurePolicy::FailClosed ));
		assert_eq!( FailurePolicy::resolve( true, None ), Ok( FailurePolicy::FailOpen ));
		assert_eq!( FailurePolicy::resolve( true, Some( "UNSPECIFIED" )), Ok( FailurePolicy::FailOpen ));
		assert_eq!( FailurePolicy::resolve( false, Some( "FAIL_RELOAD" )), Ok( FailurePolicy::FailReload ));
		assert_eq!( FailurePolicy::resolve( true, Some( "FAIL_CLOSED" )), Err( ConfigError::ConflictingFailurePolicy ));
		assert_eq!(
			FailurePolicy::resolve( false, Some( "FAIL_SOMETIMES" )),
			Err( ConfigError::UnknownFailurePolicy( "FAIL_SOMETIMES".to_string() )),
		);
	}

	#[test]
	fn parses_remote_configuration_with_defaults() {
		let config = PluginConfig::from_json( &format!( r#"{{
			"name": "auth",
			"failure_policy": "FAIL_RELOAD",
			"vm_config": {{
				"vm_id": "shared",
				"code": {{ "remote": {{ "http_uri": {{ "uri": "https://example.com/auth.wasm" }}, "sha256": "{}" }} }}
			}}
		}}"#, SHA )).unwrap();

		assert_eq!( config.vm_config.runtime, "wasmtime" );
		assert_eq!( config.reload_backoff(), BackoffConfig { base_interval_ms: 1000, max_interval_ms: None });
		assert_eq!( config.reload_backoff().max_interval_ms(), 10_000 );
		let CodeSource::Remote( remote ) = &config.vm_config.code else { panic!( "Expected a remote source" )};
		assert_eq!( remote.retry_policy.num_retries, 1 );
		assert_eq!( remote.http_uri.timeout_ms, 1000 );
		assert_eq!( config.validate(), Ok( FailurePolicy::FailReload ));
	}

	#[test]
	fn rejects_bad_remote_sources() {
		let mut config = PluginConfig::default();
		config.vm_config.code = CodeSource::Remote( RemoteSource {
			http_uri: HttpUri { uri: "https://example.com/a.wasm".to_string(), cluster: String::new(), timeout_ms: 1000 },
			sha256: "abc".to_string(),
			retry_policy: RetryPolicy::default(),
		});
		assert!( matches!( config.validate(), Err( ConfigError::InvalidRemoteSource( _ ))));

		if let CodeSource::Remote( remote ) = &mut config.vm_config.code {
			remote.sha256 = SHA.to_string();
			remote.http_uri.uri = "  ".to_string();
		}
		assert!( matches!( config.validate(), Err( ConfigError::InvalidRemoteSource( _ ))));
	}

	#[test]
	fn rejects_zero_reload_base() {
		let config = PluginConfig {
			failure_policy: Some( "FAIL_RELOAD".to_string() ),
			reload_config: Some( ReloadConfig { backoff: BackoffConfig { base_interval_ms: 0, max_interval_ms: None }}),
			..PluginConfig::default()
		};
		assert!( matches!( config.validate(), Err( ConfigError::InvalidBackoff( _ ))));
	}

	#[test]
	fn rejects_malformed_inline_bytes() {
		let mut config = PluginConfig::default();
		config.vm_config.code = CodeSource::Local( LocalSource::InlineBytes( "zz".to_string() ));
		assert!( matches!( config.validate(), Err( ConfigError::InvalidLocalSource( _ ))));
	}

	#[test]
	fn local_sources_read_or_yield_empty() {
		assert_eq!( LocalSource::InlineBytes( "0061736d".to_string() ).read(), b"\0asm".to_vec() );
		assert_eq!( LocalSource::InlineString( "(module)".to_string() ).read(), b"(module)".to_vec() );
		assert!( LocalSource::Filename( PathBuf::from( "/definitely/not/here.wasm" )).read().is_empty() );

		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join( "plugin.wasm" );
		std::fs::write( &path, b"bytes" ).unwrap();
		assert_eq!( LocalSource::Filename( path ).read(), b"bytes".to_vec() );
	}

	#[test]
	fn configuration_bytes_passes_strings_verbatim() {
		assert!( configuration_bytes( None ).is_empty() );
		assert_eq!( configuration_bytes( Some( &serde_json::json!( "raw" ))), b"raw".to_vec() );
		assert_eq!( configuration_bytes( Some( &serde_json::json!({ "a": 1 }))), br#"{"a":1}"#.to_vec() );
	}

}
