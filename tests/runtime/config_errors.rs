use std::sync::atomic::Ordering ;
use wasm_host::{ BackoffConfig, CodeSource, ConfigError, CreateError, FailurePolicy, LocalSource, PluginConfig, PluginRuntime, ReloadConfig };
use crate::fixtures::{ dispatcher, local_plugin, mock_host, remote_plugin, with_policy };
use crate::mock_engine::HEALTHY ;

fn create_error( config: PluginConfig ) -> ConfigError {
    let ( host, engine ) = mock_host();
    let ( _, dispatcher ) = dispatcher();
    let error = match PluginRuntime::new( &host, config, dispatcher, None ) {
        Err( CreateError::Config( error )) => error,
        other => panic!( "Expected a configuration error, found: {:#?}", other ),
    };
    assert_eq!( engine.control.compiles.load( Ordering::SeqCst ), 0, "nothing may be compiled for a rejected configuration" );
    error
}

#[test]
fn fail_open_conflicts_with_an_explicit_policy() {
    let mut config = with_policy( local_plugin( "conflict", HEALTHY ), "FAIL_RELOAD" );
    config.fail_open = true ;
    assert_eq!( create_error( config ), ConfigError::ConflictingFailurePolicy );
}

#[test]
fn unspecified_policy_defers_to_the_legacy_flag() {
    let mut config = with_policy( local_plugin( "legacy", HEALTHY ), "UNSPECIFIED" );
    config.fail_open = true ;
    assert_eq!( config.validate(), Ok( FailurePolicy::FailOpen ));
}

#[test]
fn unknown_policy_is_rejected() {
    let config = with_policy( local_plugin( "typo", HEALTHY ), "FAIL_SOMETIMES" );
    assert_eq!( create_error( config ), ConfigError::UnknownFailurePolicy( "FAIL_SOMETIMES".to_string() ));
}

#[test]
fn unknown_runtime_lists_registered_engines() {
    let mut config = local_plugin( "v8", HEALTHY );
    config.vm_config.runtime = "v8".to_string();
    match create_error( config ) {
        ConfigError::UnknownRuntime( message ) => {
            assert!( message.starts_with( "v8" ));
            assert!( message.contains( "mock" ));
        },
        other => panic!( "Expected UnknownRuntime, found: {:#?}", other ),
    }
}

#[test]
fn malformed_sha256_is_rejected() {
    let mut config = remote_plugin( "remote", "https://plugins.internal/a.wasm", HEALTHY.as_bytes(), false );
    if let CodeSource::Remote( remote ) = &mut config.vm_config.code {
        remote.sha256 = "not-a-digest".to_string();
    }
    assert!( matches!( create_error( config ), ConfigError::InvalidRemoteSource( _ )));
}

#[test]
fn empty_uri_is_rejected() {
    let mut config = remote_plugin( "remote", "https://plugins.internal/a.wasm", HEALTHY.as_bytes(), false );
    if let CodeSource::Remote( remote ) = &mut config.vm_config.code {
        remote.http_uri.uri = " ".to_string();
    }
    assert!( matches!( create_error( config ), ConfigError::InvalidRemoteSource( _ )));
}

#[test]
fn invalid_inline_hex_is_rejected() {
    let mut config = local_plugin( "hex", HEALTHY );
    config.vm_config.code = CodeSource::Local( LocalSource::InlineBytes( "0xzz".to_string() ));
    assert!( matches!( create_error( config ), ConfigError::InvalidLocalSource( _ )));
}

#[test]
fn zero_reload_interval_is_rejected() {
    let mut config = with_policy( local_plugin( "reload", HEALTHY ), "FAIL_RELOAD" );
    config.reload_config = Some( ReloadConfig { backoff: BackoffConfig { base_interval_ms: 0, max_interval_ms: None }});
    assert!( matches!( create_error( config ), ConfigError::InvalidBackoff( _ )));
}

#[test]
fn reload_config_is_ignored_by_other_policies() {
    let mut config = local_plugin( "closed", HEALTHY );
    config.reload_config = Some( ReloadConfig { backoff: BackoffConfig { base_interval_ms: 0, max_interval_ms: None }});
    assert_eq!( config.validate(), Ok( FailurePolicy::FailClosed ));
}

#[test]
fn json_configuration_is_parsed() {
    let config = PluginConfig::from_json( r#"{
        "name": "authz",
        "root_id": "authz-root",
        "configuration": { "deny": [ "/admin" ] },
        "failure_policy": "FAIL_RELOAD",
        "reload_config": { "backoff": { "base_interval_ms": 250 } },
        "vm_config": {
            "vm_id": "authz-vm",
            "runtime": "mock",
            "code": { "remote": {
                "http_uri": { "uri": "https://plugins.internal/authz.wasm", "cluster": "plugins" },
                "sha256": "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
                "retry_policy": { "num_retries": 3 }
            }}
        }
    }"# ).expect( "failed to parse configuration" );

    assert_eq!( config.validate(), Ok( FailurePolicy::FailReload ));
    assert_eq!( config.reload_backoff(), BackoffConfig { base_interval_ms: 250, max_interval_ms: None });
    assert_eq!( config.reload_backoff().max_interval_ms(), 2500 );
    match &config.vm_config.code {
        CodeSource::Remote( remote ) => {
            assert_eq!( remote.http_uri.timeout_ms, 1000 );
            assert_eq!( remote.retry_policy.num_retries, 3 );
            assert_eq!( remote.retry_policy.backoff, BackoffConfig::default() );
            assert_eq!( remote.cache_key(), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855" );
        },
        other => panic!( "Expected a remote source, found: {:#?}", other ),
    }
}

#[test]
fn malformed_json_is_rejected() {
    match PluginConfig::from_json( r#"{ "name": 42 }"# ) {
        Err( ConfigError::Malformed( _ )) => {}
        other => panic!( "Expected Malformed, found: {:#?}", other ),
    }
}
