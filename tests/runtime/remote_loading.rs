use wasm_host::{ CreateError, InitManager, PluginRuntime };
use tracing_test::traced_test ;
use crate::fixtures::{ dispatcher, mock_host_with_fetcher, remote_plugin };
use crate::mock_engine::HEALTHY ;
use crate::scripted_fetcher::ScriptedFetcher ;

const URI: &str = "https://plugins.internal/remote.wasm" ;

#[test]
fn remote_plugin_loads_in_the_background() {
    let fetcher = ScriptedFetcher::new();
    let ( host, _ ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();
    let init_manager = InitManager::new();

    let runtime = PluginRuntime::new( &host, remote_plugin( "remote", URI, HEALTHY.as_bytes(), false ), dispatcher, Some( &init_manager ))
        .expect( "failed to create runtime" );
    assert!( !runtime.is_loaded() );
    assert!( !init_manager.is_ready() );

    // Requests before the code arrives are denied under the default policy
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );

    fetcher.respond( HEALTHY.as_bytes() );
    simulated.run_posted();
    assert!( runtime.is_loaded() );
    assert!( init_manager.is_ready() );
    assert!( !runtime.create_context().expect( "expected a context" ).is_denied() );
}

#[test]
fn nack_on_cache_miss_rejects_until_cached() {
    let fetcher = ScriptedFetcher::new();
    let ( host, _ ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();
    let config = remote_plugin( "lazy", URI, HEALTHY.as_bytes(), true );

    match PluginRuntime::new( &host, config.clone(), dispatcher.clone(), None ) {
        Err( CreateError::Unavailable( _ )) => {}
        other => panic!( "Expected Unavailable, found: {:#?}", other ),
    }
    fetcher.respond( HEALTHY.as_bytes() );
    simulated.run_posted();

    let runtime = PluginRuntime::new( &host, config, dispatcher, None ).expect( "failed to create runtime" );
    assert!( runtime.is_loaded() );
    assert!( runtime.base_vm().is_some() );
    assert_eq!( fetcher.fetch_count(), 1 );
}

#[test]
fn dropped_runtime_ignores_late_code() {
    let fetcher = ScriptedFetcher::new();
    let ( host, engine ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();

    let runtime = PluginRuntime::new( &host, remote_plugin( "gone", URI, HEALTHY.as_bytes(), false ), dispatcher, None )
        .expect( "failed to create runtime" );
    drop( runtime );

    fetcher.respond( HEALTHY.as_bytes() );
    simulated.run_posted();
    // The base vm is still created for the cache but nobody keeps it
    assert_eq!( host.base_vm_count(), 0 );
    assert_eq!( engine.control.compiles.load( std::sync::atomic::Ordering::SeqCst ), 1 );
}

#[traced_test]
#[test]
fn failed_fetch_under_fail_closed_is_logged() {
    let fetcher = ScriptedFetcher::new();
    let ( host, _ ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();

    let runtime = PluginRuntime::new( &host, remote_plugin( "broken", URI, HEALTHY.as_bytes(), false ), dispatcher, None )
        .expect( "failed to create runtime" );
    fetcher.fail();
    simulated.run_posted();

    assert!( runtime.is_loaded() );
    assert!( runtime.base_vm().is_none() );
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );
    assert!( logs_contain( "failed to load remote code (fetch failed)" ));
    assert!( logs_contain( "plugin configured to fail closed failed to load" ));
}
