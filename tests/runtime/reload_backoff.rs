use std::sync::Arc ;
use std::time::Duration ;
use wasm_host::{ BackoffConfig, Dispatcher, FailState, Host, PluginConfig, PluginRuntime, RandomGenerator, ReloadConfig, VmEvent };
use crate::fixtures::{ dispatcher, local_plugin, mock_host, with_policy };
use crate::mock_engine::{ MockEngine, HEALTHY };

struct FixedRandom( u64 );

impl RandomGenerator for FixedRandom {
    fn random( &self ) -> u64 { self.0 }
}

fn reloading( base_interval_ms: u64 ) -> PluginConfig {
    let mut config = with_policy( local_plugin( "reload", HEALTHY ), "FAIL_RELOAD" );
    config.reload_config = Some( ReloadConfig { backoff: BackoffConfig { base_interval_ms, max_interval_ms: None }});
    config
}

#[test]
fn runtime_error_is_reloaded_after_backoff() {
    let ( host, engine ) = mock_host();
    let ( simulated, dispatcher ) = dispatcher();
    let start = simulated.monotonic_time();
    let runtime = PluginRuntime::new( &host, reloading( 1000 ), dispatcher, None ).expect( "failed to create runtime" );

    let context = runtime.create_context().expect( "expected a context" );
    let original = runtime.handle_snapshot().expect( "expected a handle" );
    engine.control.trap( "work" );
    assert!( context.call( "work", &[] ).is_err() );
    drop( context );
    engine.control.heal( "work" );

    simulated.advance( Duration::from_millis( 500 ));
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadBackoff ), 1 );
    assert_eq!( runtime.last_load(), Some( start ));

    simulated.advance( Duration::from_millis( 700 ));
    let context = runtime.create_context().expect( "expected a context" );
    assert!( !context.is_denied() );
    assert!( context.call( "work", &[] ).is_ok() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadSuccess ), 1 );
    assert_eq!( runtime.last_load(), Some( start + Duration::from_millis( 1200 )));

    let reloaded = runtime.handle_snapshot().expect( "expected a handle" );
    assert!( !std::sync::Arc::ptr_eq( &original, &reloaded ));
    assert!( reloaded.vm().shares_program_with( original.vm() ));
    assert_eq!( original.fail_state(), FailState::RuntimeError );
}

#[test]
fn failed_reload_keeps_the_old_handle_and_backs_off_further() {
    let ( host, engine ) = mock_host();
    let ( simulated, dispatcher ) = dispatcher();
    let start = simulated.monotonic_time();
    let runtime = PluginRuntime::new( &host, reloading( 1000 ), dispatcher, None ).expect( "failed to create runtime" );

    let context = runtime.create_context().expect( "expected a context" );
    engine.control.trap( "work" );
    assert!( context.call( "work", &[] ).is_err() );
    drop( context );
    let original = runtime.handle_snapshot().expect( "expected a handle" );

    // Fresh VMs fail to start for now
    engine.control.trap( "on_vm_start" );
    simulated.advance( Duration::from_millis( 1200 ));
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadFailure ), 1 );
    assert_eq!( runtime.last_load(), Some( start + Duration::from_millis( 1200 )));
    assert!( std::sync::Arc::ptr_eq( &original, &runtime.handle_snapshot().expect( "expected a handle" )));

    // The second attempt waits twice the base interval
    engine.control.heal( "on_vm_start" );
    engine.control.heal( "work" );
    simulated.advance( Duration::from_millis( 1999 ));
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadBackoff ), 1 );

    simulated.advance( Duration::from_millis( 1 ));
    assert!( !runtime.create_context().expect( "expected a context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadSuccess ), 1 );
}

#[test]
fn successful_reload_resets_the_backoff() {
    let ( host, engine ) = mock_host();
    let ( simulated, dispatcher ) = dispatcher();
    let runtime = PluginRuntime::new( &host, reloading( 100 ), dispatcher, None ).expect( "failed to create runtime" );

    for _ in 0..3 {
        let context = runtime.create_context().expect( "expected a context" );
        assert!( !context.is_denied() );
        engine.control.trap( "work" );
        assert!( context.call( "work", &[] ).is_err() );
        drop( context );
        engine.control.heal( "work" );

        // Always the base interval, never a doubled one
        simulated.advance( Duration::from_millis( 100 ));
    }
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadSuccess ), 2 );
    assert!( !runtime.create_context().expect( "expected a context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadSuccess ), 3 );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadBackoff ), 0 );
}

#[test]
fn jitter_delays_the_first_reload_past_the_base_interval() {
    let engine = MockEngine::new();
    let host = Host::builder().with_engine( engine.clone() ).with_random( Arc::new( FixedRandom( 400 ))).build();
    let ( simulated, dispatcher ) = dispatcher();
    let runtime = PluginRuntime::new( &host, reloading( 1000 ), dispatcher, None ).expect( "failed to create runtime" );

    let context = runtime.create_context().expect( "expected a context" );
    engine.control.trap( "work" );
    assert!( context.call( "work", &[] ).is_err() );
    drop( context );
    engine.control.heal( "work" );

    simulated.advance( Duration::from_millis( 1200 ));
    assert!( runtime.create_context().expect( "expected a denying context" ).is_denied() );

    simulated.advance( Duration::from_millis( 200 ));
    assert!( !runtime.create_context().expect( "expected a context" ).is_denied() );
    assert_eq!( runtime.stats().counter( VmEvent::VmReloadSuccess ), 1 );
}
