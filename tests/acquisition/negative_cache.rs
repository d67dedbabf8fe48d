use std::time::Duration ;
use wasm_host::{ Resolution, VmEvent };
use crate::fixtures::{ dispatcher, mock_host_with_fetcher, recorder, remote_vm };
use crate::scripted_fetcher::ScriptedFetcher ;

const CODE: &[u8] = b"on_vm_start" ;
const URI: &str = "https://plugins.internal/flaky.wasm" ;

#[test]
fn failure_is_served_from_cache_for_ten_seconds() {
    let fetcher = ScriptedFetcher::new();
    let ( host, _ ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();
    let vm_config = remote_vm( URI, CODE, false );

    let ( first, completion ) = recorder();
    host.pipeline().resolve( &vm_config, &dispatcher, None, completion );
    fetcher.fail();
    simulated.run_posted();
    assert_eq!( *first.lock().unwrap(), vec![ Vec::<u8>::new() ]);

    simulated.advance( Duration::from_secs( 5 ));
    let ( second, completion ) = recorder();
    assert_eq!( host.pipeline().resolve( &vm_config, &dispatcher, None, completion ), Resolution::Completed );
    assert_eq!( *second.lock().unwrap(), vec![ Vec::<u8>::new() ]);
    assert_eq!( fetcher.fetch_count(), 1 );
    assert_eq!( host.stats().counter( VmEvent::RemoteLoadCacheNegativeHit ), 1 );

    simulated.advance( Duration::from_secs( 10 ));
    let ( third, completion ) = recorder();
    assert_eq!( host.pipeline().resolve( &vm_config, &dispatcher, None, completion ), Resolution::Pending );
    assert_eq!( fetcher.fetch_count(), 2 );

    fetcher.respond( CODE );
    simulated.run_posted();
    assert_eq!( *third.lock().unwrap(), vec![ CODE.to_vec() ]);
    assert_eq!( host.stats().counter( VmEvent::RemoteLoadCacheFetchFailure ), 1 );
    assert_eq!( host.stats().counter( VmEvent::RemoteLoadCacheFetchSuccess ), 1 );
}

#[test]
fn unused_entries_are_evicted_after_a_day() {
    let fetcher = ScriptedFetcher::new();
    let ( host, _ ) = mock_host_with_fetcher( fetcher.clone() );
    let ( simulated, dispatcher ) = dispatcher();

    let ( _, completion ) = recorder();
    host.pipeline().resolve( &remote_vm( URI, CODE, false ), &dispatcher, None, completion );
    fetcher.respond( CODE );
    simulated.run_posted();
    assert_eq!( host.code_cache().len(), 1 );

    simulated.advance( Duration::from_secs( 24 * 60 * 60 ));
    let other = b"on_vm_start on_tick" ;
    let ( _, completion ) = recorder();
    host.pipeline().resolve( &remote_vm( "https://plugins.internal/other.wasm", other, false ), &dispatcher, None, completion );

    // Only the in-progress entry for the new key survives
    assert_eq!( host.code_cache().len(), 1 );
    assert_eq!( host.stats().remote_cache_entries(), 1 );
}
