use std::io::Write ;
use wasm_host::{ CodeSource, LocalSource, Resolution, VmConfig };
use crate::fixtures::{ dispatcher, mock_host, recorder };

fn local( source: LocalSource ) -> VmConfig {
    VmConfig { runtime: "mock".to_string(), code: CodeSource::Local( source ), ..VmConfig::default() }
}

#[test]
fn inline_string_resolves_synchronously() {
    let ( host, _ ) = mock_host();
    let ( simulated, dispatcher ) = dispatcher();

    let ( received, completion ) = recorder();
    let resolution = host.pipeline().resolve( &local( LocalSource::InlineString( "on_vm_start".into() )), &dispatcher, None, completion );
    assert_eq!( resolution, Resolution::Completed );
    assert_eq!( *received.lock().unwrap(), vec![ b"on_vm_start".to_vec() ]);
    assert_eq!( simulated.pending_tasks(), 0 );
    assert!( host.code_cache().is_empty() );
}

#[test]
fn inline_bytes_are_hex() {
    let ( host, _ ) = mock_host();
    let ( _, dispatcher ) = dispatcher();

    let ( received, completion ) = recorder();
    host.pipeline().resolve( &local( LocalSource::InlineBytes( hex::encode( b"\0asm" ))), &dispatcher, None, completion );
    assert_eq!( *received.lock().unwrap(), vec![ b"\0asm".to_vec() ]);
}

#[test]
fn filename_is_read_from_disk() {
    let ( host, _ ) = mock_host();
    let ( _, dispatcher ) = dispatcher();
    let mut file = tempfile::NamedTempFile::new().expect( "failed to create temp file" );
    file.write_all( b"on_vm_start on_tick" ).expect( "failed to write temp file" );

    let ( received, completion ) = recorder();
    host.pipeline().resolve( &local( LocalSource::Filename( file.path().to_path_buf() )), &dispatcher, None, completion );
    assert_eq!( *received.lock().unwrap(), vec![ b"on_vm_start on_tick".to_vec() ]);
}

#[test]
fn unreadable_file_resolves_empty() {
    let ( host, _ ) = mock_host();
    let ( _, dispatcher ) = dispatcher();
    let directory = tempfile::tempdir().expect( "failed to create temp dir" );

    let ( received, completion ) = recorder();
    let missing = directory.path().join( "missing.wasm" );
    assert_eq!( host.pipeline().resolve( &local( LocalSource::Filename( missing )), &dispatcher, None, completion ), Resolution::Completed );
    assert_eq!( *received.lock().unwrap(), vec![ Vec::<u8>::new() ]);
}
