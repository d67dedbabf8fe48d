use wasm_host::{ FailState, Value, VmError };
use crate::fixtures::{ base_vm, dispatcher, lifecycle };
use crate::mock_engine::{ MockEngine, HEALTHY };

fn fail_state_of( code: &str ) -> FailState {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    base_vm( &*engine, code.as_bytes(), &dispatcher, &lifecycle() ).fail_state()
}

#[test]
fn healthy_code_starts() {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    let vm = base_vm( &*engine, HEALTHY.as_bytes(), &dispatcher, &lifecycle() );
    assert_eq!( vm.fail_state(), FailState::Ok );
    assert!( vm.is_base() );
    assert_eq!( vm.engine_name(), "mock" );
    // on_vm_start receives the size of the VM configuration
    assert_eq!( engine.control.calls(), vec![( 0, "on_vm_start".to_string(), vec![ Value::I32( 2 )])]);
}

#[test]
fn empty_code_is_unable_to_create_vm() {
    assert_eq!( fail_state_of( "" ), FailState::UnableToCreateVm );
}

#[test]
fn compile_failure_is_unable_to_initialize_code() {
    assert_eq!( fail_state_of( "on_vm_start !compile" ), FailState::UnableToInitializeCode );
}

#[test]
fn instantiate_failure_is_unable_to_initialize_code() {
    assert_eq!( fail_state_of( "on_vm_start !instantiate" ), FailState::UnableToInitializeCode );
}

#[test]
fn missing_on_vm_start_is_missing_function() {
    assert_eq!( fail_state_of( "on_configure on_tick" ), FailState::MissingFunction );
}

#[test]
fn rejected_start_is_start_failed() {
    assert_eq!( fail_state_of( "reject:on_vm_start" ), FailState::StartFailed );
}

#[test]
fn trapping_start_is_start_failed() {
    assert_eq!( fail_state_of( "trap:on_vm_start" ), FailState::StartFailed );
}

#[test]
fn failed_vm_refuses_calls() {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    let vm = base_vm( &*engine, b"reject:on_vm_start work", &dispatcher, &lifecycle() );
    match vm.call( "work", &[] ) {
        Err( VmError::Failed( FailState::StartFailed )) => {}
        other => panic!( "Expected Failed( StartFailed ), found: {:#?}", other ),
    }
    assert_eq!( engine.control.count( "work" ), 0 );
}

#[test]
fn only_the_first_failure_is_kept() {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    let vm = base_vm( &*engine, HEALTHY.as_bytes(), &dispatcher, &lifecycle() );
    vm.fail( FailState::Ok );
    assert!( !vm.is_failed() );
    vm.fail( FailState::ConfigureFailed );
    vm.fail( FailState::RuntimeError );
    assert_eq!( vm.fail_state(), FailState::ConfigureFailed );
}

#[test]
fn trap_marks_runtime_error() {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    let vm = base_vm( &*engine, HEALTHY.as_bytes(), &dispatcher, &lifecycle() );
    assert_eq!( vm.call( "work", &[] ), Ok( Some( Value::I32( 1 ))));

    engine.control.trap( "work" );
    match vm.call( "work", &[] ) {
        Err( VmError::RuntimeException( _ )) => {}
        other => panic!( "Expected RuntimeException, found: {:#?}", other ),
    }
    assert_eq!( vm.fail_state(), FailState::RuntimeError );
}

#[test]
fn missing_export_does_not_fail_the_vm() {
    let engine = MockEngine::new();
    let ( _, dispatcher ) = dispatcher();
    let vm = base_vm( &*engine, HEALTHY.as_bytes(), &dispatcher, &lifecycle() );
    match vm.call( "absent", &[] ) {
        Err( VmError::MissingFunction( name )) => assert_eq!( name, "absent" ),
        other => panic!( "Expected MissingFunction, found: {:#?}", other ),
    }
    assert!( !vm.is_failed() );
}
