#[allow( dead_code )]
mod mock_engine {

    //! A scripted [`VmEngine`] for driving VM lifecycles without real guests.
    //!
    //! The "bytecode" is a whitespace-separated list of tokens:
    //! - `name` exports `name`, which returns `1`;
    //! - `reject:name` exports `name`, which returns `0`;
    //! - `trap:name` exports `name`, which always traps;
    //! - `!compile` makes compilation fail;
    //! - `!instantiate` makes every instantiation fail.
    //!
    //! [`MockControl`] changes behaviour of already-compiled programs at runtime.

    use std::collections::HashSet ;
    use std::sync::{ Arc, Mutex };
    use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
    use wasm_host::{ CompiledProgram, EngineError, Value, VmEngine, VmRuntime };

    pub const MOCK_RUNTIME: &str = "mock" ;

    /// Guest code that starts, configures and ticks successfully.
    pub const HEALTHY: &str = "on_vm_start on_context_create on_configure on_tick on_delete work" ;

    #[derive( Default )]
    pub struct MockControl {
        pub fail_instantiate: AtomicBool,
        pub compiles: AtomicUsize,
        pub instantiations: AtomicUsize,
        traps: Mutex<HashSet<String>>,
        calls: Mutex<Vec<( usize, String, Vec<Value> )>>,
    }

    impl MockControl {

        /// Makes `function` trap in every instance from now on.
        pub fn trap( &self, function: &str ) { self.traps.lock().unwrap().insert( function.to_string() ); }

        /// Stops `function` from trapping.
        pub fn heal( &self, function: &str ) { self.traps.lock().unwrap().remove( function ); }

        /// Every call so far as `( instance, function, args )`.
        pub fn calls( &self ) -> Vec<( usize, String, Vec<Value> )> { self.calls.lock().unwrap().clone() }

        /// Names of the functions called so far, in order.
        pub fn called( &self ) -> Vec<String> { self.calls().into_iter().map(|( _, name, _ )| name ).collect() }

        pub fn count( &self, function: &str ) -> usize { self.calls().iter().filter(|( _, name, _ )| name == function ).count() }

    }

    pub struct MockEngine {
        name: String,
        pub control: Arc<MockControl>,
    }

    impl MockEngine {
        pub fn new() -> Arc<Self> { Self::named( MOCK_RUNTIME ) }
        pub fn named( name: &str ) -> Arc<Self> { Arc::new( Self { name: name.to_string(), control: Arc::default() })}
    }

    impl VmEngine for MockEngine {

        fn name( &self ) -> &str { &self.name }

        fn compile( &self, code: &[u8], _allow_precompiled: bool ) -> Result<Arc<dyn CompiledProgram>, EngineError> {
            self.control.compiles.fetch_add( 1, Ordering::SeqCst );
            let text = std::str::from_utf8( code ).map_err(| err | EngineError::CompilationFailed( err.to_string() ))?;
            let mut program = MockProgram { control: Arc::clone( &self.control ), ..MockProgram::default() };
            for token in text.split_whitespace() {
                match token.split_once( ':' ) {
                    _ if token == "!compile" => return Err( EngineError::CompilationFailed( "scripted".to_string() )),
                    _ if token == "!instantiate" => program.fail_instantiate = true,
                    Some(( "reject", name )) => { program.exports.insert( name.to_string() ); program.rejects.insert( name.to_string() ); },
                    Some(( "trap", name )) => { program.exports.insert( name.to_string() ); program.traps.insert( name.to_string() ); },
                    _ => { program.exports.insert( token.to_string() ); },
                }
            }
            Ok( Arc::new( program ))
        }

    }

    #[derive( Default, Clone )]
    struct MockProgram {
        control: Arc<MockControl>,
        exports: HashSet<String>,
        rejects: HashSet<String>,
        traps: HashSet<String>,
        fail_instantiate: bool,
    }

    impl CompiledProgram for MockProgram {
        fn instantiate( &self ) -> Result<Box<dyn VmRuntime>, EngineError> {
            if self.fail_instantiate || self.control.fail_instantiate.load( Ordering::SeqCst ) {
                return Err( EngineError::InstantiationFailed( "scripted".to_string() ))
            }
            let instance = self.control.instantiations.fetch_add( 1, Ordering::SeqCst );
            Ok( Box::new( MockRuntime { program: self.clone(), instance }))
        }
    }

    struct MockRuntime {
        program: MockProgram,
        instance: usize,
    }

    impl VmRuntime for MockRuntime {

        fn has_function( &self, name: &str ) -> bool { self.program.exports.contains( name ) }

        fn call( &mut self, name: &str, args: &[Value] ) -> Result<Option<Value>, EngineError> {
            if !self.program.exports.contains( name ) { return Err( EngineError::MissingFunction( name.to_string() )) }
            let control = &self.program.control ;
            control.calls.lock().unwrap().push(( self.instance, name.to_string(), args.to_vec() ));
            if self.program.traps.contains( name ) || control.traps.lock().unwrap().contains( name ) {
                return Err( EngineError::RuntimeException( format!( "{} trapped", name )))
            }
            Ok( Some( Value::I32( match self.program.rejects.contains( name ) { true => 0, false => 1 })))
        }

    }

}
