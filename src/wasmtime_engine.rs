//! [`VmEngine`] backed by wasmtime core modules.

use std::sync::Arc ;
use wasmtime::{ Config, Engine, ExternType, Instance, Linker, Module, Precompiled, Store, Val, ValType };

use crate::engine::{ CompiledProgram, EngineError, Value, VmEngine, VmRuntime };



/// Runtime name wasmtime is selected by in configuration.
pub const WASMTIME_RUNTIME: &str = "wasmtime" ;

/// Compiles and runs core WebAssembly modules with wasmtime.
///
/// Guests get no imports. When constructed with [`with_fuel`]( Self::with_fuel ) every
/// guest call runs under a fresh fuel budget and a guest that exhausts it traps.
#[derive( Clone )]
pub struct WasmtimeEngine {
	engine: Engine,
	fuel_per_call: Option<u64>,
}

impl WasmtimeEngine {

	/// Creates an engine with no execution limits.
	pub fn new() -> Self { Self { engine: Engine::default(), fuel_per_call: None }}

	/// Creates an engine where each guest call may consume at most `fuel` units.
	///
	/// # Errors
	/// Fails if wasmtime rejects the engine configuration.
	pub fn with_fuel( fuel: u64 ) -> Result<Self, EngineError> {
		let mut config = Config::new();
		config.consume_fuel( true );
		let engine = Engine::new( &config )
			.map_err(| err | EngineError::CompilationFailed( err.to_string() ))?;
		Ok( Self { engine, fuel_per_call: Some( fuel )})
	}

	/// The underlying wasmtime engine.
	#[inline] pub fn engine( &self ) -> &Engine { &self.engine }

}

impl Default for WasmtimeEngine {
	fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for WasmtimeEngine {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "WasmtimeEngine" )
			.field( "fuel_per_call", &self.fuel_per_call )
			.finish_non_exhaustive()
	}
}

impl VmEngine for WasmtimeEngine {

	fn name( &self ) -> &str { WASMTIME_RUNTIME }

	fn compile( &self, code: &[u8], allow_precompiled: bool ) -> Result<Arc<dyn CompiledProgram>, EngineError> {
		let module = match allow_precompiled && matches!( Engine::detect_precompiled( code ), Some( Precompiled::Module )) {
			// SAFETY: the artifact is only trusted when the operator opted into precompiled
			// code for this VM, and wasmtime has verified it was produced by a compatible engine.
			true => unsafe { Module::deserialize( &self.engine, code ) },
			false => Module::new( &self.engine, code ),
		}.map_err(| err | EngineError::CompilationFailed( err.to_string() ))?;
		tracing::trace!( exports = module.exports().count(), "compiled wasm module" );
		Ok( Arc::new( WasmtimeProgram {
			linker: Linker::new( &self.engine ),
			engine: self.engine.clone(),
			module,
			fuel_per_call: self.fuel_per_call,
		}))
	}

}

struct WasmtimeProgram {
	engine: Engine,
	module: Module,
	linker: Linker<()>,
	fuel_per_call: Option<u64>,
}

impl CompiledProgram for WasmtimeProgram {
	fn instantiate( &self ) -> Result<Box<dyn VmRuntime>, EngineError> {
		let mut store = Store::new( &self.engine, () );
		let instance = self.linker.instantiate( &mut store, &self.module )
			.map_err(| err | EngineError::InstantiationFailed( err.to_string() ))?;
		Ok( Box::new( WasmtimeRuntime {
			module: self.module.clone(),
			store,
			instance,
			fuel_per_call: self.fuel_per_call,
		}))
	}
}

struct WasmtimeRuntime {
	module: Module,
	store: Store<()>,
	instance: Instance,
	fuel_per_call: Option<u64>,
}

impl VmRuntime for WasmtimeRuntime {

	fn has_function( &self, name: &str ) -> bool {
		matches!( self.module.get_export( name ), Some( ExternType::Func( _ )))
	}

	fn call( &mut self, name: &str, args: &[Value] ) -> Result<Option<Value>, EngineError> {

		let func = self.instance
			.get_func( &mut self.store, name )
			.ok_or_else(|| EngineError::MissingFunction( name.to_string() ))?;
		let ty = func.ty( &self.store );
		let signature_matches = ty.params().len() == args.len()
			&& ty.params().zip( args ).all(|( param, arg )| arg.matches( &param ));
		if !signature_matches { return Err( EngineError::InvalidArgumentList ) }

		let params = args.iter().copied().map( Val::from ).collect::<Vec<_>>();
		let mut results = ty.results().map( placeholder ).collect::<Vec<_>>();

		let fuel_was_set = if let Some( fuel ) = self.fuel_per_call {
			self.store.set_fuel( fuel ).map_err(| err | EngineError::RuntimeException( err.to_string() ))?;
			true
		} else { false };

		let call_result = func.call( &mut self.store, &params, &mut results );

		// Reset fuel to 0 after call to prevent leakage to subsequent calls
		if fuel_was_set { let _ = self.store.set_fuel( 0 ); }

		call_result.map_err(| err | EngineError::RuntimeException( err.to_string() ))?;
		Ok( results.first().and_then( Value::from_val ))

	}

}

fn placeholder( ty: ValType ) -> Val { match ty {
	ValType::I64 => Val::I64( 0 ),
	ValType::F32 => Val::F32( 0 ),
	ValType::F64 => Val::F64( 0 ),
	_ => Val::I32( 0 ),
}}

impl From<Value> for Val {
	fn from( value: Value ) -> Val { match value {
		Value::I32( value ) => Val::I32( value ),
		Value::I64( value ) => Val::I64( value ),
		Value::F32( value ) => Val::F32( value.to_bits() ),
		Value::F64( value ) => Val::F64( value.to_bits() ),
	}}
}

impl Value {

	fn matches( &self, ty: &ValType ) -> bool {
		matches!(( self, ty ),
			( Self::I32( _ ), ValType::I32 )
			| ( Self::I64( _ ), ValType::I64 )
			| ( Self::F32( _ ), ValType::F32 )
			| ( Self::F64( _ ), ValType::F64 )
		)
	}

	fn from_val( val: &Val ) -> Option<Self> { match val {
		Val::I32( value ) => Some( Self::I32( *value )),
		Val::I64( value ) => Some( Self::I64( *value )),
		Val::F32( bits ) => Some( Self::F32( f32::from_bits( *bits ))),
		Val::F64( bits ) => Some( Self::F64( f64::from_bits( *bits ))),
		_ => None,
	}}

}
