//! The VM engine capability the host is written against.
//!
//! The host never depends on a concrete engine. A [`VmEngine`] compiles bytecode into a
//! [`CompiledProgram`], which is immutable and shared by every VM built from it.
//! Instantiating a program yields a [`VmRuntime`] with its own independent execution
//! state; this is how per-thread VMs are cloned from a base.

use std::sync::Arc ;
use thiserror::Error ;



/// A scalar passed across the guest boundary.
#[derive( Debug, Clone, Copy, PartialEq )]
pub enum Value {
	I32( i32 ),
	I64( i64 ),
	F32( f32 ),
	F64( f64 ),
}

impl Value {
	/// The value as an `i32`, if it is one.
	pub fn as_i32( &self ) -> Option<i32> { match self {
		Self::I32( value ) => Some( *value ),
		_ => None,
	}}
}

/// Errors reported by an engine.
#[derive( Error, Debug, Clone )]
pub enum EngineError {
	/// The bytecode could not be compiled.
	#[error( "Compilation Failed: {0}" )] CompilationFailed( String ),
	/// A compiled program could not be instantiated.
	#[error( "Instantiation Failed: {0}" )] InstantiationFailed( String ),
	/// The guest does not export the requested function.
	#[error( "Missing Function: {0}" )] MissingFunction( String ),
	/// The provided arguments don't match the function signature.
	#[error( "Invalid Argument List" )] InvalidArgumentList,
	/// The guest trapped while executing.
	#[error( "Runtime Exception: {0}" )] RuntimeException( String ),
}

/// Compiles bytecode into shareable programs.
pub trait VmEngine: Send + Sync {
	/// Name the engine is selected by in configuration.
	fn name( &self ) -> &str ;

	/// Compiles `code`. `allow_precompiled` permits loading an engine-specific
	/// precompiled artifact instead of portable bytecode.
	fn compile( &self, code: &[u8], allow_precompiled: bool ) -> Result<Arc<dyn CompiledProgram>, EngineError> ;
}

/// An immutable compiled program shared by a base VM and all VMs derived from it.
pub trait CompiledProgram: Send + Sync {
	/// Creates fresh execution state for this program.
	fn instantiate( &self ) -> Result<Box<dyn VmRuntime>, EngineError> ;
}

/// Mutable execution state of one VM.
pub trait VmRuntime: Send {
	/// Whether the guest exports a function called `name`.
	fn has_function( &self, name: &str ) -> bool ;

	/// Calls the exported function `name`, returning its first result if it has one.
	fn call( &mut self, name: &str, args: &[Value] ) -> Result<Option<Value>, EngineError> ;
}
