//! Per-request execution contexts.
//!
//! A context either runs guest code in a healthy VM or, when the plugin failed and its
//! failure policy keeps it in the request path, refuses every call. A refusing context
//! never executes guest code.

use std::sync::Arc ;
use thiserror::Error ;

use crate::engine::Value ;
use crate::plugin::PluginHandle ;
use crate::vm::{ guest_id, VmError, VmInstance, ON_CONTEXT_CREATE, ON_DELETE };



/// Errors from calling through an execution context.
#[derive( Error, Debug, Clone, PartialEq )]
pub enum ContextError {
	/// The plugin is failed or absent and the request must be rejected.
	#[error( "Denied" )] Denied,
	/// The call reached the VM and failed there.
	#[error( "VM Error: {0}" )] Vm( #[from] VmError ),
}

/// A request context bound to a plugin handle.
pub struct ExecutionContext {
	id: u32,
	handle: Option<Arc<PluginHandle>>,
	live: bool,
}

impl ExecutionContext {

	/// Creates a context in `handle`'s VM, notifying the guest.
	///
	/// Falls back to a denying context if the VM is failed.
	pub fn new( handle: Arc<PluginHandle> ) -> Self {
		if handle.is_failed() { return Self::deny( Some( handle )) }
		let vm = handle.vm();
		let id = vm.allocate_context_id();
		if vm.has_function( ON_CONTEXT_CREATE ) {
			if let Err( err ) = vm.call( ON_CONTEXT_CREATE, &[ guest_id( id ), guest_id( handle.root_context_id() )]) {
				tracing::debug!( plugin = handle.plugin().name(), context_id = id, error = %err, "context creation failed" );
				return Self { id, handle: Some( handle ), live: false }
			}
		}
		Self { id, handle: Some( handle ), live: true }
	}

	/// Creates a context that refuses every call.
	pub fn deny( handle: Option<Arc<PluginHandle>> ) -> Self { Self { id: 0, handle, live: false }}

	/// Calls an exported guest function in this context's VM.
	///
	/// # Errors
	/// [`ContextError::Denied`] for a denying context or a VM that has failed since the
	/// context was created, otherwise whatever the VM reports.
	pub fn call( &self, name: &str, args: &[Value] ) -> Result<Option<Value>, ContextError> {
		let vm = self.live_vm().ok_or( ContextError::Denied )?;
		vm.call( name, args ).map_err( ContextError::from )
	}

	/// Whether calls are refused.
	pub fn is_denied( &self ) -> bool { self.live_vm().is_none() }

	/// Context id inside the guest; zero for a denying context.
	#[inline] pub fn id( &self ) -> u32 { self.id }

	/// The handle this context was created from, if any.
	#[inline] pub fn handle( &self ) -> Option<&Arc<PluginHandle>> { self.handle.as_ref() }

	/// Root context this context belongs to.
	pub fn root_context_id( &self ) -> Option<u32> { self.handle.as_ref().map(| handle | handle.root_context_id() )}

	fn live_vm( &self ) -> Option<&Arc<VmInstance>> {
		match self.live {
			true => self.handle.as_ref().map(| handle | handle.vm() ).filter(| vm | !vm.is_failed() ),
			false => None,
		}
	}

}

impl Drop for ExecutionContext {
	fn drop( &mut self ) {
		let Some( vm ) = self.live_vm() else { return };
		if !vm.has_function( ON_DELETE ) { return }
		if let Err( err ) = vm.call( ON_DELETE, &[ guest_id( self.id )]) {
			tracing::debug!( context_id = self.id, error = %err, "context deletion failed" );
		}
	}
}

impl std::fmt::Debug for ExecutionContext {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "ExecutionContext" )
			.field( "id", &self.id )
			.field( "denied", &self.is_denied() )
			.field( "handle", &self.handle )
			.finish()
	}
}
