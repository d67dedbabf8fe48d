//! Plugins and the handles binding them to a VM.
//!
//! A [`Plugin`] is a validated configuration. A [`PluginHandle`] pairs a plugin with the
//! VM it runs in on one thread (or on the main thread, for singleton plugins) and owns
//! the plugin's root context in that VM.

use std::sync::Arc ;
use std::time::Duration ;

use crate::config::{ configuration_bytes, CodeSource, ConfigError, FailurePolicy, PluginConfig, VmConfig };
use crate::dispatcher::Dispatcher ;
use crate::vm::{ FailState, VmInstance, VmSettings };



/// A validated plugin configuration, ready to have its code acquired.
#[derive( Debug, Clone )]
pub struct Plugin {
	config: PluginConfig,
	failure_policy: FailurePolicy,
	configuration: Arc<[u8]>,
	vm_settings: VmSettings,
}

impl Plugin {

	/// Validates `config`.
	///
	/// # Errors
	/// Whatever [`PluginConfig::validate`] rejects.
	pub fn new( config: PluginConfig ) -> Result<Self, ConfigError> {
		let failure_policy = config.validate()?;
		let configuration = Arc::from( configuration_bytes( config.configuration.as_ref() ));
		let vm_settings = VmSettings {
			vm_id: config.vm_config.vm_id.clone(),
			configuration: Arc::from( configuration_bytes( config.vm_config.configuration.as_ref() )),
			allow_precompiled: config.vm_config.allow_precompiled,
		};
		Ok( Self { config, failure_policy, configuration, vm_settings })
	}

	#[inline] pub fn name( &self ) -> &str { &self.config.name }
	#[inline] pub fn root_id( &self ) -> &str { &self.config.root_id }
	#[inline] pub fn failure_policy( &self ) -> FailurePolicy { self.failure_policy }
	#[inline] pub fn is_singleton( &self ) -> bool { self.config.singleton }
	#[inline] pub fn config( &self ) -> &PluginConfig { &self.config }
	#[inline] pub fn vm_config( &self ) -> &VmConfig { &self.config.vm_config }
	#[inline] pub fn code_source( &self ) -> &CodeSource { &self.config.vm_config.code }
	#[inline] pub fn vm_settings( &self ) -> &VmSettings { &self.vm_settings }

	/// Serialised plugin configuration handed to `on_configure`.
	#[inline] pub fn configuration( &self ) -> &[u8] { &self.configuration }

}

/// A plugin bound to a VM.
///
/// The VM may be failed; callers decide what a failed handle means through the plugin's
/// [`FailurePolicy`].
pub struct PluginHandle {
	plugin: Arc<Plugin>,
	vm: Arc<VmInstance>,
	root_context_id: u32,
}

impl PluginHandle {

	/// Derives a VM from `base` for the thread owning `dispatcher` and configures the
	/// plugin's root context in it.
	///
	/// Never fails outright: a VM that could not be cloned or configured is recorded in
	/// its fail state.
	pub fn create( base: &Arc<VmInstance>, plugin: Arc<Plugin>, dispatcher: Arc<dyn Dispatcher> ) -> Arc<Self> {
		let vm = VmInstance::derive( base, dispatcher );
		let root_context_id = vm.allocate_context_id();
		if !vm.is_failed() {
			if let Err( err ) = vm.configure( root_context_id, plugin.configuration() ) {
				tracing::warn!( plugin = plugin.name(), error = %err, "unable to configure plugin" );
			}
		}
		Arc::new( Self { plugin, vm, root_context_id })
	}

	#[inline] pub fn plugin( &self ) -> &Arc<Plugin> { &self.plugin }
	#[inline] pub fn vm( &self ) -> &Arc<VmInstance> { &self.vm }
	#[inline] pub fn root_context_id( &self ) -> u32 { self.root_context_id }
	#[inline] pub fn fail_state( &self ) -> FailState { self.vm.fail_state() }
	#[inline] pub fn is_failed( &self ) -> bool { self.vm.is_failed() }

	/// Sets how often the plugin's root context receives `on_tick`. Zero stops ticking.
	pub fn set_tick_period( &self, period: Duration ) { self.vm.set_timer( self.root_context_id, period ); }

}

impl std::fmt::Debug for PluginHandle {
	fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
		f.debug_struct( "PluginHandle" )
			.field( "plugin", &self.plugin.name() )
			.field( "root_context_id", &self.root_context_id )
			.field( "vm", &self.vm )
			.finish()
	}
}
