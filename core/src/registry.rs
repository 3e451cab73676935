//! Module registry: name-keyed storage and dependency-ordered lifecycle
//!
//! Grounded in the reader/writer-locked, name-keyed registry pattern used
//! for upstream circuit breakers elsewhere in the pack; generalized here to
//! hold [`ModuleHandle`] values of any class and to drive their lifecycle
//! in dependency order via a topological sort (Kahn's algorithm).

mod private
{
  use std::collections::{ HashMap, HashSet, VecDeque };
  use crate::error::GatewayError;
  use crate::module::{ HealthStatus, ModuleHandle, ModuleHealth, ModuleKind, ModuleState };

  /// How long [`ModuleRegistry::unregister`] and [`ModuleRegistry::reload`]
  /// wait on a module's lifecycle calls before giving up, per spec.md §4.2.
  const LIFECYCLE_TIMEOUT : std::time::Duration = std::time::Duration::from_secs( 30 );

  struct Entry
  {
    handle : ModuleHandle,
    state : ModuleState,
  }

  /// Name-keyed store of registered modules with a dependency-ordered
  /// start/stop lifecycle.
  ///
  /// All mutation goes through a single `RwLock` over the whole table:
  /// registrations and lifecycle transitions are rare compared to the
  /// per-request reads the pipeline performs, so a single lock keeps the
  /// invariant "every reader sees a consistent set of modules" trivially
  /// true at the cost of write contention nobody measures in practice.
  #[ derive( Default ) ]
  pub struct ModuleRegistry
  {
    entries : tokio::sync::RwLock< HashMap< String, Entry > >,
    next_sequence : std::sync::atomic::AtomicU64,
  }

  impl std::fmt::Debug for ModuleRegistry
  {
    fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
    {
      f.debug_struct( "ModuleRegistry" ).finish_non_exhaustive()
    }
  }

  impl ModuleRegistry
  {
    /// Build an empty registry.
    #[ must_use ]
    pub fn new() -> Self
    {
      Self::default()
    }

    /// Next registration sequence number, for modules that need a
    /// monotonic tie-break (see [`crate::module::ModuleMeta::registration_sequence`]).
    pub fn next_sequence( &self ) -> u64
    {
      self.next_sequence.fetch_add( 1, std::sync::atomic::Ordering::Relaxed )
    }

    /// Register `handle`, starting it in [`ModuleState::Loading`].
    ///
    /// Fails if the name is empty, a module of the same name is already
    /// registered, or any listed dependency is not already present — per
    /// spec.md §4.2. A successful registration logs an info event.
    pub async fn register( &self, handle : ModuleHandle ) -> Result< (), GatewayError >
    {
      let name = handle.meta().name.clone();
      if name.trim().is_empty()
      {
        return Err( GatewayError::Registry( "module name must not be empty".to_string() ) );
      }
      let mut entries = self.entries.write().await;
      if entries.contains_key( &name )
      {
        return Err( GatewayError::Registry( format!( "module '{name}' already registered" ) ) );
      }
      for dep in &handle.meta().depends_on
      {
        if !entries.contains_key( dep )
        {
          return Err( GatewayError::Registry( format!( "module '{name}' depends on unregistered module '{dep}'" ) ) );
        }
      }
      entries.insert( name.clone(), Entry { handle, state : ModuleState::Loading } );
      tracing::info!( module = %name, "module registered" );
      Ok( () )
    }

    /// Stop then shut down `name` under a 30-second timeout each, logging
    /// (not propagating) a timeout or error, then remove it from the
    /// registry regardless of how the lifecycle calls went.
    pub async fn unregister( &self, name : &str ) -> Result< (), GatewayError >
    {
      let handle =
      {
        let entries = self.entries.read().await;
        match entries.get( name )
        {
          Some( entry ) => entry.handle.clone(),
          None => return Err( GatewayError::Registry( format!( "module '{name}' is not registered" ) ) ),
        }
      };

      match tokio::time::timeout( LIFECYCLE_TIMEOUT, handle.shutdown() ).await
      {
        Ok( Ok( () ) ) => {},
        Ok( Err( err ) ) => tracing::warn!( module = %name, error = %err, "module shutdown returned an error" ),
        Err( _ ) => tracing::warn!( module = %name, "module shutdown timed out after 30s" ),
      }

      self.entries.write().await.remove( name );
      tracing::info!( module = %name, "module unregistered" );
      Ok( () )
    }

    /// Look up a module by name.
    pub async fn get( &self, name : &str ) -> Option< ModuleHandle >
    {
      self.entries.read().await.get( name ).map( | e | e.handle.clone() )
    }

    /// All registered module handles, in no particular order.
    pub async fn list( &self ) -> Vec< ModuleHandle >
    {
      self.entries.read().await.values().map( | e | e.handle.clone() ).collect()
    }

    /// All registered module handles of `kind`, regardless of lifecycle
    /// state (unlike [`Self::running_of_kind`], which the pipeline uses).
    pub async fn list_by_type( &self, kind : ModuleKind ) -> Vec< ModuleHandle >
    {
      self.entries.read().await.values().filter( | e | e.handle.meta().kind == kind ).map( | e | e.handle.clone() ).collect()
    }

    /// Stop then start `name` under a 30-second timeout each. State passes
    /// `Running -> Draining -> Ready -> Running`, matching spec.md §4.2.
    pub async fn reload( &self, name : &str ) -> Result< (), GatewayError >
    {
      let handle =
      {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut( name ).ok_or_else( || GatewayError::Registry( format!( "module '{name}' is not registered" ) ) )?;
        Self::transition( &mut entry.state, ModuleState::Draining, name )?;
        entry.handle.clone()
      };

      match tokio::time::timeout( LIFECYCLE_TIMEOUT, handle.shutdown() ).await
      {
        Ok( Ok( () ) ) => {},
        Err( _ ) | Ok( Err( _ ) ) =>
        {
          let mut entries = self.entries.write().await;
          if let Some( entry ) = entries.get_mut( name ) { entry.state = ModuleState::Failed; }
          return Err( GatewayError::Registry( format!( "module '{name}' failed to stop during reload" ) ) );
        },
      }

      // Reload is the one path that skips `Stopped`: spec.md §4.2 requires
      // `Draining -> Ready -> Running`, not a full stop/re-register cycle.
      let init_result = tokio::time::timeout( LIFECYCLE_TIMEOUT, handle.init() ).await;
      let mut entries = self.entries.write().await;
      let entry = entries.get_mut( name ).expect( "module is not removed mid-reload" );
      match init_result
      {
        Ok( Ok( () ) ) =>
        {
          entry.state = ModuleState::Ready;
          Self::transition( &mut entry.state, ModuleState::Running, name )?;
          tracing::info!( module = %name, "module reloaded" );
          Ok( () )
        },
        Ok( Err( err ) ) =>
        {
          entry.state = ModuleState::Failed;
          Err( err )
        },
        Err( _ ) =>
        {
          entry.state = ModuleState::Failed;
          Err( GatewayError::Registry( format!( "module '{name}' failed to start during reload : init timed out after 30s" ) ) )
        },
      }
    }

    /// Current lifecycle state of a module, if registered.
    pub async fn state_of( &self, name : &str ) -> Option< ModuleState >
    {
      self.entries.read().await.get( name ).map( | e | e.state )
    }

    /// Dependency-ordered names: every module appears after everything it
    /// `depends_on`. Errors on an unknown dependency or a cycle.
    pub async fn dependency_order( &self ) -> Result< Vec< String >, GatewayError >
    {
      let entries = self.entries.read().await;
      let mut in_degree : HashMap< String, usize > = HashMap::new();
      let mut dependents : HashMap< String, Vec< String > > = HashMap::new();

      for ( name, entry ) in entries.iter()
      {
        in_degree.entry( name.clone() ).or_insert( 0 );
        for dep in &entry.handle.meta().depends_on
        {
          if !entries.contains_key( dep )
          {
            return Err( GatewayError::Registry( format!( "module '{name}' depends on unknown module '{dep}'" ) ) );
          }
          *in_degree.entry( name.clone() ).or_insert( 0 ) += 1;
          dependents.entry( dep.clone() ).or_default().push( name.clone() );
        }
      }

      let mut queue : VecDeque< String > = in_degree
        .iter()
        .filter( | ( _, degree ) | **degree == 0 )
        .map( | ( name, _ ) | name.clone() )
        .collect();
      let mut ordered = Vec::new();
      let mut seen = HashSet::new();

      while let Some( name ) = queue.pop_front()
      {
        if !seen.insert( name.clone() )
        {
          continue;
        }
        ordered.push( name.clone() );
        if let Some( deps ) = dependents.get( &name )
        {
          for dependent in deps
          {
            if let Some( degree ) = in_degree.get_mut( dependent )
            {
              *degree -= 1;
              if *degree == 0
              {
                queue.push_back( dependent.clone() );
              }
            }
          }
        }
      }

      if ordered.len() != entries.len()
      {
        return Err( GatewayError::Registry( "dependency cycle detected among modules".to_string() ) );
      }
      Ok( ordered )
    }

    /// Validate every module's configuration without side effects.
    pub async fn validate_all( &self ) -> Result< (), GatewayError >
    {
      let entries = self.entries.read().await;
      for entry in entries.values()
      {
        entry.handle.validate( &entry.handle.meta().config.clone() )?;
      }
      Ok( () )
    }

    fn transition( state : &mut ModuleState, next : ModuleState, name : &str ) -> Result< (), GatewayError >
    {
      if !state.can_transition_to( next )
      {
        return Err( GatewayError::Registry( format!( "module '{name}' cannot move from {state:?} to {next:?}" ) ) );
      }
      *state = next;
      Ok( () )
    }

    /// Drive every module from `Loading` through `Ready` in dependency
    /// order, then to `Running`. A failure anywhere sets that module to
    /// `Failed` and aborts the remaining startups.
    pub async fn start_all( &self ) -> Result< (), GatewayError >
    {
      let order = self.dependency_order().await?;
      for name in order
      {
        let handle =
        {
          let mut entries = self.entries.write().await;
          let entry = entries.get_mut( &name ).expect( "name came from dependency_order over the same table" );
          Self::transition( &mut entry.state, ModuleState::Initializing, &name )?;
          entry.handle.clone()
        };

        let init_result = handle.init().await;

        let mut entries = self.entries.write().await;
        let entry = entries.get_mut( &name ).expect( "module is not removed while starting" );
        if let Err( err ) = init_result
        {
          entry.state = ModuleState::Failed;
          return Err( err );
        }
        Self::transition( &mut entry.state, ModuleState::Ready, &name )?;
        Self::transition( &mut entry.state, ModuleState::Running, &name )?;
      }
      Ok( () )
    }

    /// Drive every module from `Running` through `Stopped`, in reverse
    /// dependency order so dependents drain before their dependencies.
    pub async fn stop_all( &self ) -> Result< (), GatewayError >
    {
      let mut order = self.dependency_order().await?;
      order.reverse();
      for name in order
      {
        let handle =
        {
          let mut entries = self.entries.write().await;
          let entry = match entries.get_mut( &name )
          {
            Some( entry ) if entry.state == ModuleState::Running => entry,
            _ => continue,
          };
          Self::transition( &mut entry.state, ModuleState::Draining, &name )?;
          entry.handle.clone()
        };

        let shutdown_result = handle.shutdown().await;

        let mut entries = self.entries.write().await;
        let entry = entries.get_mut( &name ).expect( "module is not removed while stopping" );
        if let Err( err ) = shutdown_result
        {
          entry.state = ModuleState::Failed;
          return Err( err );
        }
        Self::transition( &mut entry.state, ModuleState::Stopped, &name )?;
      }
      Ok( () )
    }

    /// Aggregate health: `true` only if every registered module is `Running`.
    pub async fn health( &self ) -> bool
    {
      let entries = self.entries.read().await;
      entries.values().all( | e | e.state == ModuleState::Running )
    }

    /// Per-module health, per spec.md §4.2: calls every registered module's
    /// health check and collects the `(name, result)` pairs. A module that
    /// errors surfaces as [`HealthStatus::Unhealthy`] carrying the error
    /// message rather than propagating — a misbehaving module must not take
    /// down the aggregate health read.
    pub async fn aggregate_health( &self ) -> Vec< ( String, ModuleHealth ) >
    {
      let handles : Vec< ( String, ModuleHandle ) > = self
        .entries
        .read()
        .await
        .iter()
        .map( | ( name, entry ) | ( name.clone(), entry.handle.clone() ) )
        .collect();

      let mut results = Vec::with_capacity( handles.len() );
      for ( name, handle ) in handles
      {
        let started = std::time::Instant::now();
        let health = match handle.health_check().await
        {
          Ok( health ) => health,
          Err( err ) => ModuleHealth
          {
            status : HealthStatus::Unhealthy,
            message : err.to_string(),
            last_check : started,
            duration : started.elapsed(),
            details : serde_json::Value::Null,
          },
        };
        results.push( ( name, health ) );
      }
      results
    }

    /// Validate then hot-swap `name`'s config in place, per spec.md §6's
    /// `update_config(name, new_config)` contract. Does not touch
    /// lifecycle state — unlike [`Self::reload`], this never stops or
    /// re-initializes the module; it only applies already-valid new
    /// parameters via [`crate::module::Module::set_config`].
    pub async fn update_config( &self, name : &str, new_config : serde_json::Value ) -> Result< (), GatewayError >
    {
      let handle =
      {
        let entries = self.entries.read().await;
        entries.get( name ).ok_or_else( || GatewayError::Registry( format!( "module '{name}' is not registered" ) ) )?.handle.clone()
      };
      handle.validate( &new_config )?;
      handle.set_config( new_config )?;
      tracing::info!( module = %name, "module config updated" );
      Ok( () )
    }

    /// Snapshot `(name, state)` for every registered module.
    pub async fn snapshot( &self ) -> Vec< ( String, ModuleState ) >
    {
      self.entries.read().await.iter().map( | ( name, entry ) | ( name.clone(), entry.state ) ).collect()
    }

    /// `Running` module handles of `kind`, sorted by `(priority, registration_sequence)`.
    pub async fn running_of_kind( &self, kind : ModuleKind ) -> Vec< ModuleHandle >
    {
      let entries = self.entries.read().await;
      let mut handles : Vec< ModuleHandle > = entries
        .values()
        .filter( | e | e.state == ModuleState::Running && e.handle.meta().kind == kind )
        .map( | e | e.handle.clone() )
        .collect();
      handles.sort_by_key( | h | ( h.meta().priority, h.meta().registration_sequence ) );
      handles
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;
    use async_trait::async_trait;
    use crate::context::ResponseContext;
    use crate::module::{ HealthStatus, ModuleCounters, ModuleMeta, Sink };

    fn meta( name : &str, depends_on : Vec< String > ) -> ModuleMeta
    {
      ModuleMeta
      {
        name : name.to_string(),
        kind : ModuleKind::Sink,
        depends_on,
        priority : 500,
        registration_sequence : 0,
        conditions : crate::condition::ConditionSet::default(),
        processing_timeout : std::time::Duration::from_millis( 50 ),
        config : serde_json::Value::Null,
        counters : ModuleCounters::new(),
      }
    }

    #[ derive( Debug ) ]
    struct NoopSink { meta : ModuleMeta }

    #[ async_trait ]
    impl crate::module::Module for NoopSink
    {
      fn meta( &self ) -> &ModuleMeta { &self.meta }
      fn validate( &self, _c : &serde_json::Value ) -> Result< (), GatewayError > { Ok( () ) }
    }

    #[ async_trait ]
    impl Sink for NoopSink
    {
      async fn record( &self, _ctx : &ResponseContext ) -> Result< (), GatewayError > { Ok( () ) }
    }

    fn handle( name : &str, depends_on : Vec< String > ) -> ModuleHandle
    {
      ModuleHandle::Sink( std::sync::Arc::new( NoopSink { meta : meta( name, depends_on ) } ) )
    }

    #[ tokio::test ]
    async fn register_rejects_empty_name()
    {
      let registry = ModuleRegistry::new();
      let err = registry.register( handle( "", Vec::new() ) ).await.unwrap_err();
      assert!( matches!( err, GatewayError::Registry( _ ) ) );
    }

    #[ tokio::test ]
    async fn register_rejects_unknown_dependency()
    {
      let registry = ModuleRegistry::new();
      let err = registry.register( handle( "a", vec![ "missing".to_string() ] ) ).await.unwrap_err();
      assert!( matches!( err, GatewayError::Registry( _ ) ) );
    }

    #[ tokio::test ]
    async fn register_rejects_duplicate_name()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      let err = registry.register( handle( "a", Vec::new() ) ).await.unwrap_err();
      assert!( matches!( err, GatewayError::Registry( _ ) ) );
    }

    #[ tokio::test ]
    async fn unregister_removes_module_after_shutdown()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      registry.start_all().await.unwrap();
      assert!( registry.get( "a" ).await.is_some() );
      registry.unregister( "a" ).await.unwrap();
      assert!( registry.get( "a" ).await.is_none() );
    }

    #[ tokio::test ]
    async fn reload_cycles_through_draining_ready_running_without_stopped()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      registry.start_all().await.unwrap();
      registry.reload( "a" ).await.unwrap();
      assert_eq!( registry.state_of( "a" ).await, Some( ModuleState::Running ) );
    }

    #[ tokio::test ]
    async fn list_by_type_ignores_lifecycle_state()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      // Not started: still `Loading`, but list_by_type is not lifecycle-filtered.
      let sinks = registry.list_by_type( ModuleKind::Sink ).await;
      assert_eq!( sinks.len(), 1 );
      assert!( registry.running_of_kind( ModuleKind::Sink ).await.is_empty() );
    }

    #[ tokio::test ]
    async fn aggregate_health_defaults_to_unknown_for_unoverridden_modules()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      let results = registry.aggregate_health().await;
      assert_eq!( results.len(), 1 );
      assert_eq!( results[ 0 ].1.status, HealthStatus::Unknown );
    }

    #[ tokio::test ]
    async fn update_config_is_rejected_for_unregistered_module()
    {
      let registry = ModuleRegistry::new();
      let err = registry.update_config( "missing", serde_json::Value::Null ).await.unwrap_err();
      assert!( matches!( err, GatewayError::Registry( _ ) ) );
    }

    #[ tokio::test ]
    async fn update_config_applies_to_registered_module()
    {
      let registry = ModuleRegistry::new();
      registry.register( handle( "a", Vec::new() ) ).await.unwrap();
      registry.update_config( "a", serde_json::json!( { "k": "v" } ) ).await.unwrap();
    }
  }
}

crate::mod_interface!
{
  exposed use private::ModuleRegistry;
}
