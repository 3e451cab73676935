//! Module traits and lifecycle types
//!
//! Four module classes run at different pipeline phases. All four share the
//! same identity, configuration and lifecycle surface via [`ModuleMeta`];
//! what differs is the async method the pipeline invokes and whether a
//! failure is fail-open or fail-closed for that phase.

mod private
{
  use std::collections::HashMap;
  use std::fmt;
  use async_trait::async_trait;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::{ RequestContext, ResponseContext };
  use crate::error::GatewayError;

  /// Which of the four module classes a module belongs to.
  ///
  /// The class determines where in the pipeline the module runs and
  /// whether its failure mode is fail-open or fail-closed; see
  /// `core/src/pipeline.rs`.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq, Hash ) ]
  pub enum ModuleKind
  {
    /// Request-side, parallel, fail-open. Observes, never blocks.
    Inspector,
    /// Request-side, sequential, fail-closed. May block the request.
    Policy,
    /// Request-side or response-side, sequential, fail-open. Rewrites.
    Transformer,
    /// Response-side, detached, fail-open. Observes the final outcome.
    Sink,
  }

  /// Lifecycle state of a registered module.
  ///
  /// Transitions are linear except for `Failed`, which is reachable from
  /// any other state:
  /// `Loading -> Initializing -> Ready -> Running -> Draining -> Stopped`.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum ModuleState
  {
    /// Registered, not yet validated or constructed.
    Loading,
    /// `Module::init` is running.
    Initializing,
    /// Initialized, not yet started.
    Ready,
    /// Actively taking pipeline traffic.
    Running,
    /// No longer accepting new requests, finishing in-flight work.
    Draining,
    /// Fully stopped.
    Stopped,
    /// Entered from any state when the module cannot continue.
    Failed,
  }

  impl ModuleState
  {
    /// `true` if `next` is a legal transition from `self`.
    #[ must_use ]
    pub fn can_transition_to( self, next : ModuleState ) -> bool
    {
      if next == ModuleState::Failed
      {
        return self != ModuleState::Stopped;
      }
      matches!(
        ( self, next ),
        ( ModuleState::Loading, ModuleState::Initializing )
          | ( ModuleState::Initializing, ModuleState::Ready )
          | ( ModuleState::Ready, ModuleState::Running )
          | ( ModuleState::Running, ModuleState::Draining )
          | ( ModuleState::Draining, ModuleState::Stopped )
      )
    }
  }

  /// Coarse health of a single module, as returned by [`Module::health_check`].
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum HealthStatus
  {
    /// Fully functional.
    Healthy,
    /// Functional but impaired (e.g. operating on stale data, elevated latency).
    Degraded,
    /// Not functional.
    Unhealthy,
    /// The module does not implement a meaningful health check.
    Unknown,
  }

  /// Result of one health probe, shaped per spec.md §4.2's aggregate health
  /// contract.
  #[ derive( Debug, Clone ) ]
  pub struct ModuleHealth
  {
    /// Coarse status.
    pub status : HealthStatus,
    /// Human-readable detail.
    pub message : String,
    /// When this probe ran.
    pub last_check : std::time::Instant,
    /// How long the probe took.
    pub duration : std::time::Duration,
    /// Free-form structured detail (counters, last error, ...).
    pub details : Value,
  }

  impl ModuleHealth
  {
    /// Build an `Unknown` health result for a module that does not
    /// override [`Module::health_check`].
    #[ must_use ]
    pub fn unknown() -> Self
    {
      Self
      {
        status : HealthStatus::Unknown,
        message : "module does not implement a health check".to_string(),
        last_check : std::time::Instant::now(),
        duration : std::time::Duration::ZERO,
        details : Value::Null,
      }
    }
  }

  /// Outcome of running a single module against a request.
  #[ derive( Debug, Clone ) ]
  pub enum ModuleOutcome
  {
    /// Proceed, optionally contributing annotations.
    Continue( HashMap< String, Value > ),
    /// Fail-closed phases only: stop the request here.
    Block
    {
      /// Human-readable reason, surfaced to the client and to sinks.
      reason : String,
    },
  }

  /// Per-module runtime counters, updated by the pipeline on every call.
  ///
  /// Matches spec.md §3's `counters: requests_processed, error_count,
  /// last_activity`. Per §5's concurrency model ("Module counters ...
  /// atomic operations are sufficient") the two counts are lock-free
  /// atomics; `last_activity` is an `Instant` and so is guarded the same
  /// way [`crate::circuit_breaker::CircuitBreaker`] guards its own
  /// `last_failure_time`.
  #[ derive( Debug, Default ) ]
  pub struct ModuleCounters
  {
    requests_processed : std::sync::atomic::AtomicU64,
    error_count : std::sync::atomic::AtomicU64,
    last_activity : tokio::sync::RwLock< Option< std::time::Instant > >,
  }

  impl ModuleCounters
  {
    /// Build a fresh, zeroed counter set.
    #[ must_use ]
    pub fn new() -> Self
    {
      Self::default()
    }

    /// Total calls dispatched to this module so far.
    #[ must_use ]
    pub fn requests_processed( &self ) -> u64
    {
      self.requests_processed.load( std::sync::atomic::Ordering::Relaxed )
    }

    /// Calls that ended in a timeout or an error, so far.
    #[ must_use ]
    pub fn error_count( &self ) -> u64
    {
      self.error_count.load( std::sync::atomic::Ordering::Relaxed )
    }

    /// When this module was last invoked, if ever.
    pub async fn last_activity( &self ) -> Option< std::time::Instant >
    {
      *self.last_activity.read().await
    }

    /// Record one dispatch: increments `requests_processed` and stamps
    /// `last_activity`. Called once per module call, regardless of outcome.
    pub async fn record_call( &self )
    {
      self.requests_processed.fetch_add( 1, std::sync::atomic::Ordering::Relaxed );
      *self.last_activity.write().await = Some( std::time::Instant::now() );
    }

    /// Record a failure: increments `error_count`. Called in addition to
    /// [`Self::record_call`] when the call errored or timed out.
    pub fn record_error( &self )
    {
      self.error_count.fetch_add( 1, std::sync::atomic::Ordering::Relaxed );
    }
  }

  /// Identity, scoping and static configuration shared by every module.
  #[ derive( Debug ) ]
  pub struct ModuleMeta
  {
    /// Unique name used for registry lookup, logging and annotation namespacing.
    pub name : String,
    /// Module class.
    pub kind : ModuleKind,
    /// Names of modules that must initialize before this one.
    pub depends_on : Vec< String >,
    /// Scheduling priority; lower runs first among modules of the same kind.
    pub priority : i32,
    /// Monotonic tie-break assigned at registration time, used when two
    /// modules of the same kind share a priority.
    pub registration_sequence : u64,
    /// Request scoping; an empty set matches every request.
    pub conditions : ConditionSet,
    /// Per-call budget; a module exceeding this is treated as
    /// [`GatewayError::ModuleTimeout`].
    pub processing_timeout : std::time::Duration,
    /// Opaque config blob validated by [`Module::validate`] and handed to
    /// [`Module::init`].
    pub config : Value,
    /// Runtime counters; see spec.md §3 "counters".
    pub counters : ModuleCounters,
  }

  /// Common lifecycle and identity surface for every module class.
  ///
  /// Lifecycle methods take `&self`, not `&mut self`: modules run behind a
  /// shared `Arc` so inspectors can be fanned out to concurrently (see
  /// `core/src/pipeline.rs`), and any state a module needs to mutate (a
  /// token bucket, a counter) it owns behind its own internal
  /// synchronization, the same way [`crate::circuit_breaker::CircuitBreaker`] does.
  #[ async_trait ]
  pub trait Module : Send + Sync + fmt::Debug
  {
    /// Static identity and scoping.
    fn meta( &self ) -> &ModuleMeta;

    /// Validate `config` without side effects. Called at register time and
    /// again on every config reload before the new config is swapped in.
    fn validate( &self, config : &Value ) -> Result< (), GatewayError >;

    /// Perform one-time setup. Runs once, during `Loading -> Initializing`.
    async fn init( &self ) -> Result< (), GatewayError >
    {
      Ok( () )
    }

    /// Release resources. Runs once, during `Draining -> Stopped`.
    async fn shutdown( &self ) -> Result< (), GatewayError >
    {
      Ok( () )
    }

    /// Hot-swap this module's config, per spec.md §6's
    /// `update_config(name, new_config)` contract. The caller
    /// ([`crate::registry::ModuleRegistry::update_config`]) validates
    /// `config` first via [`Module::validate`]; this method only needs to
    /// apply an already-valid config. Default is a no-op — most built-in
    /// modules are constructed once with fixed parameters (a rate
    /// limiter's capacity, a content filter's patterns) and a host wanting
    /// runtime-adjustable values overrides this to swap an internal cell.
    fn set_config( &self, config : Value ) -> Result< (), GatewayError >
    {
      let _ = config;
      Ok( () )
    }

    /// Probe this module's health. Default is [`ModuleHealth::unknown`];
    /// modules with meaningful internal state (a breaker, a bucket map, a
    /// downstream dependency) should override this. An error returned here
    /// is turned into [`HealthStatus::Unhealthy`] by the caller, not
    /// propagated, per spec.md §4.2 ("exceptions from a module's health
    /// call surface as Unhealthy with the error message").
    async fn health_check( &self ) -> Result< ModuleHealth, GatewayError >
    {
      Ok( ModuleHealth::unknown() )
    }
  }

  /// Request-side, parallel, fail-open observer.
  #[ async_trait ]
  pub trait Inspector : Module
  {
    /// Observe `ctx`, optionally returning annotations to merge in.
    async fn inspect( &self, ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >;
  }

  /// Request-side, sequential, fail-closed gate.
  #[ async_trait ]
  pub trait Policy : Module
  {
    /// Decide whether `ctx` may proceed.
    async fn evaluate( &self, ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >;
  }

  /// Rewrites a request before dispatch or a response before return.
  #[ async_trait ]
  pub trait Transformer : Module
  {
    /// Rewrite the outbound request in place.
    async fn transform_request( &self, ctx : &mut RequestContext ) -> Result< (), GatewayError >
    {
      let _ = ctx;
      Ok( () )
    }

    /// Rewrite the inbound response in place.
    async fn transform_response( &self, ctx : &mut ResponseContext ) -> Result< (), GatewayError >
    {
      let _ = ctx;
      Ok( () )
    }
  }

  /// Response-side, detached, fail-open observer of the final outcome.
  #[ async_trait ]
  pub trait Sink : Module
  {
    /// Record the final outcome. Runs detached from the response path: a
    /// sink failure or timeout never delays or alters the client response.
    async fn record( &self, ctx : &ResponseContext ) -> Result< (), GatewayError >;
  }

  /// One registered module, carrying its class-specific trait object.
  ///
  /// The registry stores modules as `ModuleHandle` rather than
  /// `Arc<dyn Module>` because the pipeline needs to call the
  /// class-specific method (`inspect`, `evaluate`, ...), which plain
  /// `Module` does not expose.
  #[ derive( Clone ) ]
  pub enum ModuleHandle
  {
    /// Wraps an [`Inspector`].
    Inspector( std::sync::Arc< dyn Inspector > ),
    /// Wraps a [`Policy`].
    Policy( std::sync::Arc< dyn Policy > ),
    /// Wraps a [`Transformer`].
    Transformer( std::sync::Arc< dyn Transformer > ),
    /// Wraps a [`Sink`].
    Sink( std::sync::Arc< dyn Sink > ),
  }

  impl fmt::Debug for ModuleHandle
  {
    fn fmt( &self, f : &mut fmt::Formatter< '_ > ) -> fmt::Result
    {
      f.debug_tuple( "ModuleHandle" ).field( &self.meta().name ).finish()
    }
  }

  impl ModuleHandle
  {
    /// Identity and scoping of the wrapped module, regardless of class.
    #[ must_use ]
    pub fn meta( &self ) -> &ModuleMeta
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.meta(),
        ModuleHandle::Policy( m ) => m.meta(),
        ModuleHandle::Transformer( m ) => m.meta(),
        ModuleHandle::Sink( m ) => m.meta(),
      }
    }

    /// Run this module's one-time setup.
    pub async fn init( &self ) -> Result< (), GatewayError >
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.init().await,
        ModuleHandle::Policy( m ) => m.init().await,
        ModuleHandle::Transformer( m ) => m.init().await,
        ModuleHandle::Sink( m ) => m.init().await,
      }
    }

    /// Release this module's resources.
    pub async fn shutdown( &self ) -> Result< (), GatewayError >
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.shutdown().await,
        ModuleHandle::Policy( m ) => m.shutdown().await,
        ModuleHandle::Transformer( m ) => m.shutdown().await,
        ModuleHandle::Sink( m ) => m.shutdown().await,
      }
    }

    /// Validate this module's configuration.
    pub fn validate( &self, config : &Value ) -> Result< (), GatewayError >
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.validate( config ),
        ModuleHandle::Policy( m ) => m.validate( config ),
        ModuleHandle::Transformer( m ) => m.validate( config ),
        ModuleHandle::Sink( m ) => m.validate( config ),
      }
    }

    /// Probe this module's health.
    pub async fn health_check( &self ) -> Result< ModuleHealth, GatewayError >
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.health_check().await,
        ModuleHandle::Policy( m ) => m.health_check().await,
        ModuleHandle::Transformer( m ) => m.health_check().await,
        ModuleHandle::Sink( m ) => m.health_check().await,
      }
    }

    /// Hot-swap this module's config; caller is responsible for validating
    /// first (see [`crate::registry::ModuleRegistry::update_config`]).
    pub fn set_config( &self, config : Value ) -> Result< (), GatewayError >
    {
      match self
      {
        ModuleHandle::Inspector( m ) => m.set_config( config ),
        ModuleHandle::Policy( m ) => m.set_config( config ),
        ModuleHandle::Transformer( m ) => m.set_config( config ),
        ModuleHandle::Sink( m ) => m.set_config( config ),
      }
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;

    #[ test ]
    fn loading_to_initializing_is_legal()
    {
      assert!( ModuleState::Loading.can_transition_to( ModuleState::Initializing ) );
    }

    #[ test ]
    fn loading_to_running_is_illegal()
    {
      assert!( !ModuleState::Loading.can_transition_to( ModuleState::Running ) );
    }

    #[ test ]
    fn failed_reachable_from_running()
    {
      assert!( ModuleState::Running.can_transition_to( ModuleState::Failed ) );
    }

    #[ test ]
    fn failed_not_reachable_from_stopped()
    {
      assert!( !ModuleState::Stopped.can_transition_to( ModuleState::Failed ) );
    }

    #[ test ]
    fn draining_to_stopped_is_legal()
    {
      assert!( ModuleState::Draining.can_transition_to( ModuleState::Stopped ) );
    }
  }
}

crate::mod_interface!
{
  exposed use private::ModuleKind;
  exposed use private::ModuleState;
  exposed use private::HealthStatus;
  exposed use private::ModuleHealth;
  exposed use private::ModuleOutcome;
  exposed use private::ModuleCounters;
  exposed use private::ModuleMeta;
  exposed use private::Module;
  exposed use private::Inspector;
  exposed use private::Policy;
  exposed use private::Transformer;
  exposed use private::Sink;
  exposed use private::ModuleHandle;
}
