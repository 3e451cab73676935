//! Provider adapters: the upstream side of the dispatcher
//!
//! [`ProviderAdapter`] is grounded directly in the `ApiConnector` trait used
//! to talk to a single upstream API: `name`, `config`, and an async call
//! method are the whole surface a wire-format crate has to implement. The
//! gateway generalizes it with streaming, cost calculation and health
//! checks that every provider gets for free via default methods.

mod private
{
  use std::collections::HashMap;
  use std::sync::Arc;
  use std::time::Duration;
  use async_trait::async_trait;
  use serde_json::Value;
  use tokio::sync::{ mpsc, RwLock };
  use crate::circuit_breaker::{ CircuitBreaker, CircuitBreakerConfig };
  use crate::context::TokenUsage;
  use crate::error::GatewayError;

  /// One model's per-token pricing and capability row.
  #[ derive( Debug, Clone, Copy ) ]
  pub struct ModelPricing
  {
    /// Model name as the provider identifies it.
    pub model : &'static str,
    /// US dollars per prompt token.
    pub input_per_token : f64,
    /// US dollars per completion token.
    pub output_per_token : f64,
    /// Whether this model accepts a streaming completion request.
    pub supports_streaming : bool,
    /// Maximum context/output tokens the provider documents, if known.
    pub max_tokens : Option< u32 >,
  }

  /// Linear-scanned model pricing table for one provider.
  ///
  /// A handful of providers each with a handful of models does not justify
  /// a `HashMap`; a short `Vec` scanned on every request is both simpler
  /// and, at this scale, not measurably slower.
  #[ derive( Debug, Clone, Default ) ]
  pub struct ModelTable
  {
    entries : Vec< ModelPricing >,
  }

  impl ModelTable
  {
    /// Build a table from a fixed list of entries.
    #[ must_use ]
    pub fn new( entries : Vec< ModelPricing > ) -> Self
    {
      Self { entries }
    }

    /// Pricing for `model`, if known.
    #[ must_use ]
    pub fn pricing_for( &self, model : &str ) -> Option< ModelPricing >
    {
      self.entries.iter().find( | e | e.model == model ).copied()
    }

    /// Every model name this table carries pricing for, used by
    /// [`ProviderRegistry::get_for_model`]'s fallback scan when no
    /// provider's prefix list matches.
    #[ must_use ]
    pub fn supported_models( &self ) -> Vec< &str >
    {
      self.entries.iter().map( | e | e.model ).collect()
    }

    /// `true` iff `model` is known and documented as accepting a streaming
    /// request. An unknown model is treated as non-streaming, the same
    /// fail-safe default as an unknown model's cost being `0.0`.
    #[ must_use ]
    pub fn supports_streaming( &self, model : &str ) -> bool
    {
      self.pricing_for( model ).is_some_and( | p | p.supports_streaming )
    }

    /// Compute cost in US dollars for `usage` against `model`.
    /// `0.0` for an unknown model, per spec: cost tracking degrades
    /// gracefully rather than blocking the response.
    #[ must_use ]
    pub fn cost_usd( &self, model : &str, usage : TokenUsage ) -> f64
    {
      self.pricing_for( model ).map_or( 0.0, | p |
      {
        usage.prompt as f64 * p.input_per_token + usage.completion as f64 * p.output_per_token
      } )
    }
  }

  /// One chunk of a streamed completion.
  #[ derive( Debug, Clone ) ]
  pub struct StreamChunk
  {
    /// Raw bytes of this chunk, in the wire format the provider uses.
    pub data : Vec< u8 >,
    /// `true` on the final chunk of the stream.
    pub is_final : bool,
  }

  /// Receiving half of a streamed completion; bounded so a slow consumer
  /// applies backpressure to the provider call rather than buffering
  /// unboundedly in memory.
  pub type StreamReceiver = mpsc::Receiver< Result< StreamChunk, GatewayError > >;

  /// Non-streaming upstream response.
  #[ derive( Debug, Clone ) ]
  pub struct ProviderResponse
  {
    /// HTTP-style status code the upstream returned.
    pub status_code : u16,
    /// Raw response body.
    pub body : Value,
    /// Token usage, if the upstream reported one.
    pub usage : Option< TokenUsage >,
  }

  /// Health of a single upstream provider.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum ProviderHealth
  {
    /// Recent calls have succeeded.
    Healthy,
    /// Recent calls have failed or the breaker is open.
    Unhealthy,
    /// No calls made yet; health is unknown.
    Unknown,
  }

  /// Implemented once per upstream wire format (OpenAI, Anthropic, Google, ...).
  ///
  /// The gateway core never speaks a provider's wire format directly: every
  /// upstream call goes through this trait, wrapped by the caller in the
  /// matching [`CircuitBreaker`].
  #[ async_trait ]
  pub trait ProviderAdapter : Send + Sync + std::fmt::Debug
  {
    /// Name this provider is registered and referred to under.
    fn name( &self ) -> &str;

    /// This provider's model pricing table.
    fn model_table( &self ) -> &ModelTable;

    /// Prefixes of model names this provider serves, used by
    /// [`ProviderRegistry::get_for_model`] (e.g. `"gpt-"`, `"claude-"`).
    fn model_prefixes( &self ) -> &[ &str ];

    /// Perform a single non-streaming call.
    async fn call( &self, method : &str, path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >;

    /// Perform a streaming call. Default implementation makes one call via
    /// [`Self::call`] and yields it as a single final chunk; providers with
    /// native streaming override this.
    async fn call_streaming( &self, method : &str, path : &str, body : Value ) -> Result< StreamReceiver, GatewayError >
    {
      let response = self.call( method, path, body ).await?;
      let ( tx, rx ) = mpsc::channel( 1 );
      let _ = tx.send( Ok( StreamChunk { data : response.body.to_string().into_bytes(), is_final : true } ) ).await;
      Ok( rx )
    }

    /// Perform a lightweight call used by the background health-check loop.
    /// Default pings `GET /` which most providers accept or cheaply reject.
    async fn health_check( &self ) -> Result< (), GatewayError >
    {
      self.call( "GET", "/", Value::Null ).await.map( | _ | () )
    }
  }

  struct RegisteredProvider
  {
    adapter : Arc< dyn ProviderAdapter >,
    breaker : Arc< CircuitBreaker >,
    health : Arc< RwLock< ProviderHealth > >,
  }

  /// Holds every registered [`ProviderAdapter`] alongside its circuit
  /// breaker and resolves which provider should serve a given model.
  #[ derive( Default ) ]
  pub struct ProviderRegistry
  {
    providers : RwLock< HashMap< String, RegisteredProvider > >,
  }

  impl std::fmt::Debug for ProviderRegistry
  {
    fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
    {
      f.debug_struct( "ProviderRegistry" ).finish_non_exhaustive()
    }
  }

  impl ProviderRegistry
  {
    /// Build an empty registry.
    #[ must_use ]
    pub fn new() -> Self
    {
      Self::default()
    }

    /// Register a provider with its breaker configuration.
    pub async fn register( &self, adapter : Arc< dyn ProviderAdapter >, breaker_config : CircuitBreakerConfig )
    {
      let name = adapter.name().to_string();
      let breaker = Arc::new( CircuitBreaker::new( name.clone(), breaker_config ) );
      let mut providers = self.providers.write().await;
      providers.insert( name, RegisteredProvider { adapter, breaker, health : Arc::new( RwLock::new( ProviderHealth::Unknown ) ) } );
    }

    /// Look up a provider by exact name.
    pub async fn get( &self, name : &str ) -> Option< ( Arc< dyn ProviderAdapter >, Arc< CircuitBreaker > ) >
    {
      self.providers.read().await.get( name ).map( | p | ( Arc::clone( &p.adapter ), Arc::clone( &p.breaker ) ) )
    }

    /// Resolve the provider serving `model`: first by matching a registered
    /// prefix (`"gpt-"` -> openai, `"claude-"` -> anthropic, ...), then —
    /// per spec.md §4.3.4 — by falling back to a scan of every provider's
    /// [`ModelTable::supported_models`] for an exact match. Errors with
    /// [`GatewayError::NoHealthyProvider`] if neither resolves anything.
    pub async fn get_for_model( &self, model : &str ) -> Result< ( Arc< dyn ProviderAdapter >, Arc< CircuitBreaker > ), GatewayError >
    {
      let providers = self.providers.read().await;
      for provider in providers.values()
      {
        if provider.adapter.model_prefixes().iter().any( | prefix | model.starts_with( prefix ) )
        {
          return Ok( ( Arc::clone( &provider.adapter ), Arc::clone( &provider.breaker ) ) );
        }
      }
      for provider in providers.values()
      {
        if provider.adapter.model_table().supported_models().contains( &model )
        {
          return Ok( ( Arc::clone( &provider.adapter ), Arc::clone( &provider.breaker ) ) );
        }
      }
      Err( GatewayError::NoHealthyProvider )
    }

    /// Health-aware provider selection, per spec.md §4.3.4: `preferred` if
    /// it is registered and not known-unhealthy; otherwise any provider
    /// that is not known-unhealthy; otherwise [`GatewayError::NoHealthyProvider`].
    /// A provider with no health check recorded yet ([`ProviderHealth::Unknown`])
    /// is treated as eligible — refusing traffic before the first health
    /// tick has run would make every provider unusable at startup.
    pub async fn healthy_provider( &self, preferred : Option< &str > ) -> Result< ( Arc< dyn ProviderAdapter >, Arc< CircuitBreaker > ), GatewayError >
    {
      let providers = self.providers.read().await;

      if let Some( name ) = preferred
      {
        if let Some( provider ) = providers.get( name )
        {
          if *provider.health.read().await != ProviderHealth::Unhealthy
          {
            return Ok( ( Arc::clone( &provider.adapter ), Arc::clone( &provider.breaker ) ) );
          }
        }
      }

      for provider in providers.values()
      {
        if *provider.health.read().await != ProviderHealth::Unhealthy
        {
          return Ok( ( Arc::clone( &provider.adapter ), Arc::clone( &provider.breaker ) ) );
        }
      }

      Err( GatewayError::NoHealthyProvider )
    }

    /// Spawn a background task that periodically calls
    /// [`ProviderAdapter::health_check`] for every registered provider and
    /// updates its recorded [`ProviderHealth`].
    ///
    /// Returns a handle the caller can abort on shutdown; detached
    /// otherwise, matching a sink's fire-and-forget posture.
    pub fn spawn_health_checks( self : &Arc< Self >, interval : Duration ) -> tokio::task::JoinHandle< () >
    {
      let registry = Arc::clone( self );
      tokio::spawn( async move
      {
        let mut ticker = tokio::time::interval( interval );
        loop
        {
          ticker.tick().await;
          let snapshot : Vec< ( String, Arc< dyn ProviderAdapter >, Arc< RwLock< ProviderHealth > > ) > =
          {
            let providers = registry.providers.read().await;
            providers.iter().map( | ( name, p ) | ( name.clone(), Arc::clone( &p.adapter ), Arc::clone( &p.health ) ) ).collect()
          };
          for ( name, adapter, health ) in snapshot
          {
            let outcome = adapter.health_check().await;
            let mut guard = health.write().await;
            *guard = if outcome.is_ok() { ProviderHealth::Healthy } else { ProviderHealth::Unhealthy };
            if outcome.is_err()
            {
              tracing::warn!( provider = %name, "provider health check failed" );
            }
          }
        }
      } )
    }

    /// Last recorded health for `name`, if registered.
    pub async fn health_of( &self, name : &str ) -> Option< ProviderHealth >
    {
      let providers = self.providers.read().await;
      match providers.get( name )
      {
        Some( p ) => Some( *p.health.read().await ),
        None => None,
      }
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;

    #[ derive( Debug ) ]
    struct FakeAdapter
    {
      name : &'static str,
      prefixes : Vec< &'static str >,
      pricing : ModelTable,
    }

    #[ async_trait ]
    impl ProviderAdapter for FakeAdapter
    {
      fn name( &self ) -> &str { self.name }
      fn model_table( &self ) -> &ModelTable { &self.pricing }
      fn model_prefixes( &self ) -> &[ &str ] { &self.prefixes }
      async fn call( &self, _method : &str, _path : &str, _body : Value ) -> Result< ProviderResponse, GatewayError >
      {
        Ok( ProviderResponse { status_code : 200, body : Value::Null, usage : None } )
      }
    }

    fn fake( name : &'static str, prefixes : Vec< &'static str >, models : Vec< &'static str > ) -> Arc< dyn ProviderAdapter >
    {
      let pricing = ModelTable::new( models.into_iter().map( | model | ModelPricing
      {
        model, input_per_token : 0.0, output_per_token : 0.0, supports_streaming : false, max_tokens : None,
      } ).collect() );
      Arc::new( FakeAdapter { name, prefixes, pricing } )
    }

    #[ tokio::test ]
    async fn get_for_model_falls_back_to_supported_models_scan()
    {
      let registry = ProviderRegistry::new();
      registry.register( fake( "custom", vec![], vec![ "my-finetuned-model" ] ), CircuitBreakerConfig::default() ).await;
      let ( adapter, _ ) = registry.get_for_model( "my-finetuned-model" ).await.unwrap();
      assert_eq!( adapter.name(), "custom" );
    }

    #[ tokio::test ]
    async fn get_for_model_errors_when_nothing_matches()
    {
      let registry = ProviderRegistry::new();
      registry.register( fake( "openai", vec![ "gpt-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      assert!( matches!( registry.get_for_model( "claude-3" ).await, Err( GatewayError::NoHealthyProvider ) ) );
    }

    #[ tokio::test ]
    async fn healthy_provider_prefers_requested_name_when_not_unhealthy()
    {
      let registry = ProviderRegistry::new();
      registry.register( fake( "openai", vec![ "gpt-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      registry.register( fake( "anthropic", vec![ "claude-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      let ( adapter, _ ) = registry.healthy_provider( Some( "anthropic" ) ).await.unwrap();
      assert_eq!( adapter.name(), "anthropic" );
    }

    #[ tokio::test ]
    async fn healthy_provider_falls_back_when_preferred_is_unhealthy()
    {
      let registry = ProviderRegistry::new();
      registry.register( fake( "openai", vec![ "gpt-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      registry.register( fake( "anthropic", vec![ "claude-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      {
        let providers = registry.providers.read().await;
        *providers.get( "anthropic" ).unwrap().health.write().await = ProviderHealth::Unhealthy;
      }
      let ( adapter, _ ) = registry.healthy_provider( Some( "anthropic" ) ).await.unwrap();
      assert_eq!( adapter.name(), "openai" );
    }

    #[ tokio::test ]
    async fn healthy_provider_errors_when_all_unhealthy()
    {
      let registry = ProviderRegistry::new();
      registry.register( fake( "openai", vec![ "gpt-" ], vec![] ), CircuitBreakerConfig::default() ).await;
      {
        let providers = registry.providers.read().await;
        *providers.get( "openai" ).unwrap().health.write().await = ProviderHealth::Unhealthy;
      }
      assert!( matches!( registry.healthy_provider( None ).await, Err( GatewayError::NoHealthyProvider ) ) );
    }

    #[ test ]
    fn cost_is_zero_for_unknown_model()
    {
      let table = ModelTable::new( vec![] );
      let usage = TokenUsage { prompt : 100, completion : 50, total : 150 };
      assert_eq!( table.cost_usd( "mystery-model", usage ), 0.0 );
    }

    #[ test ]
    fn cost_scales_with_token_counts()
    {
      let table = ModelTable::new( vec![ ModelPricing { model : "gpt-4o", input_per_token : 0.000_005, output_per_token : 0.000_015, supports_streaming : true, max_tokens : Some( 128_000 ) } ] );
      let usage = TokenUsage { prompt : 1000, completion : 500, total : 1500 };
      let cost = table.cost_usd( "gpt-4o", usage );
      assert!( ( cost - 0.0125 ).abs() < 1e-9 );
    }

    #[ test ]
    fn supports_streaming_false_for_unknown_model()
    {
      let table = ModelTable::new( vec![] );
      assert!( !table.supports_streaming( "mystery-model" ) );
    }

    #[ test ]
    fn supports_streaming_reads_model_row()
    {
      let table = ModelTable::new( vec![ ModelPricing { model : "gpt-4o", input_per_token : 0.0, output_per_token : 0.0, supports_streaming : true, max_tokens : None } ] );
      assert!( table.supports_streaming( "gpt-4o" ) );
    }
  }
}

crate::mod_interface!
{
  exposed use private::ModelPricing;
  exposed use private::ModelTable;
  exposed use private::StreamChunk;
  exposed use private::StreamReceiver;
  exposed use private::ProviderResponse;
  exposed use private::ProviderHealth;
  exposed use private::ProviderAdapter;
  exposed use private::ProviderRegistry;
}
