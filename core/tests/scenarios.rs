//! End-to-end scenarios run against an in-process fake provider, no network I/O.

use std::collections::HashMap;
use std::sync::atomic::{ AtomicU32, Ordering };
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::circuit_breaker::CircuitBreakerConfig;
use gateway_core::condition::ConditionSet;
use gateway_core::context::{ ModuleConfigSnapshot, RequestContext };
use gateway_core::dispatcher::{ DispatchOutcome, Dispatcher, DispatcherConfig };
use gateway_core::error::GatewayError;
use gateway_core::module::{ Inspector, Module, ModuleCounters, ModuleHandle, ModuleKind, ModuleMeta };
use gateway_core::modules::content_filter::{ ContentFilterAction, ContentFilterTransformer };
use gateway_core::modules::rate_limiter::RateLimiterPolicy;
use gateway_core::pipeline::Pipeline;
use gateway_core::provider::{ ModelPricing, ModelTable, ProviderAdapter, ProviderRegistry, ProviderResponse };
use gateway_core::registry::ModuleRegistry;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[ derive( Debug ) ]
struct FakeProvider
{
  pricing : ModelTable,
  calls : AtomicU32,
}

impl FakeProvider
{
  fn new() -> Self
  {
    Self
    {
      pricing : ModelTable::new( vec![ ModelPricing { model : "gpt-4o-mini", input_per_token : 0.0000003, output_per_token : 0.0000006, supports_streaming : true, max_tokens : Some( 128_000 ) } ] ),
      calls : AtomicU32::new( 0 ),
    }
  }
}

#[ async_trait ]
impl ProviderAdapter for FakeProvider
{
  fn name( &self ) -> &str
  {
    "openai"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "gpt-" ]
  }

  async fn call( &self, _method : &str, _path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    self.calls.fetch_add( 1, Ordering::SeqCst );
    Ok( ProviderResponse
    {
      status_code : 200,
      body,
      usage : Some( gateway_core::context::TokenUsage { prompt : 10, completion : 5, total : 15 } ),
    } )
  }
}

#[ derive( Debug ) ]
struct SleepyInspector
{
  meta : ModuleMeta,
}

impl SleepyInspector
{
  fn new( timeout : Duration ) -> Self
  {
    Self
    {
      meta : ModuleMeta
      {
        name : "sleepy_inspector".to_string(),
        kind : ModuleKind::Inspector,
        depends_on : Vec::new(),
        priority : 0,
        registration_sequence : 0,
        conditions : ConditionSet::default(),
        processing_timeout : timeout,
        config : Value::Null,
        counters : ModuleCounters::new(),
      },
    }
  }
}

impl Module for SleepyInspector
{
  fn meta( &self ) -> &ModuleMeta
  {
    &self.meta
  }

  fn validate( &self, _config : &Value ) -> Result< (), GatewayError >
  {
    Ok( () )
  }
}

#[ async_trait ]
impl Inspector for SleepyInspector
{
  async fn inspect( &self, _ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >
  {
    tokio::time::sleep( Duration::from_millis( 100 ) ).await;
    let mut annotations = HashMap::new();
    annotations.insert( "would_have_run".to_string(), Value::Bool( true ) );
    Ok( annotations )
  }
}

async fn build_dispatcher( rate_capacity : f64 ) -> ( Dispatcher, Arc< FakeProvider > )
{
  let registry = Arc::new( ModuleRegistry::new() );
  let seq = registry.next_sequence();
  registry
    .register( ModuleHandle::Policy( Arc::new( RateLimiterPolicy::new( rate_capacity, 0.0, 0, seq, ConditionSet::default() ) ) ) )
    .await
    .unwrap();
  let seq = registry.next_sequence();
  registry
    .register( ModuleHandle::Transformer( Arc::new( ContentFilterTransformer::new(
      vec![ regex::Regex::new( "harmful" ).unwrap() ],
      ContentFilterAction::Redact,
      0, seq, ConditionSet::default(),
    ) ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let providers = Arc::new( ProviderRegistry::new() );
  let fake = Arc::new( FakeProvider::new() );
  providers.register( Arc::clone( &fake ) as Arc< dyn ProviderAdapter >, CircuitBreakerConfig::default() ).await;

  let pipeline = Pipeline::new( registry );
  let dispatcher = Dispatcher::new( pipeline, providers, DispatcherConfig::default() );
  ( dispatcher, fake )
}

fn request( body : &str ) -> RequestContext
{
  let mut ctx = RequestContext::new( "openai", "POST", "/chat/completions", body.as_bytes().to_vec(), Arc::new( ModuleConfigSnapshot::default() ) );
  ctx.model_name = Some( "gpt-4o-mini".to_string() );
  ctx.tenant_id = "acme".to_string();
  ctx
}

#[ tokio::test ]
async fn scenario_1_healthy_passthrough_computes_cost()
{
  let ( dispatcher, fake ) = build_dispatcher( 10.0 ).await;
  let ctx = request( r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"# );
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( ctx, CancellationToken::new() ).await.unwrap()
  else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };

  assert_eq!( response.status_code, 200 );
  assert!( response.token_usage.is_some() );
  assert!( response.cost_usd > 0.0 );
  assert_eq!( fake.calls.load( Ordering::SeqCst ), 1 );
}

#[ tokio::test ]
async fn scenario_2_rate_limit_blocks_without_reaching_provider()
{
  let ( dispatcher, fake ) = build_dispatcher( 1.0 ).await;
  let first = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
  dispatcher.dispatch( first, CancellationToken::new() ).await.unwrap();

  let second = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( second, CancellationToken::new() ).await.unwrap()
  else { panic!( "blocked request must return DispatchOutcome::Complete" ) };

  assert_eq!( response.status_code, 403 );
  assert!( response.blocked_reason.is_some() );
  assert_eq!( fake.calls.load( Ordering::SeqCst ), 1, "second request must not reach the provider" );

  let body : Value = serde_json::from_slice( &response.response_body ).unwrap();
  assert_eq!( body[ "request_id" ], Value::String( response.request.request_id.to_string() ) );
  assert_eq!( body[ "error" ], Value::String( "blocked".to_string() ) );
  assert!( body[ "reason" ].as_str().is_some_and( | r | r.contains( "rate limit" ) ) );
  assert_eq!( body[ "module" ], Value::String( "rate_limiter".to_string() ) );
}

#[ tokio::test ]
async fn scenario_3_content_filter_redacts_before_dispatch()
{
  let ( dispatcher, _fake ) = build_dispatcher( 10.0 ).await;
  let ctx = request( r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"this is harmful text"}]}"# );
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( ctx, CancellationToken::new() ).await.unwrap()
  else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };

  assert_eq!( response.status_code, 200 );
  let forwarded = std::str::from_utf8( &response.response_body ).unwrap();
  assert!( !forwarded.contains( "harmful" ) );
  assert_eq!( response.request.annotations.get( "redacted" ), Some( &Value::Bool( true ) ) );
}

#[ derive( Debug ) ]
struct FailingProvider
{
  pricing : ModelTable,
}

#[ async_trait ]
impl ProviderAdapter for FailingProvider
{
  fn name( &self ) -> &str
  {
    "openai"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "gpt-" ]
  }

  async fn call( &self, _method : &str, _path : &str, _body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    Err( GatewayError::UpstreamStatus( 500 ) )
  }
}

#[ tokio::test ]
async fn scenario_4_circuit_opens_after_consecutive_failures_and_rejects_fast()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.start_all().await.unwrap();

  let providers = Arc::new( ProviderRegistry::new() );
  let fake = Arc::new( FailingProvider { pricing : ModelTable::new( vec![] ) } );
  let breaker_config = CircuitBreakerConfig
  {
    failure_rate_threshold : 0.5,
    min_requests : 10,
    reset_timeout : Duration::from_millis( 50 ),
  };
  providers.register( Arc::clone( &fake ) as Arc< dyn ProviderAdapter >, breaker_config ).await;

  let dispatcher = Dispatcher::new( Pipeline::new( registry ), providers, DispatcherConfig::default() );

  for _ in 0..10
  {
    let ctx = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
    let DispatchOutcome::Complete( response ) = dispatcher.dispatch( ctx, CancellationToken::new() ).await.unwrap()
    else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };
    assert_eq!( response.status_code, 500, "upstream status codes pass through verbatim" );
  }

  // breaker should now be open: the 11th call must fail fast with 503 and
  // never reach the provider's `call`.
  let eleventh = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
  let before = std::time::Instant::now();
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( eleventh, CancellationToken::new() ).await.unwrap()
  else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };
  assert_eq!( response.status_code, 503 );
  assert!( before.elapsed() < Duration::from_millis( 20 ), "circuit-open rejection must fail fast without an upstream attempt" );

  tokio::time::sleep( Duration::from_millis( 60 ) ).await;
  // after the reset timeout a trial call is allowed again (still fails, but
  // reaches the provider this time rather than being rejected at the breaker).
  let trial = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( trial, CancellationToken::new() ).await.unwrap()
  else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };
  assert_eq!( response.status_code, 500, "half-open trial call must reach the provider" );
}

#[ derive( Debug ) ]
struct AbortingStreamProvider
{
  pricing : ModelTable,
}

#[ async_trait ]
impl ProviderAdapter for AbortingStreamProvider
{
  fn name( &self ) -> &str
  {
    "openai"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "gpt-" ]
  }

  async fn call( &self, _method : &str, _path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    Ok( ProviderResponse { status_code : 200, body, usage : None } )
  }

  async fn call_streaming( &self, _method : &str, _path : &str, _body : Value ) -> Result< gateway_core::provider::StreamReceiver, GatewayError >
  {
    let ( tx, rx ) = tokio::sync::mpsc::channel( 8 );
    tokio::spawn( async move
    {
      for i in 0..3
      {
        let _ = tx.send( Ok( gateway_core::provider::StreamChunk { data : format!( "chunk-{i}" ).into_bytes(), is_final : false } ) ).await;
      }
      let _ = tx.send( Err( GatewayError::StreamAborted( "upstream closed connection".to_string() ) ) ).await;
      // sender dropped here: consumer sees the channel close right after
      // the error chunk, matching "producer closes the upstream body on exit".
    } );
    Ok( rx )
  }
}

#[ tokio::test ]
async fn scenario_6_streaming_abort_mid_response_delivers_partial_chunks_then_error()
{
  let provider = AbortingStreamProvider { pricing : ModelTable::new( vec![] ) };
  let mut rx = provider.call_streaming( "POST", "/chat/completions", Value::Null ).await.unwrap();

  let mut received = Vec::new();
  while let Some( chunk ) = rx.recv().await
  {
    received.push( chunk );
  }

  assert_eq!( received.len(), 4, "3 data chunks then one terminal error chunk" );
  assert!( received[ ..3 ].iter().all( | c | matches!( c, Ok( chunk ) if !chunk.is_final ) ) );
  assert!( matches!( &received[ 3 ], Err( GatewayError::StreamAborted( _ ) ) ) );
}

#[ tokio::test ]
async fn scenario_7_streaming_request_runs_headers_phase_then_defers_sinks()
{
  let ( dispatcher, fake ) = build_dispatcher( 10.0 ).await;
  let mut ctx = request( r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"# );
  ctx.stream_requested = true;
  let outcome = dispatcher.dispatch( ctx, CancellationToken::new() ).await.unwrap();

  let DispatchOutcome::Streaming( streaming ) = outcome
  else { panic!( "a streaming request against a model that supports streaming must return DispatchOutcome::Streaming" ) };
  assert_eq!( streaming.response.status_code, 200 );
  assert!( streaming.response.response_body.is_empty(), "S-1 runs against empty initial headers, the body is not yet known" );

  let mut chunks = streaming.chunks;
  let mut received = Vec::new();
  while let Some( chunk ) = chunks.recv().await
  {
    received.push( chunk.unwrap() );
  }
  assert!( received.last().is_some_and( | c | c.is_final ) );
  assert_eq!( fake.calls.load( Ordering::SeqCst ), 1 );

  let usage = gateway_core::context::TokenUsage { prompt : 10, completion : 5, total : 15 };
  streaming.finish( Some( usage ), 0.01, false );
}

#[ tokio::test( start_paused = false ) ]
async fn scenario_5_inspector_timeout_is_harmless()
{
  let registry = Arc::new( ModuleRegistry::new() );
  let seq = registry.next_sequence();
  registry
    .register( ModuleHandle::Inspector( Arc::new( SleepyInspector::new( Duration::from_millis( 10 ) ) ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let providers = Arc::new( ProviderRegistry::new() );
  let fake = Arc::new( FakeProvider::new() );
  providers.register( Arc::clone( &fake ) as Arc< dyn ProviderAdapter >, CircuitBreakerConfig::default() ).await;

  let dispatcher = Dispatcher::new( Pipeline::new( Arc::clone( &registry ) ), providers, DispatcherConfig::default() );
  let ctx = request( r#"{"model":"gpt-4o-mini","messages":[]}"# );
  let DispatchOutcome::Complete( response ) = dispatcher.dispatch( ctx, CancellationToken::new() ).await.unwrap()
  else { panic!( "non-streaming request must return DispatchOutcome::Complete" ) };

  assert_eq!( response.status_code, 200 );
  assert!( !response.request.annotations.contains_key( "would_have_run" ), "timed-out inspector's annotations must not appear" );

  let inspector = registry.get( "sleepy_inspector" ).await.expect( "inspector stays registered after the request" );
  assert_eq!( inspector.meta().counters.error_count(), 1, "a timed-out inspector's error_count must increment by 1" );
  assert_eq!( inspector.meta().counters.requests_processed(), 1 );
}
