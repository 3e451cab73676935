//! Quantified invariants from the pipeline's testable-properties set (P1-P9),
//! exercised directly against [`Pipeline`] without a dispatcher or provider.

use std::collections::HashMap;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::condition::ConditionSet;
use gateway_core::context::{ ModuleConfigSnapshot, RequestContext };
use gateway_core::error::GatewayError;
use gateway_core::module::{ Inspector, Module, ModuleCounters, ModuleHandle, ModuleKind, ModuleMeta, ModuleOutcome, Policy, Sink };
use gateway_core::pipeline::{ Pipeline, RequestPhaseOutcome };
use gateway_core::context::ResponseContext;
use gateway_core::registry::ModuleRegistry;
use serde_json::Value;

fn meta( name : &str, kind : ModuleKind, priority : i32, sequence : u64 ) -> ModuleMeta
{
  ModuleMeta
  {
    name : name.to_string(),
    kind,
    depends_on : Vec::new(),
    priority,
    registration_sequence : sequence,
    conditions : ConditionSet::default(),
    processing_timeout : std::time::Duration::from_millis( 50 ),
    config : Value::Null,
    counters : ModuleCounters::new(),
  }
}

fn base_request() -> RequestContext
{
  RequestContext::new( "openai", "POST", "/chat/completions", b"{\"a\":1}".to_vec(), Arc::new( ModuleConfigSnapshot::default() ) )
}

#[ derive( Debug ) ]
struct ErroringInspector
{
  meta : ModuleMeta,
}

#[ async_trait ]
impl Module for ErroringInspector
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Inspector for ErroringInspector
{
  async fn inspect( &self, _ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >
  {
    Err( GatewayError::ModuleError { module : self.meta.name.clone(), reason : "boom".to_string() } )
  }
}

#[ derive( Debug ) ]
struct AnnotatingInspector
{
  meta : ModuleMeta,
  key : &'static str,
  value : Value,
}

#[ async_trait ]
impl Module for AnnotatingInspector
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Inspector for AnnotatingInspector
{
  async fn inspect( &self, _ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >
  {
    let mut map = HashMap::new();
    map.insert( self.key.to_string(), self.value.clone() );
    Ok( map )
  }
}

#[ derive( Debug ) ]
struct BlockingPolicy
{
  meta : ModuleMeta,
}

#[ async_trait ]
impl Module for BlockingPolicy
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Policy for BlockingPolicy
{
  async fn evaluate( &self, _ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >
  {
    Ok( ModuleOutcome::Block { reason : "always blocks".to_string() } )
  }
}

#[ derive( Debug ) ]
struct AnnotatingPolicy
{
  meta : ModuleMeta,
  key : &'static str,
  value : Value,
}

#[ async_trait ]
impl Module for AnnotatingPolicy
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Policy for AnnotatingPolicy
{
  async fn evaluate( &self, _ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >
  {
    let mut map = HashMap::new();
    map.insert( self.key.to_string(), self.value.clone() );
    Ok( ModuleOutcome::Continue( map ) )
  }
}

/// A policy that reads back whatever an earlier policy wrote, recording
/// what it saw so the test can assert on it.
#[ derive( Debug ) ]
struct ReadingPolicy
{
  meta : ModuleMeta,
  read_key : &'static str,
  seen : Arc< tokio::sync::Mutex< Option< Value > > >,
}

#[ async_trait ]
impl Module for ReadingPolicy
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Policy for ReadingPolicy
{
  async fn evaluate( &self, ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >
  {
    *self.seen.lock().await = ctx.annotations.get( self.read_key ).cloned();
    Ok( ModuleOutcome::Continue( HashMap::new() ) )
  }
}

#[ derive( Debug ) ]
struct RecordingSink
{
  meta : ModuleMeta,
  invoked : Arc< AtomicBool >,
  invocation_count : Arc< AtomicU32 >,
}

#[ async_trait ]
impl Module for RecordingSink
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Sink for RecordingSink
{
  async fn record( &self, _ctx : &ResponseContext ) -> Result< (), GatewayError >
  {
    self.invoked.store( true, Ordering::SeqCst );
    self.invocation_count.fetch_add( 1, Ordering::SeqCst );
    Ok( () )
  }
}

#[ tokio::test ]
async fn p1_fail_closed_policy_blocks_before_dispatch()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.register( ModuleHandle::Policy( Arc::new( BlockingPolicy { meta : meta( "blocker", ModuleKind::Policy, 0, 0 ) } ) ) ).await.unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( registry );
  let mut ctx = base_request();
  let outcome = pipeline.run_request_phase( &mut ctx ).await;

  assert!( matches!( outcome, RequestPhaseOutcome::Blocked { .. } ) );
}

#[ tokio::test ]
async fn p2_fail_open_inspector_never_stops_the_request()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.register( ModuleHandle::Inspector( Arc::new( ErroringInspector { meta : meta( "broken", ModuleKind::Inspector, 0, 0 ) } ) ) ).await.unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( Arc::clone( &registry ) );
  let mut ctx = base_request();
  let outcome = pipeline.run_request_phase( &mut ctx ).await;

  assert!( matches!( outcome, RequestPhaseOutcome::Proceed ) );

  let inspector = registry.get( "broken" ).await.unwrap();
  assert_eq!( inspector.meta().counters.error_count(), 1, "an erroring inspector's error_count must increment by 1" );
  assert_eq!( inspector.meta().counters.requests_processed(), 1 );
}

#[ tokio::test ]
async fn p3_annotation_written_by_earlier_module_is_visible_to_later_one()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry
    .register( ModuleHandle::Inspector( Arc::new( AnnotatingInspector { meta : meta( "first", ModuleKind::Inspector, 0, 0 ), key : "risk", value : Value::from( 1 ) } ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( registry );
  let mut ctx = base_request();
  pipeline.run_request_phase( &mut ctx ).await;

  assert_eq!( ctx.annotations.get( "risk" ), Some( &Value::from( 1 ) ) );
}

/// P3 across Phase R-2 specifically: a policy's `Continue` annotations must
/// be merged before the next policy runs, per spec.md §4.4.1 Phase R-2
/// ("If the result carries annotations, merge them").
#[ tokio::test ]
async fn p3_policy_annotation_is_merged_and_visible_to_later_policy()
{
  let seen = Arc::new( tokio::sync::Mutex::new( None ) );
  let registry = Arc::new( ModuleRegistry::new() );
  registry
    .register( ModuleHandle::Policy( Arc::new( AnnotatingPolicy { meta : meta( "annotator", ModuleKind::Policy, 0, 0 ), key : "policy_risk", value : Value::from( 7 ) } ) ) )
    .await
    .unwrap();
  registry
    .register( ModuleHandle::Policy( Arc::new( ReadingPolicy { meta : meta( "reader", ModuleKind::Policy, 1, 1 ), read_key : "policy_risk", seen : Arc::clone( &seen ) } ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( registry );
  let mut ctx = base_request();
  let outcome = pipeline.run_request_phase( &mut ctx ).await;

  assert!( matches!( outcome, RequestPhaseOutcome::Proceed ) );
  assert_eq!( ctx.annotations.get( "policy_risk" ), Some( &Value::from( 7 ) ) );
  assert_eq!( *seen.lock().await, Some( Value::from( 7 ) ) );
}

#[ tokio::test ]
async fn p3_collision_is_namespaced_not_silently_overwritten()
{
  let mut ctx = base_request();
  let mut first = HashMap::new();
  first.insert( "key".to_string(), Value::from( "a" ) );
  ctx.merge_annotations( "module_a", first );

  let mut second = HashMap::new();
  second.insert( "key".to_string(), Value::from( "b" ) );
  ctx.merge_annotations( "module_b", second );

  assert_eq!( ctx.annotations.get( "key" ), Some( &Value::from( "a" ) ) );
  assert_eq!( ctx.annotations.get( "module_b.key" ), Some( &Value::from( "b" ) ) );
}

#[ tokio::test ]
async fn p6_sink_runs_even_when_request_is_blocked()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.register( ModuleHandle::Policy( Arc::new( BlockingPolicy { meta : meta( "blocker", ModuleKind::Policy, 0, 0 ) } ) ) ).await.unwrap();
  let invoked = Arc::new( AtomicBool::new( false ) );
  let invocation_count = Arc::new( AtomicU32::new( 0 ) );
  registry
    .register( ModuleHandle::Sink( Arc::new( RecordingSink { meta : meta( "recorder", ModuleKind::Sink, 0, 0 ), invoked : Arc::clone( &invoked ), invocation_count : Arc::clone( &invocation_count ) } ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( registry );
  let mut ctx = base_request();
  let outcome = pipeline.run_request_phase( &mut ctx ).await;
  let RequestPhaseOutcome::Blocked { module, reason } = outcome else { panic!( "expected a block" ) };
  let response = ResponseContext::synthesized( ctx, 403, Vec::new(), Some( format!( "{module}: {reason}" ) ) );
  let _ = pipeline.run_response_phase( response ).await;

  // sinks are detached; give the spawned task a chance to run.
  tokio::time::sleep( std::time::Duration::from_millis( 20 ) ).await;
  assert!( invoked.load( Ordering::SeqCst ), "sink must run even for a blocked request" );
  assert_eq!( invocation_count.load( Ordering::SeqCst ), 1, "sink must run exactly once" );
}

#[ tokio::test ]
async fn p8_passthrough_with_no_transformer_leaves_body_unchanged()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.start_all().await.unwrap();
  let pipeline = Pipeline::new( registry );

  let original = b"{\"unchanged\":true}".to_vec();
  let mut ctx = RequestContext::new( "openai", "POST", "/chat/completions", original.clone(), Arc::new( ModuleConfigSnapshot::default() ) );
  pipeline.run_request_phase( &mut ctx ).await;

  assert_eq!( ctx.body, original );
}

#[ derive( Debug ) ]
struct OrderRecordingPolicy
{
  meta : ModuleMeta,
  order : Arc< tokio::sync::Mutex< Vec< String > > >,
}

#[ async_trait ]
impl Module for OrderRecordingPolicy
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Policy for OrderRecordingPolicy
{
  async fn evaluate( &self, _ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >
  {
    self.order.lock().await.push( self.meta.name.clone() );
    Ok( ModuleOutcome::Continue( HashMap::new() ) )
  }
}

/// P4: policies run in ascending `(priority, registration_sequence)` order,
/// and that order is identical across repeated runs against an unchanged
/// registered set.
#[ tokio::test ]
async fn p4_policies_run_in_priority_then_registration_order()
{
  let registry = Arc::new( ModuleRegistry::new() );
  let order = Arc::new( tokio::sync::Mutex::new( Vec::new() ) );

  // Registered out of priority order and with a same-priority tie, to prove
  // both the priority sort and the registration-order tie-break.
  registry.register( ModuleHandle::Policy( Arc::new( OrderRecordingPolicy { meta : meta( "c_priority10", ModuleKind::Policy, 10, 0 ), order : Arc::clone( &order ) } ) ) ).await.unwrap();
  registry.register( ModuleHandle::Policy( Arc::new( OrderRecordingPolicy { meta : meta( "a_priority0_first", ModuleKind::Policy, 0, 1 ), order : Arc::clone( &order ) } ) ) ).await.unwrap();
  registry.register( ModuleHandle::Policy( Arc::new( OrderRecordingPolicy { meta : meta( "b_priority0_second", ModuleKind::Policy, 0, 2 ), order : Arc::clone( &order ) } ) ) ).await.unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( registry );

  let mut first_run = base_request();
  pipeline.run_request_phase( &mut first_run ).await;
  let first_order = order.lock().await.clone();
  order.lock().await.clear();

  let mut second_run = base_request();
  pipeline.run_request_phase( &mut second_run ).await;
  let second_order = order.lock().await.clone();

  let expected = vec![ "a_priority0_first".to_string(), "b_priority0_second".to_string(), "c_priority10".to_string() ];
  assert_eq!( first_order, expected );
  assert_eq!( second_order, expected, "call order must be identical across repeated runs" );
}

#[ derive( Debug ) ]
struct LockProbeInspector
{
  meta : ModuleMeta,
  sleep_for : std::time::Duration,
}

#[ async_trait ]
impl Module for LockProbeInspector
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl Inspector for LockProbeInspector
{
  async fn inspect( &self, _ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >
  {
    tokio::time::sleep( self.sleep_for ).await;
    Ok( HashMap::new() )
  }
}

/// P7: the registry's read lock (taken to copy the module slice) is not held
/// across a module's own execution. A concurrent `register` must complete
/// promptly even while a slow inspector from an in-flight request is still
/// running.
#[ tokio::test ]
async fn p7_concurrent_register_is_not_blocked_by_a_slow_inflight_module()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry
    .register( ModuleHandle::Inspector( Arc::new( LockProbeInspector { meta : meta( "slow", ModuleKind::Inspector, 0, 0 ), sleep_for : std::time::Duration::from_millis( 200 ) } ) ) )
    .await
    .unwrap();
  registry.start_all().await.unwrap();

  let pipeline = Pipeline::new( Arc::clone( &registry ) );
  let mut ctx = base_request();
  let dispatch = tokio::spawn( async move
  {
    pipeline.run_request_phase( &mut ctx ).await;
  } );

  // Give the slow inspector time to start running before attempting a
  // concurrent write.
  tokio::time::sleep( std::time::Duration::from_millis( 20 ) ).await;
  let register_start = std::time::Instant::now();
  registry
    .register( ModuleHandle::Inspector( Arc::new( AnnotatingInspector { meta : meta( "new_arrival", ModuleKind::Inspector, 0, 1 ), key : "late", value : Value::from( true ) } ) ) )
    .await
    .unwrap();
  let register_elapsed = register_start.elapsed();

  dispatch.await.unwrap();
  assert!( register_elapsed < std::time::Duration::from_millis( 100 ), "register must not wait on an in-flight module call, took {register_elapsed:?}" );
}

#[ derive( Debug ) ]
struct UppercaseTransformer
{
  meta : ModuleMeta,
}

#[ async_trait ]
impl Module for UppercaseTransformer
{
  fn meta( &self ) -> &ModuleMeta { &self.meta }
  fn validate( &self, _c : &Value ) -> Result< (), GatewayError > { Ok( () ) }
}

#[ async_trait ]
impl gateway_core::module::Transformer for UppercaseTransformer
{
  async fn transform_request( &self, ctx : &mut RequestContext ) -> Result< (), GatewayError >
  {
    ctx.body = ctx.body.to_ascii_uppercase();
    Ok( () )
  }
}

/// P9: running the same pure transformer twice on identical input yields
/// identical output.
#[ tokio::test ]
async fn p9_pure_transformer_is_idempotent_across_identical_inputs()
{
  let registry = Arc::new( ModuleRegistry::new() );
  registry.register( ModuleHandle::Transformer( Arc::new( UppercaseTransformer { meta : meta( "upper", ModuleKind::Transformer, 0, 0 ) } ) ) ).await.unwrap();
  registry.start_all().await.unwrap();
  let pipeline = Pipeline::new( registry );

  let input = b"same input".to_vec();

  let mut first = RequestContext::new( "openai", "POST", "/chat/completions", input.clone(), Arc::new( ModuleConfigSnapshot::default() ) );
  pipeline.run_request_phase( &mut first ).await;

  let mut second = RequestContext::new( "openai", "POST", "/chat/completions", input, Arc::new( ModuleConfigSnapshot::default() ) );
  pipeline.run_request_phase( &mut second ).await;

  assert_eq!( first.body, second.body );
}
