//! Cost-tracking sink
//!
//! Accumulates per-tenant spend from [`ResponseContext::cost_usd`]. Kept in
//! memory; a host that needs durable cost accounting registers its own
//! sink alongside or instead of this one, the same way the audit log sink
//! does for compliance logging.

mod private
{
  use std::collections::HashMap;
  use std::sync::Mutex;
  use async_trait::async_trait;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::ResponseContext;
  use crate::error::GatewayError;
  use crate::module::{ HealthStatus, Module, ModuleCounters, ModuleHealth, ModuleKind, ModuleMeta, Sink };

  /// In-memory per-tenant cost accumulator.
  #[ derive( Debug ) ]
  pub struct CostTrackerSink
  {
    meta : ModuleMeta,
    totals : Mutex< HashMap< String, f64 > >,
  }

  impl CostTrackerSink
  {
    /// Build an empty tracker.
    #[ must_use ]
    pub fn new( priority : i32, registration_sequence : u64, conditions : ConditionSet ) -> Self
    {
      Self
      {
        meta : ModuleMeta
        {
          name : "cost_tracker".to_string(),
          kind : ModuleKind::Sink,
          depends_on : Vec::new(),
          priority,
          registration_sequence,
          conditions,
          processing_timeout : std::time::Duration::from_millis( 100 ),
          config : Value::Null,
          counters : ModuleCounters::new(),
        },
        totals : Mutex::new( HashMap::new() ),
      }
    }

    /// Total US dollars recorded for `tenant_id` so far.
    #[ must_use ]
    pub fn total_for( &self, tenant_id : &str ) -> f64
    {
      self.totals.lock().expect( "cost tracker mutex is never held across a panic point" ).get( tenant_id ).copied().unwrap_or( 0.0 )
    }
  }

  #[ async_trait ]
  impl Module for CostTrackerSink
  {
    fn meta( &self ) -> &ModuleMeta
    {
      &self.meta
    }

    fn validate( &self, _config : &Value ) -> Result< (), GatewayError >
    {
      Ok( () )
    }

    async fn health_check( &self ) -> Result< ModuleHealth, GatewayError >
    {
      let started = std::time::Instant::now();
      let tenants = self.totals.lock().expect( "cost tracker mutex is never held across a panic point" ).len();
      Ok( ModuleHealth
      {
        status : HealthStatus::Healthy,
        message : format!( "tracking {tenants} tenant(s)" ),
        last_check : started,
        duration : started.elapsed(),
        details : serde_json::json!( { "tenants_tracked": tenants } ),
      } )
    }
  }

  #[ async_trait ]
  impl Sink for CostTrackerSink
  {
    async fn record( &self, ctx : &ResponseContext ) -> Result< (), GatewayError >
    {
      if ctx.cost_usd > 0.0
      {
        let mut totals = self.totals.lock().expect( "cost tracker mutex is never held across a panic point" );
        *totals.entry( ctx.request.tenant_id.clone() ).or_insert( 0.0 ) += ctx.cost_usd;
      }
      Ok( () )
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;
    use std::sync::Arc;
    use crate::context::{ ModuleConfigSnapshot, RequestContext };

    fn response_with_cost( tenant : &str, cost : f64 ) -> ResponseContext
    {
      let mut request = RequestContext::new( "openai", "POST", "/chat/completions", Vec::new(), Arc::new( ModuleConfigSnapshot::default() ) );
      request.tenant_id = tenant.to_string();
      ResponseContext { cost_usd : cost, ..ResponseContext::synthesized( request, 200, Vec::new(), None ) }
    }

    #[ tokio::test ]
    async fn accumulates_cost_per_tenant()
    {
      let sink = CostTrackerSink::new( 0, 0, ConditionSet::default() );
      sink.record( &response_with_cost( "acme", 0.02 ) ).await.unwrap();
      sink.record( &response_with_cost( "acme", 0.03 ) ).await.unwrap();
      sink.record( &response_with_cost( "globex", 0.10 ) ).await.unwrap();
      assert!( ( sink.total_for( "acme" ) - 0.05 ).abs() < 1e-9 );
      assert!( ( sink.total_for( "globex" ) - 0.10 ).abs() < 1e-9 );
    }

    #[ tokio::test ]
    async fn zero_cost_responses_do_not_pollute_totals()
    {
      let sink = CostTrackerSink::new( 0, 0, ConditionSet::default() );
      sink.record( &response_with_cost( "acme", 0.0 ) ).await.unwrap();
      assert_eq!( sink.total_for( "acme" ), 0.0 );
    }

    #[ tokio::test ]
    async fn health_check_reports_tenant_count()
    {
      let sink = CostTrackerSink::new( 0, 0, ConditionSet::default() );
      sink.record( &response_with_cost( "acme", 0.02 ) ).await.unwrap();
      sink.record( &response_with_cost( "globex", 0.01 ) ).await.unwrap();
      let health = sink.health_check().await.unwrap();
      assert_eq!( health.status, HealthStatus::Healthy );
      assert_eq!( health.details[ "tenants_tracked" ], 2 );
    }
  }
}

crate::mod_interface!
{
  exposed use private::CostTrackerSink;
}
