//! Token-bucket rate limiter policy
//!
//! One bucket per `(tenant, provider)` pair, refilled continuously at
//! `refill_per_second` up to `capacity`. A request that finds an empty
//! bucket is blocked — this is a [`Policy`], so the block is fail-closed
//! and stops the request before it reaches a provider.

mod private
{
  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::{ Duration, Instant };
  use async_trait::async_trait;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::RequestContext;
  use crate::error::GatewayError;
  use crate::module::{ Module, ModuleCounters, ModuleKind, ModuleMeta, ModuleOutcome, Policy };

  #[ derive( Debug ) ]
  struct Bucket
  {
    tokens : f64,
    last_refill : Instant,
  }

  /// Token-bucket rate limiter, keyed by `"{tenant}:{provider}"`.
  #[ derive( Debug ) ]
  pub struct RateLimiterPolicy
  {
    meta : ModuleMeta,
    capacity : f64,
    refill_per_second : f64,
    buckets : Mutex< HashMap< String, Bucket > >,
  }

  impl RateLimiterPolicy
  {
    /// Build a limiter allowing `capacity` requests in a burst, refilling
    /// at `refill_per_second` tokens/sec thereafter.
    #[ must_use ]
    pub fn new( capacity : f64, refill_per_second : f64, priority : i32, registration_sequence : u64, conditions : ConditionSet ) -> Self
    {
      Self
      {
        meta : ModuleMeta
        {
          name : "rate_limiter".to_string(),
          kind : ModuleKind::Policy,
          depends_on : Vec::new(),
          priority,
          registration_sequence,
          conditions,
          processing_timeout : Duration::from_millis( 20 ),
          config : Value::Null,
          counters : ModuleCounters::new(),
        },
        capacity,
        refill_per_second,
        buckets : Mutex::new( HashMap::new() ),
      }
    }

    fn key( ctx : &RequestContext ) -> String
    {
      format!( "{}:{}", ctx.tenant_id, ctx.provider_name )
    }

    fn try_take( &self, key : &str ) -> bool
    {
      let mut buckets = self.buckets.lock().expect( "rate limiter mutex is never held across a panic point" );
      let now = Instant::now();
      let bucket = buckets.entry( key.to_string() ).or_insert_with( || Bucket { tokens : self.capacity, last_refill : now } );

      let elapsed = now.duration_since( bucket.last_refill ).as_secs_f64();
      bucket.tokens = ( bucket.tokens + elapsed * self.refill_per_second ).min( self.capacity );
      bucket.last_refill = now;

      if bucket.tokens >= 1.0
      {
        bucket.tokens -= 1.0;
        true
      }
      else
      {
        false
      }
    }
  }

  impl Module for RateLimiterPolicy
  {
    fn meta( &self ) -> &ModuleMeta
    {
      &self.meta
    }

    fn validate( &self, _config : &Value ) -> Result< (), GatewayError >
    {
      if self.capacity <= 0.0 || self.refill_per_second < 0.0
      {
        return Err( GatewayError::ModuleConfigInvalid { module : self.meta.name.clone(), reason : "capacity must be positive and refill_per_second non-negative".to_string() } );
      }
      Ok( () )
    }
  }

  #[ async_trait ]
  impl Policy for RateLimiterPolicy
  {
    async fn evaluate( &self, ctx : &RequestContext ) -> Result< ModuleOutcome, GatewayError >
    {
      let key = Self::key( ctx );
      if self.try_take( &key )
      {
        Ok( ModuleOutcome::Continue( HashMap::new() ) )
      }
      else
      {
        Ok( ModuleOutcome::Block { reason : format!( "rate limit exceeded for {key}" ) } )
      }
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;
    use std::sync::Arc;
    use crate::context::ModuleConfigSnapshot;

    fn ctx() -> RequestContext
    {
      let mut ctx = RequestContext::new( "openai", "POST", "/chat/completions", Vec::new(), Arc::new( ModuleConfigSnapshot::default() ) );
      ctx.tenant_id = "acme".to_string();
      ctx
    }

    #[ tokio::test ]
    async fn admits_calls_within_capacity()
    {
      let limiter = RateLimiterPolicy::new( 2.0, 0.0, 0, 0, ConditionSet::default() );
      let request = ctx();
      assert!( matches!( limiter.evaluate( &request ).await.unwrap(), ModuleOutcome::Continue( _ ) ) );
      assert!( matches!( limiter.evaluate( &request ).await.unwrap(), ModuleOutcome::Continue( _ ) ) );
    }

    #[ tokio::test ]
    async fn blocks_once_capacity_exhausted()
    {
      let limiter = RateLimiterPolicy::new( 1.0, 0.0, 0, 0, ConditionSet::default() );
      let request = ctx();
      limiter.evaluate( &request ).await.unwrap();
      assert!( matches!( limiter.evaluate( &request ).await.unwrap(), ModuleOutcome::Block { .. } ) );
    }

    #[ test ]
    fn validate_rejects_non_positive_capacity()
    {
      let limiter = RateLimiterPolicy::new( 0.0, 1.0, 0, 0, ConditionSet::default() );
      assert!( limiter.validate( &Value::Null ).is_err() );
    }
  }
}

crate::mod_interface!
{
  exposed use private::RateLimiterPolicy;
}
