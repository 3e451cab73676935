//! Audit log sink
//!
//! Emits one structured `tracing` event per completed request, including
//! blocked and failed outcomes, at a level chosen from the outcome so a
//! log pipeline can alert on blocks and errors without parsing the message.

mod private
{
  use async_trait::async_trait;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::ResponseContext;
  use crate::error::GatewayError;
  use crate::module::{ Module, ModuleCounters, ModuleKind, ModuleMeta, Sink };

  /// Structured audit trail sink.
  #[ derive( Debug ) ]
  pub struct AuditLogSink
  {
    meta : ModuleMeta,
  }

  impl AuditLogSink
  {
    /// Build an audit log sink.
    #[ must_use ]
    pub fn new( priority : i32, registration_sequence : u64, conditions : ConditionSet ) -> Self
    {
      Self
      {
        meta : ModuleMeta
        {
          name : "audit_log".to_string(),
          kind : ModuleKind::Sink,
          depends_on : Vec::new(),
          priority,
          registration_sequence,
          conditions,
          processing_timeout : std::time::Duration::from_millis( 100 ),
          config : Value::Null,
          counters : ModuleCounters::new(),
        },
      }
    }
  }

  impl Module for AuditLogSink
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
  impl Sink for AuditLogSink
  {
    async fn record( &self, ctx : &ResponseContext ) -> Result< (), GatewayError >
    {
      let request = &ctx.request;
      if let Some( reason ) = &ctx.blocked_reason
      {
        tracing::warn!(
          request_id = %request.request_id,
          tenant = %request.tenant_id,
          status = ctx.status_code,
          reason = %reason,
          "request blocked or failed"
        );
      }
      else
      {
        tracing::info!(
          request_id = %request.request_id,
          tenant = %request.tenant_id,
          provider = %request.provider_name,
          status = ctx.status_code,
          cost_usd = ctx.cost_usd,
          latency_ms = ctx.total_latency.as_millis() as u64,
          "request completed"
        );
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

    #[ tokio::test ]
    async fn records_successful_response_without_error()
    {
      let sink = AuditLogSink::new( 0, 0, ConditionSet::default() );
      let request = RequestContext::new( "openai", "POST", "/chat/completions", Vec::new(), Arc::new( ModuleConfigSnapshot::default() ) );
      let response = ResponseContext::synthesized( request, 200, Vec::new(), None );
      assert!( sink.record( &response ).await.is_ok() );
    }

    #[ tokio::test ]
    async fn records_blocked_response_without_error()
    {
      let sink = AuditLogSink::new( 0, 0, ConditionSet::default() );
      let request = RequestContext::new( "openai", "POST", "/chat/completions", Vec::new(), Arc::new( ModuleConfigSnapshot::default() ) );
      let response = ResponseContext::synthesized( request, 403, Vec::new(), Some( "blocked".to_string() ) );
      assert!( sink.record( &response ).await.is_ok() );
    }
  }
}

crate::mod_interface!
{
  exposed use private::AuditLogSink;
}
