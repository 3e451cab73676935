//! Request logging inspector
//!
//! Emits one structured `tracing` event per request it sees. Purely
//! observational: it never blocks and never rewrites annotations other
//! modules depend on, which is why it is an [`Inspector`] and not a
//! [`crate::module::Policy`].

mod private
{
  use std::collections::HashMap;
  use async_trait::async_trait;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::RequestContext;
  use crate::error::GatewayError;
  use crate::module::{ Inspector, Module, ModuleCounters, ModuleKind, ModuleMeta };

  /// Logs every request at `INFO`, tagged with method, path and tenant.
  #[ derive( Debug ) ]
  pub struct RequestLoggerInspector
  {
    meta : ModuleMeta,
  }

  impl RequestLoggerInspector
  {
    /// Build a logger with the given scoping conditions and registration
    /// sequence (obtain the latter from
    /// [`crate::registry::ModuleRegistry::next_sequence`]).
    #[ must_use ]
    pub fn new( priority : i32, registration_sequence : u64, conditions : ConditionSet ) -> Self
    {
      Self
      {
        meta : ModuleMeta
        {
          name : "request_logger".to_string(),
          kind : ModuleKind::Inspector,
          depends_on : Vec::new(),
          priority,
          registration_sequence,
          conditions,
          processing_timeout : std::time::Duration::from_millis( 50 ),
          config : Value::Null,
          counters : ModuleCounters::new(),
        },
      }
    }
  }

  impl Module for RequestLoggerInspector
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
  impl Inspector for RequestLoggerInspector
  {
    async fn inspect( &self, ctx : &RequestContext ) -> Result< HashMap< String, Value >, GatewayError >
    {
      tracing::info!(
        request_id = %ctx.request_id,
        tenant = %ctx.tenant_id,
        provider = %ctx.provider_name,
        method = %ctx.method,
        path = %ctx.path,
        "request received"
      );
      Ok( HashMap::new() )
    }
  }
}

crate::mod_interface!
{
  exposed use private::RequestLoggerInspector;
}
