//! Error taxonomy for the gateway core
//!
//! Every error the core surfaces to a caller is one of these variants. Module
//! bodies return their own errors through [`GatewayError::ModuleError`];
//! everything else originates in the circuit breaker, the provider adapter,
//! or the dispatcher itself.

mod private
{
  use error_tools::dependency::thiserror;

  /// Errors surfaced by the gateway core.
  #[ derive( Debug, Clone, thiserror::Error ) ]
  pub enum GatewayError
  {
    /// A module's configuration failed validation at register/reload time.
    #[ error( "module '{module}' has invalid configuration : {reason}" ) ]
    ModuleConfigInvalid
    {
      /// Name of the offending module.
      module : String,
      /// Human-readable reason validation failed.
      reason : String,
    },

    /// A module call exceeded its `processing_timeout`.
    #[ error( "module '{module}' timed out after {elapsed_ms}ms" ) ]
    ModuleTimeout
    {
      /// Name of the module that timed out.
      module : String,
      /// How long the call had run before it was abandoned.
      elapsed_ms : u64,
    },

    /// A module call returned an error (as opposed to timing out).
    #[ error( "module '{module}' returned an error : {reason}" ) ]
    ModuleError
    {
      /// Name of the module that errored.
      module : String,
      /// The error the module reported.
      reason : String,
    },

    /// A policy blocked the request. Terminal for the request.
    #[ error( "blocked by policy '{module}' : {reason}" ) ]
    PolicyBlock
    {
      /// Name of the blocking policy.
      module : String,
      /// Human-readable block reason.
      reason : String,
    },

    /// The circuit breaker for this upstream is open.
    #[ error( "circuit open for upstream '{upstream}'" ) ]
    CircuitOpen
    {
      /// Name of the upstream whose breaker is open.
      upstream : String,
      /// Suggested retry-after duration, derived from the breaker's reset timeout.
      retry_after_ms : u64,
    },

    /// The upstream responded with a non-2xx status.
    #[ error( "upstream responded with status {0}" ) ]
    UpstreamStatus( u16 ),

    /// The upstream call exceeded its configured timeout.
    #[ error( "upstream timed out" ) ]
    UpstreamTimeout,

    /// No healthy provider could be resolved for the request.
    #[ error( "no healthy provider available" ) ]
    NoHealthyProvider,

    /// A streaming response was aborted mid-flight.
    #[ error( "stream aborted : {0}" ) ]
    StreamAborted( String ),

    /// Registry-level failure (unknown module, duplicate name, missing dependency, ...).
    #[ error( "registry error : {0}" ) ]
    Registry( String ),

    /// Pipeline-level failure not attributable to any single module.
    #[ error( "pipeline error : {0}" ) ]
    Pipeline( String ),
  }

  impl From< reqwest::Error > for GatewayError
  {
    #[ inline ]
    fn from( err : reqwest::Error ) -> Self
    {
      if err.is_timeout()
      {
        GatewayError::UpstreamTimeout
      }
      else if let Some( status ) = err.status()
      {
        GatewayError::UpstreamStatus( status.as_u16() )
      }
      else
      {
        GatewayError::ModuleError
        {
          module : "http".to_string(),
          reason : err.to_string(),
        }
      }
    }
  }

  impl From< serde_json::Error > for GatewayError
  {
    #[ inline ]
    fn from( err : serde_json::Error ) -> Self
    {
      GatewayError::Pipeline( format!( "serialization error : {err}" ) )
    }
  }

  impl GatewayError
  {
    /// `true` for the subset of variants that are fail-closed by definition
    /// (the caller must not proceed to the provider).
    #[ must_use ]
    pub fn is_terminal( &self ) -> bool
    {
      matches!(
        self,
        GatewayError::PolicyBlock { .. }
          | GatewayError::CircuitOpen { .. }
          | GatewayError::NoHealthyProvider
          | GatewayError::UpstreamStatus( _ )
          | GatewayError::UpstreamTimeout
      )
    }
  }
}

crate::mod_interface!
{
  exposed use private::GatewayError;
}
