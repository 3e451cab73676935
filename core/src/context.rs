//! Request and response context threaded through the pipeline
//!
//! The context is the sole channel modules use to communicate: inspectors
//! write annotations, policies and transformers read and add to them, sinks
//! read the final state. [`RequestContext::merge_annotations`] implements
//! the append-only collision rule from the data model: a later module never
//! silently overwrites a key an earlier module wrote.

mod private
{
  use std::collections::HashMap;
  use std::sync::Arc;
  use chrono::{ DateTime, Utc };
  use serde_json::Value;
  use uuid::Uuid;

  /// Reserved tenant id used when a request carries no identifiable tenant.
  pub const UNKNOWN_TENANT : &str = "unknown";

  /// How a collision between two modules writing the same annotation key
  /// is resolved.
  ///
  /// Spec default is [`AnnotationCollisionPolicy::Namespace`]; this is a
  /// configurable escape hatch for hosts that need last-writer-wins
  /// fidelity with systems that do not namespace (see DESIGN.md, "Open
  /// question — annotation namespacing").
  #[ derive( Debug, Clone, Copy, PartialEq, Eq, Default ) ]
  pub enum AnnotationCollisionPolicy
  {
    /// Namespace the later write as `<module-name>.<key>` (spec default).
    #[ default ]
    Namespace,
    /// Let the later write silently replace the earlier one.
    LastWriteWins,
  }

  /// Case-insensitive header multimap: header name -> one or more values.
  #[ derive( Debug, Clone, Default ) ]
  pub struct Headers
  {
    inner : HashMap< String, Vec< String > >,
  }

  impl Headers
  {
    /// Create an empty header map.
    #[ must_use ]
    pub fn new() -> Self
    {
      Self { inner : HashMap::new() }
    }

    fn key( name : &str ) -> String
    {
      name.to_ascii_lowercase()
    }

    /// Append a value for `name`, preserving any values already present.
    pub fn append( &mut self, name : &str, value : impl Into< String > )
    {
      self.inner.entry( Self::key( name ) ).or_default().push( value.into() );
    }

    /// Replace all values for `name` with a single value.
    pub fn set( &mut self, name : &str, value : impl Into< String > )
    {
      self.inner.insert( Self::key( name ), vec![ value.into() ] );
    }

    /// First value for `name`, if any.
    #[ must_use ]
    pub fn get( &self, name : &str ) -> Option< &str >
    {
      self.inner.get( &Self::key( name ) ).and_then( | v | v.first() ).map( String::as_str )
    }

    /// All values for `name`.
    #[ must_use ]
    pub fn get_all( &self, name : &str ) -> &[ String ]
    {
      self.inner.get( &Self::key( name ) ).map_or( &[], Vec::as_slice )
    }

    /// Merge another header map in, appending rather than replacing.
    pub fn merge( &mut self, other : &Headers )
    {
      for ( name, values ) in &other.inner
      {
        self.inner.entry( name.clone() ).or_default().extend( values.iter().cloned() );
      }
    }

    /// Iterate over `(name, values)` pairs.
    pub fn iter( &self ) -> impl Iterator< Item = ( &String, &Vec< String > ) >
    {
      self.inner.iter()
    }
  }

  /// Token usage reported by the upstream provider.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub struct TokenUsage
  {
    /// Prompt/input tokens billed.
    pub prompt : u64,
    /// Completion/output tokens billed.
    pub completion : u64,
    /// `prompt + completion`, kept explicit so a provider's own total (which
    /// may include cached-token adjustments) can differ from the naive sum.
    pub total : u64,
  }

  /// Immutable snapshot of the module configuration active for a request.
  ///
  /// A config reload mid-request never changes what an in-flight request
  /// sees: the dispatcher captures this snapshot once, at context
  /// construction, and the pipeline never re-reads live config through it.
  #[ derive( Debug, Clone, Default ) ]
  pub struct ModuleConfigSnapshot
  {
    /// Opaque per-module config blobs, captured at snapshot time.
    pub values : HashMap< String, Value >,
  }

  /// Per-request context threaded through the request-side pipeline and
  /// into the provider call.
  #[ derive( Debug, Clone ) ]
  pub struct RequestContext
  {
    /// Process-unique identifier, carried verbatim into every log and metric.
    pub request_id : Uuid,
    /// Instant the context was constructed (wall clock, for display/logging).
    pub timestamp : DateTime< Utc >,
    /// Tenant the request belongs to; [`UNKNOWN_TENANT`] when unidentified.
    pub tenant_id : String,
    /// Name of the upstream provider this request targets.
    pub provider_name : String,
    /// Model name, if resolvable before dispatch.
    pub model_name : Option< String >,
    /// HTTP method of the inbound request.
    pub method : String,
    /// Path of the inbound request, with the `/v1/{provider}` prefix stripped.
    pub path : String,
    /// Inbound headers.
    pub headers : Headers,
    /// Inbound body, possibly empty.
    pub body : Vec< u8 >,
    /// Client IP, if known.
    pub client_ip : Option< String >,
    /// Client `User-Agent`, if known.
    pub user_agent : Option< String >,
    /// `true` if the edge indicated the client wants a streamed completion.
    /// The dispatcher only honors this when the resolved model's pricing
    /// row also reports [`crate::provider::ModelPricing::supports_streaming`].
    pub stream_requested : bool,
    /// Append-only annotation map; see [`RequestContext::merge_annotations`].
    pub annotations : HashMap< String, Value >,
    /// Immutable configuration snapshot for this request's lifetime.
    pub module_config_snapshot : Arc< ModuleConfigSnapshot >,
    /// How annotation key collisions are resolved for this request.
    pub collision_policy : AnnotationCollisionPolicy,
  }

  impl RequestContext
  {
    /// Construct a new context. `request_id` is generated fresh; callers
    /// that receive one from the edge should overwrite it immediately.
    #[ must_use ]
    pub fn new(
      provider_name : impl Into< String >,
      method : impl Into< String >,
      path : impl Into< String >,
      body : Vec< u8 >,
      module_config_snapshot : Arc< ModuleConfigSnapshot >,
    ) -> Self
    {
      Self
      {
        request_id : Uuid::new_v4(),
        timestamp : Utc::now(),
        tenant_id : UNKNOWN_TENANT.to_string(),
        provider_name : provider_name.into(),
        model_name : None,
        method : method.into(),
        path : path.into(),
        headers : Headers::new(),
        body,
        client_ip : None,
        user_agent : None,
        stream_requested : false,
        annotations : HashMap::new(),
        module_config_snapshot,
        collision_policy : AnnotationCollisionPolicy::default(),
      }
    }

    /// Mark this request as wanting a streamed completion, if the resolved
    /// provider/model supports it.
    #[ must_use ]
    pub fn with_stream_requested( mut self, stream_requested : bool ) -> Self
    {
      self.stream_requested = stream_requested;
      self
    }

    /// Merge annotations written by `module_name` into this context,
    /// honoring [`RequestContext::collision_policy`].
    ///
    /// Under [`AnnotationCollisionPolicy::Namespace`] (the default), a key
    /// already present is not overwritten: the incoming value is instead
    /// written under `<module_name>.<key>`.
    pub fn merge_annotations( &mut self, module_name : &str, incoming : HashMap< String, Value > )
    {
      for ( key, value ) in incoming
      {
        match self.collision_policy
        {
          AnnotationCollisionPolicy::LastWriteWins =>
          {
            self.annotations.insert( key, value );
          },
          AnnotationCollisionPolicy::Namespace =>
          {
            if self.annotations.contains_key( &key )
            {
              self.annotations.insert( format!( "{module_name}.{key}" ), value );
            }
            else
            {
              self.annotations.insert( key, value );
            }
          },
        }
      }
    }
  }

  /// Extends [`RequestContext`] with everything only known once a response
  /// (or an upstream failure) exists.
  #[ derive( Debug, Clone ) ]
  pub struct ResponseContext
  {
    /// The request this response belongs to.
    pub request : RequestContext,
    /// HTTP-style status code of the final response.
    pub status_code : u16,
    /// Response headers, possibly rewritten by a response transformer.
    pub response_headers : Headers,
    /// Response body, possibly replaced by a response transformer.
    pub response_body : Vec< u8 >,
    /// Time spent waiting on the upstream provider.
    pub provider_latency : std::time::Duration,
    /// Total time spent from dispatch entry to response-phase completion.
    pub total_latency : std::time::Duration,
    /// Normalized token usage, if the provider reported one.
    pub token_usage : Option< TokenUsage >,
    /// Computed cost in US dollars; `0.0` for an unknown model.
    pub cost_usd : f64,
    /// Set by the dispatcher when the request never reached a provider
    /// (blocked, or the provider is unavailable). Sinks use this to record
    /// `blocked` observations even though there is no upstream latency.
    pub blocked_reason : Option< String >,
    /// Set when a streaming response ended early (upstream closed mid-flight).
    pub stream_terminated : bool,
  }

  impl ResponseContext
  {
    /// Build a response context around a request that never reached a
    /// provider (blocked or provider-unavailable path).
    #[ must_use ]
    pub fn synthesized(
      request : RequestContext,
      status_code : u16,
      body : Vec< u8 >,
      blocked_reason : Option< String >,
    ) -> Self
    {
      Self
      {
        request,
        status_code,
        response_headers : Headers::new(),
        response_body : body,
        provider_latency : std::time::Duration::ZERO,
        total_latency : std::time::Duration::ZERO,
        token_usage : None,
        cost_usd : 0.0,
        blocked_reason,
        stream_terminated : false,
      }
    }

    /// Merge annotations into the underlying request context, honoring the
    /// same collision rule as [`RequestContext::merge_annotations`].
    pub fn merge_annotations( &mut self, module_name : &str, incoming : HashMap< String, Value > )
    {
      self.request.merge_annotations( module_name, incoming );
    }
  }
}

crate::mod_interface!
{
  exposed use private::UNKNOWN_TENANT;
  exposed use private::AnnotationCollisionPolicy;
  exposed use private::Headers;
  exposed use private::TokenUsage;
  exposed use private::ModuleConfigSnapshot;
  exposed use private::RequestContext;
  exposed use private::ResponseContext;
}
