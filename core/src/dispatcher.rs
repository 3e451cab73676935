//! Request dispatcher: the single entry point into the gateway core
//!
//! Runs the request-side pipeline phases, resolves and calls a provider
//! through its circuit breaker, then runs the response-side pipeline
//! phases. Cancellation is cooperative: a caller holding the returned
//! [`tokio_util::sync::CancellationToken`] can abort a call still waiting
//! on the upstream.

mod private
{
  use std::sync::Arc;
  use std::time::{ Duration, Instant };
  use tokio_util::sync::CancellationToken;
  use crate::context::{ RequestContext, ResponseContext, TokenUsage };
  use crate::error::GatewayError;
  use crate::pipeline::Pipeline;
  use crate::pipeline::RequestPhaseOutcome;
  use crate::provider::{ ProviderRegistry, StreamReceiver };

  /// What [`Dispatcher::dispatch`] hands back: either a complete response or
  /// a still-draining stream the caller must finish itself.
  #[ derive( Debug ) ]
  pub enum DispatchOutcome
  {
    /// The provider call (or a block/error synthesis) already produced a
    /// complete response; `S-2` sinks have already been scheduled.
    Complete( ResponseContext ),
    /// The provider accepted a streaming call; `S-1` has already run against
    /// the initial headers, but `S-2` sinks do not run until the caller
    /// calls [`StreamingDispatch::finish`].
    Streaming( StreamingDispatch ),
  }

  /// A streaming response in progress: initial headers plus the chunk
  /// receiver, and the bookkeeping needed to schedule `S-2` sinks once the
  /// caller has drained it to completion.
  #[ derive( Debug ) ]
  pub struct StreamingDispatch
  {
    /// Status code and headers already run through the response-side
    /// transformers; `response_body` is empty and must be ignored.
    pub response : ResponseContext,
    /// Chunk-by-chunk body; the caller drains this until it returns `None`.
    pub chunks : StreamReceiver,
    pipeline : Pipeline,
  }

  impl StreamingDispatch
  {
    /// Schedule `S-2` sinks against the final accumulated context. Call
    /// this once [`Self::chunks`] has been drained (or the caller gave up
    /// early), passing whatever usage/cost the caller accumulated from the
    /// chunks and whether the stream ended early (`stream_terminated`).
    pub fn finish( self, usage : Option< TokenUsage >, cost_usd : f64, stream_terminated : bool )
    {
      let mut response = self.response;
      response.token_usage = usage;
      response.cost_usd = cost_usd;
      response.stream_terminated = stream_terminated;
      self.pipeline.finish_streaming( response );
    }
  }

  /// Per-call timeout applied to the upstream provider call, independent of
  /// any single module's `processing_timeout`.
  #[ derive( Debug, Clone, Copy ) ]
  pub struct DispatcherConfig
  {
    /// Maximum time to wait on the provider call before treating it as
    /// [`GatewayError::UpstreamTimeout`].
    pub upstream_timeout : Duration,
  }

  impl Default for DispatcherConfig
  {
    fn default() -> Self
    {
      Self { upstream_timeout : Duration::from_secs( 60 ) }
    }
  }

  /// Wires a [`Pipeline`] and a [`ProviderRegistry`] together behind one
  /// `dispatch` entry point.
  #[ derive( Debug, Clone ) ]
  pub struct Dispatcher
  {
    pipeline : Pipeline,
    providers : Arc< ProviderRegistry >,
    config : DispatcherConfig,
  }

  impl Dispatcher
  {
    /// Build a dispatcher over `pipeline` and `providers`.
    #[ must_use ]
    pub fn new( pipeline : Pipeline, providers : Arc< ProviderRegistry >, config : DispatcherConfig ) -> Self
    {
      Self { pipeline, providers, config }
    }

    /// Run the full request -> provider -> response flow for `ctx`.
    ///
    /// `cancellation` lets a caller abort the upstream call; a cancellation
    /// observed while waiting on the provider surfaces as
    /// [`GatewayError::StreamAborted`] and still runs the response-side
    /// sinks so cost/audit bookkeeping for the attempt is not lost.
    ///
    /// Returns [`DispatchOutcome::Streaming`] only when `ctx.stream_requested`
    /// is set and the resolved model's pricing row reports
    /// `supports_streaming`; every other path returns
    /// [`DispatchOutcome::Complete`] with `S-2` sinks already scheduled.
    pub async fn dispatch( &self, mut ctx : RequestContext, cancellation : CancellationToken ) -> Result< DispatchOutcome, GatewayError >
    {
      let start = Instant::now();
      let span = tracing::info_span!( "dispatch", request_id = %ctx.request_id, provider = %ctx.provider_name );
      let _entered = span.enter();

      match self.pipeline.run_request_phase( &mut ctx ).await
      {
        RequestPhaseOutcome::Blocked { module, reason } =>
        {
          tracing::warn!( policy = %module, reason = %reason, "request blocked by policy" );
          // Shape per spec.md §6 "Block response shape":
          // { "request_id", "error": "blocked", "reason", "module" }.
          let body = serde_json::json!(
          {
            "request_id" : ctx.request_id.to_string(),
            "error" : "blocked",
            "reason" : reason,
            "module" : module,
          } );
          let response = ResponseContext::synthesized( ctx, 403, serde_json::to_vec( &body ).unwrap_or_default(), Some( format!( "{module}: {reason}" ) ) );
          return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
        },
        RequestPhaseOutcome::Proceed => {},
      }

      let model = ctx.model_name.clone().unwrap_or_default();
      let ( adapter, breaker ) = match self.providers.get_for_model( &model ).await
      {
        Ok( resolved ) => resolved,
        Err( err ) =>
        {
          tracing::warn!( model = %model, "no healthy provider for model" );
          let response = ResponseContext::synthesized( ctx, 503, b"no healthy provider".to_vec(), Some( err.to_string() ) );
          return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
        },
      };

      if !breaker.try_acquire().await
      {
        let retry_after_ms = breaker.retry_after().await.as_millis() as u64;
        tracing::warn!( upstream = %ctx.provider_name, retry_after_ms, "circuit open, rejecting without calling upstream" );
        let err = GatewayError::CircuitOpen { upstream : ctx.provider_name.clone(), retry_after_ms };
        let response = ResponseContext::synthesized( ctx, 503, err.to_string().into_bytes(), Some( err.to_string() ) );
        return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
      }

      if ctx.stream_requested && adapter.model_table().supports_streaming( &model )
      {
        return self.dispatch_streaming( ctx, start, adapter, breaker ).await;
      }

      let body : serde_json::Value = serde_json::from_slice( &ctx.body ).unwrap_or( serde_json::Value::Null );
      let provider_call_start = Instant::now();
      let call = tokio::time::timeout( self.config.upstream_timeout, adapter.call( &ctx.method, &ctx.path, body ) );

      let outcome = tokio::select!
      {
        result = call => result.unwrap_or( Err( GatewayError::UpstreamTimeout ) ),
        () = cancellation.cancelled() =>
        {
          breaker.record_failure().await;
          let response = ResponseContext::synthesized( ctx, 499, b"request cancelled".to_vec(), Some( "cancelled by caller".to_string() ) );
          return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
        },
      };

      let response_ctx = match outcome
      {
        Ok( provider_response ) =>
        {
          breaker.record_success().await;
          let usage = provider_response.usage.unwrap_or( TokenUsage { prompt : 0, completion : 0, total : 0 } );
          let cost_usd = adapter.model_table().cost_usd( &model, usage );
          ResponseContext
          {
            status_code : provider_response.status_code,
            response_headers : crate::context::Headers::new(),
            response_body : serde_json::to_vec( &provider_response.body ).unwrap_or_default(),
            provider_latency : provider_call_start.elapsed(),
            total_latency : start.elapsed(),
            token_usage : Some( usage ),
            cost_usd,
            blocked_reason : None,
            stream_terminated : false,
            request : ctx,
          }
        },
        Err( err ) =>
        {
          breaker.record_failure().await;
          tracing::warn!( error = %err, "provider call failed" );
          // Upstream status codes pass through verbatim, an upstream timeout
          // maps to 504, anything else is a 502 bad-gateway.
          let status_code = match &err
          {
            GatewayError::UpstreamStatus( code ) => *code,
            GatewayError::UpstreamTimeout => 504,
            _ => 502,
          };
          ResponseContext::synthesized( ctx, status_code, err.to_string().into_bytes(), Some( err.to_string() ) )
        },
      };

      Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response_ctx ).await ) )
    }

    /// Streaming branch of [`Self::dispatch`]: per spec §4.3.2, the circuit
    /// breaker wraps only the acquisition of the initial response, not the
    /// chunk-by-chunk body; `S-1` runs against the (bodyless) initial
    /// headers and `S-2` is deferred to [`StreamingDispatch::finish`].
    async fn dispatch_streaming(
      &self,
      ctx : RequestContext,
      start : Instant,
      adapter : Arc< dyn crate::provider::ProviderAdapter >,
      breaker : Arc< crate::circuit_breaker::CircuitBreaker >,
    ) -> Result< DispatchOutcome, GatewayError >
    {
      let body : serde_json::Value = serde_json::from_slice( &ctx.body ).unwrap_or( serde_json::Value::Null );
      let provider_call_start = Instant::now();
      let acquisition = tokio::time::timeout( self.config.upstream_timeout, adapter.call_streaming( &ctx.method, &ctx.path, body ) ).await;

      let chunks = match acquisition
      {
        Ok( Ok( chunks ) ) =>
        {
          breaker.record_success().await;
          chunks
        },
        Ok( Err( err ) ) =>
        {
          breaker.record_failure().await;
          tracing::warn!( error = %err, "streaming acquisition failed" );
          let status_code = match &err
          {
            GatewayError::UpstreamStatus( code ) => *code,
            _ => 502,
          };
          let response = ResponseContext::synthesized( ctx, status_code, err.to_string().into_bytes(), Some( err.to_string() ) );
          return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
        },
        Err( _ ) =>
        {
          breaker.record_failure().await;
          let response = ResponseContext::synthesized( ctx, 504, b"upstream timed out".to_vec(), Some( GatewayError::UpstreamTimeout.to_string() ) );
          return Ok( DispatchOutcome::Complete( self.pipeline.run_response_phase( response ).await ) );
        },
      };

      let initial = ResponseContext
      {
        status_code : 200,
        response_headers : crate::context::Headers::new(),
        response_body : Vec::new(),
        provider_latency : provider_call_start.elapsed(),
        total_latency : start.elapsed(),
        token_usage : None,
        cost_usd : 0.0,
        blocked_reason : None,
        stream_terminated : false,
        request : ctx,
      };
      let response = self.pipeline.run_response_headers_phase( initial ).await;
      Ok( DispatchOutcome::Streaming( StreamingDispatch { response, chunks, pipeline : self.pipeline.clone() } ) )
    }
  }
}

crate::mod_interface!
{
  exposed use private::DispatcherConfig;
  exposed use private::Dispatcher;
  exposed use private::DispatchOutcome;
  exposed use private::StreamingDispatch;
}
