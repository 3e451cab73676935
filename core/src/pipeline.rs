//! Phased pipeline execution
//!
//! Request side runs four phases in order: `R-1` inspectors in parallel
//! (fail-open), `R-2` policies sequentially (fail-closed — the first block
//! stops the request), `R-3` transformers sequentially (fail-open, skip on
//! error), `R-4` sinks detached (fire-and-forget, never awaited by the
//! caller). Response side runs two: `S-1` transformers sequentially,
//! `S-2` sinks detached.

mod private
{
  use std::sync::Arc;
  use tokio::time::timeout;
  use crate::context::{ RequestContext, ResponseContext };
  use crate::error::GatewayError;
  use crate::module::{ ModuleHandle, ModuleKind, ModuleOutcome };
  use crate::registry::ModuleRegistry;

  /// Outcome of running the request-side phases.
  pub enum RequestPhaseOutcome
  {
    /// All inspectors, policies and transformers ran; request may proceed.
    Proceed,
    /// A policy blocked the request; carries the blocking module's name
    /// and reason.
    Blocked
    {
      /// Name of the policy that blocked.
      module : String,
      /// Human-readable reason.
      reason : String,
    },
  }

  /// Runs `fut` under `handle`'s `processing_timeout`, updating `handle`'s
  /// [`crate::module::ModuleCounters`] per spec.md §3: `requests_processed`
  /// ticks on every call, `error_count` ticks whenever the call errors or
  /// times out (P2's "error count for each failing inspector is
  /// incremented by 1", and the same contract for every other module
  /// class).
  async fn run_with_timeout< T >(
    handle : &ModuleHandle,
    fut : impl std::future::Future< Output = Result< T, GatewayError > >,
  ) -> Result< T, GatewayError >
  {
    let counters = &handle.meta().counters;
    counters.record_call().await;
    let budget = handle.meta().processing_timeout;
    let result = match timeout( budget, fut ).await
    {
      Ok( result ) => result,
      Err( _ ) => Err( GatewayError::ModuleTimeout { module : handle.meta().name.clone(), elapsed_ms : budget.as_millis() as u64 } ),
    };
    if result.is_err()
    {
      counters.record_error();
    }
    result
  }

  /// Runs the phased module pipeline against a [`ModuleRegistry`].
  #[ derive( Debug, Clone ) ]
  pub struct Pipeline
  {
    registry : Arc< ModuleRegistry >,
  }

  impl Pipeline
  {
    /// Build a pipeline over `registry`.
    #[ must_use ]
    pub fn new( registry : Arc< ModuleRegistry > ) -> Self
    {
      Self { registry }
    }

    /// `R-1`: run every matching inspector concurrently. A single
    /// inspector's timeout or error is logged and otherwise ignored — the
    /// phase is fail-open by definition.
    async fn run_inspectors( &self, ctx : &mut RequestContext )
    {
      let inspectors = self.registry.running_of_kind( ModuleKind::Inspector ).await;
      let matching : Vec< ModuleHandle > = inspectors.into_iter().filter( | h | h.meta().conditions.matches( ctx ) ).collect();

      let ctx_snapshot = ctx.clone();
      let calls = matching.iter().map( | handle |
      {
        let ctx_ref = &ctx_snapshot;
        async move
        {
          let ModuleHandle::Inspector( inspector ) = handle else { unreachable!( "running_of_kind filtered to Inspector" ) };
          let result = run_with_timeout( handle, inspector.inspect( ctx_ref ) ).await;
          ( handle.meta().name.clone(), result )
        }
      } );
      let results = futures::future::join_all( calls ).await;

      for ( name, result ) in results
      {
        match result
        {
          Ok( annotations ) => ctx.merge_annotations( &name, annotations ),
          Err( err ) => tracing::warn!( module = %name, error = %err, "inspector failed, continuing (fail-open)" ),
        }
      }
    }

    /// `R-2`: run every matching policy in priority order. The first block
    /// stops the phase; policies after it never run. A `Continue` result's
    /// annotations are merged under the append-only rule before the next
    /// policy runs, per spec.md §4.4.1 Phase R-2 and P3 (annotation
    /// monotonicity).
    async fn run_policies( &self, ctx : &mut RequestContext ) -> Result< (), ( String, String ) >
    {
      let policies = self.registry.running_of_kind( ModuleKind::Policy ).await;
      for handle in policies
      {
        if !handle.meta().conditions.matches( ctx )
        {
          continue;
        }
        let ModuleHandle::Policy( policy ) = &handle else { unreachable!( "running_of_kind filtered to Policy" ) };
        let name = handle.meta().name.clone();
        let outcome = run_with_timeout( &handle, policy.evaluate( ctx ) ).await;
        match outcome
        {
          Ok( ModuleOutcome::Continue( annotations ) ) => ctx.merge_annotations( &name, annotations ),
          Ok( ModuleOutcome::Block { reason } ) => return Err( ( name, reason ) ),
          Err( err ) => return Err( ( name, err.to_string() ) ),
        }
      }
      Ok( () )
    }

    /// `R-3`: run every matching transformer in priority order. A
    /// transformer's own error is logged and skipped — the phase is
    /// fail-open; a transformer never blocks a request.
    async fn run_request_transformers( &self, ctx : &mut RequestContext )
    {
      let transformers = self.registry.running_of_kind( ModuleKind::Transformer ).await;
      for handle in transformers
      {
        if !handle.meta().conditions.matches( ctx )
        {
          continue;
        }
        let ModuleHandle::Transformer( transformer ) = &handle else { unreachable!( "running_of_kind filtered to Transformer" ) };
        if let Err( err ) = run_with_timeout( &handle, transformer.transform_request( ctx ) ).await
        {
          tracing::warn!( module = %handle.meta().name, error = %err, "request transformer failed, skipping (fail-open)" );
        }
      }
    }

    /// `S-1`: run every matching transformer against the response, in
    /// priority order, fail-open.
    async fn run_response_transformers( &self, ctx : &mut ResponseContext )
    {
      let transformers = self.registry.running_of_kind( ModuleKind::Transformer ).await;
      for handle in transformers
      {
        if !handle.meta().conditions.matches( &ctx.request )
        {
          continue;
        }
        let ModuleHandle::Transformer( transformer ) = &handle else { unreachable!( "running_of_kind filtered to Transformer" ) };
        if let Err( err ) = run_with_timeout( &handle, transformer.transform_response( ctx ) ).await
        {
          tracing::warn!( module = %handle.meta().name, error = %err, "response transformer failed, skipping (fail-open)" );
        }
      }
    }

    /// `R-4`/`S-2`: fan every matching sink out on a detached task. Sinks
    /// never delay the caller and their failures are only logged.
    fn spawn_sinks( &self, ctx : ResponseContext )
    {
      let registry = Arc::clone( &self.registry );
      tokio::spawn( async move
      {
        let sinks = registry.running_of_kind( ModuleKind::Sink ).await;
        let ctx = Arc::new( ctx );
        let calls = sinks.into_iter().filter( | h | h.meta().conditions.matches( &ctx.request ) ).map( | handle |
        {
          let ctx = Arc::clone( &ctx );
          async move
          {
            let ModuleHandle::Sink( sink ) = &handle else { unreachable!( "running_of_kind filtered to Sink" ) };
            if let Err( err ) = run_with_timeout( &handle, sink.record( &ctx ) ).await
            {
              tracing::warn!( module = %handle.meta().name, error = %err, "sink failed" );
            }
          }
        } );
        futures::future::join_all( calls ).await;
      } );
    }

    /// Run the full request-side phases (`R-1` through `R-3`), returning
    /// whether the request may proceed to dispatch.
    pub async fn run_request_phase( &self, ctx : &mut RequestContext ) -> RequestPhaseOutcome
    {
      self.run_inspectors( ctx ).await;
      if let Err( ( module, reason ) ) = self.run_policies( ctx ).await
      {
        return RequestPhaseOutcome::Blocked { module, reason };
      }
      self.run_request_transformers( ctx ).await;
      RequestPhaseOutcome::Proceed
    }

    /// Run the full response-side phases (`S-1`, then detach `S-2`) and
    /// return the (possibly rewritten) response context.
    pub async fn run_response_phase( &self, mut ctx : ResponseContext ) -> ResponseContext
    {
      self.run_response_transformers( &mut ctx ).await;
      self.spawn_sinks( ctx.clone() );
      ctx
    }

    /// Run only `S-1` against a response whose body is not yet known (the
    /// initial headers of a streaming response). No sinks are scheduled:
    /// the caller calls [`Self::finish_streaming`] once the stream itself
    /// has terminated, per spec's "transformers apply to the initial
    /// headers only; sinks fire with the final accumulated metadata".
    pub async fn run_response_headers_phase( &self, mut ctx : ResponseContext ) -> ResponseContext
    {
      self.run_response_transformers( &mut ctx ).await;
      ctx
    }

    /// `S-2` for a streaming response: schedule sinks against the final
    /// accumulated context once the stream has drained to completion (or
    /// aborted).
    pub fn finish_streaming( &self, ctx : ResponseContext )
    {
      self.spawn_sinks( ctx );
    }
  }

}

crate::mod_interface!
{
  exposed use private::RequestPhaseOutcome;
  exposed use private::Pipeline;
}
