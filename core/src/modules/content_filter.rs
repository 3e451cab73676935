//! Content filter transformer
//!
//! Scans the request body against a list of regular expressions. A match
//! in `redact` mode replaces the matched text with `[REDACTED]`; a match in
//! `block` mode replaces the whole body with a rejection payload and
//! annotates the request so a downstream sink can record it as refused.
//! As a [`Transformer`] this never stops the request from reaching the
//! provider — a host that needs a hard stop on a content match should pair
//! this with a [`crate::module::Policy`] reading the
//! `content_filter.blocked` annotation it writes.

mod private
{
  use std::collections::HashMap;
  use async_trait::async_trait;
  use regex::Regex;
  use serde_json::Value;
  use crate::condition::ConditionSet;
  use crate::context::RequestContext;
  use crate::error::GatewayError;
  use crate::module::{ Module, ModuleCounters, ModuleKind, ModuleMeta, Transformer };

  /// What a matched pattern does to the request.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum ContentFilterAction
  {
    /// Replace the matched span with `[REDACTED]`.
    Redact,
    /// Replace the whole body and annotate the request as blocked.
    Block,
  }

  /// Regex-driven request-body content filter.
  #[ derive( Debug ) ]
  pub struct ContentFilterTransformer
  {
    meta : ModuleMeta,
    patterns : Vec< Regex >,
    action : ContentFilterAction,
  }

  impl ContentFilterTransformer
  {
    /// Build a filter over `patterns`, applying `action` on any match.
    #[ must_use ]
    pub fn new( patterns : Vec< Regex >, action : ContentFilterAction, priority : i32, registration_sequence : u64, conditions : ConditionSet ) -> Self
    {
      Self
      {
        meta : ModuleMeta
        {
          name : "content_filter".to_string(),
          kind : ModuleKind::Transformer,
          depends_on : Vec::new(),
          priority,
          registration_sequence,
          conditions,
          processing_timeout : std::time::Duration::from_millis( 50 ),
          config : Value::Null,
          counters : ModuleCounters::new(),
        },
        patterns,
        action,
      }
    }
  }

  impl Module for ContentFilterTransformer
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
  impl Transformer for ContentFilterTransformer
  {
    async fn transform_request( &self, ctx : &mut RequestContext ) -> Result< (), GatewayError >
    {
      let Ok( text ) = std::str::from_utf8( &ctx.body ) else { return Ok( () ) };
      let Some( matched_pattern ) = self.patterns.iter().find( | re | re.is_match( text ) ) else { return Ok( () ) };

      match self.action
      {
        ContentFilterAction::Redact =>
        {
          let redacted = matched_pattern.replace_all( text, "[REDACTED]" );
          ctx.body = redacted.into_owned().into_bytes();
          let mut annotations = HashMap::new();
          annotations.insert( "redacted".to_string(), Value::Bool( true ) );
          ctx.merge_annotations( &self.meta.name, annotations );
        },
        ContentFilterAction::Block =>
        {
          ctx.body = br#"{"error":"request blocked by content filter"}"#.to_vec();
          let mut annotations = HashMap::new();
          annotations.insert( "blocked".to_string(), Value::Bool( true ) );
          ctx.merge_annotations( &self.meta.name, annotations );
        },
      }
      Ok( () )
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;
    use std::sync::Arc;
    use crate::context::ModuleConfigSnapshot;

    fn ctx_with_body( body : &str ) -> RequestContext
    {
      RequestContext::new( "openai", "POST", "/chat/completions", body.as_bytes().to_vec(), Arc::new( ModuleConfigSnapshot::default() ) )
    }

    #[ tokio::test ]
    async fn redact_mode_replaces_matched_text()
    {
      let filter = ContentFilterTransformer::new(
        vec![ Regex::new( "secret" ).unwrap() ],
        ContentFilterAction::Redact,
        0, 0, ConditionSet::default(),
      );
      let mut ctx = ctx_with_body( "the secret plan" );
      filter.transform_request( &mut ctx ).await.unwrap();
      assert_eq!( std::str::from_utf8( &ctx.body ).unwrap(), "the [REDACTED] plan" );
      assert_eq!( ctx.annotations.get( "redacted" ), Some( &Value::Bool( true ) ) );
    }

    #[ tokio::test ]
    async fn block_mode_replaces_body_and_annotates()
    {
      let filter = ContentFilterTransformer::new(
        vec![ Regex::new( "forbidden" ).unwrap() ],
        ContentFilterAction::Block,
        0, 0, ConditionSet::default(),
      );
      let mut ctx = ctx_with_body( "this is forbidden content" );
      filter.transform_request( &mut ctx ).await.unwrap();
      assert_eq!( ctx.annotations.get( "blocked" ), Some( &Value::Bool( true ) ) );
    }

    #[ tokio::test ]
    async fn non_matching_body_is_untouched()
    {
      let filter = ContentFilterTransformer::new(
        vec![ Regex::new( "forbidden" ).unwrap() ],
        ContentFilterAction::Redact,
        0, 0, ConditionSet::default(),
      );
      let mut ctx = ctx_with_body( "nothing to see here" );
      filter.transform_request( &mut ctx ).await.unwrap();
      assert_eq!( std::str::from_utf8( &ctx.body ).unwrap(), "nothing to see here" );
    }
  }
}

crate::mod_interface!
{
  exposed use private::ContentFilterAction;
  exposed use private::ContentFilterTransformer;
}
