//! Anthropic wire-format adapter
//!
//! Anthropic authenticates via `x-api-key` plus an `anthropic-version`
//! header rather than a bearer token, and reports usage under `usage` with
//! `input_tokens`/`output_tokens` rather than OpenAI's `prompt_tokens`/
//! `completion_tokens` naming — the two fields this adapter exists to
//! translate.

use std::time::Duration;
use async_trait::async_trait;
use gateway_core::context::TokenUsage;
use gateway_core::error::GatewayError;
use gateway_core::provider::{ ModelPricing, ModelTable, ProviderAdapter, ProviderResponse };
use serde_json::Value;

const DEFAULT_BASE_URL : &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION : &str = "2023-06-01";

fn pricing_table() -> ModelTable
{
  ModelTable::new( vec!
  [
    ModelPricing { model : "claude-opus-4-5", input_per_token : 0.000_015, output_per_token : 0.000_075, supports_streaming : true, max_tokens : Some( 200_000 ) },
    ModelPricing { model : "claude-sonnet-4-5", input_per_token : 0.000_003, output_per_token : 0.000_015, supports_streaming : true, max_tokens : Some( 200_000 ) },
    ModelPricing { model : "claude-haiku-4-5", input_per_token : 0.000_001, output_per_token : 0.000_005, supports_streaming : true, max_tokens : Some( 200_000 ) },
  ] )
}

/// Adapter for Anthropic's Messages API.
#[ derive( Debug ) ]
pub struct AnthropicAdapter
{
  base_url : String,
  api_key : String,
  http : reqwest::Client,
  pricing : ModelTable,
}

impl AnthropicAdapter
{
  /// Build an adapter with Anthropic's default base URL.
  #[ must_use ]
  pub fn new( api_key : impl Into< String > ) -> Self
  {
    Self::with_base_url( api_key, DEFAULT_BASE_URL )
  }

  /// Build an adapter against a custom base URL.
  #[ must_use ]
  pub fn with_base_url( api_key : impl Into< String >, base_url : impl Into< String > ) -> Self
  {
    Self
    {
      base_url : base_url.into(),
      api_key : api_key.into(),
      http : reqwest::Client::builder().timeout( Duration::from_secs( 120 ) ).build().expect( "static reqwest client config is always valid" ),
      pricing : pricing_table(),
    }
  }
}

fn extract_usage( body : &Value ) -> Option< TokenUsage >
{
  let usage = body.get( "usage" )?;
  let prompt = usage.get( "input_tokens" )?.as_u64()?;
  let completion = usage.get( "output_tokens" )?.as_u64()?;
  Some( TokenUsage { prompt, completion, total : prompt + completion } )
}

#[ async_trait ]
impl ProviderAdapter for AnthropicAdapter
{
  fn name( &self ) -> &str
  {
    "anthropic"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "claude-" ]
  }

  async fn call( &self, method : &str, path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    let url = format!( "{}{}", self.base_url, path );
    let reqwest_method = method.parse::< reqwest::Method >().unwrap_or( reqwest::Method::POST );
    let response = self.http
      .request( reqwest_method, url )
      .header( "x-api-key", &self.api_key )
      .header( "anthropic-version", ANTHROPIC_VERSION )
      .json( &body )
      .send()
      .await?;

    let status_code = response.status().as_u16();
    let payload : Value = response.json().await?;
    if !( 200..300 ).contains( &status_code )
    {
      return Err( GatewayError::UpstreamStatus( status_code ) );
    }
    let usage = extract_usage( &payload );
    Ok( ProviderResponse { status_code, body : payload, usage } )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn prefix_table_matches_claude_models()
  {
    let adapter = AnthropicAdapter::new( "test-key" );
    assert!( adapter.model_prefixes().iter().any( | p | "claude-sonnet-4-5".starts_with( p ) ) );
  }

  #[ test ]
  fn extract_usage_reads_input_output_fields()
  {
    let body = serde_json::json!( { "usage" : { "input_tokens" : 20, "output_tokens" : 8 } } );
    let usage = extract_usage( &body ).unwrap();
    assert_eq!( usage.prompt, 20 );
    assert_eq!( usage.completion, 8 );
    assert_eq!( usage.total, 28 );
  }

  #[ test ]
  fn pricing_known_for_sonnet()
  {
    let table = pricing_table();
    assert!( table.pricing_for( "claude-sonnet-4-5" ).is_some() );
  }
}
