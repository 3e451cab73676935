//! OpenAI wire-format adapter
//!
//! Thin: all resilience (circuit breaking, timeouts, cost calculation) is
//! the gateway core's job. This crate only knows how to shape a request for
//! `api.openai.com`, attach its auth header, and parse a response's usage
//! block into [`gateway_core::context::TokenUsage`].

use std::time::Duration;
use async_trait::async_trait;
use gateway_core::context::TokenUsage;
use gateway_core::error::GatewayError;
use gateway_core::provider::{ ModelPricing, ModelTable, ProviderAdapter, ProviderResponse };
use serde_json::Value;

const DEFAULT_BASE_URL : &str = "https://api.openai.com/v1";

fn pricing_table() -> ModelTable
{
  ModelTable::new( vec!
  [
    ModelPricing { model : "gpt-4o", input_per_token : 0.000_005, output_per_token : 0.000_015, supports_streaming : true, max_tokens : Some( 128_000 ) },
    ModelPricing { model : "gpt-4o-mini", input_per_token : 0.000_000_15, output_per_token : 0.000_000_6, supports_streaming : true, max_tokens : Some( 128_000 ) },
    ModelPricing { model : "gpt-4-turbo", input_per_token : 0.00001, output_per_token : 0.00003, supports_streaming : true, max_tokens : Some( 128_000 ) },
    ModelPricing { model : "gpt-3.5-turbo", input_per_token : 0.0000005, output_per_token : 0.0000015, supports_streaming : true, max_tokens : Some( 16_385 ) },
  ] )
}

/// Adapter for OpenAI's Chat Completions API.
#[ derive( Debug ) ]
pub struct OpenAiAdapter
{
  base_url : String,
  api_key : String,
  http : reqwest::Client,
  pricing : ModelTable,
}

impl OpenAiAdapter
{
  /// Build an adapter with OpenAI's default base URL.
  #[ must_use ]
  pub fn new( api_key : impl Into< String > ) -> Self
  {
    Self::with_base_url( api_key, DEFAULT_BASE_URL )
  }

  /// Build an adapter against a custom base URL (Azure-compatible proxies,
  /// local test servers).
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
  let prompt = usage.get( "prompt_tokens" )?.as_u64()?;
  let completion = usage.get( "completion_tokens" )?.as_u64()?;
  let total = usage.get( "total_tokens" ).and_then( Value::as_u64 ).unwrap_or( prompt + completion );
  Some( TokenUsage { prompt, completion, total } )
}

#[ async_trait ]
impl ProviderAdapter for OpenAiAdapter
{
  fn name( &self ) -> &str
  {
    "openai"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "gpt-", "o1-", "o3-", "text-embedding-" ]
  }

  async fn call( &self, method : &str, path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    let url = format!( "{}{}", self.base_url, path );
    let reqwest_method = method.parse::< reqwest::Method >().unwrap_or( reqwest::Method::POST );
    let response = self.http
      .request( reqwest_method, url )
      .bearer_auth( &self.api_key )
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
  fn prefix_table_matches_chat_models()
  {
    let adapter = OpenAiAdapter::new( "test-key" );
    assert!( adapter.model_prefixes().iter().any( | p | "gpt-4o".starts_with( p ) ) );
  }

  #[ test ]
  fn extract_usage_reads_standard_fields()
  {
    let body = serde_json::json!( { "usage" : { "prompt_tokens" : 10, "completion_tokens" : 5, "total_tokens" : 15 } } );
    let usage = extract_usage( &body ).unwrap();
    assert_eq!( usage.prompt, 10 );
    assert_eq!( usage.completion, 5 );
    assert_eq!( usage.total, 15 );
  }

  #[ test ]
  fn extract_usage_none_when_absent()
  {
    assert!( extract_usage( &serde_json::json!( {} ) ).is_none() );
  }

  #[ test ]
  fn pricing_known_for_gpt4o()
  {
    let table = pricing_table();
    assert!( table.pricing_for( "gpt-4o" ).is_some() );
  }
}
