//! Google Gemini wire-format adapter
//!
//! Gemini authenticates via an `?key=` query parameter rather than a
//! header, and its usage block (`usageMetadata`) uses yet a third naming
//! scheme (`promptTokenCount`/`candidatesTokenCount`) — the normalization
//! this adapter exists for.

use std::time::Duration;
use async_trait::async_trait;
use gateway_core::context::TokenUsage;
use gateway_core::error::GatewayError;
use gateway_core::provider::{ ModelPricing, ModelTable, ProviderAdapter, ProviderResponse };
use serde_json::Value;

const DEFAULT_BASE_URL : &str = "https://generativelanguage.googleapis.com/v1beta";

fn pricing_table() -> ModelTable
{
  ModelTable::new( vec!
  [
    ModelPricing { model : "gemini-2.5-pro", input_per_token : 0.00000125, output_per_token : 0.000005, supports_streaming : true, max_tokens : Some( 1_048_576 ) },
    ModelPricing { model : "gemini-2.5-flash", input_per_token : 0.0000003, output_per_token : 0.0000025, supports_streaming : true, max_tokens : Some( 1_048_576 ) },
  ] )
}

/// Adapter for Google's Gemini `generateContent` API.
#[ derive( Debug ) ]
pub struct GoogleAdapter
{
  base_url : String,
  api_key : String,
  http : reqwest::Client,
  pricing : ModelTable,
}

impl GoogleAdapter
{
  /// Build an adapter with Google's default base URL.
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
  let usage = body.get( "usageMetadata" )?;
  let prompt = usage.get( "promptTokenCount" )?.as_u64()?;
  let completion = usage.get( "candidatesTokenCount" )?.as_u64()?;
  let total = usage.get( "totalTokenCount" ).and_then( Value::as_u64 ).unwrap_or( prompt + completion );
  Some( TokenUsage { prompt, completion, total } )
}

#[ async_trait ]
impl ProviderAdapter for GoogleAdapter
{
  fn name( &self ) -> &str
  {
    "google"
  }

  fn model_table( &self ) -> &ModelTable
  {
    &self.pricing
  }

  fn model_prefixes( &self ) -> &[ &str ]
  {
    &[ "gemini-" ]
  }

  async fn call( &self, method : &str, path : &str, body : Value ) -> Result< ProviderResponse, GatewayError >
  {
    let url = format!( "{}{}?key={}", self.base_url, path, self.api_key );
    let reqwest_method = method.parse::< reqwest::Method >().unwrap_or( reqwest::Method::POST );
    let response = self.http
      .request( reqwest_method, url )
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
  fn prefix_table_matches_gemini_models()
  {
    let adapter = GoogleAdapter::new( "test-key" );
    assert!( adapter.model_prefixes().iter().any( | p | "gemini-2.5-pro".starts_with( p ) ) );
  }

  #[ test ]
  fn extract_usage_reads_camel_case_fields()
  {
    let body = serde_json::json!( { "usageMetadata" : { "promptTokenCount" : 12, "candidatesTokenCount" : 4, "totalTokenCount" : 16 } } );
    let usage = extract_usage( &body ).unwrap();
    assert_eq!( usage.prompt, 12 );
    assert_eq!( usage.completion, 4 );
    assert_eq!( usage.total, 16 );
  }

  #[ test ]
  fn pricing_known_for_flash()
  {
    let table = pricing_table();
    assert!( table.pricing_for( "gemini-2.5-flash" ).is_some() );
  }
}
