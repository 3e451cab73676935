#![ doc( html_root_url = "https://docs.rs/gateway_core/latest/gateway_core/" ) ]
#![ cfg_attr( doc, doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "readme.md" ) ) ) ]
#![ allow( clippy::missing_inline_in_public_items ) ]
#![ allow( clippy::std_instead_of_core ) ]
#![ allow( clippy::must_use_candidate ) ]

//! Module processing pipeline and provider runtime for an LLM reverse proxy
//!
//! # Governing shape
//!
//! A request enters at [`dispatcher::Dispatcher::dispatch`], runs the
//! request-side phases of [`pipeline::Pipeline`], is handed to a
//! [`provider::ProviderAdapter`] resolved from the [`provider::ProviderRegistry`]
//! (itself guarded by a [`circuit_breaker::CircuitBreaker`] per upstream),
//! and finally runs the response-side phases of the pipeline before the
//! response is returned. Every module the pipeline runs lives in the
//! [`registry::ModuleRegistry`].
//!
//! This crate does not speak HTTP to clients, load configuration from disk,
//! or expose metrics over the wire — it is the hard core a reverse proxy's
//! edge sits in front of.

use mod_interface::mod_interface;

crate::mod_interface!
{
  layer error;
  layer context;
  layer condition;
  layer module;
  layer circuit_breaker;
  layer registry;
  layer provider;
  layer pipeline;
  layer dispatcher;
  layer modules;
}
