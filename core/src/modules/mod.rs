//! Built-in modules shipped with the gateway core
//!
//! These are reference implementations of each module class, grounded in
//! concrete scenarios from the system overview: a logging inspector, a
//! token-bucket rate limiter policy, a redacting content filter
//! transformer, and cost/audit sinks. A host is free to register none of
//! these and supply its own modules instead.

use mod_interface::mod_interface;

crate::mod_interface!
{
  layer request_logger;
  layer rate_limiter;
  layer content_filter;
  layer cost_tracker;
  layer audit_log;
}
