//! Condition grammar used to scope a module to a subset of requests
//!
//! A condition is evaluated against a [`RequestContext`](crate::context::RequestContext)
//! and never mutates it. The grammar is intentionally small: one field
//! selector, one operator, one operand. Composite conditions are built by
//! wrapping several [`Condition`] values in [`ConditionSet`].

mod private
{
  use crate::context::RequestContext;
  use regex::Regex;
  use serde_json::Value;

  /// Field a condition is evaluated against.
  #[ derive( Debug, Clone, PartialEq, Eq ) ]
  pub enum Field
  {
    /// [`RequestContext::tenant_id`](crate::context::RequestContext::tenant_id).
    Tenant,
    /// [`RequestContext::provider_name`](crate::context::RequestContext::provider_name).
    Provider,
    /// [`RequestContext::model_name`](crate::context::RequestContext::model_name), empty string if unset.
    Model,
    /// [`RequestContext::method`](crate::context::RequestContext::method).
    Method,
    /// [`RequestContext::path`](crate::context::RequestContext::path).
    Path,
    /// An annotation value addressed by key, stringified for comparison.
    Annotation( String ),
  }

  /// Operator a [`Condition`] applies between a field's actual value and
  /// the configured operand.
  #[ derive( Debug, Clone ) ]
  pub enum Operator
  {
    /// Field value equals the operand exactly.
    Eq( String ),
    /// Field value does not equal the operand.
    Ne( String ),
    /// Field value is one of the given set.
    In( Vec< String > ),
    /// Field value is none of the given set.
    NotIn( Vec< String > ),
    /// Field value matches the given regular expression.
    Regex( Regex ),
  }

  /// A single `field operator operand` predicate.
  #[ derive( Debug, Clone ) ]
  pub struct Condition
  {
    field : Field,
    operator : Operator,
  }

  impl Condition
  {
    /// Build a condition from a field selector and operator.
    #[ must_use ]
    pub fn new( field : Field, operator : Operator ) -> Self
    {
      Self { field, operator }
    }

    fn field_value( &self, ctx : &RequestContext ) -> String
    {
      match &self.field
      {
        Field::Tenant => ctx.tenant_id.clone(),
        Field::Provider => ctx.provider_name.clone(),
        Field::Model => ctx.model_name.clone().unwrap_or_default(),
        Field::Method => ctx.method.clone(),
        Field::Path => ctx.path.clone(),
        Field::Annotation( key ) => ctx.annotations.get( key ).map_or_else( String::new, value_to_string ),
      }
    }

    /// Evaluate this condition against `ctx`.
    #[ must_use ]
    pub fn matches( &self, ctx : &RequestContext ) -> bool
    {
      let actual = self.field_value( ctx );
      match &self.operator
      {
        Operator::Eq( expected ) => &actual == expected,
        Operator::Ne( expected ) => &actual != expected,
        Operator::In( set ) => set.iter().any( | v | v == &actual ),
        Operator::NotIn( set ) => set.iter().all( | v | v != &actual ),
        Operator::Regex( re ) => re.is_match( &actual ),
      }
    }
  }

  fn value_to_string( value : &Value ) -> String
  {
    match value
    {
      Value::String( s ) => s.clone(),
      other => other.to_string(),
    }
  }

  /// How the members of a [`ConditionSet`] combine.
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum Combinator
  {
    /// All members must match.
    All,
    /// At least one member must match.
    Any,
  }

  /// A set of [`Condition`]s combined with a [`Combinator`].
  ///
  /// An empty set always matches: a module with no conditions configured
  /// runs on every request, which is the natural default.
  #[ derive( Debug, Clone ) ]
  pub struct ConditionSet
  {
    combinator : Combinator,
    conditions : Vec< Condition >,
  }

  impl ConditionSet
  {
    /// Build a set requiring every condition to match.
    #[ must_use ]
    pub fn all( conditions : Vec< Condition > ) -> Self
    {
      Self { combinator : Combinator::All, conditions }
    }

    /// Build a set requiring at least one condition to match.
    #[ must_use ]
    pub fn any( conditions : Vec< Condition > ) -> Self
    {
      Self { combinator : Combinator::Any, conditions }
    }

    /// Evaluate this set against `ctx`.
    #[ must_use ]
    pub fn matches( &self, ctx : &RequestContext ) -> bool
    {
      if self.conditions.is_empty()
      {
        return true;
      }
      match self.combinator
      {
        Combinator::All => self.conditions.iter().all( | c | c.matches( ctx ) ),
        Combinator::Any => self.conditions.iter().any( | c | c.matches( ctx ) ),
      }
    }
  }

  impl Default for ConditionSet
  {
    fn default() -> Self
    {
      Self { combinator : Combinator::All, conditions : Vec::new() }
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use crate::context::ModuleConfigSnapshot;

    fn ctx() -> RequestContext
    {
      let mut ctx = RequestContext::new( "openai", "POST", "/chat/completions", Vec::new(), Arc::new( ModuleConfigSnapshot::default() ) );
      ctx.tenant_id = "acme".to_string();
      ctx.model_name = Some( "gpt-4o".to_string() );
      ctx.annotations.insert( "risk_score".to_string(), serde_json::json!( 42 ) );
      ctx
    }

    #[ test ]
    fn eq_matches_tenant()
    {
      let cond = Condition::new( Field::Tenant, Operator::Eq( "acme".to_string() ) );
      assert!( cond.matches( &ctx() ) );
    }

    #[ test ]
    fn ne_rejects_matching_value()
    {
      let cond = Condition::new( Field::Provider, Operator::Ne( "openai".to_string() ) );
      assert!( !cond.matches( &ctx() ) );
    }

    #[ test ]
    fn in_set_matches_model_prefix_family()
    {
      let cond = Condition::new( Field::Model, Operator::In( vec![ "gpt-4o".to_string(), "gpt-4".to_string() ] ) );
      assert!( cond.matches( &ctx() ) );
    }

    #[ test ]
    fn not_in_excludes_method()
    {
      let cond = Condition::new( Field::Method, Operator::NotIn( vec![ "GET".to_string() ] ) );
      assert!( cond.matches( &ctx() ) );
    }

    #[ test ]
    fn regex_matches_path()
    {
      let cond = Condition::new( Field::Path, Operator::Regex( Regex::new( r"^/chat/" ).unwrap() ) );
      assert!( cond.matches( &ctx() ) );
    }

    #[ test ]
    fn annotation_field_reads_stringified_value()
    {
      let cond = Condition::new( Field::Annotation( "risk_score".to_string() ), Operator::Eq( "42".to_string() ) );
      assert!( cond.matches( &ctx() ) );
    }

    #[ test ]
    fn empty_set_always_matches()
    {
      assert!( ConditionSet::default().matches( &ctx() ) );
    }

    #[ test ]
    fn any_combinator_requires_one_match()
    {
      let set = ConditionSet::any( vec![
        Condition::new( Field::Tenant, Operator::Eq( "nobody".to_string() ) ),
        Condition::new( Field::Provider, Operator::Eq( "openai".to_string() ) ),
      ] );
      assert!( set.matches( &ctx() ) );
    }

    #[ test ]
    fn all_combinator_requires_every_match()
    {
      let set = ConditionSet::all( vec![
        Condition::new( Field::Tenant, Operator::Eq( "acme".to_string() ) ),
        Condition::new( Field::Provider, Operator::Eq( "anthropic".to_string() ) ),
      ] );
      assert!( !set.matches( &ctx() ) );
    }
  }
}

crate::mod_interface!
{
  exposed use private::Field;
  exposed use private::Operator;
  exposed use private::Condition;
  exposed use private::Combinator;
  exposed use private::ConditionSet;
}
