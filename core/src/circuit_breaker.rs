//! Circuit breaker guarding calls to a single upstream provider
//!
//! Three states: `Closed` (calls pass through), `Open` (calls are rejected
//! immediately), `HalfOpen` (a single trial call is let through to probe
//! recovery). The `Closed -> Open` transition is rate-based: once at least
//! `min_requests` results have been recorded, the breaker trips as soon as
//! the cumulative failure rate reaches `failure_rate_threshold`. Metrics and
//! an optional state-change callback are exposed for the sink layer to
//! observe.

mod private
{
  use std::sync::Arc;
  use std::sync::atomic::{ AtomicU64, Ordering };
  use std::time::{ Duration, Instant };
  use tokio::sync::RwLock;

  /// Current state of a [`CircuitBreaker`].
  #[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
  pub enum CircuitState
  {
    /// Calls pass through normally; results feed the failure-rate evaluation.
    Closed,
    /// Calls are rejected without reaching the upstream.
    Open,
    /// A single trial call is allowed through to probe recovery.
    HalfOpen,
  }

  /// Threshold and timing configuration for a [`CircuitBreaker`]: a
  /// percentage failure-rate threshold, a minimum sample size before that
  /// rate is evaluated, and a cooldown before a trial call is allowed.
  #[ derive( Debug, Clone, Copy ) ]
  pub struct CircuitBreakerConfig
  {
    /// Fraction of recorded calls that must fail (in `[0.0, 1.0]`) before
    /// the breaker trips, once `min_requests` results have been recorded.
    pub failure_rate_threshold : f64,
    /// Minimum number of recorded results before the failure rate is
    /// evaluated at all.
    pub min_requests : u32,
    /// How long the breaker stays `Open` before a `HalfOpen` trial call is
    /// allowed.
    pub reset_timeout : Duration,
  }

  impl Default for CircuitBreakerConfig
  {
    fn default() -> Self
    {
      Self
      {
        failure_rate_threshold : 0.5,
        min_requests : 10,
        reset_timeout : Duration::from_secs( 30 ),
      }
    }
  }

  /// Point-in-time counters for a [`CircuitBreaker`], cheap to snapshot for
  /// a health endpoint or a sink.
  #[ derive( Debug, Clone, Copy, Default ) ]
  pub struct CircuitBreakerMetrics
  {
    /// Total calls let through (`Closed` or `HalfOpen` trial), lifetime.
    pub total_calls : u64,
    /// Total calls rejected while `Open`, lifetime.
    pub total_rejected : u64,
    /// Total calls that completed successfully, lifetime.
    pub total_successes : u64,
    /// Total calls that completed with failure, lifetime.
    pub total_failures : u64,
    /// How many times the breaker has tripped to `Open`, lifetime.
    pub trip_count : u64,
  }

  impl CircuitBreakerMetrics
  {
    /// Lifetime success rate in `[0.0, 1.0]`; `1.0` if no calls recorded yet.
    #[ must_use ]
    pub fn success_rate( &self ) -> f64
    {
      let completed = self.total_successes + self.total_failures;
      if completed == 0
      {
        1.0
      }
      else
      {
        self.total_successes as f64 / completed as f64
      }
    }
  }

  #[ derive( Debug ) ]
  struct Inner
  {
    state : CircuitState,
    /// Results recorded since entering `Closed` (or since the last trip).
    requests : u32,
    /// Failures within `requests`.
    failures : u32,
    /// When the breaker last tripped to `Open`; drives the `Open -> HalfOpen`
    /// timeout ("now - last_failure_time > reset_timeout").
    last_failure_time : Option< Instant >,
    /// `true` while the single `HalfOpen` trial call is in flight.
    half_open_in_flight : bool,
  }

  /// Callback invoked whenever the breaker transitions state.
  pub type StateChangeCallback = Arc< dyn Fn( &str, CircuitState, CircuitState ) + Send + Sync >;

  /// Per-upstream circuit breaker.
  ///
  /// `name` identifies the upstream this breaker guards and is passed
  /// verbatim to [`StateChangeCallback`] and into
  /// [`crate::error::GatewayError::CircuitOpen`].
  pub struct CircuitBreaker
  {
    name : String,
    config : CircuitBreakerConfig,
    inner : RwLock< Inner >,
    total_calls : AtomicU64,
    total_rejected : AtomicU64,
    total_successes : AtomicU64,
    total_failures : AtomicU64,
    trip_count : AtomicU64,
    on_state_change : Option< StateChangeCallback >,
  }

  impl std::fmt::Debug for CircuitBreaker
  {
    fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
    {
      f.debug_struct( "CircuitBreaker" )
        .field( "name", &self.name )
        .field( "config", &self.config )
        .finish_non_exhaustive()
    }
  }

  impl CircuitBreaker
  {
    /// Build a new breaker, starting `Closed`.
    #[ must_use ]
    pub fn new( name : impl Into< String >, config : CircuitBreakerConfig ) -> Self
    {
      Self::with_callback( name, config, None )
    }

    /// Build a new breaker with a state-change callback.
    #[ must_use ]
    pub fn with_callback( name : impl Into< String >, config : CircuitBreakerConfig, on_state_change : Option< StateChangeCallback > ) -> Self
    {
      Self
      {
        name : name.into(),
        config,
        inner : RwLock::new( Inner
        {
          state : CircuitState::Closed,
          requests : 0,
          failures : 0,
          last_failure_time : None,
          half_open_in_flight : false,
        } ),
        total_calls : AtomicU64::new( 0 ),
        total_rejected : AtomicU64::new( 0 ),
        total_successes : AtomicU64::new( 0 ),
        total_failures : AtomicU64::new( 0 ),
        trip_count : AtomicU64::new( 0 ),
        on_state_change,
      }
    }

    /// Name of the upstream this breaker guards.
    #[ must_use ]
    pub fn name( &self ) -> &str
    {
      &self.name
    }

    /// Current state, re-evaluating an `Open -> HalfOpen` timeout first.
    pub async fn state( &self ) -> CircuitState
    {
      self.maybe_transition_to_half_open().await;
      self.inner.read().await.state
    }

    async fn maybe_transition_to_half_open( &self )
    {
      let should_transition =
      {
        let inner = self.inner.read().await;
        inner.state == CircuitState::Open
          && inner.last_failure_time.is_some_and( | at | at.elapsed() > self.config.reset_timeout )
      };
      if should_transition
      {
        let mut inner = self.inner.write().await;
        if inner.state == CircuitState::Open
          && inner.last_failure_time.is_some_and( | at | at.elapsed() > self.config.reset_timeout )
        {
          let from = inner.state;
          inner.state = CircuitState::HalfOpen;
          inner.half_open_in_flight = false;
          drop( inner );
          self.notify( from, CircuitState::HalfOpen );
        }
      }
    }

    /// Ask permission to make a call. Returns `false` if the call should be
    /// rejected without reaching the upstream (`Open`, or `HalfOpen` with a
    /// trial already in flight).
    pub async fn try_acquire( &self ) -> bool
    {
      self.maybe_transition_to_half_open().await;
      let mut inner = self.inner.write().await;
      match inner.state
      {
        CircuitState::Closed =>
        {
          self.total_calls.fetch_add( 1, Ordering::Relaxed );
          true
        },
        CircuitState::Open =>
        {
          self.total_rejected.fetch_add( 1, Ordering::Relaxed );
          false
        },
        CircuitState::HalfOpen =>
        {
          if inner.half_open_in_flight
          {
            self.total_rejected.fetch_add( 1, Ordering::Relaxed );
            false
          }
          else
          {
            inner.half_open_in_flight = true;
            self.total_calls.fetch_add( 1, Ordering::Relaxed );
            true
          }
        },
      }
    }

    /// Report the outcome of a call previously admitted by
    /// [`Self::try_acquire`].
    async fn record( &self, success : bool )
    {
      if success
      {
        self.total_successes.fetch_add( 1, Ordering::Relaxed );
      }
      else
      {
        self.total_failures.fetch_add( 1, Ordering::Relaxed );
      }

      let mut inner = self.inner.write().await;
      match inner.state
      {
        CircuitState::Closed =>
        {
          inner.requests += 1;
          if !success
          {
            inner.failures += 1;
            inner.last_failure_time = Some( Instant::now() );
          }
          if inner.requests >= self.config.min_requests
            && f64::from( inner.failures ) / f64::from( inner.requests ) >= self.config.failure_rate_threshold
          {
            let from = inner.state;
            inner.state = CircuitState::Open;
            inner.requests = 0;
            inner.failures = 0;
            self.trip_count.fetch_add( 1, Ordering::Relaxed );
            drop( inner );
            self.notify( from, CircuitState::Open );
          }
        },
        CircuitState::HalfOpen =>
        {
          inner.half_open_in_flight = false;
          inner.requests = 0;
          inner.failures = 0;
          let from = inner.state;
          if success
          {
            inner.state = CircuitState::Closed;
            inner.last_failure_time = None;
            drop( inner );
            self.notify( from, CircuitState::Closed );
          }
          else
          {
            inner.state = CircuitState::Open;
            inner.last_failure_time = Some( Instant::now() );
            self.trip_count.fetch_add( 1, Ordering::Relaxed );
            drop( inner );
            self.notify( from, CircuitState::Open );
          }
        },
        CircuitState::Open => {},
      }
    }

    /// Report a successful call previously admitted by [`Self::try_acquire`].
    pub async fn record_success( &self )
    {
      self.record( true ).await;
    }

    /// Report a failed call previously admitted by [`Self::try_acquire`].
    pub async fn record_failure( &self )
    {
      self.record( false ).await;
    }

    fn notify( &self, from : CircuitState, to : CircuitState )
    {
      if let Some( cb ) = self.on_state_change.clone()
      {
        let name = self.name.clone();
        tokio::spawn( async move
        {
          cb( &name, from, to );
        } );
      }
    }

    /// Remaining time until an `Open` breaker becomes eligible for a
    /// `HalfOpen` probe; `0` if not `Open` or already eligible.
    pub async fn retry_after( &self ) -> Duration
    {
      let inner = self.inner.read().await;
      match ( inner.state, inner.last_failure_time )
      {
        ( CircuitState::Open, Some( at ) ) => self.config.reset_timeout.saturating_sub( at.elapsed() ),
        _ => Duration::ZERO,
      }
    }

    /// Snapshot current counters.
    #[ must_use ]
    pub fn metrics( &self ) -> CircuitBreakerMetrics
    {
      CircuitBreakerMetrics
      {
        total_calls : self.total_calls.load( Ordering::Relaxed ),
        total_rejected : self.total_rejected.load( Ordering::Relaxed ),
        total_successes : self.total_successes.load( Ordering::Relaxed ),
        total_failures : self.total_failures.load( Ordering::Relaxed ),
        trip_count : self.trip_count.load( Ordering::Relaxed ),
      }
    }
  }

  #[ cfg( test ) ]
  mod tests
  {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig
    {
      CircuitBreakerConfig
      {
        failure_rate_threshold : 0.5,
        min_requests : 4,
        reset_timeout : Duration::from_millis( 20 ),
      }
    }

    #[ tokio::test ]
    async fn starts_closed_and_admits_calls()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      assert_eq!( cb.state().await, CircuitState::Closed );
      assert!( cb.try_acquire().await );
    }

    #[ tokio::test ]
    async fn stays_closed_below_min_requests_even_at_100_percent_failure()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      for _ in 0..3
      {
        assert!( cb.try_acquire().await );
        cb.record_failure().await;
      }
      assert_eq!( cb.state().await, CircuitState::Closed );
    }

    #[ tokio::test ]
    async fn trips_open_once_rate_threshold_reached_at_min_requests()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      // 2 failures, 2 successes: 4 requests, 50% failure rate, meets threshold.
      cb.try_acquire().await; cb.record_failure().await;
      cb.try_acquire().await; cb.record_success().await;
      cb.try_acquire().await; cb.record_failure().await;
      cb.try_acquire().await; cb.record_success().await;
      assert_eq!( cb.state().await, CircuitState::Open );
      assert!( !cb.try_acquire().await );
    }

    #[ tokio::test ]
    async fn half_opens_after_reset_timeout_and_closes_on_success()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      for _ in 0..4
      {
        cb.try_acquire().await;
        cb.record_failure().await;
      }
      assert_eq!( cb.state().await, CircuitState::Open );
      tokio::time::sleep( Duration::from_millis( 30 ) ).await;
      assert_eq!( cb.state().await, CircuitState::HalfOpen );
      assert!( cb.try_acquire().await );
      cb.record_success().await;
      assert_eq!( cb.state().await, CircuitState::Closed );
    }

    #[ tokio::test ]
    async fn half_open_failure_reopens_immediately()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      for _ in 0..4
      {
        cb.try_acquire().await;
        cb.record_failure().await;
      }
      tokio::time::sleep( Duration::from_millis( 30 ) ).await;
      assert_eq!( cb.state().await, CircuitState::HalfOpen );
      cb.try_acquire().await;
      cb.record_failure().await;
      assert_eq!( cb.state().await, CircuitState::Open );
    }

    #[ tokio::test ]
    async fn half_open_admits_only_one_trial_call_at_a_time()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      for _ in 0..4
      {
        cb.try_acquire().await;
        cb.record_failure().await;
      }
      tokio::time::sleep( Duration::from_millis( 30 ) ).await;
      assert!( cb.try_acquire().await );
      assert!( !cb.try_acquire().await, "a second concurrent trial call must be rejected" );
    }

    #[ tokio::test ]
    async fn metrics_track_calls_and_rejections()
    {
      let cb = CircuitBreaker::new( "up", fast_config() );
      cb.try_acquire().await;
      cb.record_failure().await;
      cb.try_acquire().await;
      cb.record_failure().await;
      cb.try_acquire().await;
      cb.record_failure().await;
      cb.try_acquire().await;
      cb.record_failure().await;
      cb.try_acquire().await; // breaker now open, rejected
      let metrics = cb.metrics();
      assert_eq!( metrics.total_failures, 4 );
      assert_eq!( metrics.total_rejected, 1 );
      assert_eq!( metrics.trip_count, 1 );
      assert!( ( metrics.success_rate() - 0.0 ).abs() < 1e-9 );
    }
  }
}

crate::mod_interface!
{
  exposed use private::CircuitState;
  exposed use private::CircuitBreakerConfig;
  exposed use private::CircuitBreakerMetrics;
  exposed use private::StateChangeCallback;
  exposed use private::CircuitBreaker;
}
