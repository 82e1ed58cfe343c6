use crate::{
    error::{fetch_abandoned, TokenError},
    expiry::{ExpiryExtractor, JwtExpiry},
    sources::AsyncTokenSource,
    AccessToken, CacheConfig, CachedToken,
};
use jwt_cache_clock::{Clock, DurationMillis, System};
use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::watch, task::JoinHandle};

pub(crate) type Outcome = Result<Arc<CachedToken>, TokenError>;

type ErrorObserver = Box<dyn Fn(&TokenError) + Send + Sync>;

/// One fetch-and-install cycle of the cached token
///
/// Identity matters: continuations compare generations with `Arc::ptr_eq`
/// against the generation they started from before touching shared state.
pub(crate) struct Generation {
    pub(crate) id: u64,
    /// The generation this one was pre-fetched to replace
    pub(crate) replaces: Option<u64>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl Generation {
    /// Waits for the fetch behind this generation to finish
    ///
    /// Returns `None` if the task that publishes the outcome went away without
    /// publishing, as happens when its runtime shuts down mid-fetch.
    async fn outcome(&self) -> Option<Outcome> {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => (*self.outcome.borrow()).clone(),
        };
        outcome
    }
}

/// Everything the foreground and background paths share
///
/// Only touched while holding the mutex, which is never held across an `.await`.
pub(crate) struct CoordinatorState {
    next_generation: u64,
    pub(crate) current: Option<Arc<Generation>>,
    pub(crate) prefetched: Option<Arc<Generation>>,
    pub(crate) disposed: bool,
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl CoordinatorState {
    pub(crate) fn is_current(&self, generation: &Arc<Generation>) -> bool {
        matches!(&self.current, Some(current) if Arc::ptr_eq(current, generation))
    }

    pub(crate) fn is_prefetched(&self, generation: &Arc<Generation>) -> bool {
        matches!(&self.prefetched, Some(prefetched) if Arc::ptr_eq(prefetched, generation))
    }
}

pub(crate) struct Shared<S, C> {
    source: S,
    expiry: Box<dyn ExpiryExtractor>,
    pub(crate) clock: C,
    pub(crate) config: CacheConfig,
    on_refresh_error: Option<ErrorObserver>,
    state: Mutex<CoordinatorState>,
}

impl<S, C> Shared<S, C> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, C> Drop for Shared<S, C> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl<S, C> Shared<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn fetch(self: Arc<Self>) -> Outcome {
        let token = self
            .source
            .request_token()
            .await
            .map_err(TokenError::fetch)?;
        let expiry = self.expiry.expiry(&token)?;
        Ok(Arc::new(CachedToken::new(token, expiry)))
    }

    /// Starts a new fetch against the token source without installing it anywhere
    pub(crate) fn start_fetch(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        replaces: Option<u64>,
    ) -> Arc<Generation> {
        let id = state.next_generation;
        state.next_generation += 1;

        let (tx, rx) = watch::channel(None);
        let generation = Arc::new(Generation {
            id,
            replaces,
            outcome: rx,
        });

        tracing::debug!(generation = id, ?replaces, "requesting new token");

        let fetch = tokio::spawn(Arc::clone(self).fetch());
        let shared = Arc::clone(self);
        let completed = Arc::clone(&generation);
        tokio::spawn(async move {
            let outcome = match fetch.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if err.is_panic() {
                        tracing::error!(generation = id, "token fetch panicked!");
                    } else {
                        tracing::info!(generation = id, "token fetch was cancelled");
                    }
                    Err(fetch_abandoned().into())
                }
            };
            shared.complete(&completed, &tx, outcome);
        });

        generation
    }

    /// Applies the outcome of a finished fetch and publishes it to every waiter
    fn complete(
        self: &Arc<Self>,
        generation: &Arc<Generation>,
        tx: &watch::Sender<Option<Outcome>>,
        outcome: Outcome,
    ) {
        let mut state = self.lock();
        let mut unobserved_failure = None;

        match &outcome {
            Ok(token) if state.is_current(generation) => {
                tracing::debug!(
                    generation = generation.id,
                    expiry = token.expiry().0,
                    "installed new token"
                );
                self.schedule_refresh(&mut state, generation, token);
            }
            Ok(token) if state.is_prefetched(generation) => {
                state.prefetched = None;
                self.promote(&mut state, generation, token);
            }
            Ok(_) => {
                tracing::debug!(
                    generation = generation.id,
                    "discarding token from a superseded fetch"
                );
            }
            Err(error) if state.is_current(generation) => {
                tracing::debug!(
                    generation = generation.id,
                    error = (error as &dyn error::Error),
                    "token fetch failed, next request will retry"
                );
                state.current = None;
            }
            Err(error) if state.is_prefetched(generation) => {
                state.prefetched = None;
                if !state.disposed {
                    unobserved_failure = Some(error.clone());
                }
            }
            Err(_) => {}
        }

        tx.send_replace(Some(outcome));
        drop(state);

        if let Some(error) = unobserved_failure {
            tracing::warn!(
                generation = generation.id,
                error = (&error as &dyn error::Error),
                "eager token refresh failed, falling back to on-demand refresh"
            );
            if let Some(observer) = &self.on_refresh_error {
                observer(&error);
            }
        }
    }

    /// Waits on `generation`, clearing it from the state if it can never finish
    async fn wait(&self, generation: &Arc<Generation>) -> Outcome {
        match generation.outcome().await {
            Some(outcome) => outcome,
            None => {
                self.abandon(generation);
                Err(fetch_abandoned().into())
            }
        }
    }

    fn abandon(&self, generation: &Arc<Generation>) {
        let mut state = self.lock();
        if state.is_current(generation) {
            tracing::warn!(
                generation = generation.id,
                "token fetch was abandoned without an outcome, next request will retry"
            );
            state.current = None;
        }
        if state.is_prefetched(generation) {
            state.prefetched = None;
        }
    }

    /// Moves the coordinator onto a newer generation
    ///
    /// Callers that observed `observed` as stale and find that some other caller
    /// has already advanced join that newer generation instead of starting
    /// another fetch.
    fn advance(self: &Arc<Self>, observed: Option<&Arc<Generation>>) -> Arc<Generation> {
        let mut state = self.lock();

        if let Some(current) = &state.current {
            let superseded = observed.map_or(true, |o| !Arc::ptr_eq(current, o));
            if superseded {
                tracing::trace!(generation = current.id, "joining in-flight generation");
                return Arc::clone(current);
            }
        }

        let generation = match state.prefetched.take() {
            Some(prefetched) => {
                tracing::debug!(
                    generation = prefetched.id,
                    "adopting pre-fetched token as current"
                );
                prefetched
            }
            None => self.start_fetch(&mut state, None),
        };

        state.current = Some(Arc::clone(&generation));
        generation
    }
}

/// A cache that hands out a short-lived token to many concurrent callers
///
/// Tokens are fetched from an [`AsyncTokenSource`] only when the cached token
/// has less than the configured minimum validity left. Concurrent callers that
/// find the cache stale share a single fetch, and all of them see its result,
/// success or failure.
///
/// With eager refresh configured, a replacement is fetched in the background
/// shortly before the cached token would go stale, so callers rarely wait on
/// the token source at all. Failures of these background fetches are never
/// surfaced to callers; the cache falls back to fetching on demand.
///
/// `TokenCache` is a cheap handle; clones share the same cached state. Must be
/// used from within a Tokio runtime.
pub struct TokenCache<S, C = System> {
    shared: Arc<Shared<S, C>>,
}

impl<S, C> Clone for TokenCache<S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, C> fmt::Debug for TokenCache<S, C>
where
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TokenCache")
            .field("source", &self.shared.source)
            .field("clock", &self.shared.clock)
            .field("config", &self.shared.config)
            .field("current", &state.current.as_ref().map(|g| g.id))
            .field("prefetched", &state.prefetched.as_ref().map(|g| g.id))
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<S> TokenCache<S, System>
where
    S: AsyncTokenSource + 'static,
{
    /// Constructs a cache over `source` using the system clock and JWT expiry claims
    ///
    /// If eager refresh is enabled, the first token is requested immediately.
    pub fn new(source: S, config: CacheConfig) -> Self {
        Self::builder(source).with_config(config).build()
    }

    /// Starts building a cache over `source`
    pub fn builder(source: S) -> TokenCacheBuilder<S> {
        TokenCacheBuilder {
            source,
            config: CacheConfig::default(),
            clock: System,
            expiry: Box::new(JwtExpiry),
            on_refresh_error: None,
        }
    }
}

impl<S, C> TokenCache<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Gets a token with at least the configured minimum validity remaining
    ///
    /// Returns the cached token when it is still good. Otherwise joins the fetch
    /// already in flight, adopts a token pre-fetched in the background, or starts
    /// a new fetch. A failed fetch is reported to every caller waiting on it and
    /// is not retried until the next call.
    pub async fn get_token(&self) -> Result<AccessToken, TokenError> {
        let observed = {
            let state = self.shared.lock();
            if state.disposed {
                return Err(TokenError::Disposed);
            }
            state.current.clone()
        };

        let generation = match observed {
            Some(generation) => {
                let token = self.shared.wait(&generation).await?;
                let now = self.shared.clock.now();
                let minimum_validity = self.shared.config.minimum_validity();

                if token.is_usable_at(now, minimum_validity) {
                    tracing::trace!(generation = generation.id, "serving cached token");
                    return Ok(token.access_token().to_owned());
                }

                tracing::trace!(
                    generation = generation.id,
                    remaining_ms = token.remaining_validity_at(now).0,
                    minimum_validity_ms = minimum_validity.0,
                    "cached token lacks minimum validity"
                );
                self.shared.advance(Some(&generation))
            }
            None => self.shared.advance(None),
        };

        let token = self.shared.wait(&generation).await?;
        Ok(token.access_token().to_owned())
    }

    /// Stops all background work and refuses any further requests
    ///
    /// A request that was already waiting on a fetch still receives its result.
    /// Calling this more than once has no further effect.
    pub fn dispose(&self) {
        let mut state = self.shared.lock();
        if !state.disposed {
            tracing::debug!("disposing token cache");
            state.disposed = true;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Whether [`dispose`][Self::dispose] has been called
    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }
}

/// Builder for a [`TokenCache`]
pub struct TokenCacheBuilder<S, C = System> {
    source: S,
    config: CacheConfig,
    clock: C,
    expiry: Box<dyn ExpiryExtractor>,
    on_refresh_error: Option<ErrorObserver>,
}

impl<S, C> fmt::Debug for TokenCacheBuilder<S, C>
where
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCacheBuilder")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("on_refresh_error", &self.on_refresh_error.is_some())
            .finish_non_exhaustive()
    }
}

impl<S, C> TokenCacheBuilder<S, C> {
    /// Replaces the whole configuration
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the eager refresh lead time; zero disables background refreshes
    pub fn with_eager_refresh(mut self, eager_refresh: DurationMillis) -> Self {
        self.config = self.config.with_eager_refresh(eager_refresh);
        self
    }

    /// Sets the minimum remaining lifetime for a token to be served
    pub fn with_minimum_validity(mut self, minimum_validity: DurationMillis) -> Self {
        self.config = self.config.with_minimum_validity(minimum_validity);
        self
    }

    /// Sets how expiry times are read from tokens
    ///
    /// Defaults to the `exp` claim of a JWT.
    pub fn with_expiry_extractor(mut self, expiry: impl ExpiryExtractor + 'static) -> Self {
        self.expiry = Box::new(expiry);
        self
    }

    /// Observes failures of background refreshes, which are otherwise only logged
    ///
    /// The observer runs on the runtime's worker and must not block.
    pub fn on_refresh_error(
        mut self,
        observer: impl Fn(&TokenError) + Send + Sync + 'static,
    ) -> Self {
        self.on_refresh_error = Some(Box::new(observer));
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenCacheBuilder<S, D> {
        TokenCacheBuilder {
            source: self.source,
            config: self.config,
            clock,
            expiry: self.expiry,
            on_refresh_error: self.on_refresh_error,
        }
    }
}

impl<S, C> TokenCacheBuilder<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Builds the cache
    ///
    /// If eager refresh is enabled, the first token is requested immediately in
    /// the background. A failure there is only seen by callers that joined the
    /// fetch while it was in flight; later callers start a fresh one. Must be
    /// called from within a Tokio runtime in that case.
    pub fn build(self) -> TokenCache<S, C> {
        let shared = Arc::new(Shared {
            source: self.source,
            expiry: self.expiry,
            clock: self.clock,
            config: self.config,
            on_refresh_error: self.on_refresh_error,
            state: Mutex::new(CoordinatorState {
                next_generation: 0,
                current: None,
                prefetched: None,
                disposed: false,
                timer: None,
            }),
        });

        if shared.config.eager_refresh_enabled() {
            shared.advance(None);
        }

        TokenCache { shared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::MalformedToken, sources, AccessTokenRef};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use color_eyre::Result;
    use jwt_cache_clock::{TokioClock, UnixTimeMillis};
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::{task::JoinSet, time::Instant};

    const EPOCH: UnixTimeMillis = UnixTimeMillis(1_700_000_000_000);
    const LIFETIME: DurationMillis = DurationMillis::from_secs(3);

    #[derive(Debug, thiserror::Error)]
    #[error("issuer unavailable")]
    struct IssuerUnavailable;

    #[derive(Debug)]
    enum Step {
        Issue { after: Duration },
        Fail { after: Duration },
    }

    #[derive(Debug)]
    struct IssuerState {
        clock: TokioClock,
        calls: AtomicUsize,
        script: Mutex<VecDeque<Step>>,
    }

    /// Issues unsigned JWTs that live for `LIFETIME`, following a script of
    /// delays and failures before falling back to issuing immediately
    #[derive(Clone, Debug)]
    struct TestIssuer(Arc<IssuerState>);

    impl TestIssuer {
        fn new(clock: TokioClock) -> Self {
            Self::scripted(clock, [])
        }

        fn scripted(clock: TokioClock, script: impl IntoIterator<Item = Step>) -> Self {
            Self(Arc::new(IssuerState {
                clock,
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into_iter().collect()),
            }))
        }

        fn calls(&self) -> usize {
            self.0.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AsyncTokenSource for TestIssuer {
        type Error = IssuerUnavailable;

        async fn request_token(&self) -> Result<AccessToken, Self::Error> {
            let serial = self.0.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let step = self.0.script.lock().unwrap().pop_front();

            match step.unwrap_or(Step::Issue {
                after: Duration::ZERO,
            }) {
                Step::Issue { after } => {
                    tokio::time::sleep(after).await;
                    let expiry = self.0.clock.now() + LIFETIME;
                    Ok(mint(expiry.0 / 1000, serial))
                }
                Step::Fail { after } => {
                    tokio::time::sleep(after).await;
                    Err(IssuerUnavailable)
                }
            }
        }
    }

    fn mint(exp_secs: u64, serial: usize) -> AccessToken {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let claims = serde_json::json!({ "sub": "test", "exp": exp_secs, "jti": serial });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        AccessToken::from(format!("{header}.{payload}."))
    }

    fn is_valid(token: &AccessTokenRef, clock: &TokioClock) -> bool {
        JwtExpiry
            .expiry(token)
            .map(|expiry| expiry > clock.now())
            .unwrap_or(false)
    }

    fn cache_with(
        issuer: &TestIssuer,
        clock: TokioClock,
        eager_refresh: u64,
    ) -> TokenCache<TestIssuer, TokioClock> {
        TokenCache::builder(issuer.clone())
            .with_minimum_validity(DurationMillis(100))
            .with_eager_refresh(DurationMillis(eager_refresh))
            .with_clock(clock)
            .build()
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [Step::Issue {
                after: Duration::from_millis(50),
            }],
        );
        let cache = cache_with(&issuer, clock, 0);

        let mut requests = JoinSet::new();
        for _ in 0..16 {
            let cache = cache.clone();
            requests.spawn(async move { cache.get_token().await });
        }

        let mut tokens = Vec::new();
        while let Some(token) = requests.join_next().await {
            tokens.push(token??);
        }

        assert_eq!(issuer.calls(), 1);
        assert_eq!(tokens.len(), 16);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert!(is_valid(&tokens[0], &clock));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_cache_refetches_once_expired() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::new(clock);
        let cache = cache_with(&issuer, clock, 0);

        sleep_ms(10).await;
        assert_eq!(issuer.calls(), 0);

        let (a, b, c) = tokio::join!(cache.get_token(), cache.get_token(), cache.get_token());
        let tokens = [a?, b?, c?];
        assert_eq!(issuer.calls(), 1);
        for t in &tokens {
            assert!(is_valid(t, &clock));
        }

        sleep_ms(3_100).await;
        for t in &tokens {
            assert!(!is_valid(t, &clock));
        }
        assert_eq!(issuer.calls(), 1);

        let (a, b, c) = tokio::join!(cache.get_token(), cache.get_token(), cache.get_token());
        let renewed = [a?, b?, c?];
        assert_eq!(issuer.calls(), 2);
        for t in &renewed {
            assert!(is_valid(t, &clock));
            assert_ne!(t, &tokens[0]);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn eager_cache_refreshes_in_background() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [
                Step::Issue {
                    after: Duration::ZERO,
                },
                Step::Issue {
                    after: Duration::from_millis(200),
                },
            ],
        );
        let cache = cache_with(&issuer, clock, 500);

        let (a, b, c) = tokio::join!(cache.get_token(), cache.get_token(), cache.get_token());
        let tokens = [a?, b?, c?];
        assert_eq!(issuer.calls(), 1);
        for t in &tokens {
            assert!(is_valid(t, &clock));
        }

        // Refresh fires at 2.4s and completes at 2.6s
        sleep_ms(3_100).await;
        for t in &tokens {
            assert!(!is_valid(t, &clock));
        }
        assert_eq!(issuer.calls(), 2);

        let started = Instant::now();
        let (a, b, c) = tokio::join!(cache.get_token(), cache.get_token(), cache.get_token());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(issuer.calls(), 2);

        let renewed = [a?, b?, c?];
        for t in &renewed {
            assert!(is_valid(t, &clock));
            assert_eq!(t, &renewed[0]);
            assert_ne!(t, &tokens[0]);
        }

        cache.dispose();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn eager_cache_fetches_before_first_request() {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::new(clock);
        let _cache = cache_with(&issuer, clock, 500);

        sleep_ms(10).await;
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eager_cache_keeps_one_fetch_per_generation() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::new(clock);
        let cache = cache_with(&issuer, clock, 500);

        // Whole-second `exp` claims put refreshes at 2.4s, 4.4s, 6.4s and 8.4s
        sleep_ms(10_000).await;
        assert_eq!(issuer.calls(), 5);

        let token = cache.get_token().await?;
        assert!(is_valid(&token, &clock));
        assert_eq!(issuer.calls(), 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_validity_forces_early_refetch() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::new(clock);
        let cache = TokenCache::builder(issuer.clone())
            .with_minimum_validity(DurationMillis(1_000))
            .with_clock(clock)
            .build();

        let first = cache.get_token().await?;

        sleep_ms(1_900).await;
        assert_eq!(cache.get_token().await?, first);
        assert_eq!(issuer.calls(), 1);

        sleep_ms(200).await;
        assert!(is_valid(&first, &clock));
        let second = cache.get_token().await?;
        assert_ne!(second, first);
        assert_eq!(issuer.calls(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_reaches_every_waiter_without_retry() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [Step::Fail {
                after: Duration::from_millis(50),
            }],
        );
        let cache = cache_with(&issuer, clock, 0);

        let results = tokio::join!(cache.get_token(), cache.get_token(), cache.get_token());
        for result in [results.0, results.1, results.2] {
            match result {
                Err(TokenError::Fetch(source)) => assert_eq!(source.to_string(), "issuer unavailable"),
                other => panic!("expected a fetch error, got {other:?}"),
            }
        }
        assert_eq!(issuer.calls(), 1);

        sleep_ms(1_000).await;
        assert_eq!(issuer.calls(), 1);

        let token = cache.get_token().await?;
        assert!(is_valid(&token, &clock));
        assert_eq!(issuer.calls(), 2);
        Ok(())
    }

    #[test]
    fn fetch_abandoned_by_its_runtime_is_cleared() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [Step::Issue {
                after: Duration::from_secs(5),
            }],
        );

        let first_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let cache = first_runtime.block_on(async {
            let cache = cache_with(&issuer, clock, 500);
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache
        });
        assert_eq!(issuer.calls(), 1);
        drop(first_runtime);

        let second_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        second_runtime.block_on(async {
            match cache.get_token().await {
                Err(TokenError::Fetch(_)) => {}
                other => panic!("expected the abandoned fetch to fail, got {other:?}"),
            }
            assert!(cache.shared.lock().current.is_none());

            let token = cache.get_token().await?;
            assert!(is_valid(&token, &clock));
            assert_eq!(issuer.calls(), 2);
            cache.dispose();
            Ok::<_, color_eyre::Report>(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_tokens_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = sources::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, IssuerUnavailable>("opaque-token") }
        });
        let cache = TokenCache::new(source, CacheConfig::default());

        for attempt in 1..=2 {
            match cache.get_token().await {
                Err(TokenError::Malformed(err)) => {
                    assert_eq!(err.reason(), "expected three dot-separated segments")
                }
                other => panic!("expected a malformed token error, got {other:?}"),
            }
            assert_eq!(calls.load(Ordering::SeqCst), attempt);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn custom_expiry_extractor_is_used() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = sources::from_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, IssuerUnavailable>(format!("opaque-{n}")) }
        });

        let cache = TokenCache::builder(source)
            .with_clock(clock)
            .with_expiry_extractor(
                move |_: &AccessTokenRef| -> Result<UnixTimeMillis, MalformedToken> {
                    Ok(clock.now() + DurationMillis::from_secs(2))
                },
            )
            .build();

        assert_eq!(cache.get_token().await?.as_str(), "opaque-1");
        sleep_ms(500).await;
        assert_eq!(cache.get_token().await?.as_str(), "opaque-1");
        sleep_ms(600).await;
        assert_eq!(cache.get_token().await?.as_str(), "opaque-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_halts_background_refresh() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::new(clock);
        let cache = cache_with(&issuer, clock, 500);

        cache.get_token().await?;
        assert_eq!(issuer.calls(), 1);

        cache.dispose();
        assert!(cache.is_disposed());

        sleep_ms(10_000).await;
        assert_eq!(issuer.calls(), 1);

        assert!(matches!(cache.get_token().await, Err(TokenError::Disposed)));
        cache.dispose();
        assert!(matches!(cache.clone().get_token().await, Err(TokenError::Disposed)));
        assert_eq!(issuer.calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_ignores_prefetch_in_flight() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [
                Step::Issue {
                    after: Duration::ZERO,
                },
                Step::Issue {
                    after: Duration::from_secs(1),
                },
            ],
        );
        let cache = cache_with(&issuer, clock, 500);
        cache.get_token().await?;

        // Pre-fetch starts at 2.4s and is still running
        sleep_ms(2_500).await;
        assert_eq!(issuer.calls(), 2);
        cache.dispose();

        sleep_ms(10_000).await;
        assert_eq!(issuer.calls(), 2);
        assert!(cache.shared.lock().current.is_some());
        assert!(cache.shared.lock().prefetched.is_none());
        assert!(cache.get_token().await.unwrap_err().is_disposed());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_request_adopts_prefetch_in_flight() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [
                Step::Issue {
                    after: Duration::ZERO,
                },
                Step::Issue {
                    after: Duration::from_secs(1),
                },
            ],
        );
        let cache = cache_with(&issuer, clock, 500);
        let first = cache.get_token().await?;

        // Pre-fetch runs from 2.4s to 3.4s; the first token is stale from 2.9s
        sleep_ms(2_950).await;
        assert_eq!(issuer.calls(), 2);

        let started = Instant::now();
        let second = cache.get_token().await?;
        assert_eq!(started.elapsed(), Duration::from_millis(450));
        assert_eq!(issuer.calls(), 2);
        assert_ne!(second, first);
        assert!(is_valid(&second, &clock));

        // The adopted generation arms its own refresh, due at 5.4s
        sleep_ms(2_100).await;
        assert_eq!(issuer.calls(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn background_failure_is_observed_but_not_surfaced() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [
                Step::Issue {
                    after: Duration::ZERO,
                },
                Step::Fail {
                    after: Duration::ZERO,
                },
            ],
        );
        let observed = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&observed);
        let cache = TokenCache::builder(issuer.clone())
            .with_minimum_validity(DurationMillis(100))
            .with_eager_refresh(DurationMillis(500))
            .with_clock(clock)
            .on_refresh_error(move |err| {
                assert!(matches!(err, TokenError::Fetch(_)));
                observer.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let first = cache.get_token().await?;

        sleep_ms(2_500).await;
        assert_eq!(issuer.calls(), 2);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_token().await?, first);

        // No timer is re-armed after a failed pre-fetch
        sleep_ms(450).await;
        assert_eq!(issuer.calls(), 2);

        let second = cache.get_token().await?;
        assert_ne!(second, first);
        assert_eq!(issuer.calls(), 3);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_refresh_fires_immediately() -> Result<()> {
        let clock = TokioClock::starting_at(EPOCH);
        let issuer = TestIssuer::scripted(
            clock,
            [
                Step::Issue {
                    after: Duration::ZERO,
                },
                Step::Fail {
                    after: Duration::ZERO,
                },
            ],
        );
        // 3s lifetime minus 2.8s validity minus 0.5s lead is already in the past
        let cache = TokenCache::builder(issuer.clone())
            .with_minimum_validity(DurationMillis(2_800))
            .with_eager_refresh(DurationMillis(500))
            .with_clock(clock)
            .build();

        sleep_ms(10).await;
        assert_eq!(issuer.calls(), 2);

        let token = cache.get_token().await?;
        assert!(is_valid(&token, &clock));
        assert_eq!(issuer.calls(), 2);
        Ok(())
    }

    #[test]
    fn builder_debug_reports_observer() {
        let issuer = TestIssuer::new(TokioClock::starting_at(EPOCH));
        let builder = TokenCache::builder(issuer).on_refresh_error(|_| {});
        let rendered = format!("{builder:?}");
        assert!(rendered.contains("on_refresh_error: true"));
    }
}
