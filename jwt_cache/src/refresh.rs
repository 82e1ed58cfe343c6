//! Eager background refresh
//!
//! After a generation is installed, a single timer is armed to fire shortly
//! before the token would fail the minimum validity check. When it fires, a
//! replacement is fetched while the current token keeps being served, and the
//! replacement is promoted once it arrives, arming the next timer in turn.
//!
//! Every step re-checks, under the state lock, that the generation it was
//! started for is still the one in charge. A timer or fetch that lost that
//! race does nothing.

use crate::{
    cache::{CoordinatorState, Generation, Shared},
    sources::AsyncTokenSource,
    CachedToken,
};
use jwt_cache_clock::Clock;
use std::{sync::Arc, time::Duration};

/// Clamps a signed millisecond delay into something a timer can sleep for
///
/// Delays that have already passed fire immediately.
pub(crate) fn timer_delay(millis: i128) -> Duration {
    if millis <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl<S, C> Shared<S, C>
where
    S: AsyncTokenSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Arms the refresh timer for a freshly installed generation
    ///
    /// Replaces, and cancels, whatever timer was armed before.
    pub(crate) fn schedule_refresh(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        generation: &Arc<Generation>,
        token: &CachedToken,
    ) {
        if state.disposed || !self.config.eager_refresh_enabled() {
            return;
        }

        let millis = token.millis_until_refresh(
            self.clock.now(),
            self.config.minimum_validity(),
            self.config.eager_refresh(),
        );
        let delay = timer_delay(millis);

        tracing::trace!(
            generation = generation.id,
            delay_ms = delay.as_millis() as u64,
            expiry = token.expiry().0,
            "arming eager refresh"
        );

        let shared = Arc::downgrade(self);
        let target = Arc::clone(generation);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match shared.upgrade() {
                Some(shared) => shared.refresh_now(&target),
                None => tracing::trace!("token cache dropped, skipping eager refresh"),
            }
        });

        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Starts a background fetch to replace `generation`, if it is still current
    fn refresh_now(self: &Arc<Self>, generation: &Arc<Generation>) {
        let mut state = self.lock();

        if state.disposed || !state.is_current(generation) {
            tracing::trace!(
                generation = generation.id,
                "generation superseded before eager refresh fired"
            );
            return;
        }

        if let Some(prefetched) = &state.prefetched {
            tracing::trace!(
                generation = prefetched.id,
                "pre-fetch already in flight"
            );
            return;
        }

        tracing::debug!(generation = generation.id, "eagerly refreshing token");
        let next = self.start_fetch(&mut state, Some(generation.id));
        state.prefetched = Some(next);
    }

    /// Installs a pre-fetched generation as current, if it still replaces the
    /// current generation
    pub(crate) fn promote(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        generation: &Arc<Generation>,
        token: &CachedToken,
    ) {
        let replaces_current = matches!(
            (&state.current, generation.replaces),
            (Some(current), Some(replaces)) if current.id == replaces
        );

        if state.disposed || !replaces_current {
            tracing::debug!(
                generation = generation.id,
                "discarding pre-fetched token for a superseded generation"
            );
            return;
        }

        tracing::debug!(
            generation = generation.id,
            expiry = token.expiry().0,
            "promoted pre-fetched token"
        );
        state.current = Some(Arc::clone(generation));
        self.schedule_refresh(state, generation, token);
    }
}
