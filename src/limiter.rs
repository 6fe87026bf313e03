use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use url::Url;

use crate::util::lock_unpoisoned;

/// AIMD policy for the per-host adaptive in-flight cap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConcurrencyLimiterPolicy {
    min_limit: usize,
    initial_limit: usize,
    max_limit: usize,
    backoff_ratio: f64,
}

impl ConcurrencyLimiterPolicy {
    pub const fn standard() -> Self {
        Self {
            min_limit: 1,
            initial_limit: 20,
            max_limit: 200,
            backoff_ratio: 0.9,
        }
    }

    pub const fn min_limit(mut self, min_limit: usize) -> Self {
        self.min_limit = if min_limit == 0 { 1 } else { min_limit };
        self
    }

    pub const fn initial_limit(mut self, initial_limit: usize) -> Self {
        self.initial_limit = if initial_limit == 0 { 1 } else { initial_limit };
        self
    }

    pub const fn max_limit(mut self, max_limit: usize) -> Self {
        self.max_limit = if max_limit == 0 { 1 } else { max_limit };
        self
    }

    pub fn backoff_ratio(mut self, backoff_ratio: f64) -> Self {
        self.backoff_ratio = backoff_ratio.clamp(0.1, 0.99);
        self
    }
}

impl Default for ConcurrencyLimiterPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Registry of limiters, one per `(host, first path segment)`.
pub(crate) struct ConcurrencyLimiters {
    policy: ConcurrencyLimiterPolicy,
    limiters: Mutex<BTreeMap<LimiterKey, Arc<ConcurrencyLimiter>>>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct LimiterKey {
    host: String,
    path_prefix: String,
}

impl ConcurrencyLimiters {
    pub(crate) fn new(policy: ConcurrencyLimiterPolicy) -> Self {
        Self {
            policy,
            limiters: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn limiter_for(&self, url: &Url) -> Arc<ConcurrencyLimiter> {
        let key = limiter_key(url);
        let mut limiters = lock_unpoisoned(&self.limiters);
        limiters
            .entry(key)
            .or_insert_with(|| Arc::new(ConcurrencyLimiter::new(self.policy)))
            .clone()
    }
}

fn limiter_key(url: &Url) -> LimiterKey {
    let mut host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if let Some(port) = url.port_or_known_default() {
        host.push(':');
        host.push_str(&port.to_string());
    }
    let path_prefix = url
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_owned();
    LimiterKey { host, path_prefix }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Success,
    Dropped,
    Ignore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaiterPhase {
    Waiting,
    Granted,
    Consumed,
    Cancelled,
}

struct WaiterSlot {
    phase: WaiterPhase,
    waker: Option<Waker>,
}

struct LimiterState {
    limit: f64,
    in_flight: usize,
    waiters: VecDeque<Arc<Mutex<WaiterSlot>>>,
}

impl LimiterState {
    fn capacity_available(&self) -> bool {
        (self.in_flight as f64) < self.limit.floor()
    }
}

/// An AIMD in-flight limiter with strictly FIFO asynchronous acquisition.
///
/// Every credit handed out is returned exactly once: an explicit disposition
/// moves the cap (additive increase on success, multiplicative decrease on
/// drop), a plain `Drop` of the permit returns the credit without moving it,
/// and an acquisition cancelled while queued — or in the instant between
/// grant and observation — surrenders its slot with the cap untouched.
pub(crate) struct ConcurrencyLimiter {
    policy: ConcurrencyLimiterPolicy,
    state: Mutex<LimiterState>,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(policy: ConcurrencyLimiterPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LimiterState {
                limit: policy.initial_limit as f64,
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Acquire {
        Acquire {
            limiter: Arc::clone(self),
            slot: None,
        }
    }

    fn release(&self, disposition: Disposition) {
        let mut woken = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.state);
            match disposition {
                Disposition::Success => {
                    // Additive increase, gated on the cap actually being used.
                    if state.in_flight * 2 >= state.limit.floor() as usize {
                        state.limit = (state.limit + 1.0).min(self.policy.max_limit as f64);
                    }
                }
                Disposition::Dropped => {
                    state.limit =
                        (state.limit * self.policy.backoff_ratio).max(self.policy.min_limit as f64);
                }
                Disposition::Ignore => {}
            }
            state.in_flight = state.in_flight.saturating_sub(1);

            while state.capacity_available() {
                let Some(slot) = state.waiters.pop_front() else {
                    break;
                };
                let mut slot_state = lock_unpoisoned(&slot);
                if slot_state.phase == WaiterPhase::Cancelled {
                    continue;
                }
                slot_state.phase = WaiterPhase::Granted;
                state.in_flight += 1;
                if let Some(waker) = slot_state.waker.take() {
                    woken.push(waker);
                }
            }
        }
        for waker in woken {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub(crate) fn current_limit(&self) -> usize {
        lock_unpoisoned(&self.state).limit.floor() as usize
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.state).in_flight
    }
}

/// FIFO acquisition future. Dropping it before completion surrenders the
/// queue slot; dropping it after a grant raced in returns the credit.
pub(crate) struct Acquire {
    limiter: Arc<ConcurrencyLimiter>,
    slot: Option<Arc<Mutex<WaiterSlot>>>,
}

impl Future for Acquire {
    type Output = Permit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Permit> {
        let this = &mut *self;
        if let Some(slot) = &this.slot {
            let mut slot_state = lock_unpoisoned(slot);
            return match slot_state.phase {
                WaiterPhase::Granted => {
                    slot_state.phase = WaiterPhase::Consumed;
                    drop(slot_state);
                    Poll::Ready(Permit::new(Arc::clone(&this.limiter)))
                }
                WaiterPhase::Waiting => {
                    slot_state.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                WaiterPhase::Consumed | WaiterPhase::Cancelled => Poll::Pending,
            };
        }

        let mut state = lock_unpoisoned(&this.limiter.state);
        if state.waiters.is_empty() && state.capacity_available() {
            state.in_flight += 1;
            drop(state);
            return Poll::Ready(Permit::new(Arc::clone(&this.limiter)));
        }
        let slot = Arc::new(Mutex::new(WaiterSlot {
            phase: WaiterPhase::Waiting,
            waker: Some(cx.waker().clone()),
        }));
        state.waiters.push_back(Arc::clone(&slot));
        drop(state);
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let granted_unobserved = {
            let mut slot_state = lock_unpoisoned(&slot);
            match slot_state.phase {
                WaiterPhase::Granted => {
                    slot_state.phase = WaiterPhase::Cancelled;
                    true
                }
                WaiterPhase::Waiting => {
                    slot_state.phase = WaiterPhase::Cancelled;
                    false
                }
                WaiterPhase::Consumed | WaiterPhase::Cancelled => false,
            }
        };
        if granted_unobserved {
            self.limiter.release(Disposition::Ignore);
        }
    }
}

/// A concurrency credit for one attempt.
pub(crate) struct Permit {
    limiter: Option<Arc<ConcurrencyLimiter>>,
}

impl Permit {
    fn new(limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            limiter: Some(limiter),
        }
    }

    pub(crate) fn on_success(mut self) {
        self.complete(Disposition::Success);
    }

    pub(crate) fn on_dropped(mut self) {
        self.complete(Disposition::Dropped);
    }

    pub(crate) fn on_ignore(mut self) {
        self.complete(Disposition::Ignore);
    }

    fn complete(&mut self, disposition: Disposition) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release(disposition);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        // No explicit disposition means no load signal.
        self.complete(Disposition::Ignore);
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, Waker};

    use url::Url;

    use super::{ConcurrencyLimiter, ConcurrencyLimiterPolicy, ConcurrencyLimiters, limiter_key};

    fn limiter(initial: usize) -> Arc<ConcurrencyLimiter> {
        Arc::new(ConcurrencyLimiter::new(
            ConcurrencyLimiterPolicy::standard()
                .min_limit(1)
                .initial_limit(initial)
                .max_limit(50),
        ))
    }

    fn poll_once(acquire: &mut super::Acquire) -> Poll<super::Permit> {
        let mut context = Context::from_waker(Waker::noop());
        Pin::new(acquire).poll(&mut context)
    }

    #[test]
    fn grants_up_to_the_limit() {
        let limiter = limiter(2);
        let mut first = limiter.acquire();
        let mut second = limiter.acquire();
        let mut third = limiter.acquire();
        assert!(poll_once(&mut first).is_ready());
        assert!(poll_once(&mut second).is_ready());
        assert!(poll_once(&mut third).is_pending());
        assert_eq!(limiter.in_flight(), 2);
    }

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        let limiter = limiter(1);
        let mut holder = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut holder) else {
            panic!("first acquisition should be immediate");
        };

        let mut first_waiter = limiter.acquire();
        let mut second_waiter = limiter.acquire();
        assert!(poll_once(&mut first_waiter).is_pending());
        assert!(poll_once(&mut second_waiter).is_pending());

        permit.on_ignore();
        assert!(poll_once(&mut second_waiter).is_pending());
        assert!(poll_once(&mut first_waiter).is_ready());
    }

    #[test]
    fn success_increases_the_cap_when_utilized() {
        let limiter = limiter(1);
        let mut acquire = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut acquire) else {
            panic!("acquisition should be immediate");
        };
        permit.on_success();
        assert_eq!(limiter.current_limit(), 2);
    }

    #[test]
    fn dropped_decreases_the_cap_multiplicatively() {
        let limiter = limiter(20);
        let mut acquire = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut acquire) else {
            panic!("acquisition should be immediate");
        };
        permit.on_dropped();
        assert_eq!(limiter.current_limit(), 18);
    }

    #[test]
    fn ignore_leaves_the_cap_unchanged() {
        let limiter = limiter(20);
        let mut acquire = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut acquire) else {
            panic!("acquisition should be immediate");
        };
        permit.on_ignore();
        assert_eq!(limiter.current_limit(), 20);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn cap_never_drops_below_min_limit() {
        let limiter = limiter(2);
        for _ in 0..50 {
            let mut acquire = limiter.acquire();
            let Poll::Ready(permit) = poll_once(&mut acquire) else {
                panic!("acquisition should be immediate");
            };
            permit.on_dropped();
        }
        assert_eq!(limiter.current_limit(), 1);
    }

    #[test]
    fn cancelled_waiter_does_not_affect_the_cap() {
        let limiter = limiter(1);
        let mut holder = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut holder) else {
            panic!("first acquisition should be immediate");
        };

        let mut abandoned = limiter.acquire();
        let mut patient = limiter.acquire();
        assert!(poll_once(&mut abandoned).is_pending());
        assert!(poll_once(&mut patient).is_pending());
        drop(abandoned);

        permit.on_ignore();
        assert!(poll_once(&mut patient).is_ready());
        assert_eq!(limiter.current_limit(), 1);
    }

    #[test]
    fn grant_raced_by_cancellation_returns_the_credit() {
        let limiter = limiter(1);
        let mut holder = limiter.acquire();
        let Poll::Ready(permit) = poll_once(&mut holder) else {
            panic!("first acquisition should be immediate");
        };

        let mut waiter = limiter.acquire();
        assert!(poll_once(&mut waiter).is_pending());
        permit.on_ignore();
        // The grant has landed in the slot but was never observed by a poll.
        drop(waiter);
        assert_eq!(limiter.in_flight(), 0);

        let mut next = limiter.acquire();
        assert!(poll_once(&mut next).is_ready());
    }

    #[test]
    fn permit_drop_without_disposition_releases_the_credit() {
        let limiter = limiter(1);
        {
            let mut acquire = limiter.acquire();
            let Poll::Ready(_permit) = poll_once(&mut acquire) else {
                panic!("acquisition should be immediate");
            };
            assert_eq!(limiter.in_flight(), 1);
        }
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.current_limit(), 1);
    }

    #[test]
    fn registry_reuses_limiters_per_host_and_path_prefix() {
        let registry = ConcurrencyLimiters::new(ConcurrencyLimiterPolicy::standard());
        let a1 = registry.limiter_for(&Url::parse("https://a.test/api/items").unwrap());
        let a2 = registry.limiter_for(&Url::parse("https://a.test/api/other").unwrap());
        let b = registry.limiter_for(&Url::parse("https://a.test/admin/items").unwrap());
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn limiter_key_includes_default_port() {
        let key = limiter_key(&Url::parse("https://a.test/api/items").unwrap());
        assert_eq!(key.host, "a.test:443");
        assert_eq!(key.path_prefix, "api");
    }
}
