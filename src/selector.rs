use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use url::Url;

/// Tracks the configured base URLs, their health, and the currently pinned
/// choice.
///
/// Selection is a hint, not a guarantee: health writes are per-entry atomics
/// and reads are lock-free, so concurrent calls may briefly disagree about
/// the preferred URL without harm.
pub(crate) struct UrlSelector {
    entries: Vec<BaseUrlEntry>,
    current: AtomicUsize,
    failed_url_cooldown: Duration,
    created_at: Instant,
}

struct BaseUrlEntry {
    url: Url,
    // Millis since selector creation plus one; zero means healthy.
    failed_since_ms: AtomicU64,
}

impl UrlSelector {
    pub(crate) fn new(base_urls: Vec<Url>, failed_url_cooldown: Duration) -> Self {
        let entries = base_urls
            .into_iter()
            .map(|url| BaseUrlEntry {
                url,
                failed_since_ms: AtomicU64::new(0),
            })
            .collect();
        Self {
            entries,
            current: AtomicUsize::new(0),
            failed_url_cooldown,
            created_at: Instant::now(),
        }
    }

    /// Advances the pinned index by one; used for round-robin call spreading.
    pub(crate) fn advance(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Rebases the request onto the currently pinned base URL.
    pub(crate) fn redirect_to_current(&self, request_url: &Url) -> Option<Url> {
        let entry = self.entries.get(self.current_index())?;
        self.rebase(request_url, entry)
    }

    /// Chooses the next base URL after the one the request was addressed to,
    /// skipping entries whose failure cooldown has not elapsed. If every
    /// candidate is cooling down, the one whose cooldown expires soonest is
    /// taken. The chosen entry becomes the new pin.
    pub(crate) fn redirect_to_next(&self, request_url: &Url) -> Option<Url> {
        if self.entries.is_empty() {
            return None;
        }
        let from = self.index_of_base_for(request_url)?;
        let now_ms = self.now_ms();

        let mut soonest: Option<(usize, u64)> = None;
        let mut chosen = None;
        for offset in 1..=self.entries.len() {
            let index = (from + offset) % self.entries.len();
            match self.cooldown_expiry_ms(index, now_ms) {
                None => {
                    chosen = Some(index);
                    break;
                }
                Some(expiry_ms) => {
                    if soonest.is_none_or(|(_, current)| expiry_ms < current) {
                        soonest = Some((index, expiry_ms));
                    }
                }
            }
        }
        let index = chosen.or(soonest.map(|(index, _)| index))?;
        self.current.store(index, Ordering::Relaxed);
        self.rebase(request_url, &self.entries[index])
    }

    /// Rebases the request onto an explicitly named base URL, if it is one
    /// of the configured bases (scheme and authority equality; paths are
    /// ignored for matching).
    pub(crate) fn redirect_to(&self, request_url: &Url, target: &Url) -> Option<Url> {
        let entry = self
            .entries
            .iter()
            .find(|entry| same_authority(&entry.url, target))?;
        self.rebase(request_url, entry)
    }

    pub(crate) fn is_known_base(&self, target: &Url) -> bool {
        self.entries
            .iter()
            .any(|entry| same_authority(&entry.url, target))
    }

    pub(crate) fn mark_as_failed(&self, url: &Url) {
        if let Some(index) = self.index_of_base_for(url) {
            self.entries[index]
                .failed_since_ms
                .store(self.now_ms() + 1, Ordering::Relaxed);
        }
    }

    pub(crate) fn mark_as_succeeded(&self, url: &Url) {
        if let Some(index) = self.index_of_base_for(url) {
            self.entries[index].failed_since_ms.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn is_failed(&self, url: &Url) -> bool {
        self.index_of_base_for(url)
            .is_some_and(|index| self.entries[index].failed_since_ms.load(Ordering::Relaxed) != 0)
    }

    fn current_index(&self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        self.current.load(Ordering::Relaxed) % self.entries.len()
    }

    fn now_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    /// Remaining-cooldown expiry for an entry, or `None` when it is eligible.
    fn cooldown_expiry_ms(&self, index: usize, now_ms: u64) -> Option<u64> {
        if self.failed_url_cooldown.is_zero() {
            return None;
        }
        let failed_since = self.entries[index].failed_since_ms.load(Ordering::Relaxed);
        if failed_since == 0 {
            return None;
        }
        let cooldown_ms = self.failed_url_cooldown.as_millis().min(u64::MAX as u128) as u64;
        let expiry_ms = (failed_since - 1).saturating_add(cooldown_ms);
        if now_ms >= expiry_ms {
            // Cooldown elapsed; the entry counts as healthy again.
            self.entries[index].failed_since_ms.store(0, Ordering::Relaxed);
            return None;
        }
        Some(expiry_ms)
    }

    fn index_of_base_for(&self, url: &Url) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| is_base_for(&entry.url, url))
    }

    /// Rebases the request path onto the entry's base: the matched base's
    /// path prefix is stripped and the remainder (plus query) is joined onto
    /// the target. A request that is not rooted under any known base cannot
    /// be rebased and yields `None`.
    fn rebase(&self, request_url: &Url, entry: &BaseUrlEntry) -> Option<Url> {
        let matched = &self.entries[self.index_of_base_for(request_url)?];
        let prefix = matched.url.path().trim_end_matches('/');
        let relative = &request_url.path()[prefix.len()..];

        let mut rebased = entry.url.clone();
        let base_path = entry.url.path().trim_end_matches('/');
        let mut path = String::with_capacity(base_path.len() + relative.len() + 1);
        path.push_str(base_path);
        if !relative.is_empty() && !relative.starts_with('/') {
            path.push('/');
        }
        path.push_str(relative);
        if path.is_empty() {
            path.push('/');
        }
        rebased.set_path(&path);
        rebased.set_query(request_url.query());
        rebased.set_fragment(request_url.fragment());
        Some(rebased)
    }
}

fn same_authority(left: &Url, right: &Url) -> bool {
    left.scheme() == right.scheme()
        && left.host_str() == right.host_str()
        && left.port_or_known_default() == right.port_or_known_default()
}

fn is_base_for(base: &Url, url: &Url) -> bool {
    if !same_authority(base, url) {
        return false;
    }
    let prefix = base.path().trim_end_matches('/');
    let path = url.path();
    path.starts_with(prefix)
        && (path.len() == prefix.len() || path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::UrlSelector;

    fn url(text: &str) -> Url {
        Url::parse(text).expect("test url should parse")
    }

    fn selector(bases: &[&str], cooldown: Duration) -> UrlSelector {
        UrlSelector::new(bases.iter().map(|base| url(base)).collect(), cooldown)
    }

    #[test]
    fn redirect_to_current_preserves_path_and_query() {
        let selector = selector(&["https://a.test/api", "https://b.test/api"], Duration::ZERO);
        let redirected = selector
            .redirect_to_current(&url("https://a.test/api/items?page=2"))
            .expect("current base exists");
        assert_eq!(redirected.as_str(), "https://a.test/api/items?page=2");
    }

    #[test]
    fn redirect_to_next_moves_to_the_following_base() {
        let selector = selector(&["https://a.test/api", "https://b.test/api"], Duration::ZERO);
        let redirected = selector
            .redirect_to_next(&url("https://a.test/api/items"))
            .expect("next base exists");
        assert_eq!(redirected.as_str(), "https://b.test/api/items");
    }

    #[test]
    fn redirect_to_next_pins_the_chosen_base() {
        let selector = selector(&["https://a.test/", "https://b.test/"], Duration::ZERO);
        selector.redirect_to_next(&url("https://a.test/items"));
        let current = selector
            .redirect_to_current(&url("https://a.test/items"))
            .expect("current base exists");
        assert_eq!(current.as_str(), "https://b.test/items");
    }

    #[test]
    fn redirect_to_next_with_single_base_returns_the_same_base() {
        let selector = selector(&["https://a.test/api"], Duration::ZERO);
        let redirected = selector
            .redirect_to_next(&url("https://a.test/api/items"))
            .expect("single base remains usable");
        assert_eq!(redirected.as_str(), "https://a.test/api/items");
    }

    #[test]
    fn redirect_to_next_skips_bases_in_cooldown() {
        let selector = selector(
            &["https://a.test/", "https://b.test/", "https://c.test/"],
            Duration::from_secs(60),
        );
        selector.mark_as_failed(&url("https://b.test/items"));
        let redirected = selector
            .redirect_to_next(&url("https://a.test/items"))
            .expect("a healthy base exists");
        assert_eq!(redirected.as_str(), "https://c.test/items");
    }

    #[test]
    fn redirect_to_next_with_all_in_cooldown_picks_soonest_expiry() {
        let selector = selector(&["https://a.test/", "https://b.test/"], Duration::from_secs(60));
        selector.mark_as_failed(&url("https://b.test/"));
        std::thread::sleep(Duration::from_millis(5));
        selector.mark_as_failed(&url("https://a.test/"));
        // b failed earlier, so its cooldown expires first.
        let redirected = selector
            .redirect_to_next(&url("https://a.test/items"))
            .expect("soonest-expiring base is chosen");
        assert_eq!(redirected.as_str(), "https://b.test/items");
    }

    #[test]
    fn disabled_cooldown_never_skips_failed_bases() {
        let selector = selector(&["https://a.test/", "https://b.test/"], Duration::ZERO);
        selector.mark_as_failed(&url("https://b.test/"));
        let redirected = selector
            .redirect_to_next(&url("https://a.test/items"))
            .expect("failed base stays eligible without cooldown");
        assert_eq!(redirected.as_str(), "https://b.test/items");
    }

    #[test]
    fn mark_as_succeeded_clears_failure() {
        let selector = selector(&["https://a.test/"], Duration::from_secs(60));
        let base = url("https://a.test/items");
        selector.mark_as_failed(&base);
        assert!(selector.is_failed(&base));
        selector.mark_as_succeeded(&base);
        assert!(!selector.is_failed(&base));
    }

    #[test]
    fn failed_base_becomes_eligible_after_cooldown() {
        let selector = selector(&["https://a.test/", "https://b.test/"], Duration::from_millis(5));
        selector.mark_as_failed(&url("https://b.test/"));
        std::thread::sleep(Duration::from_millis(10));
        let redirected = selector
            .redirect_to_next(&url("https://a.test/items"))
            .expect("cooldown elapsed");
        assert_eq!(redirected.as_str(), "https://b.test/items");
    }

    #[test]
    fn redirect_to_matches_known_bases_by_authority() {
        let selector = selector(&["https://a.test/api", "https://b.test/api"], Duration::ZERO);
        let redirected = selector
            .redirect_to(&url("https://a.test/api/items"), &url("https://b.test/ignored"))
            .expect("authority matches a known base");
        assert_eq!(redirected.as_str(), "https://b.test/api/items");
    }

    #[test]
    fn redirect_to_unknown_target_is_none() {
        let selector = selector(&["https://a.test/api"], Duration::ZERO);
        assert!(
            selector
                .redirect_to(&url("https://a.test/api/items"), &url("https://evil.test/"))
                .is_none()
        );
    }

    #[test]
    fn foreign_request_urls_cannot_be_rebased() {
        let selector = selector(&["https://a.test/api"], Duration::ZERO);
        let foreign = url("https://elsewhere.test/v2/things");
        assert!(selector.redirect_to_current(&foreign).is_none());
        assert!(selector.redirect_to_next(&foreign).is_none());
    }

    #[test]
    fn requests_outside_the_base_path_cannot_be_rebased() {
        let selector = selector(&["https://a.test/api"], Duration::ZERO);
        assert!(
            selector
                .redirect_to_current(&url("https://a.test/admin/things"))
                .is_none()
        );
    }

    #[test]
    fn advance_rotates_the_pin() {
        let selector = selector(&["https://a.test/", "https://b.test/"], Duration::ZERO);
        selector.advance();
        let current = selector
            .redirect_to_current(&url("https://a.test/items"))
            .expect("current base exists");
        assert_eq!(current.as_str(), "https://b.test/items");
    }
}
