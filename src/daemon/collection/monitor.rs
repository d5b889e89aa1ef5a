//! Decides which single domain is active at any instant and turns elapsed time into ledger
//! writes.
//!
//! Every entry point follows the same shape: under the monitor lock the interval since the last
//! checkpoint is claimed, the transition is applied and an ordered list of ledger writes is
//! produced. The lock is released before the writes are awaited, so a re-entered handler always
//! sees the new state and can't claim the same interval twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::{
    daemon::storage::ledger::TimeLedger,
    utils::{clock::Clock, time::local_date},
};

use super::{
    browser::{BrowserEvent, BrowserPort, TabId, TabInfo, WindowId, WindowInfo},
    domain::{trackable_domain, ExclusionSet},
};

/// The record of which domain is being timed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub tab_id: TabId,
    pub window_id: WindowId,
    pub domain: String,
    /// Time up to which the session was already written to the ledger.
    pub last_tick_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MonitorState {
    Idle { last_domain: Option<String> },
    Tracking(ActiveSession),
}

/// Why a tab is being considered for tracking. Decides whether a visit is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    /// The user switched to the tab.
    Explicit,
    /// The active tab loaded a new url.
    Navigation,
    /// Focus came back to a window or the user came back from idle.
    Refocus,
    /// State reconstructed at startup.
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LedgerWrite {
    Flush {
        domain: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    Visit {
        domain: String,
        at: DateTime<Utc>,
    },
}

struct MonitorInner {
    state: MonitorState,
    exclusions: ExclusionSet,
    away: bool,
}

impl MonitorInner {
    fn tracked_domain(&self) -> Option<&str> {
        match &self.state {
            MonitorState::Tracking(session) => Some(&session.domain),
            MonitorState::Idle { .. } => None,
        }
    }

    fn last_domain(&self) -> Option<&str> {
        match &self.state {
            MonitorState::Tracking(session) => Some(&session.domain),
            MonitorState::Idle { last_domain } => last_domain.as_deref(),
        }
    }

    /// Claims time elapsed since the last checkpoint. Never moves the checkpoint backwards.
    fn flush(&mut self, now: DateTime<Utc>, writes: &mut Vec<LedgerWrite>) {
        if let MonitorState::Tracking(session) = &mut self.state {
            if now > session.last_tick_at {
                writes.push(LedgerWrite::Flush {
                    domain: session.domain.clone(),
                    from: session.last_tick_at,
                    to: now,
                });
                session.last_tick_at = now;
            }
        }
    }

    fn stop(&mut self, now: DateTime<Utc>, writes: &mut Vec<LedgerWrite>) {
        self.flush(now, writes);
        if let MonitorState::Tracking(session) = &self.state {
            debug!("Stopped tracking {}", session.domain);
            self.state = MonitorState::Idle {
                last_domain: Some(session.domain.clone()),
            };
        }
    }

    fn domain_for(&self, tab: &TabInfo, window: Option<&WindowInfo>) -> Option<String> {
        if self.away || tab.incognito || window.is_some_and(|w| w.incognito) {
            return None;
        }
        let domain = trackable_domain(tab.url.as_deref()?)?;
        if self.exclusions.is_excluded(&domain) {
            trace!("{domain} is excluded");
            return None;
        }
        Some(domain)
    }

    fn consider(
        &mut self,
        tab: &TabInfo,
        window: Option<&WindowInfo>,
        activation: Activation,
        now: DateTime<Utc>,
        writes: &mut Vec<LedgerWrite>,
    ) {
        let domain = self.domain_for(tab, window);

        if let (MonitorState::Tracking(session), Some(domain)) = (&mut self.state, &domain) {
            if session.tab_id == tab.id && session.domain == *domain {
                session.window_id = tab.window_id;
                return;
            }
        }

        let is_visit = match activation {
            Activation::Explicit => true,
            Activation::Navigation => domain.as_deref() != self.tracked_domain(),
            Activation::Refocus => domain.as_deref() != self.last_domain(),
            Activation::Resume => false,
        };

        let previous = self.last_domain().map(str::to_string);
        self.stop(now, writes);

        match domain {
            Some(domain) => {
                debug!("Tracking {domain} in tab {} ({activation:?})", tab.id);
                if is_visit {
                    writes.push(LedgerWrite::Visit {
                        domain: domain.clone(),
                        at: now,
                    });
                }
                self.state = MonitorState::Tracking(ActiveSession {
                    tab_id: tab.id,
                    window_id: tab.window_id,
                    domain,
                    last_tick_at: now,
                });
            }
            None => {
                self.state = MonitorState::Idle {
                    last_domain: previous,
                };
            }
        }
    }

    /// Re-reads the focused window and its active tab.
    fn evaluate_focused(
        &mut self,
        browser: &dyn BrowserPort,
        activation: Activation,
        now: DateTime<Utc>,
        writes: &mut Vec<LedgerWrite>,
    ) {
        let Some(window) = browser.focused_window().filter(WindowInfo::is_trackable) else {
            self.stop(now, writes);
            return;
        };
        match browser.active_tab(window.id) {
            Some(tab) => self.consider(&tab, Some(&window), activation, now, writes),
            None => self.stop(now, writes),
        }
    }

    fn tracks_tab(&self, tab_id: TabId) -> bool {
        matches!(&self.state, MonitorState::Tracking(s) if s.tab_id == tab_id)
    }

    fn tracks_window(&self, window_id: WindowId) -> bool {
        matches!(&self.state, MonitorState::Tracking(s) if s.window_id == window_id)
    }

    fn on_event(
        &mut self,
        event: &BrowserEvent,
        browser: &dyn BrowserPort,
        now: DateTime<Utc>,
        writes: &mut Vec<LedgerWrite>,
    ) {
        match event {
            BrowserEvent::TabActivated { tab_id, window_id } => {
                let Some(window) = browser
                    .focused_window()
                    .filter(|w| w.id == *window_id)
                else {
                    trace!("Activation in background window {window_id}");
                    return;
                };
                if !window.is_trackable() {
                    self.stop(now, writes);
                    return;
                }
                match browser.tab(*tab_id) {
                    Some(tab) => {
                        self.consider(&tab, Some(&window), Activation::Explicit, now, writes)
                    }
                    None => self.stop(now, writes),
                }
            }
            BrowserEvent::TabUpdated { tab } => {
                if !tab.active {
                    return;
                }
                let Some(window) = browser
                    .focused_window()
                    .filter(|w| w.id == tab.window_id && w.is_trackable())
                else {
                    return;
                };
                self.consider(tab, Some(&window), Activation::Navigation, now, writes);
            }
            BrowserEvent::TabRemoved { tab_id, .. } => {
                if self.tracks_tab(*tab_id) {
                    self.stop(now, writes);
                }
            }
            BrowserEvent::TabReplaced {
                added_tab_id,
                removed_tab_id,
            } => {
                if let MonitorState::Tracking(session) = &mut self.state {
                    if session.tab_id == *removed_tab_id {
                        trace!("Tab {removed_tab_id} replaced by {added_tab_id}");
                        session.tab_id = *added_tab_id;
                    }
                }
            }
            BrowserEvent::WindowFocusChanged { window_id: None } => self.stop(now, writes),
            BrowserEvent::WindowFocusChanged {
                window_id: Some(window_id),
            } => match browser.window(*window_id).filter(WindowInfo::is_trackable) {
                Some(window) => match browser.active_tab(window.id) {
                    Some(tab) => {
                        self.consider(&tab, Some(&window), Activation::Refocus, now, writes)
                    }
                    None => self.stop(now, writes),
                },
                None => self.stop(now, writes),
            },
            BrowserEvent::WindowUpdated { window } => {
                if self.tracks_window(window.id) {
                    if !window.is_trackable() {
                        self.stop(now, writes);
                    }
                } else if window.focused && window.is_trackable() {
                    self.evaluate_focused(browser, Activation::Refocus, now, writes);
                }
            }
            BrowserEvent::WindowRemoved { window_id } => {
                if self.tracks_window(*window_id) {
                    self.stop(now, writes);
                }
            }
            BrowserEvent::IdleStateChanged { state } => {
                self.away = state.is_away();
                if self.away {
                    self.stop(now, writes);
                } else {
                    self.evaluate_focused(browser, Activation::Refocus, now, writes);
                }
            }
        }
    }
}

/// Owner of the [ActiveSession].
pub struct ActivityMonitor {
    browser: Arc<dyn BrowserPort>,
    ledger: Arc<TimeLedger>,
    clock: Arc<dyn Clock>,
    inner: Mutex<MonitorInner>,
}

impl ActivityMonitor {
    pub fn new(
        browser: Arc<dyn BrowserPort>,
        ledger: Arc<TimeLedger>,
        clock: Arc<dyn Clock>,
        exclusions: ExclusionSet,
    ) -> Self {
        Self {
            browser,
            ledger,
            clock,
            inner: Mutex::new(MonitorInner {
                state: MonitorState::Idle { last_domain: None },
                exclusions,
                away: false,
            }),
        }
    }

    async fn transition(&self, apply: impl FnOnce(&mut MonitorInner, DateTime<Utc>, &mut Vec<LedgerWrite>)) {
        let writes = {
            let mut inner = self.inner.lock().await;
            let now = self.clock.time();
            let mut writes = vec![];
            apply(&mut inner, now, &mut writes);
            writes
        };
        self.apply_writes(writes).await;
    }

    async fn apply_writes(&self, writes: Vec<LedgerWrite>) {
        for write in writes {
            let result = match &write {
                LedgerWrite::Flush { domain, from, to } => self
                    .ledger
                    .record_interval(domain, *from, *to)
                    .await
                    .map(|ms| trace!("Recorded {ms}ms for {domain}")),
                LedgerWrite::Visit { domain, at } => self
                    .ledger
                    .add_delta(local_date(self.clock.as_ref(), *at), domain, 0, *at, true)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                error!("Failed to apply {write:?}: {e}");
            }
        }
    }

    pub async fn handle(&self, event: &BrowserEvent) {
        trace!("Handling {event:?}");
        let browser = self.browser.clone();
        self.transition(|inner, now, writes| inner.on_event(event, browser.as_ref(), now, writes))
            .await;
    }

    /// Writes time accrued by the current session without changing state.
    pub async fn tick(&self) {
        self.transition(|inner, now, writes| inner.flush(now, writes))
            .await;
    }

    /// Rebuilds the session from the focused window after a restart. Doesn't count a visit.
    pub async fn resume(&self) {
        let browser = self.browser.clone();
        self.transition(|inner, now, writes| {
            inner.evaluate_focused(browser.as_ref(), Activation::Resume, now, writes)
        })
        .await;
        if let Some(session) = self.current().await {
            info!("Resumed tracking {}", session.domain);
        }
    }

    /// Installs a new exclusion set. A tracked domain that became excluded stops immediately.
    pub async fn refresh(&self, exclusions: ExclusionSet) {
        let browser = self.browser.clone();
        self.transition(|inner, now, writes| {
            inner.exclusions = exclusions;
            match inner.tracked_domain() {
                Some(domain) if inner.exclusions.is_excluded(domain) => inner.stop(now, writes),
                Some(_) => {}
                None => inner.evaluate_focused(browser.as_ref(), Activation::Refocus, now, writes),
            }
        })
        .await;
    }

    /// Writes the current session and stops tracking.
    pub async fn suspend(&self) {
        self.transition(|inner, now, writes| inner.stop(now, writes))
            .await;
    }

    pub async fn current(&self) -> Option<ActiveSession> {
        match &self.inner.lock().await.state {
            MonitorState::Tracking(session) => Some(session.clone()),
            MonitorState::Idle { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use chrono::Duration;

    use super::ActivityMonitor;
    use crate::{
        crypto::store::testing::memory_store,
        daemon::{
            collection::{
                browser::{
                    testing::{tab, window},
                    BrowserEvent, BrowserPort, IdleState, MockBrowserPort, TabRegistry,
                    WindowState,
                },
                domain::ExclusionSet,
            },
            storage::{entities::DayBucket, ledger::TimeLedger},
        },
        utils::{
            clock::{
                testing::{ManualClock, TEST_START_DATE},
                Clock,
            },
            logging::TEST_LOGGING,
        },
    };

    struct Harness {
        clock: ManualClock,
        registry: Arc<TabRegistry>,
        ledger: Arc<TimeLedger>,
        monitor: ActivityMonitor,
    }

    impl Harness {
        async fn new(exclusions: &[&str]) -> Self {
            *TEST_LOGGING;
            let clock = ManualClock::at_test_start();
            let (_, store) = memory_store(&clock).await;
            let shared_clock = Arc::new(clock.clone()) as Arc<dyn Clock>;
            let ledger = Arc::new(TimeLedger::new(store, shared_clock.clone()));
            let registry = Arc::new(TabRegistry::new());
            registry.apply_snapshot(vec![window(1), window(2)], vec![], Some(1));
            let monitor = ActivityMonitor::new(
                registry.clone() as Arc<dyn BrowserPort>,
                ledger.clone(),
                shared_clock,
                ExclusionSet::new(exclusions.iter().map(|v| v.to_string())),
            );
            Self {
                clock,
                registry,
                ledger,
                monitor,
            }
        }

        async fn at(&self, ms: i64, event: BrowserEvent) {
            self.clock.set_ms(ms);
            self.registry.observe(&event);
            self.monitor.handle(&event).await;
        }

        async fn open_tab(&self, ms: i64, id: i64, window_id: i64, url: &str) {
            let mut info = tab(id, window_id, url);
            info.active = false;
            self.at(ms, BrowserEvent::TabUpdated { tab: info }).await;
            self.at(
                ms,
                BrowserEvent::TabActivated {
                    tab_id: id,
                    window_id,
                },
            )
            .await;
        }

        async fn today(&self) -> DayBucket {
            self.ledger.bucket(TEST_START_DATE.date()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_refocus_does_not_add_visit() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://www.youtube.com/watch?v=x").await;
        h.at(120_000, BrowserEvent::WindowFocusChanged { window_id: None })
            .await;
        h.at(
            130_000,
            BrowserEvent::WindowFocusChanged { window_id: Some(1) },
        )
        .await;
        h.at(
            150_000,
            BrowserEvent::TabRemoved {
                tab_id: 1,
                window_id: Some(1),
            },
        )
        .await;

        let bucket = h.today().await;
        let stat = &bucket.domains["youtube.com"];
        assert_eq!(stat.total_active_ms, 140_000);
        assert_eq!(stat.visit_count, 1);
        assert!(h.monitor.current().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_excluded_subdomain_never_accrues() -> Result<()> {
        let h = Harness::new(&["example.com"]).await;
        h.open_tab(0, 1, 1, "https://rust-lang.org").await;
        h.at(
            1_000,
            BrowserEvent::TabUpdated {
                tab: tab(1, 1, "https://sub.example.com/page"),
            },
        )
        .await;
        h.at(60_000, BrowserEvent::WindowFocusChanged { window_id: None })
            .await;

        let bucket = h.today().await;
        assert!(!bucket.domains.contains_key("sub.example.com"));
        assert!(!bucket.domains.contains_key("example.com"));
        assert_eq!(bucket.domains["rust-lang.org"].total_active_ms, 1_000);
        Ok(())
    }

    #[tokio::test]
    async fn test_navigation_switches_domain_and_counts_visit() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://a.com").await;
        h.at(10_000, BrowserEvent::TabUpdated { tab: tab(1, 1, "https://a.com/other") })
            .await;
        h.at(20_000, BrowserEvent::TabUpdated { tab: tab(1, 1, "https://b.com") })
            .await;
        h.monitor.suspend().await;
        h.clock.set_ms(30_000);
        h.monitor.suspend().await;

        let bucket = h.today().await;
        assert_eq!(bucket.domains["a.com"].total_active_ms, 20_000);
        assert_eq!(bucket.domains["a.com"].visit_count, 1);
        assert_eq!(bucket.domains["b.com"].total_active_ms, 0);
        assert_eq!(bucket.domains["b.com"].visit_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_untrackable_pages_and_windows() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "chrome://newtab").await;
        assert!(h.monitor.current().await.is_none());

        h.at(1_000, BrowserEvent::TabUpdated { tab: tab(1, 1, "https://a.com") })
            .await;
        assert_eq!(h.monitor.current().await.unwrap().domain, "a.com");

        let mut minimized = window(1);
        minimized.state = WindowState::Minimized;
        h.at(5_000, BrowserEvent::WindowUpdated { window: minimized })
            .await;
        assert!(h.monitor.current().await.is_none());

        let mut private = tab(2, 2, "https://secret.com");
        private.incognito = true;
        private.active = false;
        h.at(6_000, BrowserEvent::WindowFocusChanged { window_id: Some(2) })
            .await;
        h.at(6_000, BrowserEvent::TabUpdated { tab: private }).await;
        h.at(
            6_000,
            BrowserEvent::TabActivated {
                tab_id: 2,
                window_id: 2,
            },
        )
        .await;
        assert!(h.monitor.current().await.is_none());

        let bucket = h.today().await;
        assert_eq!(bucket.domains["a.com"].total_active_ms, 4_000);
        assert!(!bucket.domains.contains_key("secret.com"));
        Ok(())
    }

    #[tokio::test]
    async fn test_tick_flushes_without_double_counting() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://a.com").await;
        h.clock.set_ms(60_000);
        h.monitor.tick().await;
        h.monitor.tick().await;
        h.clock.set_ms(90_000);
        h.monitor.tick().await;
        // A clock going backwards never produces negative time.
        h.clock.set_ms(80_000);
        h.monitor.tick().await;
        h.clock.set_ms(100_000);
        h.monitor.suspend().await;

        assert_eq!(h.today().await.domains["a.com"].total_active_ms, 100_000);
        Ok(())
    }

    #[tokio::test]
    async fn test_tab_replace_keeps_session() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://a.com").await;
        h.at(
            5_000,
            BrowserEvent::TabReplaced {
                added_tab_id: 7,
                removed_tab_id: 1,
            },
        )
        .await;
        assert_eq!(h.monitor.current().await.unwrap().tab_id, 7);

        // The old id is gone, so its removal no longer matters.
        h.at(
            6_000,
            BrowserEvent::TabRemoved {
                tab_id: 1,
                window_id: Some(1),
            },
        )
        .await;
        h.at(
            9_000,
            BrowserEvent::TabRemoved {
                tab_id: 7,
                window_id: Some(1),
            },
        )
        .await;

        let stat = &h.today().await.domains["a.com"];
        assert_eq!(stat.total_active_ms, 9_000);
        assert_eq!(stat.visit_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_idle_pauses_tracking() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://a.com").await;
        h.at(
            30_000,
            BrowserEvent::IdleStateChanged {
                state: IdleState::Locked,
            },
        )
        .await;
        h.at(
            40_000,
            BrowserEvent::TabActivated {
                tab_id: 1,
                window_id: 1,
            },
        )
        .await;
        assert!(h.monitor.current().await.is_none());
        h.at(
            100_000,
            BrowserEvent::IdleStateChanged {
                state: IdleState::Active,
            },
        )
        .await;
        h.clock.set_ms(110_000);
        h.monitor.suspend().await;

        let stat = &h.today().await.domains["a.com"];
        assert_eq!(stat.total_active_ms, 40_000);
        assert_eq!(stat.visit_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_stops_newly_excluded_domain() -> Result<()> {
        let h = Harness::new(&[]).await;
        h.open_tab(0, 1, 1, "https://news.a.com").await;
        h.clock.set_ms(10_000);
        h.monitor
            .refresh(ExclusionSet::new(["a.com".to_string()]))
            .await;
        assert!(h.monitor.current().await.is_none());
        h.clock.set_ms(50_000);
        h.monitor.tick().await;

        assert_eq!(h.today().await.domains["news.a.com"].total_active_ms, 10_000);

        h.monitor.refresh(ExclusionSet::default()).await;
        assert_eq!(h.monitor.current().await.unwrap().domain, "news.a.com");
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_does_not_count_visit() -> Result<()> {
        *TEST_LOGGING;
        let clock = ManualClock::at_test_start();
        let (_, store) = memory_store(&clock).await;
        let shared_clock = Arc::new(clock.clone()) as Arc<dyn Clock>;
        let ledger = Arc::new(TimeLedger::new(store, shared_clock.clone()));

        let mut browser = MockBrowserPort::new();
        browser.expect_focused_window().returning(|| {
            let mut w = window(3);
            w.focused = true;
            Some(w)
        });
        browser
            .expect_active_tab()
            .withf(|id| *id == 3)
            .returning(|_| Some(tab(30, 3, "https://docs.rs")));

        let monitor = ActivityMonitor::new(
            Arc::new(browser),
            ledger.clone(),
            shared_clock,
            ExclusionSet::default(),
        );
        monitor.resume().await;
        assert_eq!(monitor.current().await.unwrap().domain, "docs.rs");

        clock.advance(Duration::seconds(5));
        monitor.suspend().await;
        let stat = &ledger.bucket(TEST_START_DATE.date()).await?.domains["docs.rs"];
        assert_eq!(stat.total_active_ms, 5_000);
        assert_eq!(stat.visit_count, 0);
        Ok(())
    }
}
