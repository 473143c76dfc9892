//! Per-device poll coordinator.
//!
//! One poll runs `check token -> (renew) -> fetch -> publish` in sequence. A
//! report request rejected with a cached token triggers exactly one re-login
//! and retry. Subscribers receive a [`PollState`] through a `watch` channel;
//! its `report` only changes when a fetch fully succeeds.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Transport, GET_DAY_ENDPOINT, LOGIN_ENDPOINT, REQUEST_TIMEOUT};
use crate::auth::{AuthToken, DeviceIdentity, TokenCache, TokenManager};
use crate::config::Store;
use crate::data::DayReport;
use crate::error::{CommunicationError, PillowError, Result};
use crate::report::ReportClient;

/// What subscribers see after each poll.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    pub report: Option<Arc<DayReport>>,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum PollOutcome {
    Updated(Arc<DayReport>),
    /// Another poll was already running.
    Skipped,
}

pub struct Coordinator {
    tokens: TokenManager,
    reports: ReportClient,
    identity: DeviceIdentity,
    token_cache: Mutex<TokenCache>,
    store: Option<Store>,
    request_timeout: Duration,
    in_flight: Mutex<()>,
    state_tx: watch::Sender<PollState>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, identity: DeviceIdentity) -> Self {
        let (state_tx, _) = watch::channel(PollState::default());
        Self {
            tokens: TokenManager::new(transport.clone(), identity.clone()),
            reports: ReportClient::new(transport, identity.clone()),
            identity,
            token_cache: Mutex::new(TokenCache::default()),
            store: None,
            request_timeout: REQUEST_TIMEOUT,
            in_flight: Mutex::new(()),
            state_tx,
        }
    }

    /// Persist tokens and reports in `store`, and start from what it holds.
    pub fn with_store(mut self, store: Store) -> Self {
        match store.load_token(&self.identity) {
            Ok(token) => {
                debug!("Loaded stored token valid until {}", token.valid_until);
                self.token_cache = Mutex::new(TokenCache::new(Some(token)));
            }
            Err(e) => debug!("No stored token: {:#}", e),
        }
        match store.load_report(&self.identity) {
            Ok(report) => {
                debug!("Loaded cached report for {}", report.day);
                self.state_tx.send_modify(|state| state.report = Some(Arc::new(report)));
            }
            Err(e) => debug!("No cached report: {:#}", e),
        }
        self.store = Some(store);
        self
    }

    pub fn with_token(self, token: AuthToken) -> Self {
        Self {
            token_cache: Mutex::new(TokenCache::new(Some(token))),
            ..self
        }
    }

    pub fn with_report_client(self, reports: ReportClient) -> Self {
        Self { reports, ..self }
    }

    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    pub fn report(&self) -> Option<Arc<DayReport>> {
        self.state_tx.borrow().report.clone()
    }

    /// Run one poll unless another is in flight.
    pub async fn refresh(&self) -> Result<PollOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Poll already in flight, skipping");
            return Ok(PollOutcome::Skipped);
        };

        let result = self.poll().await;

        self.state_tx.send_modify(|state| {
            state.last_attempt = Some(Utc::now());
            match &result {
                Ok(report) => {
                    state.report = Some(report.clone());
                    state.last_error = None;
                }
                Err(e) => state.last_error = Some(e.to_string()),
            }
        });

        result.map(PollOutcome::Updated)
    }

    async fn poll(&self) -> Result<Arc<DayReport>> {
        let (token, renewed) = self.current_token().await?;

        let report = match self.fetch(&token).await {
            Err(e) if e.is_unauthorized() && !renewed => {
                warn!("{}; logging in again", e);
                self.token_cache.lock().await.invalidate();
                let token = self.renew_token().await?;
                self.fetch(&token).await?
            }
            other => other?,
        };

        info!(
            "Report for {} updated (score: {})",
            report.day,
            report
                .raw
                .score
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        let report = Arc::new(report);
        if let Some(store) = &self.store {
            if let Err(e) = store.save_report(&self.identity, &report) {
                warn!("Failed to cache report: {:#}", e);
            }
        }
        Ok(report)
    }

    /// The cached token if still valid, otherwise a fresh one. The flag is
    /// true when a login just happened.
    pub async fn current_token(&self) -> Result<(String, bool)> {
        if let Some(token) = self.token_cache.lock().await.usable(Utc::now()) {
            return Ok((token.value.clone(), false));
        }
        Ok((self.renew_token().await?, true))
    }

    async fn renew_token(&self) -> Result<String> {
        let value = self.bounded(LOGIN_ENDPOINT, self.tokens.login()).await?;
        let token = AuthToken::issue(value, Utc::now());
        info!("New token valid until {}", token.valid_until);

        if let Some(store) = &self.store {
            if let Err(e) = store.save_token(&self.identity, &token) {
                warn!("Failed to persist token: {:#}", e);
            }
        }

        let value = token.value.clone();
        self.token_cache.lock().await.replace(token);
        Ok(value)
    }

    async fn fetch(&self, token: &str) -> Result<DayReport> {
        self.bounded(GET_DAY_ENDPOINT, self.reports.fetch_last_night_report(token))
            .await
    }

    async fn bounded<T>(&self, endpoint: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.request_timeout, call).await.map_err(|_| {
            PillowError::communication(endpoint, CommunicationError::Timeout(self.request_timeout))
        })?
    }

    /// True when the last poll succeeded less than `period` ago.
    fn polled_within(&self, period: Duration) -> bool {
        let state = self.state_tx.borrow();
        match (state.last_attempt, &state.last_error) {
            (Some(at), None) => chrono::Duration::from_std(period)
                .map(|period| Utc::now() - at < period)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Poll every `period` until the task is dropped. A poll that just
    /// succeeded counts as the first tick.
    pub async fn run(self: Arc<Self>, period: Duration) {
        info!(
            "Polling device {} every {}s",
            self.identity.did(),
            period.as_secs()
        );

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if self.polled_within(period) {
            debug!("Report is fresh, first poll in {}s", period.as_secs());
            timer.reset();
        }
        let mut consecutive_failures = 0u32;

        loop {
            timer.tick().await;

            match self.refresh().await {
                Ok(PollOutcome::Updated(_)) => consecutive_failures = 0,
                Ok(PollOutcome::Skipped) => {}
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= 3 {
                        warn!("Poll failed: {} (attempt {})", e, consecutive_failures);
                    } else if consecutive_failures == 4 {
                        error!(
                            "Poll failed {} times in a row, will keep trying silently",
                            consecutive_failures
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockTransport, Reply};
    use chrono::FixedOffset;
    use serde_json::{json, Value};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("mlily", "android", "user-1", "AA:BB:CC:DD:EE:FF", "3").unwrap()
    }

    fn coordinator(transport: Arc<MockTransport>) -> Coordinator {
        let tz = FixedOffset::east_opt(0).unwrap();
        let reports = ReportClient::new(transport.clone(), identity()).with_timezone(tz);
        Coordinator::new(transport, identity()).with_report_client(reports)
    }

    fn valid_token(value: &str) -> AuthToken {
        AuthToken::issue(value.to_string(), Utc::now())
    }

    fn login_ok(token: &str) -> Reply {
        Reply::Json(json!({ "code": "1000", "data": token }))
    }

    fn day(score: u32) -> Value {
        json!({
            "code": 1000,
            "data": {
                "score": score,
                "sleep_data": [{ "start": 3600, "end": 5400, "status": 1 }]
            }
        })
    }

    fn token_header(transport: &MockTransport, index: usize) -> String {
        transport.requests()[index].headers[0].1.clone()
    }

    #[tokio::test]
    async fn test_refresh_logs_in_when_no_token() {
        let transport = Arc::new(MockTransport::new(vec![login_ok("fresh"), Reply::Json(day(80))]));
        let coordinator = coordinator(transport.clone());

        let outcome = coordinator.refresh().await.unwrap();

        assert!(matches!(outcome, PollOutcome::Updated(ref r) if r.raw.score == Some(80.0)));
        assert_eq!(transport.endpoints(), vec![LOGIN_ENDPOINT, GET_DAY_ENDPOINT]);
        assert_eq!(token_header(&transport, 1), "fresh");
        assert_eq!(coordinator.report().unwrap().derived.deep_sleep_time, "1:00-1:30");
    }

    #[tokio::test]
    async fn test_refresh_uses_valid_cached_token() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(day(70))]));
        let coordinator = coordinator(transport.clone()).with_token(valid_token("cached"));

        coordinator.refresh().await.unwrap();

        assert_eq!(transport.endpoints(), vec![GET_DAY_ENDPOINT]);
        assert_eq!(token_header(&transport, 0), "cached");
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_before_fetch() {
        let expired = AuthToken::issue("old".to_string(), Utc::now() - chrono::Duration::days(16));
        let transport = Arc::new(MockTransport::new(vec![login_ok("new"), Reply::Json(day(70))]));
        let coordinator = coordinator(transport.clone()).with_token(expired);

        coordinator.refresh().await.unwrap();

        assert_eq!(transport.endpoints(), vec![LOGIN_ENDPOINT, GET_DAY_ENDPOINT]);
        assert_eq!(token_header(&transport, 1), "new");
    }

    #[tokio::test]
    async fn test_rejected_cached_token_relogs_and_retries_once() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Json(json!({ "code": 2000 })),
            login_ok("new"),
            Reply::Json(day(91)),
        ]));
        let coordinator = coordinator(transport.clone()).with_token(valid_token("stale"));

        let outcome = coordinator.refresh().await.unwrap();

        assert!(matches!(outcome, PollOutcome::Updated(_)));
        assert_eq!(
            transport.endpoints(),
            vec![GET_DAY_ENDPOINT, LOGIN_ENDPOINT, GET_DAY_ENDPOINT]
        );
        assert_eq!(token_header(&transport, 0), "stale");
        assert_eq!(token_header(&transport, 2), "new");
        assert_eq!(coordinator.current_token().await.unwrap(), ("new".to_string(), false));
    }

    #[tokio::test]
    async fn test_rejection_after_fresh_login_is_not_retried() {
        let transport = Arc::new(MockTransport::new(vec![
            login_ok("fresh"),
            Reply::Json(json!({ "code": 2000 })),
        ]));
        let coordinator = coordinator(transport.clone());

        let err = coordinator.refresh().await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(transport.endpoints(), vec![LOGIN_ENDPOINT, GET_DAY_ENDPOINT]);
    }

    #[tokio::test]
    async fn test_rejected_fetch_keeps_previous_report() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Json(day(64)),
            Reply::Json(json!({ "code": 2000 })),
            login_ok("new"),
            Reply::Json(json!({ "code": 2000 })),
        ]));
        let coordinator = coordinator(transport.clone()).with_token(valid_token("cached"));
        let mut rx = coordinator.subscribe();

        coordinator.refresh().await.unwrap();
        let first = coordinator.report().unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let err = coordinator.refresh().await.unwrap_err();
        assert!(err.is_unauthorized());

        let state = rx.borrow_and_update().clone();
        assert!(Arc::ptr_eq(state.report.as_ref().unwrap(), &first));
        assert_eq!(state.report.unwrap().raw.score, Some(64.0));
        assert!(state.last_error.unwrap().contains("error code 2000"));
    }

    #[tokio::test]
    async fn test_login_rejection_surfaces() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(json!({ "code": "1001" }))]));
        let coordinator = coordinator(transport.clone());

        let err = coordinator.refresh().await.unwrap_err();

        assert!(matches!(err, PillowError::Unauthorized { ref code, .. } if code == "1001"));
        assert!(coordinator.report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Delayed(
            Duration::from_secs(30),
            day(50),
        )]));
        let coordinator = coordinator(transport.clone()).with_token(valid_token("cached"));

        let err = coordinator.refresh().await.unwrap_err();

        assert!(matches!(
            err,
            PillowError::Communication {
                source: CommunicationError::Timeout(_),
                ..
            }
        ));
        assert_eq!(transport.endpoints(), vec![GET_DAY_ENDPOINT]);
        assert!(coordinator.report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refresh_is_skipped() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Delayed(
            Duration::from_secs(2),
            day(75),
        )]));
        let coordinator = coordinator(transport.clone()).with_token(valid_token("cached"));

        let (first, second) = tokio::join!(coordinator.refresh(), coordinator.refresh());

        assert!(matches!(first.unwrap(), PollOutcome::Updated(_)));
        assert!(matches!(second.unwrap(), PollOutcome::Skipped));
        assert_eq!(transport.endpoints(), vec![GET_DAY_ENDPOINT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_waits_a_period_after_fresh_refresh() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(day(70)), Reply::Json(day(71))]));
        let coordinator = Arc::new(coordinator(transport.clone()).with_token(valid_token("cached")));

        coordinator.refresh().await.unwrap();
        let poller = tokio::spawn(coordinator.clone().run(Duration::from_secs(3600)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.endpoints().len(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(transport.endpoints().len(), 2);
        assert_eq!(coordinator.report().unwrap().raw.score, Some(71.0));
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_starts_immediately_without_recent_poll() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Json(day(70))]));
        let coordinator = Arc::new(coordinator(transport.clone()).with_token(valid_token("cached")));

        let poller = tokio::spawn(coordinator.clone().run(Duration::from_secs(3600)));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.endpoints(), vec![GET_DAY_ENDPOINT]);
        poller.abort();
    }

    #[tokio::test]
    async fn test_store_persists_token_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let transport = Arc::new(MockTransport::new(vec![login_ok("persisted"), Reply::Json(day(88))]));

        coordinator(transport).with_store(store.clone()).refresh().await.unwrap();

        assert_eq!(store.load_token(&identity()).unwrap().value, "persisted");
        assert_eq!(store.load_report(&identity()).unwrap().raw.score, Some(88.0));

        let reloaded = Coordinator::new(Arc::new(MockTransport::default()), identity()).with_store(store);
        assert_eq!(reloaded.report().unwrap().raw.score, Some(88.0));
        assert_eq!(
            reloaded.current_token().await.unwrap(),
            ("persisted".to_string(), false)
        );
    }

    #[tokio::test]
    async fn test_store_of_another_device_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let transport = Arc::new(MockTransport::new(vec![login_ok("token-of-a"), Reply::Json(day(42))]));
        coordinator(transport).with_store(store.clone()).refresh().await.unwrap();

        let other = DeviceIdentity::new("mlily", "android", "user-1", "11:22:33:44:55:66", "3").unwrap();
        let transport = Arc::new(MockTransport::new(vec![login_ok("token-of-b")]));
        let coordinator = Coordinator::new(transport.clone(), other).with_store(store);

        assert!(coordinator.report().is_none());
        assert_eq!(
            coordinator.current_token().await.unwrap(),
            ("token-of-b".to_string(), true)
        );
        assert_eq!(transport.requests()[0].body["did"], "112233445566");
    }
}
