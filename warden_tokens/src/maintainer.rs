//! Maintenance passes over every stored connection

use std::fmt;

use tokio_util::sync::CancellationToken;
use warden_clock::{Clock, System};

use crate::{
    refresher::{RefreshResult, TokenRefresher},
    store::{StorageError, TokenStore},
    Provider, ProviderRef, TokenRecord, TokenStatus, UserId, ValidatorConfig,
};

/// What happened during one maintenance pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    /// Records whose tokens were refreshed and saved
    pub refreshed: usize,
    /// Records that needed no action
    pub skipped: usize,
    /// Records whose refresh failed in a way that may clear up by the next pass
    pub failed_transient: usize,
    /// Records whose grant is gone for good and were disconnected
    pub failed_permanent: usize,
    /// Records that could not be saved or deleted after a refresh attempt
    pub failed_storage: usize,
    /// Connections that need the user to authorize again
    pub reauthorization_required: Vec<(UserId, Provider)>,
    /// Whether the pass was cancelled before every record was examined
    pub cancelled: bool,
}

impl MaintenanceSummary {
    /// The number of records examined
    pub fn examined(&self) -> usize {
        self.refreshed
            + self.skipped
            + self.failed_transient
            + self.failed_permanent
            + self.failed_storage
    }

    /// The number of records that were not left in a healthy state
    pub fn failed(&self) -> usize {
        self.failed_transient + self.failed_permanent + self.failed_storage
    }
}

impl fmt::Display for MaintenanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} refreshed, {} skipped, {} transient, {} permanent, {} storage",
            self.refreshed,
            self.skipped,
            self.failed_transient,
            self.failed_permanent,
            self.failed_storage,
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Keeps every stored connection for one provider usable
///
/// A pass lists the provider's records, refreshes any that are expiring soon or
/// already expired, and disconnects those whose grant has been revoked. Records
/// are processed one at a time, and a failure on one never stops the others.
#[derive(Debug)]
pub struct ConnectionMaintainer<S, R, C = System> {
    store: S,
    refresher: R,
    provider: Provider,
    validator: ValidatorConfig<C>,
}

impl<S, R> ConnectionMaintainer<S, R, System> {
    /// Constructs a maintainer using the default validator configuration
    pub fn new(store: S, refresher: R, provider: Provider) -> Self {
        Self {
            store,
            refresher,
            provider,
            validator: ValidatorConfig::default(),
        }
    }
}

impl<S, R, C> ConnectionMaintainer<S, R, C> {
    /// Sets the validator used to decide which records need a refresh
    pub fn with_validator<D>(self, validator: ValidatorConfig<D>) -> ConnectionMaintainer<S, R, D> {
        ConnectionMaintainer {
            store: self.store,
            refresher: self.refresher,
            provider: self.provider,
            validator,
        }
    }

    /// Gets the provider whose connections are maintained
    pub fn provider(&self) -> &ProviderRef {
        &self.provider
    }

    /// Gets the underlying store
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, R, C> ConnectionMaintainer<S, R, C>
where
    S: TokenStore,
    R: TokenRefresher,
    C: Clock,
{
    /// Runs one pass over every stored record
    ///
    /// Only a failure to list the records fails the pass; per-record failures
    /// are counted in the summary.
    pub async fn maintain(&self) -> Result<MaintenanceSummary, StorageError> {
        self.run_pass(None).await
    }

    /// Runs one pass, stopping before the next record once `cancel` fires
    ///
    /// A record already being refreshed is finished first.
    pub async fn maintain_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceSummary, StorageError> {
        self.run_pass(Some(cancel)).await
    }

    async fn run_pass(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<MaintenanceSummary, StorageError> {
        let records = self.store.list_all(&self.provider).await.map_err(|error| {
            tracing::error!(
                provider = %self.provider,
                error = &error as &dyn std::error::Error,
                "unable to list stored tokens"
            );
            error
        })?;

        let mut summary = MaintenanceSummary::default();
        for record in &records {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                summary.cancelled = true;
                break;
            }
            self.maintain_record(record, &mut summary).await;
        }

        tracing::info!(
            provider = %self.provider,
            total = records.len(),
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed_transient = summary.failed_transient,
            failed_permanent = summary.failed_permanent,
            failed_storage = summary.failed_storage,
            reauthorization_required = summary.reauthorization_required.len(),
            cancelled = summary.cancelled,
            "maintenance pass complete"
        );

        Ok(summary)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(user_id = %record.user_id(), provider = %record.provider()),
    )]
    async fn maintain_record(&self, record: &TokenRecord, summary: &mut MaintenanceSummary) {
        let status = self.validator.status(record);
        if !status.needs_refresh() {
            tracing::trace!(expires_at = record.expires_at().0, "token valid; skipping");
            summary.skipped += 1;
            return;
        }

        if !record.is_refreshable() {
            if status == TokenStatus::Expired {
                self.disconnect(record, "expired without a refresh token", summary)
                    .await;
            } else {
                tracing::warn!(
                    expires_at = record.expires_at().0,
                    "token expiring soon but cannot be refreshed"
                );
                summary.skipped += 1;
            }
            return;
        }

        tracing::debug!(%status, "refreshing token");
        match self.refresher.refresh(record).await {
            RefreshResult::Success(fields) => {
                let expires_at = fields.expires_at;
                match self.store.save_if_unchanged(record, fields).await {
                    Ok(Some(_)) => {
                        tracing::info!(expires_at = expires_at.0, "token refreshed");
                        summary.refreshed += 1;
                    }
                    Ok(None) => {
                        tracing::info!(
                            "connection changed during refresh; keeping the newer tokens"
                        );
                        summary.skipped += 1;
                    }
                    Err(error) => {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            "refreshed token could not be saved"
                        );
                        summary.failed_storage += 1;
                    }
                }
            }
            RefreshResult::TransientFailure(reason) => {
                tracing::warn!(%reason, "refresh failed; will retry next pass");
                summary.failed_transient += 1;
            }
            RefreshResult::PermanentFailure(reason) => {
                self.disconnect(record, &reason, summary).await;
            }
        }
    }

    async fn disconnect(&self, record: &TokenRecord, reason: &str, summary: &mut MaintenanceSummary) {
        let connection = (record.user_id(), record.provider().to_owned());

        match self.store.delete_if_unchanged(record).await {
            Ok(true) => {
                tracing::warn!(%reason, "connection disconnected; reauthorization required");
                summary.failed_permanent += 1;
                summary.reauthorization_required.push(connection);
            }
            Ok(false) => {
                tracing::info!(
                    %reason,
                    "connection changed since it was listed; leaving it in place"
                );
                summary.skipped += 1;
            }
            Err(error) => {
                tracing::error!(
                    %reason,
                    error = &error as &dyn std::error::Error,
                    "revoked connection could not be removed"
                );
                summary.failed_storage += 1;
                summary.reauthorization_required.push(connection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use warden_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{store::InMemoryTokenStore, AccessToken, RefreshToken, TokenFields};

    const T0: UnixTime = UnixTime(1_700_000_000);
    const MARGIN: DurationSecs = DurationSecs::from_mins(15);

    /// Answers each user with a scripted result and remembers who asked
    #[derive(Debug, Default)]
    struct ScriptedRefresher {
        script: HashMap<UserId, RefreshResult>,
        calls: Mutex<Vec<UserId>>,
    }

    impl ScriptedRefresher {
        fn answer(mut self, user_id: i64, result: RefreshResult) -> Self {
            self.script.insert(UserId(user_id), result);
            self
        }

        fn calls(&self) -> Vec<UserId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenRefresher for ScriptedRefresher {
        async fn refresh(&self, record: &TokenRecord) -> RefreshResult {
            self.calls.lock().unwrap().push(record.user_id());
            self.script
                .get(&record.user_id())
                .cloned()
                .unwrap_or_else(|| RefreshResult::TransientFailure("unscripted".to_owned()))
        }
    }

    /// Wraps a store and fails chosen operations
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemoryTokenStore<TestClock>,
        fail_list: bool,
        fail_save_for: Option<UserId>,
        fail_delete_for: Option<UserId>,
    }

    fn unavailable() -> StorageError {
        StorageError::Unavailable("database is locked".to_owned())
    }

    #[async_trait]
    impl TokenStore for FlakyStore {
        async fn get(
            &self,
            user_id: UserId,
            provider: &ProviderRef,
        ) -> Result<Option<TokenRecord>, StorageError> {
            self.inner.get(user_id, provider).await
        }

        async fn save(
            &self,
            user_id: UserId,
            provider: &ProviderRef,
            fields: TokenFields,
        ) -> Result<TokenRecord, StorageError> {
            if self.fail_save_for == Some(user_id) {
                return Err(unavailable());
            }
            self.inner.save(user_id, provider, fields).await
        }

        async fn delete(&self, user_id: UserId, provider: &ProviderRef) -> Result<bool, StorageError> {
            if self.fail_delete_for == Some(user_id) {
                return Err(unavailable());
            }
            self.inner.delete(user_id, provider).await
        }

        async fn save_if_unchanged(
            &self,
            previous: &TokenRecord,
            fields: TokenFields,
        ) -> Result<Option<TokenRecord>, StorageError> {
            if self.fail_save_for == Some(previous.user_id()) {
                return Err(unavailable());
            }
            self.inner.save_if_unchanged(previous, fields).await
        }

        async fn delete_if_unchanged(&self, previous: &TokenRecord) -> Result<bool, StorageError> {
            if self.fail_delete_for == Some(previous.user_id()) {
                return Err(unavailable());
            }
            self.inner.delete_if_unchanged(previous).await
        }

        async fn list_all(&self, provider: &ProviderRef) -> Result<Vec<TokenRecord>, StorageError> {
            if self.fail_list {
                return Err(unavailable());
            }
            self.inner.list_all(provider).await
        }
    }

    fn fields(refresh: Option<&'static str>, expires_at: UnixTime) -> TokenFields {
        TokenFields::bearer(
            AccessToken::from_static("access"),
            refresh.map(RefreshToken::from_static),
            expires_at,
        )
    }

    fn refreshed_until(expires_at: UnixTime) -> RefreshResult {
        RefreshResult::Success(TokenFields::bearer(
            AccessToken::from_static("fresh"),
            Some(RefreshToken::from_static("refresh-next")),
            expires_at,
        ))
    }

    async fn seed<S: TokenStore>(store: &S, user_id: i64, fields: TokenFields) {
        store
            .save(UserId(user_id), &Provider::default_tag(), fields)
            .await
            .unwrap();
    }

    fn maintainer<S>(
        store: S,
        refresher: Arc<ScriptedRefresher>,
        clock: &TestClock,
    ) -> ConnectionMaintainer<S, Arc<ScriptedRefresher>, TestClock> {
        ConnectionMaintainer::new(store, refresher, Provider::default_tag())
            .with_validator(ValidatorConfig::new(MARGIN).with_clock(clock.clone()))
    }

    #[tokio::test]
    async fn only_tokens_within_margin_are_refreshed() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(Some("r1"), T0 + DurationSecs::from_mins(120))).await;
        seed(&store, 2, fields(Some("r2"), T0 + DurationSecs::from_mins(5))).await;

        let refresher = Arc::new(
            ScriptedRefresher::default().answer(2, refreshed_until(T0 + DurationSecs(3_600))),
        );
        let maintainer = maintainer(store, Arc::clone(&refresher), &clock);

        let summary = maintainer.maintain().await.unwrap();

        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(refresher.calls(), vec![UserId(2)]);

        let stored = maintainer
            .store()
            .get(UserId(2), &Provider::default_tag())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.expires_at(), T0 + DurationSecs(3_600));
        assert_eq!(stored.access_token().as_str(), "fresh");
    }

    #[tokio::test]
    async fn second_pass_does_nothing_after_a_successful_one() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(Some("r1"), T0 + DurationSecs(60))).await;

        let refresher = Arc::new(
            ScriptedRefresher::default().answer(1, refreshed_until(T0 + DurationSecs(3_600))),
        );
        let maintainer = maintainer(store, Arc::clone(&refresher), &clock);

        let first = maintainer.maintain().await.unwrap();
        let second = maintainer.maintain().await.unwrap();

        assert_eq!(first.refreshed, 1);
        assert_eq!(
            second,
            MaintenanceSummary {
                skipped: 1,
                ..MaintenanceSummary::default()
            }
        );
        assert_eq!(refresher.calls().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_leaves_record_untouched() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(Some("r1"), T0 + DurationSecs(60))).await;
        let before = store
            .get(UserId(1), &Provider::default_tag())
            .await
            .unwrap();

        let refresher = Arc::new(ScriptedRefresher::default().answer(
            1,
            RefreshResult::TransientFailure("503 Service Unavailable".to_owned()),
        ));
        let maintainer = maintainer(store, refresher, &clock);
        clock.inc(30);

        let summary = maintainer.maintain().await.unwrap();

        assert_eq!(summary.failed_transient, 1);
        assert!(summary.reauthorization_required.is_empty());
        let after = maintainer
            .store()
            .get(UserId(1), &Provider::default_tag())
            .await
            .unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn permanent_failure_disconnects_without_failing_the_pass() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(Some("revoked"), T0 + DurationSecs(60))).await;
        seed(&store, 2, fields(Some("r2"), T0 + DurationSecs(60))).await;

        let refresher = Arc::new(
            ScriptedRefresher::default()
                .answer(
                    1,
                    RefreshResult::PermanentFailure("invalid_grant".to_owned()),
                )
                .answer(2, refreshed_until(T0 + DurationSecs(3_600))),
        );
        let maintainer = maintainer(store, Arc::clone(&refresher), &clock);

        let summary = maintainer.maintain().await.unwrap();

        assert_eq!(summary.failed_permanent, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(
            summary.reauthorization_required,
            vec![(UserId(1), Provider::default_tag())]
        );
        assert!(maintainer
            .store()
            .get(UserId(1), &Provider::default_tag())
            .await
            .unwrap()
            .is_none());

        let again = maintainer.maintain().await.unwrap();
        assert_eq!(again.failed_permanent, 0);
        assert_eq!(refresher.calls(), vec![UserId(1), UserId(2)]);
    }

    #[tokio::test]
    async fn records_without_refresh_token_are_never_sent() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(None, T0 + DurationSecs(60))).await;
        seed(&store, 2, fields(None, T0 - DurationSecs(60))).await;

        let refresher = Arc::new(ScriptedRefresher::default());
        let maintainer = maintainer(store, Arc::clone(&refresher), &clock);

        let summary = maintainer.maintain().await.unwrap();

        assert!(refresher.calls().is_empty());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed_permanent, 1);
        assert_eq!(
            summary.reauthorization_required,
            vec![(UserId(2), Provider::default_tag())]
        );
        assert_eq!(maintainer.store().len().await, 1);
    }

    #[tokio::test]
    async fn storage_failures_are_isolated_per_record() {
        let clock = TestClock::new(T0);
        let store = FlakyStore {
            inner: InMemoryTokenStore::new().with_clock(clock.clone()),
            fail_save_for: Some(UserId(1)),
            fail_delete_for: Some(UserId(2)),
            ..FlakyStore::default()
        };
        seed(&store.inner, 1, fields(Some("r1"), T0 + DurationSecs(60))).await;
        seed(&store.inner, 2, fields(Some("r2"), T0 + DurationSecs(60))).await;
        seed(&store.inner, 3, fields(Some("r3"), T0 + DurationSecs(60))).await;

        let refresher = Arc::new(
            ScriptedRefresher::default()
                .answer(1, refreshed_until(T0 + DurationSecs(3_600)))
                .answer(
                    2,
                    RefreshResult::PermanentFailure("invalid_grant".to_owned()),
                )
                .answer(3, refreshed_until(T0 + DurationSecs(3_600))),
        );
        let maintainer = maintainer(store, refresher, &clock);

        let summary = maintainer.maintain().await.unwrap();

        assert_eq!(summary.failed_storage, 2);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.examined(), 3);
        assert_eq!(
            summary.reauthorization_required,
            vec![(UserId(2), Provider::default_tag())]
        );
    }

    /// Stands in for a user who authorizes again while the exchange is in flight
    #[derive(Debug)]
    struct ReauthorizedMidRefresh {
        store: Arc<InMemoryTokenStore<TestClock>>,
        result: RefreshResult,
    }

    #[async_trait]
    impl TokenRefresher for ReauthorizedMidRefresh {
        async fn refresh(&self, record: &TokenRecord) -> RefreshResult {
            self.store
                .save(
                    record.user_id(),
                    record.provider(),
                    TokenFields::bearer(
                        AccessToken::from_static("reauthorized"),
                        Some(RefreshToken::from_static("r-new")),
                        T0 + DurationSecs(7_200),
                    ),
                )
                .await
                .unwrap();
            self.result.clone()
        }
    }

    async fn pass_with_reauthorization(result: RefreshResult) -> (MaintenanceSummary, TokenRecord) {
        let clock = TestClock::new(T0);
        let store = Arc::new(InMemoryTokenStore::new().with_clock(clock.clone()));
        seed(&*store, 1, fields(Some("r-old"), T0 + DurationSecs(60))).await;

        let refresher = ReauthorizedMidRefresh {
            store: Arc::clone(&store),
            result,
        };
        let maintainer =
            ConnectionMaintainer::new(Arc::clone(&store), refresher, Provider::default_tag())
                .with_validator(ValidatorConfig::new(MARGIN).with_clock(clock));

        let summary = maintainer.maintain().await.unwrap();
        let current = store
            .get(UserId(1), &Provider::default_tag())
            .await
            .unwrap()
            .expect("reauthorized connection is kept");
        (summary, current)
    }

    #[tokio::test]
    async fn revoked_grant_does_not_remove_a_newer_authorization() {
        let (summary, current) =
            pass_with_reauthorization(RefreshResult::PermanentFailure("invalid_grant".to_owned()))
                .await;

        assert_eq!(summary.failed_permanent, 0);
        assert_eq!(summary.skipped, 1);
        assert!(summary.reauthorization_required.is_empty());
        assert_eq!(current.access_token().as_str(), "reauthorized");
    }

    #[tokio::test]
    async fn refreshed_tokens_do_not_overwrite_a_newer_authorization() {
        let (summary, current) =
            pass_with_reauthorization(refreshed_until(T0 + DurationSecs(3_600))).await;

        assert_eq!(summary.refreshed, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(current.access_token().as_str(), "reauthorized");
        assert_eq!(
            current.refresh_token().map(|rt| rt.as_str()),
            Some("r-new")
        );
    }

    #[tokio::test]
    async fn listing_failure_fails_the_pass() {
        let clock = TestClock::new(T0);
        let store = FlakyStore {
            fail_list: true,
            ..FlakyStore::default()
        };

        let maintainer = maintainer(store, Arc::new(ScriptedRefresher::default()), &clock);

        assert!(matches!(
            maintainer.maintain().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_pass_stops_before_the_next_record() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        seed(&store, 1, fields(Some("r1"), T0 + DurationSecs(60))).await;

        let refresher = Arc::new(ScriptedRefresher::default());
        let maintainer = maintainer(store, Arc::clone(&refresher), &clock);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = maintainer.maintain_until_cancelled(&cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.examined(), 0);
        assert!(refresher.calls().is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn each_pass_logs_a_summary() {
        let clock = TestClock::new(T0);
        let store = InMemoryTokenStore::new().with_clock(clock.clone());
        let maintainer = maintainer(store, Arc::new(ScriptedRefresher::default()), &clock);

        maintainer.maintain().await.unwrap();

        assert!(logs_contain("maintenance pass complete"));
    }

    #[test]
    fn summary_display_is_compact() {
        let summary = MaintenanceSummary {
            refreshed: 2,
            skipped: 5,
            failed_transient: 1,
            cancelled: true,
            ..MaintenanceSummary::default()
        };
        assert_eq!(
            summary.to_string(),
            "2 refreshed, 5 skipped, 1 transient, 0 permanent, 0 storage (cancelled)"
        );
        assert_eq!(summary.failed(), 1);
    }
}
