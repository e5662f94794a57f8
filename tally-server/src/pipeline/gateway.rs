//! ERP posting gateway
//!
//! Owns the [`Posting`] lifecycle. At most one submission per idempotency key
//! is in flight: a submission first claims the posting (READY_TO_POST ->
//! POSTING_REQUESTED) through the repository, and a failed claim means
//! somebody else holds it.

use shared::error::{AppError, AppResult, ErrorCode, ErrorKind};
use shared::models::{
    CredentialType, Posting, PostingDocument, PostingSource, PostingStatus, PostingType,
    idempotency_key,
};
use shared::util::now_millis;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::adapters::{AdapterRegistry, ErpAdapter, PostingResult};
use crate::audit_log;
use crate::config::Config;
use crate::db::{RepoError, Repositories};
use crate::vault::CredentialVault;

/// Handling kind of the posting's last recorded failure
pub fn last_failure_kind(posting: &Posting) -> Option<ErrorKind> {
    posting
        .last_error_code
        .and_then(|code| ErrorCode::try_from(code).ok())
        .map(|code| code.kind())
}

/// Read-modify-write rounds before `register` gives up on a busy row
const WRITE_ATTEMPTS: usize = 3;

pub struct ErpPostingGateway {
    repos: Repositories,
    adapters: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    policy: RetryPolicy,
    stale_claim: Duration,
}

impl ErpPostingGateway {
    pub fn new(
        repos: Repositories,
        adapters: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        config: &Config,
    ) -> Self {
        Self {
            repos,
            adapters,
            vault,
            policy: RetryPolicy::from_config(config),
            stale_claim: config.stale_claim,
        }
    }

    /// Create or refresh the posting for `document` and make it READY_TO_POST
    ///
    /// Postings that are POSTED or currently claimed are returned untouched.
    /// A FAILED posting gets the new document but stays FAILED until requeued.
    /// The write only lands if the row still has the status it was read with;
    /// otherwise the row is read again.
    pub async fn register(&self, document: PostingDocument) -> AppResult<Posting> {
        for _ in 0..WRITE_ATTEMPTS {
            let existing = self
                .repos
                .postings
                .find_posting_by_key(&document.tenant_id, &document.idempotency_key)
                .await?;
            let now = now_millis();

            let Some(mut posting) = existing else {
                let mut posting = Posting::from_document(document.clone());
                posting.transition(PostingStatus::ReadyToPost, now)?;
                match self.repos.postings.insert_posting(&posting).await {
                    Ok(()) => {
                        tracing::debug!(
                            tenant_id = %posting.tenant_id,
                            posting_id = %posting.id,
                            posting_type = %posting.posting_type,
                            "Posting registered"
                        );
                        return Ok(posting);
                    }
                    // lost an insert race; refresh the winner's row instead
                    Err(RepoError::Duplicate(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            let read_status = posting.status;
            match read_status {
                PostingStatus::Posted | PostingStatus::PostingRequested => return Ok(posting),
                PostingStatus::Created | PostingStatus::PendingMapping => {
                    posting.attach_document(document.clone());
                    posting.last_error = None;
                    posting.transition(PostingStatus::ReadyToPost, now)?;
                }
                PostingStatus::ReadyToPost | PostingStatus::Failed => {
                    posting.attach_document(document.clone());
                    posting.updated_at = now;
                }
            }
            if self
                .repos
                .postings
                .update_posting_if_status(&posting, read_status)
                .await?
            {
                return Ok(posting);
            }
            tracing::debug!(
                posting_id = %posting.id,
                read_status = %read_status,
                "Posting changed during register, reading again"
            );
        }
        Err(AppError::with_message(
            ErrorCode::PostingInFlight,
            format!("posting {} kept changing during register", document.idempotency_key),
        )
        .with_detail("idempotency_key", document.idempotency_key.as_str()))
    }

    /// Record that a posting cannot be built yet because lines are unmapped
    pub async fn mark_pending_mapping(
        &self,
        tenant_id: &str,
        source: PostingSource,
        reference_id: Uuid,
        posting_type: PostingType,
        unmapped: &[String],
    ) -> AppResult<Posting> {
        let now = now_millis();
        let key = idempotency_key(tenant_id, &reference_id, posting_type);
        let reason = format!("unmapped items: {}", unmapped.join(", "));

        match self.repos.postings.find_posting_by_key(tenant_id, &key).await? {
            None => {
                let mut posting = Posting::new(tenant_id, source, reference_id, posting_type);
                posting.transition(PostingStatus::PendingMapping, now)?;
                posting.last_error = Some(reason);
                posting.last_error_code = Some(ErrorCode::MappingRequired.code());
                self.repos.postings.insert_posting(&posting).await?;
                Ok(posting)
            }
            Some(mut posting) => {
                let read_status = posting.status;
                match read_status {
                    PostingStatus::Created => posting.transition(PostingStatus::PendingMapping, now)?,
                    PostingStatus::PendingMapping => posting.updated_at = now,
                    _ => return Ok(posting),
                }
                posting.last_error = Some(reason);
                posting.last_error_code = Some(ErrorCode::MappingRequired.code());
                if self
                    .repos
                    .postings
                    .update_posting_if_status(&posting, read_status)
                    .await?
                {
                    return Ok(posting);
                }
                // a concurrent register moved it on; report the stored row
                self.find(tenant_id, posting.id).await
            }
        }
    }

    /// Send a READY_TO_POST posting to the ERP
    ///
    /// A POSTED posting is returned as is without calling the ERP. ERP failures
    /// are recorded on the returned posting (FAILED, with `next_retry_at` set
    /// only for retryable failures within budget), not returned as errors.
    pub async fn submit(&self, tenant_id: &str, posting_id: Uuid) -> AppResult<Posting> {
        let posting = self.find(tenant_id, posting_id).await?;
        match posting.status {
            PostingStatus::Posted => {
                tracing::debug!(posting_id = %posting_id, "Posting already POSTED, submit skipped");
                return Ok(posting);
            }
            PostingStatus::PostingRequested => return Err(in_flight(&posting)),
            PostingStatus::ReadyToPost => {}
            other => {
                return Err(AppError::with_message(
                    ErrorCode::PostingNotReady,
                    format!("posting {posting_id} is {other}"),
                )
                .with_detail("status", other.as_str()));
            }
        }
        if !posting.active {
            return Err(AppError::with_message(
                ErrorCode::PostingNotReady,
                format!("posting {posting_id} is deactivated"),
            ));
        }
        let erp = self.adapters.erp()?;

        let Some(claimed) = self
            .repos
            .postings
            .try_claim_posting(tenant_id, posting_id, now_millis())
            .await?
        else {
            let current = self.find(tenant_id, posting_id).await?;
            if current.is_posted() {
                return Ok(current);
            }
            return Err(in_flight(&current));
        };

        let outcome = self.call_erp(erp.as_ref(), &claimed).await;
        match outcome {
            Ok(result) => self.record_posted(claimed, result).await,
            Err(e) => self.record_failure(claimed, e).await,
        }
    }

    /// FAILED -> READY_TO_POST
    pub async fn requeue(&self, tenant_id: &str, posting_id: Uuid) -> AppResult<Posting> {
        let mut posting = self.find(tenant_id, posting_id).await?;
        if !posting.active {
            return Err(AppError::with_message(
                ErrorCode::PostingNotReady,
                format!("posting {posting_id} is deactivated"),
            ));
        }
        posting.transition(PostingStatus::ReadyToPost, now_millis())?;
        self.repos.postings.update_posting(&posting).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            posting_id = %posting_id,
            retry_count = posting.retry_count,
            "Posting requeued"
        );
        Ok(posting)
    }

    /// Requeue then submit; used for postings whose retry time has come
    pub async fn resubmit(&self, tenant_id: &str, posting_id: Uuid) -> AppResult<Posting> {
        self.requeue(tenant_id, posting_id).await?;
        self.submit(tenant_id, posting_id).await
    }

    /// Fail claims that never got an ERP answer so they can be retried under
    /// the same idempotency key
    pub async fn release_stale_claims(&self, tenant_id: &str, now: i64) -> AppResult<usize> {
        let claimed_before = now - self.stale_claim.as_millis() as i64;
        let stale = self
            .repos
            .postings
            .list_stale_claims(tenant_id, claimed_before)
            .await?;
        let count = stale.len();
        for posting in stale {
            let err = AppError::with_message(
                ErrorCode::TimeoutError,
                "claim expired without an ERP acknowledgement",
            );
            self.record_failure(posting, err).await?;
        }
        if count > 0 {
            tracing::warn!(tenant_id = %tenant_id, count, "Released stale posting claims");
        }
        Ok(count)
    }

    pub async fn postings_for(&self, tenant_id: &str, reference_id: Uuid) -> AppResult<Vec<Posting>> {
        Ok(self
            .repos
            .postings
            .list_postings_for_reference(tenant_id, reference_id)
            .await?)
    }

    async fn find(&self, tenant_id: &str, posting_id: Uuid) -> AppResult<Posting> {
        self.repos
            .postings
            .find_posting(tenant_id, posting_id)
            .await?
            .ok_or_else(|| posting_not_found(posting_id))
    }

    async fn call_erp(
        &self,
        erp: &dyn ErpAdapter,
        posting: &Posting,
    ) -> AppResult<PostingResult> {
        let document = posting.document.as_ref().ok_or_else(|| {
            AppError::with_message(
                ErrorCode::PostingNotReady,
                format!("posting {} has no document", posting.id),
            )
        })?;
        let credentials = self
            .vault
            .load(&posting.tenant_id, None, CredentialType::Erp, erp.credential_keys())
            .await?;
        Ok(erp
            .post_sales_document(&credentials, &posting.tenant_id, document)
            .await?)
    }

    async fn record_posted(&self, mut posting: Posting, result: PostingResult) -> AppResult<Posting> {
        posting.erp_reference = Some(result.erp_reference);
        posting.transition(PostingStatus::Posted, now_millis())?;
        self.repos.postings.update_posting(&posting).await?;

        audit_log!(
            posting.tenant_id.as_str(),
            "posting_posted",
            posting.idempotency_key.as_str(),
            posting.erp_reference.as_deref().unwrap_or_default()
        );
        tracing::info!(
            tenant_id = %posting.tenant_id,
            posting_id = %posting.id,
            posting_type = %posting.posting_type,
            total = %posting.total_amount,
            "Posting POSTED"
        );
        Ok(posting)
    }

    async fn record_failure(&self, mut posting: Posting, err: AppError) -> AppResult<Posting> {
        let now = now_millis();
        posting.transition(PostingStatus::Failed, now)?;
        posting.last_error = Some(err.message.clone());
        posting.last_error_code = Some(err.code.code());
        posting.next_retry_at = if err.is_retryable() {
            self.policy.next_retry_at(posting.retry_count as u32, now)
        } else {
            None
        };
        if err.is_retryable() && posting.next_retry_at.is_none() {
            posting.last_error = Some(format!("{} (retry budget exhausted)", err.message));
        }
        self.repos.postings.update_posting(&posting).await?;

        tracing::warn!(
            tenant_id = %posting.tenant_id,
            posting_id = %posting.id,
            code = %err.code,
            kind = err.kind().name(),
            retry_count = posting.retry_count,
            next_retry_at = ?posting.next_retry_at,
            error = %err.message,
            "Posting FAILED"
        );
        Ok(posting)
    }
}

fn posting_not_found(posting_id: Uuid) -> AppError {
    AppError::with_message(ErrorCode::PostingNotFound, format!("posting {posting_id} not found"))
}

fn in_flight(posting: &Posting) -> AppError {
    AppError::with_message(
        ErrorCode::PostingInFlight,
        format!("posting {} is already being submitted", posting.id),
    )
    .with_detail("idempotency_key", posting.idempotency_key.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterError;
    use crate::db::{PostingRepository, RepoResult};
    use crate::testkit::{TestEngine, sample_document};
    use async_trait::async_trait;

    /// Postings whose key lookup answers, then stalls before returning
    struct SlowKeyLookup {
        inner: Arc<dyn PostingRepository>,
        delay: Duration,
    }

    #[async_trait]
    impl PostingRepository for SlowKeyLookup {
        async fn insert_posting(&self, posting: &Posting) -> RepoResult<()> {
            self.inner.insert_posting(posting).await
        }
        async fn update_posting(&self, posting: &Posting) -> RepoResult<()> {
            self.inner.update_posting(posting).await
        }
        async fn update_posting_if_status(
            &self,
            posting: &Posting,
            expected: PostingStatus,
        ) -> RepoResult<bool> {
            self.inner.update_posting_if_status(posting, expected).await
        }
        async fn find_posting(&self, tenant_id: &str, posting_id: Uuid) -> RepoResult<Option<Posting>> {
            self.inner.find_posting(tenant_id, posting_id).await
        }
        async fn find_posting_by_key(
            &self,
            tenant_id: &str,
            idempotency_key: &str,
        ) -> RepoResult<Option<Posting>> {
            let found = self.inner.find_posting_by_key(tenant_id, idempotency_key).await;
            tokio::time::sleep(self.delay).await;
            found
        }
        async fn try_claim_posting(
            &self,
            tenant_id: &str,
            posting_id: Uuid,
            now: i64,
        ) -> RepoResult<Option<Posting>> {
            self.inner.try_claim_posting(tenant_id, posting_id, now).await
        }
        async fn list_postings_for_reference(
            &self,
            tenant_id: &str,
            reference_id: Uuid,
        ) -> RepoResult<Vec<Posting>> {
            self.inner.list_postings_for_reference(tenant_id, reference_id).await
        }
        async fn list_due_postings(&self, tenant_id: &str, now: i64, limit: i64) -> RepoResult<Vec<Posting>> {
            self.inner.list_due_postings(tenant_id, now, limit).await
        }
        async fn list_stale_claims(&self, tenant_id: &str, claimed_before: i64) -> RepoResult<Vec<Posting>> {
            self.inner.list_stale_claims(tenant_id, claimed_before).await
        }
    }

    #[tokio::test]
    async fn test_second_submit_after_success_makes_no_erp_call() {
        let t = TestEngine::new().await;
        let gateway = &t.engine.gateway;
        let posting = gateway.register(sample_document(&t.tenant_id)).await.unwrap();

        let first = gateway.submit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(first.status, PostingStatus::Posted);
        let reference = first.erp_reference.clone().unwrap();

        let second = gateway.submit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(second.erp_reference.as_deref(), Some(reference.as_str()));
        assert_eq!(t.erp.post_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_post_once() {
        let t = TestEngine::new().await;
        t.erp.set_post_delay(Duration::from_millis(50));
        let gateway = &t.engine.gateway;
        let posting = gateway.register(sample_document(&t.tenant_id)).await.unwrap();

        let (a, b) = tokio::join!(
            gateway.submit(&t.tenant_id, posting.id),
            gateway.submit(&t.tenant_id, posting.id),
        );
        assert_eq!(t.erp.post_calls(), 1);
        let err = a.as_ref().err().or(b.as_ref().err()).unwrap();
        assert_eq!(err.code, ErrorCode::PostingInFlight);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_rescheduled() {
        let t = TestEngine::new().await;
        t.erp.fail_post(AdapterError::Upstream {
            status: 503,
            message: "maintenance".into(),
        });
        let gateway = &t.engine.gateway;
        let posting = gateway.register(sample_document(&t.tenant_id)).await.unwrap();

        let failed = gateway.submit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(failed.status, PostingStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.next_retry_at.is_some());
        assert_eq!(last_failure_kind(&failed), Some(ErrorKind::Retryable));

        let posted = gateway.resubmit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(posted.status, PostingStatus::Posted);
        assert_eq!(t.erp.post_calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_rescheduled() {
        let t = TestEngine::new().await;
        t.erp.fail_post(AdapterError::Authentication("expired token".into()));
        let gateway = &t.engine.gateway;
        let posting = gateway.register(sample_document(&t.tenant_id)).await.unwrap();

        let failed = gateway.submit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(failed.status, PostingStatus::Failed);
        assert!(failed.next_retry_at.is_none());
        assert_eq!(last_failure_kind(&failed), Some(ErrorKind::Fatal));

        // FAILED must be requeued before it can be submitted again
        let err = gateway.submit(&t.tenant_id, posting.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PostingNotReady);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_keeps_posted() {
        let t = TestEngine::new().await;
        let gateway = &t.engine.gateway;
        let first = gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        let again = gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        assert_eq!(first.id, again.id);

        gateway.submit(&t.tenant_id, first.id).await.unwrap();
        let after = gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        assert_eq!(after.status, PostingStatus::Posted);
    }

    #[tokio::test]
    async fn test_pending_mapping_then_ready() {
        let t = TestEngine::new().await;
        let gateway = &t.engine.gateway;
        let document = sample_document(&t.tenant_id);

        let pending = gateway
            .mark_pending_mapping(
                &t.tenant_id,
                document.source,
                document.reference_id,
                document.posting_type,
                &["P9:S9".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(pending.status, PostingStatus::PendingMapping);
        assert!(pending.last_error.unwrap().contains("P9:S9"));

        let err = gateway.submit(&t.tenant_id, pending.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PostingNotReady);

        let ready = gateway.register(document).await.unwrap();
        assert_eq!(ready.id, pending.id);
        assert_eq!(ready.status, PostingStatus::ReadyToPost);
        assert_eq!(t.erp.post_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_released_for_retry() {
        let t = TestEngine::new().await;
        let gateway = &t.engine.gateway;
        let posting = gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        t.engine
            .repos
            .postings
            .try_claim_posting(&t.tenant_id, posting.id, 1_000)
            .await
            .unwrap()
            .unwrap();

        let released = gateway
            .release_stale_claims(&t.tenant_id, now_millis())
            .await
            .unwrap();
        assert_eq!(released, 1);
        let failed = t
            .engine
            .repos
            .postings
            .find_posting(&t.tenant_id, posting.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, PostingStatus::Failed);
        assert!(failed.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_submit() {
        let t = TestEngine::new().await;
        let posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        let err = t.engine.gateway.submit("other-tenant", posting.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PostingNotFound);
    }

    #[tokio::test]
    async fn test_register_during_submit_keeps_posted() {
        let t = TestEngine::new().await;
        let posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();

        let mut repos = t.engine.repos.clone();
        repos.postings = Arc::new(SlowKeyLookup {
            inner: repos.postings.clone(),
            delay: Duration::from_millis(80),
        });
        let gateway = ErpPostingGateway::new(
            repos,
            t.engine.adapters.clone(),
            t.engine.vault.clone(),
            &t.engine.config,
        );

        // register reads READY_TO_POST, then submit posts while it stalls
        let (registered, submitted) = tokio::join!(
            gateway.register(sample_document(&t.tenant_id)),
            gateway.submit(&t.tenant_id, posting.id),
        );
        let submitted = submitted.unwrap();
        assert_eq!(submitted.status, PostingStatus::Posted);
        assert_eq!(registered.unwrap().status, PostingStatus::Posted);

        let stored = t
            .engine
            .repos
            .postings
            .find_posting(&t.tenant_id, posting.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PostingStatus::Posted);
        assert_eq!(stored.erp_reference, submitted.erp_reference);

        let again = gateway.submit(&t.tenant_id, posting.id).await.unwrap();
        assert_eq!(again.status, PostingStatus::Posted);
        assert_eq!(t.erp.post_calls(), 1);
    }

    #[tokio::test]
    async fn test_guarded_update_skips_moved_row() {
        let t = TestEngine::new().await;
        let postings = &t.engine.repos.postings;
        let mut posting = t.engine.gateway.register(sample_document(&t.tenant_id)).await.unwrap();
        postings
            .try_claim_posting(&t.tenant_id, posting.id, now_millis())
            .await
            .unwrap()
            .unwrap();

        posting.updated_at = now_millis();
        let written = postings
            .update_posting_if_status(&posting, PostingStatus::ReadyToPost)
            .await
            .unwrap();
        assert!(!written);
        let stored = postings.find_posting(&t.tenant_id, posting.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostingStatus::PostingRequested);
    }
}
