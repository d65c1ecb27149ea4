//! Survey-to-HR reconciliation engine.
//!
//! One run builds the survey index once, then for each domain resolves subjects, joins
//! them to surveys by email, drops pairs whose artifact is already present, and applies
//! the rest. Every run is a full reconciliation against remote state; nothing is kept
//! between runs.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use cisync_adapters::{BambooHrClient, CultureIndexClient, HrPlatform, SurveyProvider};
use cisync_core::{Domain, DomainAbort, FailedAction, Subject, SurveyIndex, SyncOutcome};
use cisync_http::{HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod apply;
pub mod collector;
pub mod config;
pub mod error;
pub mod guard;
pub mod index;
pub mod join;
pub mod resolve;

pub use apply::{comment_text, ActionApplier, Applied};
pub use collector::collect_pages;
pub use config::{EngineConfig, SyncConfig};
pub use error::{ActionError, SyncError};
pub use guard::{DuplicateGuard, GuardOutput, LookupFailure};
pub use index::build_survey_index;
pub use join::{join, Candidate, JoinOutput};
pub use resolve::resolve_subjects;

pub const CRATE_NAME: &str = "cisync-sync";

/// What a run would do for one domain, computed without writing anything.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub domain: Domain,
    pub subjects: usize,
    pub skipped_no_email: usize,
    pub subjects_without_surveys: usize,
    pub matched: usize,
    pub already_present: usize,
    pub lookup_failures: Vec<FailedAction>,
    pub actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Comment {
        application_id: String,
        survey_date: NaiveDate,
        report_link: String,
        status_id: u64,
    },
    Upload {
        employee_id: String,
        survey_date: NaiveDate,
        report_link: String,
        file_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDomainFailure {
    Record,
    Propagate,
}

struct StagedDomain {
    subjects: usize,
    skipped_no_email: usize,
    without_surveys: usize,
    matched: usize,
    guard: GuardOutput,
}

pub struct SyncService {
    config: EngineConfig,
    surveys: Arc<dyn SurveyProvider>,
    platform: Arc<dyn HrPlatform>,
    in_flight: Mutex<()>,
    current_run: StdMutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SyncService {
    pub fn new(
        config: EngineConfig,
        surveys: Arc<dyn SurveyProvider>,
        platform: Arc<dyn HrPlatform>,
    ) -> Self {
        Self {
            config,
            surveys,
            platform,
            in_flight: Mutex::new(()),
            current_run: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs inherit cancellation from `shutdown`; once it fires, the current run stops
    /// between pairs and later runs stop before their first pair.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Full cycle over both domains. Fails only when the survey index cannot be built;
    /// a domain whose subjects cannot be collected is recorded in `aborted`.
    pub async fn run_cycle(&self) -> Result<SyncOutcome, SyncError> {
        self.run(&Domain::ALL, OnDomainFailure::Record).await
    }

    /// Single-domain run. Collection failures for the domain are returned as errors.
    pub async fn run_domain(&self, domain: Domain) -> Result<SyncOutcome, SyncError> {
        self.run(&[domain], OnDomainFailure::Propagate).await
    }

    /// Cancels the run in flight, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self.current_run_slot().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Full cycle on its own task. The run keeps going if the handle is dropped, so a
    /// caller that goes away never leaves a pair half applied.
    pub fn spawn_cycle(self: &Arc<Self>) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_cycle().await })
    }

    /// Single-domain run on its own task; see [`SyncService::spawn_cycle`].
    pub fn spawn_domain(
        self: &Arc<Self>,
        domain: Domain,
    ) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_domain(domain).await })
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        let _idle = self.in_flight.lock().await;
    }

    /// Dry run: collect, join and guard one domain, and list the writes a run would make.
    pub async fn plan_domain(&self, domain: Domain) -> Result<SyncPlan, SyncError> {
        let index = build_survey_index(self.surveys.as_ref(), self.config.max_pages).await?;
        let staged = self.stage_domain(domain, &index).await?;

        let mut lookup_failures = Vec::new();
        for failure in &staged.guard.failed {
            for pair in &failure.pairs {
                lookup_failures.push(FailedAction {
                    domain,
                    subject_id: pair.subject.id().to_string(),
                    survey_date: pair.survey.survey_date,
                    error: failure.error.to_string(),
                });
            }
        }

        let actions = staged
            .guard
            .fresh
            .iter()
            .map(|pair| self.planned_action(pair))
            .collect();

        Ok(SyncPlan {
            domain,
            subjects: staged.subjects,
            skipped_no_email: staged.skipped_no_email,
            subjects_without_surveys: staged.without_surveys,
            matched: staged.matched,
            already_present: staged.guard.already_present.len(),
            lookup_failures,
            actions,
        })
    }

    fn planned_action(&self, pair: &Candidate) -> PlannedAction {
        match &pair.subject {
            Subject::Applicant { application_id, .. } => PlannedAction::Comment {
                application_id: application_id.clone(),
                survey_date: pair.survey.survey_date,
                report_link: pair.survey.report_link.clone(),
                status_id: self.config.processed_status_id,
            },
            Subject::Employee { employee_id, .. } => PlannedAction::Upload {
                employee_id: employee_id.clone(),
                survey_date: pair.survey.survey_date,
                report_link: pair.survey.report_link.clone(),
                file_name: self.config.file_names.file_name(&pair.survey),
            },
        }
    }

    fn current_run_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(
        &self,
        domains: &[Domain],
        on_failure: OnDomainFailure,
    ) -> Result<SyncOutcome, SyncError> {
        let _flight = self
            .in_flight
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let run_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let _slot = RunSlot::claim(self, cancel.clone());

        self.run_locked(run_id, domains, on_failure, &cancel)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        domains: &[Domain],
        on_failure: OnDomainFailure,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        let outcome = Mutex::new(SyncOutcome::new(run_id, Utc::now()));
        info!(domains = ?domains, "sync run started");

        let index = match build_survey_index(self.surveys.as_ref(), self.config.max_pages).await {
            Ok(index) => index,
            Err(err) => {
                error!(error = %err, "survey index failed; run aborted");
                return Err(err);
            }
        };

        for &domain in domains {
            if cancel.is_cancelled() {
                warn!(%domain, "run cancelled; domain not started");
                break;
            }
            if let Err(err) = self.sync_domain(domain, &index, &outcome, cancel).await {
                error!(%domain, error = %err, "domain aborted");
                match on_failure {
                    OnDomainFailure::Propagate => return Err(err),
                    OnDomainFailure::Record => outcome.lock().await.aborted.push(DomainAbort {
                        domain,
                        error: err.to_string(),
                    }),
                }
            }
        }

        let mut outcome = outcome.into_inner();
        outcome.cancelled = cancel.is_cancelled();
        outcome.finish(Utc::now());
        info!(
            matched = outcome.matched,
            applied = outcome.applied,
            failed = outcome.failed_count(),
            skipped_already_present = outcome.skipped_already_present,
            skipped_no_email = outcome.skipped_no_email,
            aborted = outcome.aborted.len(),
            cancelled = outcome.cancelled,
            unattempted = outcome.unattempted(),
            "sync run finished"
        );
        Ok(outcome)
    }

    async fn stage_domain(
        &self,
        domain: Domain,
        index: &SurveyIndex,
    ) -> Result<StagedDomain, SyncError> {
        let prefilter = self
            .config
            .prefilter_applicants
            .then_some(self.config.processed_status_id);
        let subjects =
            resolve_subjects(self.platform.as_ref(), domain, self.config.max_pages, prefilter)
                .await?;

        let joined = join(&subjects, index);
        let matched = joined.pairs.len();
        let guard = DuplicateGuard::new(self.platform.as_ref(), &self.config)
            .filter_new(joined.pairs)
            .await;

        info!(
            %domain,
            subjects = subjects.len(),
            matched,
            fresh = guard.fresh.len(),
            already_present = guard.already_present.len(),
            lookup_failures = guard.failed.len(),
            "domain staged"
        );

        Ok(StagedDomain {
            subjects: subjects.len(),
            skipped_no_email: joined.skipped_no_email,
            without_surveys: joined.without_surveys,
            matched,
            guard,
        })
    }

    async fn sync_domain(
        &self,
        domain: Domain,
        index: &SurveyIndex,
        outcome: &Mutex<SyncOutcome>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let staged = self.stage_domain(domain, index).await?;
        {
            let mut outcome = outcome.lock().await;
            outcome.matched += staged.matched;
            outcome.skipped_no_email += staged.skipped_no_email;
            outcome.subjects_without_surveys += staged.without_surveys;
            outcome.skipped_already_present += staged.guard.already_present.len();
            for failure in &staged.guard.failed {
                for pair in &failure.pairs {
                    outcome.record_failure(&pair.subject, &pair.survey, &failure.error);
                }
            }
        }

        ActionApplier::new(self.surveys.as_ref(), self.platform.as_ref(), &self.config)
            .apply_all(staged.guard.fresh, outcome, cancel)
            .await;
        Ok(())
    }
}

/// Publishes the run's token to [`SyncService::cancel`] and withdraws it when the run
/// ends, including when the run future is dropped.
struct RunSlot<'a> {
    service: &'a SyncService,
}

impl<'a> RunSlot<'a> {
    fn claim(service: &'a SyncService, token: CancellationToken) -> Self {
        *service.current_run_slot() = Some(token);
        Self { service }
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        *self.service.current_run_slot() = None;
    }
}

/// Wires the real Culture Index and BambooHR clients over one shared fetcher.
pub fn service_from_config(config: &SyncConfig) -> Result<SyncService> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        per_remote_concurrency: config.engine.apply_concurrency.max(1),
        rate_limit: config.rate_limit(),
        ..Default::default()
    })?);
    let surveys = CultureIndexClient::new(
        http.clone(),
        &config.surveys_url,
        config.culture_index_api_key.clone(),
    )
    .context("configuring Culture Index client")?;
    let platform = BambooHrClient::new(
        http,
        &config.bamboohr_base_url,
        &config.bamboohr_domain,
        config.bamboohr_api_key.clone(),
    )
    .context("configuring BambooHR client")?;
    Ok(SyncService::new(
        config.engine.clone(),
        Arc::new(surveys),
        Arc::new(platform),
    ))
}

/// Cron job running a full cycle. A tick that lands while a run is in flight is skipped.
pub async fn build_scheduler(service: Arc<SyncService>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            match service.spawn_cycle().await {
                Ok(Ok(outcome)) => info!(
                    run_id = %outcome.run_id,
                    applied = outcome.applied,
                    failed = outcome.failed_count(),
                    "scheduled sync finished"
                ),
                Ok(Err(SyncError::AlreadyRunning)) => {
                    warn!("scheduled sync skipped; a run is already in flight")
                }
                Ok(Err(err)) => error!(error = %err, "scheduled sync failed"),
                Err(err) => error!(error = %err, "scheduled sync task failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(service, &config.sync_cron).await.map(Some)
}

pub async fn run_sync_once_from_env(domain: Option<Domain>) -> Result<SyncOutcome> {
    let config = SyncConfig::from_env()?;
    let service = service_from_config(&config)?;
    let outcome = match domain {
        Some(domain) => service.run_domain(domain).await?,
        None => service.run_cycle().await?,
    };
    Ok(outcome)
}
