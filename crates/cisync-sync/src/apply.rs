use std::collections::HashMap;

use cisync_adapters::{FileUpload, HrPlatform, SurveyProvider};
use cisync_core::{Domain, Subject, SurveyRecord, SyncOutcome};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::join::Candidate;

pub const REPORT_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Applied {
    Commented {
        application_id: String,
        status_id: u64,
    },
    Uploaded {
        employee_id: String,
        file_name: String,
        bytes: usize,
    },
}

/// Text block posted on an applicant when their survey is attached.
pub fn comment_text(survey: &SurveyRecord) -> String {
    format!(
        "Culture Index survey ({})\nTrait pattern: {}\nReport: {}",
        survey.survey_date.format("%Y-%m-%d"),
        survey.trait_pattern,
        survey.report_link
    )
}

/// Performs the destination-side writes for surviving pairs.
pub struct ActionApplier<'a> {
    surveys: &'a dyn SurveyProvider,
    platform: &'a dyn HrPlatform,
    config: &'a EngineConfig,
}

impl<'a> ActionApplier<'a> {
    pub fn new(
        surveys: &'a dyn SurveyProvider,
        platform: &'a dyn HrPlatform,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            surveys,
            platform,
            config,
        }
    }

    /// Applies one pair. Applicants get a comment, then the status transition (only
    /// after the comment landed). Employees get the report downloaded and uploaded under
    /// its deterministic name. Calling this twice for one pair writes twice.
    pub async fn apply(&self, pair: &Candidate) -> Result<Applied, ActionError> {
        match &pair.subject {
            Subject::Applicant { application_id, .. } => {
                let status_id = self.config.processed_status_id;
                self.platform
                    .add_applicant_comment(application_id, &comment_text(&pair.survey))
                    .await
                    .map_err(ActionError::Comment)?;
                self.platform
                    .change_applicant_status(application_id, status_id)
                    .await
                    .map_err(ActionError::StatusChange)?;
                Ok(Applied::Commented {
                    application_id: application_id.clone(),
                    status_id,
                })
            }
            Subject::Employee { employee_id, .. } => {
                let link = &pair.survey.report_link;
                let bytes = self
                    .surveys
                    .download_report(link)
                    .await
                    .map_err(|source| ActionError::Download {
                        link: link.clone(),
                        source,
                    })?;
                let file_name = self.config.file_names.file_name(&pair.survey);
                let size = bytes.len();
                let upload = FileUpload {
                    category_id: self.config.file_category_id,
                    file_name: file_name.clone(),
                    content_type: REPORT_CONTENT_TYPE.to_string(),
                    share: true,
                    bytes,
                };
                self.platform
                    .upload_employee_file(employee_id, upload)
                    .await
                    .map_err(|source| ActionError::Upload {
                        file_name: file_name.clone(),
                        source,
                    })?;
                Ok(Applied::Uploaded {
                    employee_id: employee_id.clone(),
                    file_name,
                    bytes: size,
                })
            }
        }
    }

    /// Applies every pair, recording each result in `outcome`.
    ///
    /// Subjects run concurrently up to `apply_concurrency`; the pairs of one subject run
    /// in order, one at a time. `cancel` is checked before each pair, so a pair that has
    /// started always finishes.
    pub async fn apply_all(
        &self,
        pairs: Vec<Candidate>,
        outcome: &Mutex<SyncOutcome>,
        cancel: &CancellationToken,
    ) {
        let groups = group_by_subject(pairs);
        let limit = self.config.apply_concurrency.max(1);

        stream::iter(groups)
            .for_each_concurrent(limit, |group| async move {
                for pair in group {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let subject_id = pair.subject.id();
                    match self.apply(&pair).await {
                        Ok(applied) => {
                            info!(domain = %pair.subject.domain(), subject_id, ?applied, "applied");
                            outcome.lock().await.applied += 1;
                        }
                        Err(err) => {
                            warn!(
                                domain = %pair.subject.domain(),
                                subject_id,
                                error = %err,
                                "action failed"
                            );
                            outcome
                                .lock()
                                .await
                                .record_failure(&pair.subject, &pair.survey, &err);
                        }
                    }
                }
            })
            .await;
    }
}

fn group_by_subject(pairs: Vec<Candidate>) -> Vec<Vec<Candidate>> {
    let mut groups: Vec<Vec<Candidate>> = Vec::new();
    let mut slots: HashMap<(Domain, String), usize> = HashMap::new();
    for pair in pairs {
        let key = (pair.subject.domain(), pair.subject.id().to_string());
        match slots.get(&key) {
            Some(&slot) => groups[slot].push(pair),
            None => {
                slots.insert(key, groups.len());
                groups.push(vec![pair]);
            }
        }
    }
    groups
}
