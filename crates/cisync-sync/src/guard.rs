use std::collections::{HashMap, HashSet};

use cisync_adapters::{AdapterError, HrPlatform};
use cisync_core::{FileNameConvention, Subject};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::join::Candidate;

/// Pairs excluded because their employee's existing files could not be listed.
#[derive(Debug)]
pub struct LookupFailure {
    pub employee_id: String,
    pub error: ActionError,
    pub pairs: Vec<Candidate>,
}

#[derive(Debug, Default)]
pub struct GuardOutput {
    pub fresh: Vec<Candidate>,
    pub already_present: Vec<Candidate>,
    pub failed: Vec<LookupFailure>,
}

/// Drops pairs whose artifact is already at the destination.
///
/// Applicants count as done when the status captured at resolve time equals the
/// processed sentinel; the status is not re-fetched. Employees count as done when the
/// computed file name is already in the designated category. Files are listed once per
/// employee, and a name repeated within the batch is kept only the first time.
pub struct DuplicateGuard<'a> {
    platform: &'a dyn HrPlatform,
    file_names: &'a FileNameConvention,
    category_id: u64,
    processed_status_id: u64,
    lookup_concurrency: usize,
}

impl<'a> DuplicateGuard<'a> {
    pub fn new(platform: &'a dyn HrPlatform, config: &'a EngineConfig) -> Self {
        Self {
            platform,
            file_names: &config.file_names,
            category_id: config.file_category_id,
            processed_status_id: config.processed_status_id,
            lookup_concurrency: config.apply_concurrency.max(1),
        }
    }

    pub async fn filter_new(&self, pairs: Vec<Candidate>) -> GuardOutput {
        let mut output = GuardOutput::default();
        let mut by_employee: Vec<(String, Vec<Candidate>)> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();

        for pair in pairs {
            match &pair.subject {
                Subject::Applicant { status_id, .. } => {
                    if *status_id == Some(self.processed_status_id) {
                        output.already_present.push(pair);
                    } else {
                        output.fresh.push(pair);
                    }
                }
                Subject::Employee { employee_id, .. } => {
                    let slot = *slots.entry(employee_id.clone()).or_insert_with(|| {
                        by_employee.push((employee_id.clone(), Vec::new()));
                        by_employee.len() - 1
                    });
                    by_employee[slot].1.push(pair);
                }
            }
        }

        let category_id = self.category_id;
        let platform = self.platform;
        let lookups: Vec<(String, Vec<Candidate>, Result<Vec<String>, AdapterError>)> =
            stream::iter(by_employee)
                .map(move |(employee_id, pairs)| async move {
                    let existing = platform.list_employee_files(&employee_id, category_id).await;
                    (employee_id, pairs, existing)
                })
                .buffered(self.lookup_concurrency)
                .collect()
                .await;

        for (employee_id, pairs, existing) in lookups {
            match existing {
                Ok(names) => {
                    let mut taken: HashSet<String> = names.into_iter().collect();
                    for pair in pairs {
                        let file_name = self.file_names.file_name(&pair.survey);
                        if taken.insert(file_name.clone()) {
                            output.fresh.push(pair);
                        } else {
                            debug!(%employee_id, %file_name, "file already present");
                            output.already_present.push(pair);
                        }
                    }
                }
                Err(source) => {
                    warn!(
                        %employee_id,
                        error = %source,
                        excluded = pairs.len(),
                        "existing file lookup failed"
                    );
                    output.failed.push(LookupFailure {
                        error: ActionError::FileLookup {
                            employee_id: employee_id.clone(),
                            source,
                        },
                        employee_id,
                        pairs,
                    });
                }
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cisync_adapters::memory::InMemoryHrPlatform;
    use cisync_core::SurveyRecord;

    fn survey(first: &str, last: &str, date: &str) -> SurveyRecord {
        SurveyRecord {
            email: "john@example.com".into(),
            first_name: first.into(),
            last_name: last.into(),
            trait_pattern: "Maverick".into(),
            report_link: format!("https://reports.example.com/{date}.pdf"),
            survey_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            survey_time: None,
        }
    }

    fn employee_pair(id: &str, date: &str) -> Candidate {
        Candidate {
            subject: Subject::Employee {
                employee_id: id.into(),
                work_email: Some("john@example.com".into()),
            },
            survey: survey("John", "Doe", date),
        }
    }

    fn applicant_pair(id: &str, status_id: Option<u64>) -> Candidate {
        Candidate {
            subject: Subject::Applicant {
                application_id: id.into(),
                email: Some("john@example.com".into()),
                status_id,
            },
            survey: survey("John", "Doe", "2024-01-01"),
        }
    }

    #[tokio::test]
    async fn existing_file_name_drops_only_that_survey() {
        let platform =
            InMemoryHrPlatform::new().with_employee_file("E1", 308, "CI_John_Doe_2024-01-01.pdf");
        let config = EngineConfig::default();
        let guard = DuplicateGuard::new(&platform, &config);

        let output = guard
            .filter_new(vec![employee_pair("E1", "2024-01-01"), employee_pair("E1", "2024-02-01")])
            .await;

        assert_eq!(output.already_present.len(), 1);
        assert_eq!(output.already_present[0].survey.survey_date.to_string(), "2024-01-01");
        assert_eq!(output.fresh.len(), 1);
        assert_eq!(output.fresh[0].survey.survey_date.to_string(), "2024-02-01");
        assert_eq!(platform.file_lookups(), vec!["E1".to_string()]);
    }

    #[tokio::test]
    async fn files_outside_the_category_do_not_count() {
        let platform =
            InMemoryHrPlatform::new().with_employee_file("E1", 12, "CI_John_Doe_2024-01-01.pdf");
        let config = EngineConfig::default();
        let output = DuplicateGuard::new(&platform, &config)
            .filter_new(vec![employee_pair("E1", "2024-01-01")])
            .await;
        assert_eq!(output.fresh.len(), 1);
    }

    #[tokio::test]
    async fn same_name_twice_in_one_batch_is_kept_once() {
        let platform = InMemoryHrPlatform::new();
        let config = EngineConfig::default();
        let output = DuplicateGuard::new(&platform, &config)
            .filter_new(vec![employee_pair("E1", "2024-01-01"), employee_pair("E1", "2024-01-01")])
            .await;
        assert_eq!(output.fresh.len(), 1);
        assert_eq!(output.already_present.len(), 1);
    }

    #[tokio::test]
    async fn lookup_failure_excludes_only_that_employee() {
        let platform = InMemoryHrPlatform::new();
        platform.fail_file_lookup_for("E1");
        let config = EngineConfig::default();

        let output = DuplicateGuard::new(&platform, &config)
            .filter_new(vec![
                employee_pair("E1", "2024-01-01"),
                employee_pair("E2", "2024-01-01"),
                employee_pair("E1", "2024-02-01"),
            ])
            .await;

        assert_eq!(output.failed.len(), 1);
        assert_eq!(output.failed[0].employee_id, "E1");
        assert_eq!(output.failed[0].pairs.len(), 2);
        assert!(matches!(output.failed[0].error, ActionError::FileLookup { .. }));
        assert_eq!(output.fresh.len(), 1);
        assert_eq!(output.fresh[0].subject.id(), "E2");
    }

    #[tokio::test]
    async fn applicants_use_the_captured_status() {
        let platform = InMemoryHrPlatform::new();
        let config = EngineConfig::default();
        let output = DuplicateGuard::new(&platform, &config)
            .filter_new(vec![
                applicant_pair("1", Some(20)),
                applicant_pair("2", Some(1)),
                applicant_pair("3", None),
            ])
            .await;
        let fresh: Vec<&str> = output.fresh.iter().map(|c| c.subject.id()).collect();
        assert_eq!(fresh, vec!["2", "3"]);
        assert_eq!(output.already_present.len(), 1);
        assert!(platform.file_lookups().is_empty());
    }
}
