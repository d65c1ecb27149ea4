//! Core domain model for survey-to-HR reconciliation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cisync-core";

/// Join key normalization: trimmed, lowercased, `None` when blank.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// One completed assessment result as delivered by the survey provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub trait_pattern: String,
    pub report_link: String,
    pub survey_date: NaiveDate,
    /// Time of day when the provider reports one; tells same-day retakes apart.
    #[serde(default)]
    pub survey_time: Option<NaiveTime>,
}

/// Normalized email -> surveys, in provider pagination order.
#[derive(Debug, Clone, Default)]
pub struct SurveyIndex {
    by_email: HashMap<String, Vec<SurveyRecord>>,
    records: usize,
}

impl SurveyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a record under its normalized email. Returns `false` (and drops the
    /// record) when the email is blank.
    pub fn insert(&mut self, mut record: SurveyRecord) -> bool {
        let Some(key) = normalize_email(&record.email) else {
            return false;
        };
        record.email = key.clone();
        self.by_email.entry(key).or_default().push(record);
        self.records += 1;
        true
    }

    /// Surveys for `email` (normalized before lookup). Unknown emails yield an empty slice.
    pub fn surveys_for(&self, email: &str) -> &[SurveyRecord] {
        normalize_email(email)
            .and_then(|key| self.by_email.get(&key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn email_count(&self) -> usize {
        self.by_email.len()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

impl FromIterator<SurveyRecord> for SurveyIndex {
    fn from_iter<I: IntoIterator<Item = SurveyRecord>>(iter: I) -> Self {
        let mut index = Self::new();
        for record in iter {
            index.insert(record);
        }
        index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Applicants,
    Employees,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Applicants, Domain::Employees];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Applicants => "applicants",
            Domain::Employees => "employees",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDomain(pub String);

impl fmt::Display for UnknownDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown domain {:?} (expected applicants or employees)", self.0)
    }
}

impl std::error::Error for UnknownDomain {}

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "applicants" | "applicant" => Ok(Domain::Applicants),
            "employees" | "employee" => Ok(Domain::Employees),
            other => Err(UnknownDomain(other.to_string())),
        }
    }
}

/// A destination record that may receive survey artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Subject {
    Applicant {
        application_id: String,
        email: Option<String>,
        status_id: Option<u64>,
    },
    Employee {
        employee_id: String,
        work_email: Option<String>,
    },
}

impl Subject {
    pub fn id(&self) -> &str {
        match self {
            Subject::Applicant { application_id, .. } => application_id,
            Subject::Employee { employee_id, .. } => employee_id,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Subject::Applicant { email, .. } => email.as_deref(),
            Subject::Employee { work_email, .. } => work_email.as_deref(),
        }
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email().and_then(normalize_email)
    }

    pub fn domain(&self) -> Domain {
        match self {
            Subject::Applicant { .. } => Domain::Applicants,
            Subject::Employee { .. } => Domain::Employees,
        }
    }

    /// Pipeline status captured at resolve time; always `None` for employees.
    pub fn status_id(&self) -> Option<u64> {
        match self {
            Subject::Applicant { status_id, .. } => *status_id,
            Subject::Employee { .. } => None,
        }
    }
}

/// Deterministic attachment naming: `<prefix>_<first>_<last>_<YYYY-MM-DD>.<ext>`.
///
/// A survey with a time of day other than midnight gets `<YYYY-MM-DD>T<HH-MM-SS>` in
/// place of the date, so two surveys taken the same day never share a name. Name parts
/// are trimmed, inner whitespace collapses to `_` and path separators become `-`, so the
/// same survey always maps to the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameConvention {
    pub prefix: String,
    pub extension: String,
}

impl Default for FileNameConvention {
    fn default() -> Self {
        Self {
            prefix: "CI".to_string(),
            extension: "pdf".to_string(),
        }
    }
}

impl FileNameConvention {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn file_name(&self, survey: &SurveyRecord) -> String {
        let ext = self.extension.trim_start_matches('.').trim();
        let stamp = match survey.survey_time {
            Some(time) if time != NaiveTime::MIN => format!(
                "{}T{}",
                survey.survey_date.format("%Y-%m-%d"),
                time.format("%H-%M-%S")
            ),
            _ => survey.survey_date.format("%Y-%m-%d").to_string(),
        };
        format!(
            "{}_{}_{}_{}.{}",
            sanitize_name_part(&self.prefix),
            sanitize_name_part(&survey.first_name),
            sanitize_name_part(&survey.last_name),
            stamp,
            if ext.is_empty() { "pdf" } else { ext }
        )
    }
}

fn sanitize_name_part(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace(['/', '\\'], "-")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAction {
    pub domain: Domain,
    pub subject_id: String,
    pub survey_date: NaiveDate,
    pub error: String,
}

/// A domain whose subject collection failed, so none of its pairs were considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAbort {
    pub domain: Domain,
    pub error: String,
}

/// Per-run summary. Counts are over (subject, survey) pairs except `skipped_no_email`
/// and `subjects_without_surveys`, which count subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub matched: usize,
    pub skipped_no_email: usize,
    pub subjects_without_surveys: usize,
    pub skipped_already_present: usize,
    pub applied: usize,
    pub failed: Vec<FailedAction>,
    pub aborted: Vec<DomainAbort>,
    pub cancelled: bool,
}

impl SyncOutcome {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            matched: 0,
            skipped_no_email: 0,
            subjects_without_surveys: 0,
            skipped_already_present: 0,
            applied: 0,
            failed: Vec::new(),
            aborted: Vec::new(),
            cancelled: false,
        }
    }

    pub fn record_failure(
        &mut self,
        subject: &Subject,
        survey: &SurveyRecord,
        error: impl fmt::Display,
    ) {
        self.failed.push(FailedAction {
            domain: subject.domain(),
            subject_id: subject.id().to_string(),
            survey_date: survey.survey_date,
            error: error.to_string(),
        });
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Pairs that never reached a verdict because the run was cancelled.
    pub fn unattempted(&self) -> usize {
        self.matched
            .saturating_sub(self.skipped_already_present + self.applied + self.failed.len())
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
    }
}
