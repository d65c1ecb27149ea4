//! Remote API adapters: the survey provider (Culture Index) and the HR platform (BambooHR).
//!
//! The sync engine only sees the [`SurveyProvider`] and [`HrPlatform`] traits. Both
//! listing styles (`nextLink` absolute URLs and `nextPageUrl` possibly-relative paths)
//! are normalized into [`Page::next`] through [`PageLocator`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use cisync_core::{SurveyRecord, Subject};
use cisync_http::{multipart, Credentials, FetchError, HttpFetcher, Url};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub const CRATE_NAME: &str = "cisync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("invalid page locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("{0}")]
    Message(String),
}

/// One page of a remote listing, already mapped to domain values.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Url>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// A listing response that may point at a further page.
pub trait PageLocator {
    fn next_locator(&self) -> Option<&str>;

    /// Absolute URL of the next page, or `None` when the listing is exhausted.
    fn next_url(&self, current: &Url) -> Result<Option<Url>, AdapterError> {
        resolve_locator(current, self.next_locator())
    }
}

/// Absolute locators are taken as-is; relative ones resolve against `current`.
/// Blank locators count as absent.
pub fn resolve_locator(current: &Url, locator: Option<&str>) -> Result<Option<Url>, AdapterError> {
    let Some(raw) = locator.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    current
        .join(raw)
        .map(Some)
        .map_err(|err| AdapterError::InvalidLocator {
            locator: raw.to_string(),
            reason: err.to_string(),
        })
}

#[async_trait]
pub trait SurveyProvider: Send + Sync {
    fn listing_url(&self) -> Url;

    async fn fetch_survey_page(&self, url: &Url) -> Result<Page<SurveyRecord>, AdapterError>;

    async fn download_report(&self, report_link: &str) -> Result<Vec<u8>, AdapterError>;
}

#[async_trait]
pub trait HrPlatform: Send + Sync {
    fn applications_url(&self) -> Url;

    async fn fetch_application_page(&self, url: &Url) -> Result<Page<Subject>, AdapterError>;

    fn employee_directory_url(&self) -> Url;

    async fn fetch_employee_page(&self, url: &Url) -> Result<Page<Subject>, AdapterError>;

    /// Names of the files an employee already has in `category_id`.
    async fn list_employee_files(
        &self,
        employee_id: &str,
        category_id: u64,
    ) -> Result<Vec<String>, AdapterError>;

    async fn add_applicant_comment(
        &self,
        application_id: &str,
        comment: &str,
    ) -> Result<(), AdapterError>;

    async fn change_applicant_status(
        &self,
        application_id: &str,
        status_id: u64,
    ) -> Result<(), AdapterError>;

    async fn upload_employee_file(
        &self,
        employee_id: &str,
        upload: FileUpload,
    ) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub category_id: u64,
    pub file_name: String,
    pub content_type: String,
    pub share: bool,
    pub bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyListing {
    #[serde(default)]
    pub value: Vec<SurveyRow>,
    #[serde(default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyRow {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub trait_pattern: Option<String>,
    #[serde(default)]
    pub survey_report_link: Option<String>,
    #[serde(default)]
    pub survey_date: Option<String>,
}

impl PageLocator for SurveyListing {
    fn next_locator(&self) -> Option<&str> {
        self.next_link.as_deref()
    }
}

impl SurveyRow {
    /// Rows without an email, or without a readable survey date, cannot be matched or
    /// named deterministically and are dropped.
    pub fn into_record(self) -> Option<SurveyRecord> {
        let email = self
            .email
            .as_deref()
            .and_then(cisync_core::normalize_email)?;
        let stamp = self.survey_date.as_deref().and_then(parse_survey_date);
        let (survey_date, survey_time) = match stamp {
            Some(stamp) => stamp,
            None => {
                warn!(
                    %email,
                    raw = ?self.survey_date,
                    "dropping survey with unreadable surveyDate"
                );
                return None;
            }
        };
        Some(SurveyRecord {
            email,
            first_name: self.first_name.unwrap_or_default().trim().to_string(),
            last_name: self.last_name.unwrap_or_default().trim().to_string(),
            trait_pattern: self.trait_pattern.unwrap_or_default().trim().to_string(),
            report_link: self.survey_report_link.unwrap_or_default().trim().to_string(),
            survey_date,
            survey_time,
        })
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by `T` or a space and `HH:MM[:SS]`.
/// Fractional seconds and offsets after the clock are ignored.
pub fn parse_survey_date(raw: &str) -> Option<(NaiveDate, Option<NaiveTime>)> {
    let raw = raw.trim();
    let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
    let time = raw
        .get(10..)
        .map(|rest| rest.trim_start_matches(['T', 't', ' ']))
        .map(|rest| {
            let end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == ':'))
                .unwrap_or(rest.len());
            &rest[..end]
        })
        .and_then(|clock| {
            NaiveTime::parse_from_str(clock, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(clock, "%H:%M"))
                .ok()
        });
    Some((date, time))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationListing {
    #[serde(default)]
    pub applications: Vec<ApplicationRow>,
    #[serde(default)]
    pub next_page_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub status: Option<StatusRef>,
    #[serde(default)]
    pub applicant: Option<ApplicantRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRef {
    #[serde(default, deserialize_with = "opt_u64")]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicantRef {
    #[serde(default)]
    pub email: Option<String>,
}

impl PageLocator for ApplicationListing {
    fn next_locator(&self) -> Option<&str> {
        self.next_page_url.as_deref()
    }
}

impl From<ApplicationRow> for Subject {
    fn from(row: ApplicationRow) -> Self {
        Subject::Applicant {
            application_id: row.id,
            email: row.applicant.and_then(|a| a.email),
            status_id: row.status.and_then(|s| s.id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmployeeDirectory {
    #[serde(default)]
    pub employees: Vec<EmployeeRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub work_email: Option<String>,
}

/// The directory is served as a single page.
impl PageLocator for EmployeeDirectory {
    fn next_locator(&self) -> Option<&str> {
        None
    }
}

impl From<EmployeeRow> for Subject {
    fn from(row: EmployeeRow) -> Self {
        Subject::Employee {
            employee_id: row.id,
            work_email: row.work_email,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmployeeFiles {
    #[serde(default)]
    pub categories: Vec<FileCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileCategory {
    #[serde(default, deserialize_with = "opt_u64")]
    pub id: Option<u64>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    #[serde(default, alias = "fileName")]
    pub name: Option<String>,
}

impl EmployeeFiles {
    pub fn names_in_category(&self, category_id: u64) -> Vec<String> {
        self.categories
            .iter()
            .find(|c| c.id == Some(category_id))
            .map(|c| c.files.iter().filter_map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
struct CommentBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    comment: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct StatusBody {
    status: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n.to_string(),
        RawId::Text(s) => s,
    })
}

fn opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<RawId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawId::Number(n)) => Ok(Some(n)),
        Some(RawId::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawId::Text(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, AdapterError> {
    Url::parse(raw).map_err(|err| AdapterError::InvalidEndpoint {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

fn join_endpoint(root: &Url, path: &str) -> Result<Url, AdapterError> {
    root.join(path).map_err(|err| AdapterError::InvalidEndpoint {
        url: format!("{root}{path}"),
        reason: err.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Culture Index
// ---------------------------------------------------------------------------

pub const DEFAULT_SURVEYS_URL: &str =
    "https://api.cultureindex.com/Surveys?api-version=2022-10-01";

#[derive(Debug, Clone)]
pub struct CultureIndexClient {
    http: Arc<HttpFetcher>,
    listing_url: Url,
    credentials: Credentials,
}

impl CultureIndexClient {
    pub const REMOTE: &'static str = "culture-index";

    pub fn new(
        http: Arc<HttpFetcher>,
        listing_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            http,
            listing_url: parse_endpoint(listing_url)?,
            credentials: Credentials::header("subscriptionkey", api_key),
        })
    }
}

#[async_trait]
impl SurveyProvider for CultureIndexClient {
    fn listing_url(&self) -> Url {
        self.listing_url.clone()
    }

    async fn fetch_survey_page(&self, url: &Url) -> Result<Page<SurveyRecord>, AdapterError> {
        let listing: SurveyListing = self
            .http
            .get_json(Self::REMOTE, url.as_str(), &self.credentials)
            .await?;
        let next = listing.next_url(url)?;
        let received = listing.value.len();
        let items = listing
            .value
            .into_iter()
            .filter_map(SurveyRow::into_record)
            .collect::<Vec<_>>();
        debug!(%url, received, kept = items.len(), "survey page");
        Ok(Page { items, next })
    }

    async fn download_report(&self, report_link: &str) -> Result<Vec<u8>, AdapterError> {
        let link = parse_endpoint(report_link)?;
        let resp = self
            .http
            .get_bytes(Self::REMOTE, link.as_str(), &Credentials::None)
            .await?;
        Ok(resp.body)
    }
}

// ---------------------------------------------------------------------------
// BambooHR
// ---------------------------------------------------------------------------

pub const DEFAULT_BAMBOOHR_BASE_URL: &str = "https://api.bamboohr.com/api/gateway.php";

#[derive(Debug, Clone)]
pub struct BambooHrClient {
    http: Arc<HttpFetcher>,
    api_root: Url,
    applications_url: Url,
    directory_url: Url,
    credentials: Credentials,
}

impl BambooHrClient {
    pub const REMOTE: &'static str = "bamboohr";

    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: &str,
        tenant: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        let tenant = tenant.trim().trim_matches('/');
        if tenant.is_empty() {
            return Err(AdapterError::Message("BambooHR tenant is empty".into()));
        }
        let api_root = parse_endpoint(&format!(
            "{}/{}/v1/",
            base_url.trim_end_matches('/'),
            tenant
        ))?;
        Ok(Self {
            http,
            applications_url: join_endpoint(&api_root, "applicant_tracking/applications")?,
            directory_url: join_endpoint(&api_root, "employees/directory")?,
            api_root,
            credentials: Credentials::api_key_basic(api_key),
        })
    }

    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        join_endpoint(&self.api_root, path)
    }
}

#[async_trait]
impl HrPlatform for BambooHrClient {
    fn applications_url(&self) -> Url {
        self.applications_url.clone()
    }

    async fn fetch_application_page(&self, url: &Url) -> Result<Page<Subject>, AdapterError> {
        let listing: ApplicationListing = self
            .http
            .get_json(Self::REMOTE, url.as_str(), &self.credentials)
            .await?;
        let next = listing.next_url(url)?;
        let items = listing.applications.into_iter().map(Subject::from).collect();
        Ok(Page { items, next })
    }

    fn employee_directory_url(&self) -> Url {
        self.directory_url.clone()
    }

    async fn fetch_employee_page(&self, url: &Url) -> Result<Page<Subject>, AdapterError> {
        let directory: EmployeeDirectory = self
            .http
            .get_json(Self::REMOTE, url.as_str(), &self.credentials)
            .await?;
        let next = directory.next_url(url)?;
        let items = directory.employees.into_iter().map(Subject::from).collect();
        Ok(Page { items, next })
    }

    async fn list_employee_files(
        &self,
        employee_id: &str,
        category_id: u64,
    ) -> Result<Vec<String>, AdapterError> {
        let url = self.endpoint(&format!("employees/{employee_id}/files/view"))?;
        let files: EmployeeFiles = self
            .http
            .get_json(Self::REMOTE, url.as_str(), &self.credentials)
            .await?;
        Ok(files.names_in_category(category_id))
    }

    async fn add_applicant_comment(
        &self,
        application_id: &str,
        comment: &str,
    ) -> Result<(), AdapterError> {
        let url = self.endpoint(&format!(
            "applicant_tracking/applications/{application_id}/comments"
        ))?;
        let body = CommentBody {
            kind: "comment",
            comment,
        };
        self.http
            .post_json(Self::REMOTE, url.as_str(), &self.credentials, &body)
            .await?;
        Ok(())
    }

    async fn change_applicant_status(
        &self,
        application_id: &str,
        status_id: u64,
    ) -> Result<(), AdapterError> {
        let url = self.endpoint(&format!(
            "applicant_tracking/applications/{application_id}/status"
        ))?;
        self.http
            .post_json(
                Self::REMOTE,
                url.as_str(),
                &self.credentials,
                &StatusBody { status: status_id },
            )
            .await?;
        Ok(())
    }

    async fn upload_employee_file(
        &self,
        employee_id: &str,
        upload: FileUpload,
    ) -> Result<(), AdapterError> {
        let url = self.endpoint(&format!("employees/{employee_id}/files"))?;
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .map_err(|err| AdapterError::Message(format!("invalid content type: {err}")))?;
        let form = multipart::Form::new()
            .text("category", upload.category_id.to_string())
            .text("fileName", upload.file_name)
            .text("share", if upload.share { "yes" } else { "no" })
            .part("file", part);
        self.http
            .post_multipart(Self::REMOTE, url.as_str(), &self.credentials, form)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cisync_http::HttpClientConfig;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn survey_listing_decodes_and_drops_unmatchable_rows() {
        let listing: SurveyListing = serde_json::from_str(
            r#"{
                "value": [
                    {"email": " John@Example.com ", "firstName": "John", "lastName": "Doe",
                     "traitPattern": "Maverick", "surveyReportLink": "https://r/1.pdf",
                     "surveyDate": "2024-01-01T09:30:00"},
                    {"email": null, "firstName": "Ghost", "surveyDate": "2024-01-01"},
                    {"email": "bad@example.com", "surveyDate": "someday"}
                ],
                "nextLink": "https://api.cultureindex.com/Surveys?page=2"
            }"#,
        )
        .unwrap();

        let next = listing.next_url(&url(DEFAULT_SURVEYS_URL)).unwrap();
        assert_eq!(
            next.unwrap().as_str(),
            "https://api.cultureindex.com/Surveys?page=2"
        );

        let records: Vec<_> = listing
            .value
            .into_iter()
            .filter_map(SurveyRow::into_record)
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].email, "john@example.com");
        assert_eq!(records[0].survey_date.to_string(), "2024-01-01");
        assert_eq!(records[0].survey_time, NaiveTime::from_hms_opt(9, 30, 0));
    }

    #[test]
    fn relative_next_page_resolves_against_current_page() {
        let current =
            url("https://api.bamboohr.com/api/gateway.php/acme/v1/applicant_tracking/applications");
        let listing: ApplicationListing = serde_json::from_str(
            r#"{"applications": [], "nextPageUrl": "applications?page=2"}"#,
        )
        .unwrap();
        assert_eq!(
            listing.next_url(&current).unwrap().unwrap().as_str(),
            "https://api.bamboohr.com/api/gateway.php/acme/v1/applicant_tracking/applications?page=2"
        );

        let rooted: ApplicationListing =
            serde_json::from_str(r#"{"applications": [], "nextPageUrl": "/v1/x?page=3"}"#).unwrap();
        assert_eq!(
            rooted.next_url(&current).unwrap().unwrap().as_str(),
            "https://api.bamboohr.com/v1/x?page=3"
        );

        let blank: ApplicationListing =
            serde_json::from_str(r#"{"applications": [], "nextPageUrl": "  "}"#).unwrap();
        assert!(blank.next_url(&current).unwrap().is_none());
    }

    #[test]
    fn application_rows_map_to_applicants_with_lenient_ids() {
        let listing: ApplicationListing = serde_json::from_str(
            r#"{"applications": [
                {"id": 21477, "status": {"id": 1}, "applicant": {"email": "a@x.com"}},
                {"id": "21478", "status": {"id": "20"}, "applicant": {"email": null}},
                {"id": 21479}
            ]}"#,
        )
        .unwrap();
        let subjects: Vec<Subject> = listing.applications.into_iter().map(Subject::from).collect();
        assert_eq!(
            subjects[0],
            Subject::Applicant {
                application_id: "21477".into(),
                email: Some("a@x.com".into()),
                status_id: Some(1),
            }
        );
        assert_eq!(subjects[1].status_id(), Some(20));
        assert_eq!(subjects[1].email(), None);
        assert_eq!(subjects[2].status_id(), None);
    }

    #[test]
    fn employee_files_filter_to_designated_category() {
        let files: EmployeeFiles = serde_json::from_str(
            r#"{"categories": [
                {"id": 12, "files": [{"name": "contract.pdf"}]},
                {"id": 308, "files": [
                    {"name": "CI_John_Doe_2024-01-01.pdf"},
                    {"fileName": "legacy.pdf"}
                ]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            files.names_in_category(308),
            vec!["CI_John_Doe_2024-01-01.pdf".to_string(), "legacy.pdf".to_string()]
        );
        assert!(files.names_in_category(999).is_empty());
    }

    #[test]
    fn employee_directory_is_single_page() {
        let directory: EmployeeDirectory = serde_json::from_str(
            r#"{"employees": [
                {"id": "4", "workEmail": "john@example.com"},
                {"id": 5, "workEmail": null}
            ]}"#,
        )
        .unwrap();
        assert!(directory
            .next_url(&url("https://api.bamboohr.com/x"))
            .unwrap()
            .is_none());
        let subjects: Vec<Subject> = directory.employees.into_iter().map(Subject::from).collect();
        assert_eq!(subjects[1].id(), "5");
        assert_eq!(subjects[1].email(), None);
    }

    #[test]
    fn bamboohr_endpoints_carry_tenant_prefix() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let client =
            BambooHrClient::new(http.clone(), DEFAULT_BAMBOOHR_BASE_URL, "acme", "key").unwrap();
        assert_eq!(
            client.applications_url().as_str(),
            "https://api.bamboohr.com/api/gateway.php/acme/v1/applicant_tracking/applications"
        );
        assert_eq!(
            client.employee_directory_url().as_str(),
            "https://api.bamboohr.com/api/gateway.php/acme/v1/employees/directory"
        );
        assert!(BambooHrClient::new(http, DEFAULT_BAMBOOHR_BASE_URL, " / ", "key").is_err());
    }

    #[test]
    fn survey_dates_accept_date_and_datetime_forms() {
        let feb_first = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert_eq!(parse_survey_date("2024-02-01"), Some((feb_first, None)));
        assert_eq!(
            parse_survey_date("2024-02-01T00:00:00Z"),
            Some((feb_first, Some(NaiveTime::MIN)))
        );
        assert_eq!(
            parse_survey_date("2024-02-01 15:04:05.123+02:00"),
            Some((feb_first, NaiveTime::from_hms_opt(15, 4, 5)))
        );
        assert_eq!(
            parse_survey_date("2024-02-01T08:15"),
            Some((feb_first, NaiveTime::from_hms_opt(8, 15, 0)))
        );
        assert!(parse_survey_date("02/01/2024").is_none());
        assert!(parse_survey_date("").is_none());
    }

    #[test]
    fn same_day_rows_keep_their_time_of_day() {
        let rows: Vec<SurveyRow> = serde_json::from_str(
            r#"[
                {"email": "ann@x.com", "firstName": "Ann", "lastName": "Lee",
                 "surveyDate": "2024-01-01T09:00:00"},
                {"email": "ann@x.com", "firstName": "Ann", "lastName": "Lee",
                 "surveyDate": "2024-01-01T15:00:00"}
            ]"#,
        )
        .unwrap();
        let names: Vec<String> = rows
            .into_iter()
            .filter_map(SurveyRow::into_record)
            .map(|record| cisync_core::FileNameConvention::default().file_name(&record))
            .collect();
        assert_eq!(
            names,
            vec![
                "CI_Ann_Lee_2024-01-01T09-00-00.pdf".to_string(),
                "CI_Ann_Lee_2024-01-01T15-00-00.pdf".to_string()
            ]
        );
    }
}
