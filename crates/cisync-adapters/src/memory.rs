//! In-memory adapters for tests and local rehearsal.
//!
//! Writes mutate the held state (status changes, attached file names) so a second
//! sync run observes what the first one did, the same way the real remotes do.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cisync_core::{Subject, SurveyRecord};
use cisync_http::Url;

use crate::{AdapterError, FileUpload, HrPlatform, Page, SurveyProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn page_number(url: &Url) -> usize {
    url.query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1)
}

fn static_url(raw: &'static str) -> Url {
    Url::parse(raw).expect("static memory:// url parses")
}

fn memory_url(raw: &str) -> Result<Url, AdapterError> {
    Url::parse(raw).map_err(|err| AdapterError::InvalidEndpoint {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Slice `items` into 1-based pages of `page_size`.
fn paginate<T: Clone>(items: &[T], page_size: usize, page: usize) -> (Vec<T>, bool) {
    let page_size = page_size.max(1);
    let start = (page.max(1) - 1) * page_size;
    let slice = items.iter().skip(start).take(page_size).cloned().collect();
    (slice, start + page_size < items.len())
}

#[derive(Debug, Default)]
struct ProviderState {
    listing_fetches: usize,
    downloads: Vec<String>,
}

/// Survey provider serving records as `memory://surveys/?page=N` pages linked by
/// absolute `nextLink`-style URLs.
#[derive(Debug)]
pub struct InMemorySurveyProvider {
    records: Vec<SurveyRecord>,
    page_size: usize,
    reports: HashMap<String, Vec<u8>>,
    failing_pages: HashSet<usize>,
    state: Mutex<ProviderState>,
}

impl InMemorySurveyProvider {
    pub fn new(records: Vec<SurveyRecord>) -> Self {
        Self {
            records,
            page_size: 10,
            reports: HashMap::new(),
            failing_pages: HashSet::new(),
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Serve `bytes` for `link`. Links without a registered report fail to download.
    pub fn with_report(mut self, link: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.reports.insert(link.into(), bytes.into());
        self
    }

    pub fn failing_page(mut self, page: usize) -> Self {
        self.failing_pages.insert(page);
        self
    }

    pub fn listing_fetches(&self) -> usize {
        lock(&self.state).listing_fetches
    }

    pub fn downloads(&self) -> Vec<String> {
        lock(&self.state).downloads.clone()
    }
}

#[async_trait]
impl SurveyProvider for InMemorySurveyProvider {
    fn listing_url(&self) -> Url {
        static_url("memory://surveys/?page=1")
    }

    async fn fetch_survey_page(&self, url: &Url) -> Result<Page<SurveyRecord>, AdapterError> {
        let page = page_number(url);
        lock(&self.state).listing_fetches += 1;
        if self.failing_pages.contains(&page) {
            return Err(AdapterError::Message(format!("survey page {page} unavailable")));
        }
        let (items, more) = paginate(&self.records, self.page_size, page);
        let next = if more {
            Some(memory_url(&format!("memory://surveys/?page={}", page + 1))?)
        } else {
            None
        };
        Ok(Page { items, next })
    }

    async fn download_report(&self, report_link: &str) -> Result<Vec<u8>, AdapterError> {
        lock(&self.state).downloads.push(report_link.to_string());
        self.reports
            .get(report_link)
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("report {report_link} not found")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedComment {
    pub application_id: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub employee_id: String,
    pub category_id: u64,
    pub file_name: String,
    pub share: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct PlatformState {
    applicants: Vec<Subject>,
    employees: Vec<Subject>,
    files: HashMap<(String, u64), Vec<String>>,
    comments: Vec<RecordedComment>,
    status_changes: Vec<(String, u64)>,
    uploads: Vec<RecordedUpload>,
    file_lookups: Vec<String>,
    fail_applications: bool,
    fail_employees: bool,
    fail_file_lookup: HashSet<String>,
    fail_comment: HashSet<String>,
    fail_status: HashSet<String>,
    fail_upload: HashSet<String>,
}

/// HR platform holding applicants (paged with relative `?page=N` locators), a
/// single-page employee directory and per-employee file lists.
#[derive(Debug)]
pub struct InMemoryHrPlatform {
    page_size: usize,
    status_delay: Duration,
    state: Mutex<PlatformState>,
}

impl Default for InMemoryHrPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHrPlatform {
    pub fn new() -> Self {
        Self {
            page_size: 10,
            status_delay: Duration::ZERO,
            state: Mutex::new(PlatformState::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Status changes wait this long before taking effect.
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn with_applicant(self, id: &str, email: Option<&str>, status_id: Option<u64>) -> Self {
        lock(&self.state).applicants.push(Subject::Applicant {
            application_id: id.to_string(),
            email: email.map(str::to_string),
            status_id,
        });
        self
    }

    pub fn with_employee(self, id: &str, work_email: Option<&str>) -> Self {
        lock(&self.state).employees.push(Subject::Employee {
            employee_id: id.to_string(),
            work_email: work_email.map(str::to_string),
        });
        self
    }

    pub fn with_employee_file(self, employee_id: &str, category_id: u64, name: &str) -> Self {
        lock(&self.state)
            .files
            .entry((employee_id.to_string(), category_id))
            .or_default()
            .push(name.to_string());
        self
    }

    pub fn fail_applications_listing(&self) {
        lock(&self.state).fail_applications = true;
    }

    pub fn fail_employee_listing(&self) {
        lock(&self.state).fail_employees = true;
    }

    pub fn fail_file_lookup_for(&self, employee_id: &str) {
        lock(&self.state).fail_file_lookup.insert(employee_id.to_string());
    }

    pub fn fail_comment_for(&self, application_id: &str) {
        lock(&self.state).fail_comment.insert(application_id.to_string());
    }

    pub fn fail_status_for(&self, application_id: &str) {
        lock(&self.state).fail_status.insert(application_id.to_string());
    }

    /// Fail uploads of the named file, for any employee.
    pub fn fail_upload_named(&self, file_name: &str) {
        lock(&self.state).fail_upload.insert(file_name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.fail_applications = false;
        state.fail_employees = false;
        state.fail_file_lookup.clear();
        state.fail_comment.clear();
        state.fail_status.clear();
        state.fail_upload.clear();
    }

    pub fn comments(&self) -> Vec<RecordedComment> {
        lock(&self.state).comments.clone()
    }

    pub fn status_changes(&self) -> Vec<(String, u64)> {
        lock(&self.state).status_changes.clone()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        lock(&self.state).uploads.clone()
    }

    pub fn file_lookups(&self) -> Vec<String> {
        lock(&self.state).file_lookups.clone()
    }

    pub fn files_of(&self, employee_id: &str, category_id: u64) -> Vec<String> {
        lock(&self.state)
            .files
            .get(&(employee_id.to_string(), category_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn status_of(&self, application_id: &str) -> Option<u64> {
        lock(&self.state)
            .applicants
            .iter()
            .find(|s| s.id() == application_id)
            .and_then(Subject::status_id)
    }
}

#[async_trait]
impl HrPlatform for InMemoryHrPlatform {
    fn applications_url(&self) -> Url {
        static_url("memory://hr/applications")
    }

    async fn fetch_application_page(&self, url: &Url) -> Result<Page<Subject>, AdapterError> {
        let state = lock(&self.state);
        if state.fail_applications {
            return Err(AdapterError::Message("applications listing unavailable".into()));
        }
        let page = page_number(url);
        let (items, more) = paginate(&state.applicants, self.page_size, page);
        let next = if more {
            crate::resolve_locator(url, Some(&format!("applications?page={}", page + 1)))?
        } else {
            None
        };
        Ok(Page { items, next })
    }

    fn employee_directory_url(&self) -> Url {
        static_url("memory://hr/employees/directory")
    }

    async fn fetch_employee_page(&self, _url: &Url) -> Result<Page<Subject>, AdapterError> {
        let state = lock(&self.state);
        if state.fail_employees {
            return Err(AdapterError::Message("employee directory unavailable".into()));
        }
        Ok(Page::last(state.employees.clone()))
    }

    async fn list_employee_files(
        &self,
        employee_id: &str,
        category_id: u64,
    ) -> Result<Vec<String>, AdapterError> {
        let mut state = lock(&self.state);
        state.file_lookups.push(employee_id.to_string());
        if state.fail_file_lookup.contains(employee_id) {
            return Err(AdapterError::Message(format!(
                "files for employee {employee_id} unavailable"
            )));
        }
        Ok(state
            .files
            .get(&(employee_id.to_string(), category_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn add_applicant_comment(
        &self,
        application_id: &str,
        comment: &str,
    ) -> Result<(), AdapterError> {
        let mut state = lock(&self.state);
        if state.fail_comment.contains(application_id) {
            return Err(AdapterError::Message(format!(
                "comment rejected for application {application_id}"
            )));
        }
        state.comments.push(RecordedComment {
            application_id: application_id.to_string(),
            comment: comment.to_string(),
        });
        Ok(())
    }

    async fn change_applicant_status(
        &self,
        application_id: &str,
        status_id: u64,
    ) -> Result<(), AdapterError> {
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        let mut state = lock(&self.state);
        if state.fail_status.contains(application_id) {
            return Err(AdapterError::Message(format!(
                "status change rejected for application {application_id}"
            )));
        }
        state
            .status_changes
            .push((application_id.to_string(), status_id));
        for subject in &mut state.applicants {
            if let Subject::Applicant {
                application_id: id,
                status_id: current,
                ..
            } = subject
            {
                if id.as_str() == application_id {
                    *current = Some(status_id);
                }
            }
        }
        Ok(())
    }

    async fn upload_employee_file(
        &self,
        employee_id: &str,
        upload: FileUpload,
    ) -> Result<(), AdapterError> {
        let mut state = lock(&self.state);
        if state.fail_upload.contains(&upload.file_name) {
            return Err(AdapterError::Message(format!(
                "upload of {} rejected",
                upload.file_name
            )));
        }
        state
            .files
            .entry((employee_id.to_string(), upload.category_id))
            .or_default()
            .push(upload.file_name.clone());
        state.uploads.push(RecordedUpload {
            employee_id: employee_id.to_string(),
            category_id: upload.category_id,
            file_name: upload.file_name,
            share: upload.share,
            bytes: upload.bytes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applicant_pages_link_with_relative_locators() {
        let platform = InMemoryHrPlatform::new()
            .with_page_size(2)
            .with_applicant("1", Some("a@x.com"), Some(1))
            .with_applicant("2", Some("b@x.com"), Some(1))
            .with_applicant("3", None, None);

        let first = platform
            .fetch_application_page(&platform.applications_url())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let next = first.next.expect("second page");
        assert_eq!(next.as_str(), "memory://hr/applications?page=2");

        let second = platform.fetch_application_page(&next).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn writes_are_visible_to_later_reads() {
        let platform = InMemoryHrPlatform::new().with_applicant("7", Some("a@x.com"), Some(1));
        platform.change_applicant_status("7", 20).await.unwrap();
        assert_eq!(platform.status_of("7"), Some(20));

        platform
            .upload_employee_file(
                "E1",
                FileUpload {
                    category_id: 308,
                    file_name: "CI_A_B_2024-01-01.pdf".into(),
                    content_type: "application/pdf".into(),
                    share: true,
                    bytes: b"%PDF".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            platform.list_employee_files("E1", 308).await.unwrap(),
            vec!["CI_A_B_2024-01-01.pdf".to_string()]
        );
        assert!(platform.list_employee_files("E1", 12).await.unwrap().is_empty());
    }
}
