use cisync_adapters::HrPlatform;
use cisync_core::{Domain, Subject};
use tracing::info;

use crate::collector::collect_pages;
use crate::SyncError;

/// Collects the subjects of one domain.
///
/// With `processed_status` set, applicants already at that status are dropped here. The
/// duplicate guard re-checks the same value, so this only saves work downstream.
pub async fn resolve_subjects(
    platform: &dyn HrPlatform,
    domain: Domain,
    max_pages: usize,
    processed_status: Option<u64>,
) -> Result<Vec<Subject>, SyncError> {
    let subjects = match domain {
        Domain::Applicants => {
            collect_pages(platform.applications_url(), max_pages, move |url| async move {
                platform.fetch_application_page(&url).await
            })
            .await?
        }
        Domain::Employees => {
            collect_pages(platform.employee_directory_url(), max_pages, move |url| async move {
                platform.fetch_employee_page(&url).await
            })
            .await?
        }
    };

    let listed = subjects.len();
    let subjects: Vec<Subject> = match (domain, processed_status) {
        (Domain::Applicants, Some(sentinel)) => subjects
            .into_iter()
            .filter(|s| s.status_id() != Some(sentinel))
            .collect(),
        _ => subjects,
    };
    info!(%domain, listed, kept = subjects.len(), "subjects resolved");
    Ok(subjects)
}
