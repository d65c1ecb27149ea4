use cisync_adapters::SurveyProvider;
use cisync_core::SurveyIndex;
use tracing::{info, warn};

use crate::collector::collect_pages;
use crate::SyncError;

/// Collects every survey page and indexes the records by normalized email.
pub async fn build_survey_index(
    provider: &dyn SurveyProvider,
    max_pages: usize,
) -> Result<SurveyIndex, SyncError> {
    let records = collect_pages(provider.listing_url(), max_pages, move |url| async move {
        provider.fetch_survey_page(&url).await
    })
    .await?;

    let received = records.len();
    let mut index = SurveyIndex::new();
    let mut dropped = 0usize;
    for record in records {
        if !index.insert(record) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(dropped, "survey records without an email were not indexed");
    }
    info!(
        received,
        indexed = index.record_count(),
        emails = index.email_count(),
        "survey index built"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use cisync_adapters::memory::InMemorySurveyProvider;
    use cisync_core::SurveyRecord;

    fn survey(email: &str, day: i64) -> SurveyRecord {
        SurveyRecord {
            email: email.to_string(),
            first_name: "Pat".into(),
            last_name: "Lee".into(),
            trait_pattern: "Persuader".into(),
            report_link: format!("https://reports.example.com/{day}.pdf"),
            survey_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(day),
            survey_time: None,
        }
    }

    #[tokio::test]
    async fn three_linked_pages_yield_thirty_records_in_order() {
        let records: Vec<_> = (0..30).map(|i| survey(&format!("p{}@x.com", i % 3), i)).collect();
        let provider = InMemorySurveyProvider::new(records).with_page_size(10);

        let index = build_survey_index(&provider, 10_000).await.unwrap();

        assert_eq!(provider.listing_fetches(), 3);
        assert_eq!(index.record_count(), 30);
        assert_eq!(index.email_count(), 3);
        let days: Vec<i64> = index
            .surveys_for("p1@x.com")
            .iter()
            .map(|s| (s.survey_date - NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).num_days())
            .collect();
        assert_eq!(days, vec![1, 4, 7, 10, 13, 16, 19, 22, 25, 28]);
    }

    #[tokio::test]
    async fn mixed_case_emails_share_one_entry() {
        let provider =
            InMemorySurveyProvider::new(vec![survey("A@X.com", 0), survey("a@x.com", 1)]);
        let index = build_survey_index(&provider, 10).await.unwrap();
        assert_eq!(index.email_count(), 1);
        assert_eq!(index.surveys_for("a@x.com").len(), 2);
    }

    #[tokio::test]
    async fn page_failure_fails_the_index() {
        let records: Vec<_> = (0..25).map(|i| survey("a@x.com", i)).collect();
        let provider = InMemorySurveyProvider::new(records)
            .with_page_size(10)
            .failing_page(2);
        assert!(matches!(
            build_survey_index(&provider, 10).await,
            Err(SyncError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn page_bound_applies_to_the_survey_listing() {
        let records: Vec<_> = (0..25).map(|i| survey("a@x.com", i)).collect();
        let provider = InMemorySurveyProvider::new(records).with_page_size(10);
        assert!(matches!(
            build_survey_index(&provider, 2).await,
            Err(SyncError::PaginationOverrun { max_pages: 2, .. })
        ));
    }
}
