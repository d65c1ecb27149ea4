use cisync_core::{Subject, SurveyIndex, SurveyRecord};
use serde::Serialize;

/// One (subject, survey) pair that may need an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub subject: Subject,
    pub survey: SurveyRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutput {
    pub pairs: Vec<Candidate>,
    pub skipped_no_email: usize,
    pub without_surveys: usize,
}

/// Pairs every subject with each of its surveys, in survey order. Pure; no I/O.
pub fn join(subjects: &[Subject], index: &SurveyIndex) -> JoinOutput {
    let mut output = JoinOutput::default();
    for subject in subjects {
        let Some(email) = subject.normalized_email() else {
            output.skipped_no_email += 1;
            continue;
        };
        let surveys = index.surveys_for(&email);
        if surveys.is_empty() {
            output.without_surveys += 1;
            continue;
        }
        output.pairs.extend(surveys.iter().map(|survey| Candidate {
            subject: subject.clone(),
            survey: survey.clone(),
        }));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn survey(email: &str, date: &str) -> SurveyRecord {
        SurveyRecord {
            email: email.into(),
            first_name: "John".into(),
            last_name: "Doe".into(),
            trait_pattern: "Maverick".into(),
            report_link: "https://reports.example.com/r.pdf".into(),
            survey_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            survey_time: None,
        }
    }

    fn employee(id: &str, email: Option<&str>) -> Subject {
        Subject::Employee {
            employee_id: id.into(),
            work_email: email.map(str::to_string),
        }
    }

    #[test]
    fn subjects_without_email_never_pair() {
        let index: SurveyIndex = [survey("a@x.com", "2024-01-01")].into_iter().collect();
        let subjects = vec![
            employee("E1", None),
            employee("E2", Some("   ")),
            Subject::Applicant {
                application_id: "9".into(),
                email: None,
                status_id: Some(1),
            },
        ];
        let output = join(&subjects, &index);
        assert!(output.pairs.is_empty());
        assert_eq!(output.skipped_no_email, 3);
    }

    #[test]
    fn normalized_emails_match_and_keep_survey_order() {
        let index: SurveyIndex = [
            survey("a@x.com", "2024-01-01"),
            survey("A@X.com", "2024-02-01"),
            survey("b@x.com", "2024-03-01"),
        ]
        .into_iter()
        .collect();
        let subjects = vec![employee("E1", Some(" A@x.COM")), employee("E3", Some("c@x.com"))];

        let output = join(&subjects, &index);
        let dates: Vec<String> = output
            .pairs
            .iter()
            .map(|c| c.survey.survey_date.to_string())
            .collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-02-01"]);
        assert!(output.pairs.iter().all(|c| c.subject.id() == "E1"));
        assert_eq!(output.without_surveys, 1);
        assert_eq!(output.skipped_no_email, 0);
    }
}
