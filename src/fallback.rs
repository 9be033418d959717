use tracing::debug;

use crate::models::{
    AnalysisRecord, AnalysisResult, ClassInsight, Group, GroupLevel, GroupMember,
    GroupingOutcome, StudentDetail,
};
use crate::sanitize::{round2, truncate_chars};

/// Deterministic, model-free approximations for each generation task.
///
/// Every function here returns output shape-compatible with the model path,
/// with `llm: false`, so callers never branch on provenance.

const ENABLE_CREDENTIAL_HINT: &str = "Enable API_GROQ or GEMINI_API_KEY to obtain richer insights";

/// Heuristic per-submission analysis: a pseudo error percentage derived from
/// text length via logarithmic compression into [15, 85].
pub fn fallback_analysis(detected_text: &str, subject: &str) -> AnalysisResult {
    let words = detected_text.split_whitespace().count();
    let length_factor = words.clamp(10, 100) as f64;
    let error_percentage = (((length_factor + 1.0).log2() * 12.0) as i64).clamp(15, 85) as u8;

    let concept = if subject.trim().is_empty() {
        "General".to_string()
    } else {
        truncate_chars(subject, 40)
    };

    debug!(words, error_percentage, "Produced heuristic analysis");

    AnalysisResult {
        main_error: "Pending advanced analysis (LLM disabled)".to_string(),
        error_percentage,
        concepts: vec![concept],
        suggestions: vec![ENABLE_CREDENTIAL_HINT.to_string()],
        reasoning: "Fallback heuristic".to_string(),
        raw_payload: None,
        legacy: None,
        score: None,
        student_feedback: None,
        llm: false,
    }
}

struct TierSpec {
    level: GroupLevel,
    level_label: &'static str,
    slug: &'static str,
    name: &'static str,
    color: &'static str,
}

const TIERS: [TierSpec; 3] = [
    TierSpec {
        level: GroupLevel::High,
        level_label: "high",
        slug: "advanced",
        name: "Advanced Group",
        color: "bg-green-50 border-green-200",
    },
    TierSpec {
        level: GroupLevel::Medium,
        level_label: "medium",
        slug: "intermediate",
        name: "Intermediate Group",
        color: "bg-yellow-50 border-yellow-200",
    },
    TierSpec {
        level: GroupLevel::Low,
        level_label: "low",
        slug: "needs-support",
        name: "Support Group",
        color: "bg-red-50 border-red-200",
    },
];

fn tier_index(error_percentage: u8) -> usize {
    // "high" is the lowest-error bucket: low error = high performance.
    if error_percentage < 30 {
        0
    } else if error_percentage < 60 {
        1
    } else {
        2
    }
}

/// Heuristic grouping: three fixed tiers by error-percentage thresholds.
/// `records` must already be deduplicated by student. Empty tiers are omitted.
pub fn fallback_groups(records: &[AnalysisRecord]) -> GroupingOutcome {
    let mut buckets: [Vec<&AnalysisRecord>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for record in records {
        buckets[tier_index(record.data.error_percentage)].push(record);
    }

    let mut groups = Vec::new();
    for (tier, bucket) in TIERS.iter().zip(buckets.iter()) {
        if bucket.is_empty() {
            continue;
        }

        let mut common_errors: Vec<String> = Vec::new();
        for record in bucket {
            let error = &record.data.main_error;
            if !error.is_empty() && !common_errors.contains(error) {
                common_errors.push(error.clone());
            }
            if common_errors.len() == 5 {
                break;
            }
        }

        groups.push(Group {
            id: tier.slug.to_string(),
            name: tier.name.to_string(),
            level: tier.level,
            color: tier.color.to_string(),
            description: "Heuristic grouping (LLM disabled)".to_string(),
            criteria: format!("errorPercentage bucket {}", tier.level_label),
            common_errors,
            suggestions: vec![ENABLE_CREDENTIAL_HINT.to_string()],
            students: bucket
                .iter()
                .map(|record| GroupMember {
                    analysis_id: record.id.clone(),
                    student_name: record.student_name.clone(),
                    rationale: "heuristic".to_string(),
                })
                .collect(),
        });
    }

    debug!(group_count = groups.len(), record_count = records.len(), "Produced heuristic groups");

    GroupingOutcome {
        groups,
        llm: false,
        cached: false,
    }
}

/// Heuristic class summary: arithmetic mean error, frequency-ranked top
/// errors (ties broken by first appearance), one fixed suggestion and up to
/// 40 per-student detail rows.
pub fn fallback_class_insights(records: &[AnalysisRecord], class_name: &str) -> ClassInsight {
    let count = records.len();
    let total: f64 = records
        .iter()
        .map(|r| f64::from(r.data.error_percentage))
        .sum();
    let average_error = if count > 0 {
        round2(total / count as f64)
    } else {
        0.0
    };

    // Frequency count preserving first-seen order for ties
    let mut error_counts: Vec<(String, usize)> = Vec::new();
    for record in records {
        let error = if record.data.main_error.is_empty() {
            "Unknown".to_string()
        } else {
            record.data.main_error.clone()
        };
        match error_counts.iter_mut().find(|(e, _)| *e == error) {
            Some((_, n)) => *n += 1,
            None => error_counts.push((error, 1)),
        }
    }
    let mut ranked: Vec<(usize, String, usize)> = error_counts
        .into_iter()
        .enumerate()
        .map(|(idx, (error, n))| (idx, error, n))
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    let common_errors: Vec<String> = ranked.into_iter().take(8).map(|(_, e, _)| e).collect();

    let detailed: Vec<StudentDetail> = records
        .iter()
        .take(40)
        .map(|record| StudentDetail {
            student_name: Some(record.student_name.clone()),
            analysis_id: record.id.clone(),
            error_percentage: Some(i64::from(record.data.error_percentage)),
            short_rationale: truncate_chars(&record.data.main_error, 140),
        })
        .collect();

    ClassInsight {
        class_name: class_name.to_string(),
        student_count: count as i64,
        average_error,
        common_errors,
        suggestions: vec!["Review common mistakes in class; use small-group exercises".to_string()],
        detailed,
        llm: false,
        cached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, student: &str, error_percentage: u8, main_error: &str) -> AnalysisRecord {
        AnalysisRecord {
            id: id.to_string(),
            student_name: student.to_string(),
            subject: "Mathematics".to_string(),
            timestamp: Utc::now(),
            data: crate::models::AnalysisData {
                image_url: None,
                detected_text: String::new(),
                main_error: main_error.to_string(),
                error_percentage,
                concepts: Vec::new(),
                suggestions: Vec::new(),
                reasoning: None,
                raw_payload: None,
                legacy: None,
                score: None,
                student_feedback: None,
            },
        }
    }

    #[test]
    fn analysis_fallback_stays_within_band() {
        for text in ["a", "one two three", &"word ".repeat(500)] {
            let result = fallback_analysis(text, "Algebra");
            assert!((15..=85).contains(&result.error_percentage));
            assert!(!result.llm);
        }
    }

    #[test]
    fn analysis_fallback_defaults_subject_to_general() {
        let result = fallback_analysis("some text", "  ");
        assert_eq!(result.concepts, vec!["General".to_string()]);
    }

    #[test]
    fn bucket_boundaries_match_thresholds() {
        assert_eq!(tier_index(29), 0);
        assert_eq!(tier_index(30), 1);
        assert_eq!(tier_index(59), 1);
        assert_eq!(tier_index(60), 2);
    }

    #[test]
    fn high_level_is_the_low_error_bucket() {
        let outcome = fallback_groups(&[record("a1", "Anna", 10, "minor slip")]);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].id, "advanced");
        assert_eq!(outcome.groups[0].level, GroupLevel::High);
    }

    #[test]
    fn empty_buckets_are_omitted() {
        let records = vec![
            record("a1", "Anna", 10, "slip"),
            record("a2", "Bruno", 75, "missing concept"),
        ];
        let outcome = fallback_groups(&records);
        let ids: Vec<_> = outcome.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["advanced", "needs-support"]);
    }

    #[test]
    fn common_errors_are_distinct_and_capped() {
        let records: Vec<_> = (0..8)
            .map(|i| record(&format!("a{i}"), &format!("S{i}"), 70, &format!("err-{}", i % 6)))
            .collect();
        let outcome = fallback_groups(&records);
        let errors = &outcome.groups[0].common_errors;
        assert_eq!(errors.len(), 5);
        let mut unique = errors.clone();
        unique.dedup();
        assert_eq!(unique.len(), errors.len());
    }

    #[test]
    fn class_fallback_averages_and_ranks() {
        let records = vec![
            record("a1", "Anna", 20, "fractions"),
            record("a2", "Bruno", 40, "fractions"),
            record("a3", "Carla", 43, "place value"),
        ];
        let insight = fallback_class_insights(&records, "5th A");
        assert_eq!(insight.student_count, 3);
        assert_eq!(insight.average_error, 34.33);
        assert_eq!(insight.common_errors[0], "fractions");
        assert_eq!(insight.common_errors[1], "place value");
        assert_eq!(insight.detailed.len(), 3);
        assert!(!insight.llm);
    }

    #[test]
    fn class_fallback_breaks_ties_by_first_seen() {
        let records = vec![
            record("a1", "Anna", 10, "beta"),
            record("a2", "Bruno", 10, "alpha"),
        ];
        let insight = fallback_class_insights(&records, "5th A");
        assert_eq!(insight.common_errors, vec!["beta", "alpha"]);
    }
}
