use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::fallback::{fallback_class_insights, fallback_groups};
use crate::llm_gateway::ModelGateway;
use crate::models::{
    AnalysisRecord, ClassInsight, GenerationRequest, Group, GroupLevel, GroupMember,
    GroupingOutcome, StudentDetail,
};
use crate::result_cache::{class_fingerprint, grouping_fingerprint, ResultCache};
use crate::sanitize::{coerce_f64, coerce_i64, truncate_chars, value_to_text};
use crate::{log_engine_start, log_engine_success, log_engine_warn};

const GROUP_SYSTEM: &str = "You are a pedagogical expert. Your job is to analyze short \
    per-student analysis records and produce a compact clustering of students into learning \
    groups. STRICT REQUIREMENTS: Output only valid JSON (no explanatory text, no markdown). The \
    top-level JSON must be an object with a single key `groups` whose value is a list. Each \
    group must be an object with the following keys:\n\
    - id: short slug string (use lowercase, hyphen-separated)\n\
    - name: human-friendly name\n\
    - level: one of \"high\", \"medium\", \"low\"\n\
    - color: short tailwind class or hex color string light colors\n\
    - description: short summary (1-2 sentences max)\n\
    - criteria: short rationale for membership (single sentence)\n\
    - commonErrors: array of short strings (top error themes)\n\
    - suggestions: array of short actionable suggestions for the group\n\
    - students: array of student objects, each with keys: { analysisId: string, studentName: \
    string, rationale: string }\n\
    CONSTRAINTS:\n\
    - Return between 2 and 6 groups.\n\
    - A student may appear in multiple groups if they match multiple criteria (use the analysis \
    ID as unique student reference). Do NOT duplicate the same student more than once within a \
    single group's students array.\n\
    - If you are uncertain about a student's difficulty, put them in \"medium\".\n\
    - Keep outputs concise: descriptions <= 200 chars, rationale <= 160 chars, at most 10 \
    commonErrors and 10 suggestions per group.\n\
    - Prefer balanced groups when reasonable, but prioritize pedagogical coherence.\n\
    ERROR HANDLING: If you cannot produce a valid grouping, return {\"groups\":[]} as the \
    entire response.";

const CLASS_SYSTEM: &str = "You are a pedagogical analyst. Given compact per-student analysis \
    lines, produce a JSON object with keys:\n\
    class_name (string), student_count (int), average_error (float), commonErrors (array of \
    short strings), suggestions (array of short actionable items), detailed (array of objects \
    with studentName, analysisId, errorPercentage, shortRationale).\n\
    STRICT: Return ONLY valid JSON (no explanatory text). Keep arrays limited to top 8 items.";

const GROUP_PROMPT_LIMIT: usize = 120;
const CLASS_PROMPT_LIMIT: usize = 400;

/// Collapse a batch to one record per student, keeping the newest submission.
/// Output order follows each student's first appearance in the input.
pub fn dedupe_latest_by_student(records: &[AnalysisRecord]) -> Vec<AnalysisRecord> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<AnalysisRecord> = Vec::new();
    for record in records {
        match positions.get(&record.student_name) {
            Some(&idx) => {
                if record.timestamp > unique[idx].timestamp {
                    unique[idx] = record.clone();
                }
            }
            None => {
                positions.insert(record.student_name.clone(), unique.len());
                unique.push(record.clone());
            }
        }
    }
    unique
}

fn record_prompt_line(record: &AnalysisRecord, with_subject: bool) -> String {
    let concepts = record
        .data
        .concepts
        .iter()
        .take(4)
        .cloned()
        .collect::<Vec<_>>()
        .join(",");
    if with_subject {
        format!(
            "ID={}|student={}|subject={}|error%={}|mainError={}|concepts={}",
            record.id,
            record.student_name,
            record.subject,
            record.data.error_percentage,
            record.data.main_error,
            concepts
        )
    } else {
        format!(
            "ID={}|student={}|error%={}|mainError={}|concepts={}",
            record.id,
            record.student_name,
            record.data.error_percentage,
            record.data.main_error,
            concepts
        )
    }
}

fn parse_level(value: Option<&Value>) -> GroupLevel {
    match value.and_then(Value::as_str) {
        Some("high") => GroupLevel::High,
        Some("low") => GroupLevel::Low,
        _ => GroupLevel::Medium,
    }
}

fn bounded_text(value: Option<&Value>, default: &str, max: usize) -> String {
    let text = value.map(value_to_text).unwrap_or_else(|| default.to_string());
    truncate_chars(&text, max)
}

fn bounded_list(value: Option<&Value>, max_len: usize, max_items: usize) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .take(max_items)
                .map(|v| truncate_chars(&value_to_text(v), max_len))
                .collect()
        })
        .unwrap_or_default()
}

/// Bound one model-produced group to the stored shape. Members are also
/// deduplicated by student name; models occasionally repeat a student within
/// the same group despite the instructions.
fn sanitize_group(raw: &Value) -> Group {
    let mut students: Vec<GroupMember> = Vec::new();
    if let Some(values) = raw.get("students").and_then(Value::as_array) {
        for member in values.iter().take(200) {
            let student_name = bounded_text(member.get("studentName"), "Unknown Student", 80);
            if students.iter().any(|m| m.student_name == student_name) {
                continue;
            }
            let analysis_id = member
                .get("analysisId")
                .or_else(|| member.get("id"))
                .map(value_to_text)
                .unwrap_or_default();
            students.push(GroupMember {
                analysis_id,
                student_name,
                rationale: bounded_text(member.get("rationale"), "", 160),
            });
        }
    }

    Group {
        id: bounded_text(raw.get("id"), "group", 40),
        name: bounded_text(raw.get("name"), "Group", 80),
        level: parse_level(raw.get("level")),
        color: bounded_text(raw.get("color"), "bg-gray-50 border-gray-200", 80),
        description: bounded_text(raw.get("description"), "", 300),
        criteria: bounded_text(raw.get("criteria"), "", 200),
        common_errors: bounded_list(raw.get("commonErrors"), 120, 10),
        suggestions: bounded_list(raw.get("suggestions"), 160, 10),
        students,
    }
}

fn sanitize_detail(raw: &Value) -> StudentDetail {
    StudentDetail {
        student_name: raw.get("studentName").map(value_to_text),
        analysis_id: raw.get("analysisId").map(value_to_text).unwrap_or_default(),
        error_percentage: coerce_i64(raw.get("errorPercentage")),
        short_rationale: bounded_text(raw.get("shortRationale"), "", 160),
    }
}

/// Groups students into explainable learning clusters, with a TTL cache keyed
/// by the content of the deduplicated batch.
pub struct GroupingEngine {
    gateway: Arc<ModelGateway>,
    cache: ResultCache,
}

impl GroupingEngine {
    pub fn new(gateway: Arc<ModelGateway>, cache: ResultCache) -> Self {
        Self { gateway, cache }
    }

    /// Build learning groups for the given analyses. `force` skips the cache
    /// read but the fresh result is still stored.
    pub async fn build_groups(&self, records: &[AnalysisRecord], force: bool) -> GroupingOutcome {
        if records.is_empty() {
            return GroupingOutcome {
                groups: Vec::new(),
                llm: self.gateway.is_available(),
                cached: false,
            };
        }

        let unique = dedupe_latest_by_student(records);
        let key = grouping_fingerprint(&unique);

        if !force {
            if let Some(hit) = self.cache.get(&key).await {
                if let Ok(mut outcome) = serde_json::from_value::<GroupingOutcome>(hit) {
                    outcome.cached = true;
                    return outcome;
                }
            }
        }

        let outcome = self.compute_groups(&unique).await;
        if let Ok(payload) = serde_json::to_value(&outcome) {
            self.cache.put(&key, payload).await;
        }
        outcome
    }

    async fn compute_groups(&self, unique: &[AnalysisRecord]) -> GroupingOutcome {
        if !self.gateway.is_available() {
            return fallback_groups(unique);
        }

        log_engine_start!("grouping_engine", "build_groups", record_count = unique.len());

        let lines: Vec<String> = unique
            .iter()
            .take(GROUP_PROMPT_LIMIT)
            .map(|r| record_prompt_line(r, true))
            .collect();
        let prompt = format!(
            "Analysis data (one per line, each representing a unique student):\n{}\n\
             Generate JSON with 'groups' key. Grouping is by student characteristics; a student \
             may appear in multiple groups when appropriate. Do NOT duplicate the same student \
             more than once within a single group's students array. See system instructions.",
            lines.join("\n")
        );

        let request = GenerationRequest::new(prompt, GROUP_SYSTEM)
            .with_temperature(0.25)
            .with_max_retries(2)
            .with_max_output_tokens(5048);
        let result = self.gateway.generate(&request).await;

        let raw_groups = result
            .success
            .then(|| result.data.get("groups").and_then(Value::as_array).cloned())
            .flatten();
        let Some(raw_groups) = raw_groups else {
            log_engine_warn!("grouping_engine", "build_groups", "model output rejected, using heuristic");
            return fallback_groups(unique);
        };

        let groups: Vec<Group> = raw_groups.iter().take(10).map(sanitize_group).collect();
        log_engine_success!(
            "grouping_engine",
            "build_groups",
            format!("{} groups produced", groups.len())
        );

        GroupingOutcome {
            groups,
            llm: true,
            cached: false,
        }
    }

    /// Build class-level insights for the given analyses, cached per class
    /// plus batch content. `force` skips the cache read but still writes.
    pub async fn build_class_insights(
        &self,
        records: &[AnalysisRecord],
        class_name: &str,
        force: bool,
    ) -> ClassInsight {
        if records.is_empty() {
            return ClassInsight::empty(class_name, self.gateway.is_available());
        }

        let unique = dedupe_latest_by_student(records);
        let key = class_fingerprint(&unique, class_name);

        if !force {
            if let Some(hit) = self.cache.get(&key).await {
                if let Ok(mut insight) = serde_json::from_value::<ClassInsight>(hit) {
                    insight.cached = true;
                    return insight;
                }
            }
        }

        let insight = self.compute_class_insights(&unique, class_name).await;
        if let Ok(payload) = serde_json::to_value(&insight) {
            self.cache.put(&key, payload).await;
        }
        insight
    }

    async fn compute_class_insights(
        &self,
        unique: &[AnalysisRecord],
        class_name: &str,
    ) -> ClassInsight {
        if !self.gateway.is_available() {
            return fallback_class_insights(unique, class_name);
        }

        log_engine_start!("grouping_engine", "build_class_insights", class_name = class_name);

        let lines: Vec<String> = unique
            .iter()
            .take(CLASS_PROMPT_LIMIT)
            .map(|r| record_prompt_line(r, false))
            .collect();
        let prompt = format!(
            "Class-level analyses (one per line):\n{}\n\
             Produce a JSON object as described in the system instruction.",
            lines.join("\n")
        );

        let request = GenerationRequest::new(prompt, CLASS_SYSTEM)
            .with_temperature(0.2)
            .with_max_output_tokens(1500);
        let result = self.gateway.generate(&request).await;
        if !result.success {
            log_engine_warn!(
                "grouping_engine",
                "build_class_insights",
                "model output rejected, using heuristic"
            );
            return fallback_class_insights(unique, class_name);
        }

        let data = result.data;
        let detailed: Vec<StudentDetail> = data
            .get("detailed")
            .and_then(Value::as_array)
            .map(|values| values.iter().take(40).map(sanitize_detail).collect())
            .unwrap_or_default();

        ClassInsight {
            class_name: data
                .get("class_name")
                .map(value_to_text)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| class_name.to_string()),
            student_count: coerce_i64(data.get("student_count")).unwrap_or(unique.len() as i64),
            average_error: coerce_f64(data.get("average_error")).unwrap_or(0.0),
            common_errors: bounded_list(data.get("commonErrors"), 120, 8),
            suggestions: bounded_list(data.get("suggestions"), 160, 8),
            detailed,
            llm: true,
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::models::AnalysisData;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn offline_engine() -> (GroupingEngine, ResultCache) {
        let gateway = Arc::new(ModelGateway::new(&ModelConfig {
            groq_api_key: None,
            groq_url: None,
            groq_model: None,
            gemini_api_key: None,
            gemini_model: None,
        }));
        let cache = ResultCache::new(120);
        (GroupingEngine::new(gateway, cache.clone()), cache)
    }

    fn record(id: &str, student: &str, pct: u8, age_secs: i64) -> AnalysisRecord {
        AnalysisRecord {
            id: id.to_string(),
            student_name: student.to_string(),
            subject: "Math".to_string(),
            timestamp: Utc::now() - Duration::seconds(age_secs),
            data: AnalysisData {
                image_url: None,
                detected_text: String::new(),
                main_error: "fractions".to_string(),
                error_percentage: pct,
                concepts: vec!["fractions".to_string()],
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
    fn dedupe_keeps_newest_per_student_in_first_seen_order() {
        let records = vec![
            record("a1", "Anna", 40, 100),
            record("b1", "Bruno", 50, 90),
            record("a2", "Anna", 20, 10),
        ];
        let unique = dedupe_latest_by_student(&records);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].id, "a2");
        assert_eq!(unique[1].id, "b1");
    }

    #[test]
    fn sanitize_group_bounds_fields_and_dedupes_members() {
        let raw = json!({
            "id": "needs-support-with-a-very-long-slug-that-never-ends-and-keeps-going",
            "name": "Support Group",
            "level": "banana",
            "students": [
                {"analysisId": "a1", "studentName": "Maria", "rationale": "fractions"},
                {"analysisId": "a9", "studentName": "Maria", "rationale": "repeat"},
                {"id": "a2", "studentName": "Jonas", "rationale": "place value"}
            ]
        });
        let group = sanitize_group(&raw);
        assert_eq!(group.id.chars().count(), 40);
        assert_eq!(group.level, GroupLevel::Medium);
        assert_eq!(group.color, "bg-gray-50 border-gray-200");
        assert_eq!(group.students.len(), 2);
        assert_eq!(group.students[0].analysis_id, "a1");
        assert_eq!(group.students[1].analysis_id, "a2");
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let (engine, cache) = offline_engine();
        let outcome = engine.build_groups(&[], false).await;
        assert!(outcome.groups.is_empty());
        assert!(!outcome.llm);
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let (engine, _cache) = offline_engine();
        let records = vec![record("a1", "Anna", 20, 0)];

        let first = engine.build_groups(&records, false).await;
        assert!(!first.cached);

        let second = engine.build_groups(&records, false).await;
        assert!(second.cached);
        assert_eq!(second.groups.len(), first.groups.len());
    }

    #[tokio::test]
    async fn force_bypasses_cache_read_but_still_writes() {
        let (engine, cache) = offline_engine();
        let records = vec![record("a1", "Anna", 20, 0)];
        let key = grouping_fingerprint(&dedupe_latest_by_student(&records));

        cache.put(&key, json!({"groups": [], "llm": true, "cached": false})).await;

        let outcome = engine.build_groups(&records, true).await;
        assert_eq!(outcome.groups.len(), 1);

        let stored = cache.get(&key).await.unwrap();
        let stored: GroupingOutcome = serde_json::from_value(stored).unwrap();
        assert_eq!(stored.groups.len(), 1);
    }

    #[tokio::test]
    async fn class_insights_dedupe_before_aggregating() {
        let (engine, _cache) = offline_engine();
        let records = vec![
            record("a1", "Anna", 80, 100),
            record("a2", "Anna", 20, 0),
            record("b1", "Bruno", 40, 0),
        ];
        let insight = engine.build_class_insights(&records, "5th A", false).await;
        assert_eq!(insight.student_count, 2);
        assert_eq!(insight.average_error, 30.0);
    }

    #[tokio::test]
    async fn class_insights_empty_structure() {
        let (engine, _cache) = offline_engine();
        let insight = engine.build_class_insights(&[], "5th A", false).await;
        assert_eq!(insight.class_name, "5th A");
        assert_eq!(insight.student_count, 0);
        assert!(insight.detailed.is_empty());
    }
}
