use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A student known to the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub class_name: String,
}

/// A single generation call against the model gateway. Constructed per call,
/// never mutated.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: String,
    pub temperature: f32,
    pub max_retries: u32,
    pub max_output_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            temperature: 0.1,
            max_retries: 2,
            max_output_tokens: 512,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Outcome of one gateway call. `data` holds the extracted JSON object when
/// `success` is true; `llm_enabled` distinguishes "the model failed" from
/// "no model is configured".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub success: bool,
    pub data: serde_json::Map<String, Value>,
    pub raw: String,
    pub error: Option<String>,
    pub llm_enabled: bool,
}

impl GenerationResult {
    pub fn disabled(reason: &str) -> Self {
        Self {
            success: false,
            data: serde_json::Map::new(),
            raw: String::new(),
            error: Some(reason.to_string()),
            llm_enabled: false,
        }
    }
}

/// Derived exercise score, e.g. "3/4".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseScore {
    pub correct: u32,
    pub total: u32,
    pub label: String,
}

impl ExerciseScore {
    pub fn new(correct: u32, total: u32) -> Self {
        Self {
            correct,
            total,
            label: format!("{}/{}", correct, total),
        }
    }
}

/// One micro-exercise from the legacy enrichment schema. Models return these
/// either as plain strings or as objects keyed `sentence`/`prompt` + `answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MicroExercise {
    Text(String),
    Item {
        #[serde(default)]
        sentence: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        answer: Option<String>,
    },
}

impl MicroExercise {
    /// The prompt sentence of the exercise, whichever key carried it.
    pub fn prompt_sentence(&self) -> Option<&str> {
        match self {
            MicroExercise::Text(s) => Some(s.as_str()),
            MicroExercise::Item {
                sentence, prompt, ..
            } => sentence.as_deref().or(prompt.as_deref()),
        }
    }
}

/// Richer "legacy" pedagogical schema, requested as a best-effort second
/// generation call. Every field is optional: the decode boundary tolerates
/// whatever subset the model produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyAnalysis {
    #[serde(rename = "mainConcept", skip_serializing_if = "Option::is_none")]
    pub main_concept: Option<String>,
    #[serde(rename = "specificError", skip_serializing_if = "Option::is_none")]
    pub specific_error: Option<String>,
    #[serde(rename = "isRecurrent", skip_serializing_if = "Option::is_none")]
    pub is_recurrent: Option<bool>,
    #[serde(rename = "historicalAnalysis", skip_serializing_if = "Option::is_none")]
    pub historical_analysis: Option<String>,
    #[serde(rename = "suggestionForTeacher", skip_serializing_if = "Option::is_none")]
    pub suggestion_for_teacher: Option<String>,
    #[serde(rename = "generatedMicroExercise")]
    pub generated_micro_exercise: Vec<MicroExercise>,
}

/// Normalized per-submission analysis. Created once, stored immutably; the
/// `llm` flag records whether the model path or a heuristic produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(rename = "mainError")]
    pub main_error: String,
    #[serde(rename = "errorPercentage")]
    pub error_percentage: u8,
    pub concepts: Vec<String>,
    pub suggestions: Vec<String>,
    pub reasoning: String,
    #[serde(rename = "ai_analysis", skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Value>,
    #[serde(rename = "ai_structured", skip_serializing_if = "Option::is_none")]
    pub legacy: Option<LegacyAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ExerciseScore>,
    #[serde(rename = "studentFeedback", skip_serializing_if = "Option::is_none")]
    pub student_feedback: Option<String>,
    pub llm: bool,
}

/// The document-shaped payload stored alongside each analysis record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisData {
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub detected_text: String,
    #[serde(rename = "mainError", default)]
    pub main_error: String,
    #[serde(rename = "errorPercentage", default)]
    pub error_percentage: u8,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(rename = "ai_analysis", default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Value>,
    #[serde(rename = "ai_structured", default, skip_serializing_if = "Option::is_none")]
    pub legacy: Option<LegacyAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ExerciseScore>,
    #[serde(rename = "studentFeedback", default, skip_serializing_if = "Option::is_none")]
    pub student_feedback: Option<String>,
}

/// A persisted analysis record: one submission by one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub data: AnalysisData,
}

/// Performance tier of a learning group. `High` names the lowest-error
/// bucket (low error = high performance); downstream consumers rely on this
/// mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupLevel {
    High,
    #[default]
    Medium,
    Low,
}

/// Membership entry inside one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    #[serde(rename = "analysisId")]
    pub analysis_id: String,
    #[serde(rename = "studentName")]
    pub student_name: String,
    pub rationale: String,
}

/// An explainable learning group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub level: GroupLevel,
    pub color: String,
    pub description: String,
    pub criteria: String,
    #[serde(rename = "commonErrors")]
    pub common_errors: Vec<String>,
    pub suggestions: Vec<String>,
    pub students: Vec<GroupMember>,
}

/// Result of one grouping pass: groups plus provenance flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingOutcome {
    pub groups: Vec<Group>,
    pub llm: bool,
    pub cached: bool,
}

/// Per-student row inside a class insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentDetail {
    #[serde(rename = "studentName")]
    pub student_name: Option<String>,
    #[serde(rename = "analysisId")]
    pub analysis_id: String,
    #[serde(rename = "errorPercentage")]
    pub error_percentage: Option<i64>,
    #[serde(rename = "shortRationale")]
    pub short_rationale: String,
}

/// Class-level aggregation view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInsight {
    pub class_name: String,
    pub student_count: i64,
    pub average_error: f64,
    #[serde(rename = "commonErrors")]
    pub common_errors: Vec<String>,
    pub suggestions: Vec<String>,
    pub detailed: Vec<StudentDetail>,
    pub llm: bool,
    pub cached: bool,
}

impl ClassInsight {
    /// Zeroed structure returned for a class with no analyses.
    pub fn empty(class_name: &str, llm: bool) -> Self {
        Self {
            class_name: class_name.to_string(),
            student_count: 0,
            average_error: 0.0,
            common_errors: Vec::new(),
            suggestions: Vec::new(),
            detailed: Vec::new(),
            llm,
            cached: false,
        }
    }
}

/// Snapshot of gateway counters, for observability only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub requests: u64,
    pub errors: u64,
    pub last_latency_ms: Option<u64>,
}

/// Analyses of one class, as returned by the grouped-by-class view.
#[derive(Debug, Clone, Serialize)]
pub struct ClassAnalyses {
    pub class_name: String,
    pub analyses: Vec<AnalysisRecord>,
    pub count: usize,
    pub average_error: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_request_defaults_and_builders() {
        let request = GenerationRequest::new("prompt", "system");
        assert_eq!(request.temperature, 0.1);
        assert_eq!(request.max_retries, 2);
        assert_eq!(request.max_output_tokens, 512);

        let request = request
            .with_temperature(0.25)
            .with_max_retries(4)
            .with_max_output_tokens(5048);
        assert_eq!(request.temperature, 0.25);
        assert_eq!(request.max_retries, 4);
        assert_eq!(request.max_output_tokens, 5048);
    }

    #[test]
    fn micro_exercise_accepts_both_shapes() {
        let text: MicroExercise = serde_json::from_value(serde_json::json!("Simplify 4/8")).unwrap();
        assert_eq!(text.prompt_sentence(), Some("Simplify 4/8"));

        let item: MicroExercise = serde_json::from_value(
            serde_json::json!({"sentence": "Solve 2x = 4", "answer": "x = 2"}),
        )
        .unwrap();
        assert_eq!(item.prompt_sentence(), Some("Solve 2x = 4"));
    }
}
