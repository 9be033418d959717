use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::fallback::fallback_analysis;
use crate::llm_gateway::ModelGateway;
use crate::models::{
    AnalysisRecord, AnalysisResult, ExerciseScore, GenerationRequest, LegacyAnalysis,
    MicroExercise,
};
use crate::sanitize::{bounded_string_list, truncate_chars, value_to_text};
use crate::{log_engine_start, log_engine_warn};

const ANALYSIS_SYSTEM: &str = "You are a pedagogical assistant. Generate strict JSON describing \
    student difficulties. Do not invent non-existent content beyond the provided text and \
    subject context.";

const ANALYSIS_SCHEMA_INSTRUCTIONS: &str = "Return ONLY a markdown block with valid JSON \
    containing keys: mainError (string), errorPercentage (0-100 int), concepts (list of up to 8 \
    strings), suggestions (list of up to 8 strings), reasoning (short string). Do not include \
    explanations outside the JSON block.";

const LEGACY_SYSTEM: &str = "You are a specialized pedagogical assistant. Analyze the student's \
    text and return ONLY a JSON with these specific keys: mainConcept (main concept being \
    studied), specificError (specific error identified in the text), isRecurrent (boolean - if \
    it's a common/recurrent error in this type of exercise), historicalAnalysis (detailed \
    analysis of patterns and historical context of student errors), suggestionForTeacher \
    (specific and practical suggestion for the teacher), generatedMicroExercise (list of 2-3 \
    micro-exercises in object format with 'sentence' and 'answer'). Be detailed in \
    historicalAnalysis and specific in suggestions. Do not add text outside the JSON.";

static NUMBERED_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+\s*[.)]").unwrap());
static QUESTION_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:question|questão|questoes|questões|q)\b").unwrap());
static PAREN_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\)").unwrap());
static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Heuristic count of how many exercises a submission contains.
///
/// Signals are tried in a fixed order and the first one that fires at least
/// twice wins: numbered lines, question words, "1)" style markers, question
/// marks, then substantial paragraphs. Anything else counts as a single
/// exercise.
fn detect_total_exercises(detected_text: &str) -> u32 {
    if detected_text.trim().is_empty() {
        return 1;
    }

    let numbered = detected_text
        .lines()
        .filter(|line| NUMBERED_LINE.is_match(line))
        .count();
    if numbered >= 2 {
        return numbered as u32;
    }

    let question_words = QUESTION_WORD.find_iter(detected_text).count();
    if question_words >= 2 {
        return question_words as u32;
    }

    let paren_numbers = PAREN_NUMBER.find_iter(detected_text).count();
    if paren_numbers >= 2 {
        return paren_numbers as u32;
    }

    let question_marks = detected_text.matches('?').count();
    if question_marks >= 2 {
        return question_marks as u32;
    }

    let paragraphs = PARAGRAPH_BREAK
        .split(detected_text)
        .filter(|p| p.trim().chars().count() > 30)
        .count();
    if paragraphs >= 2 {
        return paragraphs as u32;
    }

    1
}

// Round half to even, so a 50% error over an odd denominator does not get
// bumped up a whole exercise.
fn round_half_even(x: f64) -> i64 {
    let floor = x.floor();
    if x - floor == 0.5 {
        let lower = floor as i64;
        if lower % 2 == 0 {
            lower
        } else {
            lower + 1
        }
    } else {
        x.round() as i64
    }
}

fn score_from_error(error_percentage: u8, total: u32) -> ExerciseScore {
    let correct = round_half_even((100.0 - f64::from(error_percentage)) / 100.0 * f64::from(total));
    let correct = correct.clamp(0, i64::from(total)) as u32;
    ExerciseScore::new(correct, total)
}

fn sanitize_main_error(data: &serde_json::Map<String, Value>) -> String {
    let text = data
        .get("mainError")
        .map(value_to_text)
        .unwrap_or_else(|| "Unspecified".to_string());
    truncate_chars(&text, 200)
}

fn sanitize_percentage(data: &serde_json::Map<String, Value>) -> u8 {
    crate::sanitize::coerce_percentage(data.get("errorPercentage"))
}

fn sanitize_list(data: &serde_json::Map<String, Value>, key: &str, max_len: usize) -> Vec<String> {
    match data.get(key).and_then(Value::as_array) {
        Some(values) => bounded_string_list(values, max_len, 8),
        None => Vec::new(),
    }
}

/// First micro-exercise prompt from either payload, whichever carried one.
fn first_micro_exercise(
    data: &serde_json::Map<String, Value>,
    legacy: Option<&LegacyAnalysis>,
) -> Option<String> {
    if let Some(values) = data.get("generatedMicroExercise").and_then(Value::as_array) {
        if let Some(first) = values.first() {
            if let Ok(exercise) = serde_json::from_value::<MicroExercise>(first.clone()) {
                if let Some(sentence) = exercise.prompt_sentence() {
                    return Some(sentence.to_string());
                }
            }
        }
    }
    legacy
        .and_then(|l| l.generated_micro_exercise.first())
        .and_then(|e| e.prompt_sentence())
        .map(|s| s.to_string())
}

fn build_student_feedback(
    main_error: &str,
    suggestions: &[String],
    reasoning: &str,
    micro_sentence: Option<&str>,
) -> String {
    let guidance = suggestions.first().cloned().or_else(|| {
        reasoning
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .map(|line| truncate_chars(line, 150))
    });

    match micro_sentence {
        Some(sentence) => format!(
            "Hi {{student_name}}! I reviewed your work and noticed you struggled with: \"{}\". \
             Here's a short tip: {}. Try this short practice: {}",
            main_error,
            guidance.as_deref().unwrap_or("follow the steps above"),
            sentence
        ),
        None => format!(
            "Hi {{student_name}}! I reviewed your work and noticed you struggled with: \"{}\". \
             Here's a short tip: {}. Keep practicing and try similar exercises to improve.",
            main_error,
            guidance.as_deref().unwrap_or("review the related concept")
        ),
    }
}

/// Fill the student-name placeholder in a feedback template.
pub fn substitute_student_name(template: &str, student_name: &str) -> String {
    template.replace("{student_name}", student_name)
}

/// Best-effort second generation pass for the richer pedagogical schema.
/// Any failure degrades to `None`; the primary analysis never depends on it.
async fn request_legacy_analysis(
    gateway: &ModelGateway,
    detected_text: &str,
    subject: &str,
    main_error: &str,
) -> Option<LegacyAnalysis> {
    let prompt = format!(
        "Student OCR text: {}\n\nContext/Subject: {}\nPreliminary error summary: {}\n\n\
         Analyze deeply:\n\
         1. What is the main concept being worked on?\n\
         2. What specific error was made?\n\
         3. Is this error common/recurrent in this type of exercise?\n\
         4. Provide a detailed historical analysis about the patterns of this type of error\n\
         5. Give a specific and practical suggestion for the teacher\n\
         6. Generate 2-3 micro-exercises targeted to correct this specific error",
        truncate_chars(detected_text, 3000),
        subject,
        main_error
    );

    let request = GenerationRequest::new(prompt, LEGACY_SYSTEM).with_temperature(0.2);
    let result = gateway.generate(&request).await;
    if !result.success {
        log_engine_warn!("analysis_engine", "legacy_analysis", "second pass produced no usable JSON");
        return None;
    }
    serde_json::from_value(Value::Object(result.data)).ok()
}

/// Analyze one submission's recognized text into a normalized result.
///
/// Empty text short-circuits to a terminal "unreadable" result; without a
/// configured provider the heuristic path runs; otherwise the model output is
/// sanitized field by field and enriched with a score and feedback template.
pub async fn analyze_text(
    gateway: &ModelGateway,
    detected_text: &str,
    subject: &str,
) -> AnalysisResult {
    if detected_text.trim().is_empty() {
        return AnalysisResult {
            main_error: "Empty or unreadable submission".to_string(),
            error_percentage: 100,
            concepts: Vec::new(),
            suggestions: vec![
                "Send a clearer image".to_string(),
                "Check lighting and focus".to_string(),
            ],
            reasoning: "No text recognized".to_string(),
            raw_payload: None,
            legacy: None,
            score: None,
            student_feedback: None,
            llm: false,
        };
    }

    if !gateway.is_available() {
        return fallback_analysis(detected_text, subject);
    }

    log_engine_start!("analysis_engine", "analyze_text");

    let prompt = format!(
        "OCR Text (limited / sanitized):\n{}\n---\nSubject/Context: {}\n\n{}",
        truncate_chars(detected_text, 4000),
        subject,
        ANALYSIS_SCHEMA_INSTRUCTIONS
    );
    let request = GenerationRequest::new(prompt, ANALYSIS_SYSTEM).with_temperature(0.2);
    let result = gateway.generate(&request).await;
    if !result.success {
        log_engine_warn!("analysis_engine", "analyze_text", "model path failed, using heuristic");
        return fallback_analysis(detected_text, subject);
    }

    let data = result.data;
    let main_error = sanitize_main_error(&data);
    let error_percentage = sanitize_percentage(&data);
    let concepts = sanitize_list(&data, "concepts", 80);
    let suggestions = sanitize_list(&data, "suggestions", 120);
    let reasoning = truncate_chars(
        &data.get("reasoning").map(value_to_text).unwrap_or_default(),
        500,
    );

    let legacy = request_legacy_analysis(gateway, detected_text, subject, &main_error).await;

    let total = detect_total_exercises(detected_text);
    let score = score_from_error(error_percentage, total);
    debug!(total, correct = score.correct, "Derived exercise score");

    let micro_sentence = first_micro_exercise(&data, legacy.as_ref());
    let student_feedback = build_student_feedback(
        &main_error,
        &suggestions,
        &reasoning,
        micro_sentence.as_deref(),
    );

    AnalysisResult {
        main_error,
        error_percentage,
        concepts,
        suggestions,
        reasoning,
        raw_payload: Some(Value::Object(data)),
        legacy,
        score: Some(score),
        student_feedback: Some(student_feedback),
        llm: true,
    }
}

fn rank_by_frequency<I>(items: I, top: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: Vec<(String, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(existing, _)| *existing == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    let mut ranked: Vec<(usize, String, usize)> = counts
        .into_iter()
        .enumerate()
        .map(|(idx, (item, n))| (idx, item, n))
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(top).map(|(_, item, _)| item).collect()
}

fn payload_string_list(payload: Option<&Value>, key: &str) -> Vec<String> {
    payload
        .and_then(|p| p.get(key))
        .and_then(Value::as_array)
        .map(|values| values.iter().map(value_to_text).collect())
        .unwrap_or_default()
}

/// Textual summary of a student's prior analyses, built from fields that were
/// already computed so no extra model calls are spent. `None` when there is
/// no history.
pub fn compute_historical_summary(
    records: &[AnalysisRecord],
    student_name: &str,
    subject: &str,
) -> Option<String> {
    if student_name.is_empty() || records.is_empty() {
        return None;
    }

    let mut main_errors: Vec<String> = Vec::new();
    let mut concepts: Vec<String> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut recurring_count = 0usize;

    for record in records {
        let data = &record.data;
        let specific = data
            .legacy
            .as_ref()
            .and_then(|l| l.specific_error.clone())
            .filter(|e| !e.is_empty());
        match specific {
            Some(error) => main_errors.push(error),
            None if !data.main_error.is_empty() => main_errors.push(data.main_error.clone()),
            None => {}
        }

        let payload_concepts = payload_string_list(data.raw_payload.as_ref(), "concepts");
        if payload_concepts.is_empty() {
            concepts.extend(data.concepts.iter().cloned());
        } else {
            concepts.extend(payload_concepts);
        }

        let payload_suggestions = payload_string_list(data.raw_payload.as_ref(), "suggestions");
        if payload_suggestions.is_empty() {
            suggestions.extend(data.suggestions.iter().cloned());
        } else {
            suggestions.extend(payload_suggestions);
        }

        if data
            .legacy
            .as_ref()
            .and_then(|l| l.is_recurrent)
            .unwrap_or(false)
        {
            recurring_count += 1;
        }
    }

    let top_errors = rank_by_frequency(main_errors, 3);
    let top_concepts = rank_by_frequency(concepts, 5);
    let top_suggestions = rank_by_frequency(suggestions, 5);

    let mut parts = vec![format!(
        "Historical summary based on {} previous analyses for {} ({}).",
        records.len(),
        student_name,
        subject
    )];
    if !top_errors.is_empty() {
        parts.push(format!("Most frequent issues: {}.", top_errors.join(", ")));
    }
    if !top_concepts.is_empty() {
        parts.push(format!(
            "Related concepts often involved: {}.",
            top_concepts.join(", ")
        ));
    }
    if recurring_count > 0 {
        parts.push(format!(
            "Detected {} cases flagged as recurrent patterns.",
            recurring_count
        ));
    }
    if !top_suggestions.is_empty() {
        parts.push(format!(
            "Common suggestions previously given: {}.",
            top_suggestions.join(", ")
        ));
    }
    parts.push(
        "Recommendation: focus targeted practice on the most frequent issues and review the \
         related concepts listed above."
            .to_string(),
    );

    Some(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::models::AnalysisData;
    use chrono::Utc;

    fn offline_gateway() -> ModelGateway {
        ModelGateway::new(&ModelConfig {
            groq_api_key: None,
            groq_url: None,
            groq_model: None,
            gemini_api_key: None,
            gemini_model: None,
        })
    }

    #[test]
    fn exercise_count_prefers_numbered_lines() {
        let text = "1. Solve for x\n2) Simplify the fraction\n3. Explain your answer";
        assert_eq!(detect_total_exercises(text), 3);
    }

    #[test]
    fn exercise_count_uses_question_marks_when_unnumbered() {
        let text = "What is 2+2? And what about 3+3?";
        assert_eq!(detect_total_exercises(text), 2);
    }

    #[test]
    fn exercise_count_defaults_to_one() {
        assert_eq!(detect_total_exercises(""), 1);
        assert_eq!(detect_total_exercises("a single answer with no structure"), 1);
    }

    #[test]
    fn score_rounds_and_clamps() {
        assert_eq!(score_from_error(30, 6).label, "4/6");
        assert_eq!(score_from_error(0, 4).label, "4/4");
        assert_eq!(score_from_error(100, 4).label, "0/4");
    }

    #[test]
    fn score_breaks_ties_toward_even() {
        // 0.5 rounds down to 0, 1.5 rounds up to 2
        assert_eq!(score_from_error(50, 1).label, "0/1");
        assert_eq!(score_from_error(25, 2).label, "2/2");
        assert_eq!(score_from_error(50, 3).label, "2/3");
        assert_eq!(score_from_error(50, 5).label, "2/5");
    }

    #[tokio::test]
    async fn empty_text_is_terminal() {
        let gateway = offline_gateway();
        let result = analyze_text(&gateway, "   \n  ", "Math").await;
        assert_eq!(result.error_percentage, 100);
        assert_eq!(result.main_error, "Empty or unreadable submission");
        assert!(result.concepts.is_empty());
        assert!(!result.llm);
    }

    #[tokio::test]
    async fn empty_text_never_reaches_the_model() {
        // Credentials are configured, so only the early return keeps the
        // request counter at zero.
        let gateway = ModelGateway::new(&ModelConfig {
            groq_api_key: Some("gsk-test".to_string()),
            groq_url: None,
            groq_model: None,
            gemini_api_key: None,
            gemini_model: None,
        });
        assert!(gateway.is_available());

        let result = analyze_text(&gateway, "   ", "Math").await;
        assert_eq!(result.error_percentage, 100);
        assert_eq!(gateway.metrics().requests, 0);
    }

    #[tokio::test]
    async fn offline_gateway_takes_heuristic_path() {
        let gateway = offline_gateway();
        let result = analyze_text(&gateway, "some student work here", "Algebra").await;
        assert!(!result.llm);
        assert!((15..=85).contains(&result.error_percentage));
    }

    #[test]
    fn feedback_template_keeps_placeholder_until_substituted() {
        let feedback = build_student_feedback("fractions", &[], "", None);
        assert!(feedback.contains("{student_name}"));
        let filled = substitute_student_name(&feedback, "Anna");
        assert!(filled.contains("Hi Anna!"));
        assert!(!filled.contains("{student_name}"));
    }

    #[test]
    fn feedback_prefers_first_suggestion_and_micro_exercise() {
        let suggestions = vec!["practice simplifying".to_string(), "other".to_string()];
        let feedback =
            build_student_feedback("fractions", &suggestions, "reasoning", Some("Simplify 4/8"));
        assert!(feedback.contains("practice simplifying"));
        assert!(feedback.contains("Try this short practice: Simplify 4/8"));
    }

    fn history_record(main_error: &str, specific: Option<&str>, recurrent: bool) -> AnalysisRecord {
        AnalysisRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_name: "Anna".to_string(),
            subject: "Math".to_string(),
            timestamp: Utc::now(),
            data: AnalysisData {
                image_url: None,
                detected_text: String::new(),
                main_error: main_error.to_string(),
                error_percentage: 40,
                concepts: vec!["fractions".to_string()],
                suggestions: vec!["practice".to_string()],
                reasoning: None,
                raw_payload: None,
                legacy: specific.map(|s| LegacyAnalysis {
                    specific_error: Some(s.to_string()),
                    is_recurrent: Some(recurrent),
                    ..Default::default()
                }),
                score: None,
                student_feedback: None,
            },
        }
    }

    #[test]
    fn historical_summary_requires_history() {
        assert!(compute_historical_summary(&[], "Anna", "Math").is_none());
        assert!(compute_historical_summary(&[history_record("x", None, false)], "", "Math").is_none());
    }

    #[test]
    fn historical_summary_prefers_specific_errors() {
        let records = vec![
            history_record("generic slip", Some("misplaced decimal"), true),
            history_record("generic slip", None, false),
        ];
        let summary = compute_historical_summary(&records, "Anna", "Math").unwrap();
        assert!(summary.contains("2 previous analyses for Anna (Math)"));
        assert!(summary.contains("misplaced decimal"));
        assert!(summary.contains("Detected 1 cases flagged as recurrent patterns."));
        assert!(summary.contains("Recommendation:"));
    }
}
