use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use tracing::info;

use crate::{
    analysis::{analyze_text, compute_historical_summary, substitute_student_name},
    database::Database,
    errors::{classify_database_error, ApiError, ErrorContext},
    grouping::GroupingEngine,
    llm_gateway::ModelGateway,
    models::*,
    transcription::TranscriptionEngine,
};

// Import logging macros
use crate::{log_api_start, log_api_success, log_api_warn, log_engine_error};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub gateway: Arc<ModelGateway>,
    pub grouping: Arc<GroupingEngine>,
    pub transcription: Arc<TranscriptionEngine>,
}

type ErrorResponse = (StatusCode, Json<ApiResponse<()>>);

#[derive(Deserialize)]
pub struct CreateStudentRequest {
    pub name: String,
    pub class_name: String,
}

#[derive(Deserialize)]
pub struct StudentsQuery {
    pub class_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ForceQuery {
    pub force: Option<bool>,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Serialize)]
pub struct StudentsPayload {
    pub students: Vec<Student>,
}

#[derive(Serialize)]
pub struct StudentPayload {
    pub student: Student,
}

#[derive(Serialize)]
pub struct ClassSummary {
    pub class_name: String,
    pub student_count: usize,
}

#[derive(Serialize)]
pub struct ClassesPayload {
    pub classes: Vec<ClassSummary>,
}

#[derive(Serialize)]
pub struct AnalysesPayload {
    pub analyses: Vec<AnalysisRecord>,
}

#[derive(Serialize)]
pub struct ClassGroupsPayload {
    pub groups: Vec<ClassAnalyses>,
}

#[derive(Serialize)]
pub struct OcrInfo {
    pub filename: String,
    pub transcription_engine: String,
}

#[derive(Serialize)]
pub struct AnalyzeExercisePayload {
    pub analysis: AnalysisRecord,
    pub ocr_info: OcrInfo,
}

#[derive(Serialize)]
pub struct TranscriptionPayload {
    pub filename: String,
    pub detected_text: String,
}

// Status endpoints

pub async fn status() -> Json<Value> {
    Json(json!({
        "Status": "The Pedagogical Radar engine is running!",
        "version": "2.0.0"
    }))
}

// Student endpoints

pub async fn get_students(
    State(state): State<AppState>,
    Query(query): Query<StudentsQuery>,
) -> Result<Json<ApiResponse<StudentsPayload>>, ErrorResponse> {
    log_api_start!("get_students");

    match state.db.list_students(query.class_name.as_deref()).await {
        Ok(students) => {
            log_api_success!("get_students", count = students.len(), "students listed");
            Ok(Json(ApiResponse::success(StudentsPayload { students })))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_students", "student");
            Err(error.to_response_with_context(context))
        }
    }
}

pub async fn create_student(
    State(state): State<AppState>,
    Json(request): Json<CreateStudentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<StudentPayload>>), ErrorResponse> {
    log_api_start!("create_student");

    if request.name.trim().is_empty() || request.class_name.trim().is_empty() {
        let error = ApiError::ValidationError("name and class_name must not be empty".to_string());
        let context = ErrorContext::new("create_student", "student");
        return Err(error.to_response_with_context(context));
    }

    match state
        .db
        .create_student(request.name.trim(), request.class_name.trim())
        .await
    {
        Ok(student) => {
            log_api_success!("create_student", student_id = student.id, "student created");
            Ok((
                StatusCode::CREATED,
                Json(ApiResponse::success(StudentPayload { student })),
            ))
        }
        Err(e) => {
            let classified = classify_database_error(&e);
            let context = ErrorContext::new("create_student", "student");
            Err(classified.to_response_with_context(context))
        }
    }
}

pub async fn get_student(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
) -> Result<Json<ApiResponse<Student>>, ErrorResponse> {
    log_api_start!("get_student", student_id = student_id);

    match state.db.get_student(&student_id).await {
        Ok(Some(student)) => Ok(Json(ApiResponse::success(student))),
        Ok(None) => {
            log_api_warn!("get_student", student_id = student_id, "student not found");
            let message = format!("Student with ID '{}' not found", student_id);
            let error = ApiError::NotFound(message.clone());
            let context = ErrorContext::new("get_student", "student")
                .with_id(&student_id)
                .with_user_message(&message);
            Err(error.to_response_with_context(context))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_student", "student").with_id(&student_id);
            Err(error.to_response_with_context(context))
        }
    }
}

pub async fn remove_student(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
) -> Result<StatusCode, ErrorResponse> {
    log_api_start!("remove_student", student_id = student_id);

    match state.db.delete_student(&student_id).await {
        Ok(true) => {
            log_api_success!("remove_student", student_id = student_id, "student deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => {
            let message = format!("Student with ID '{}' not found", student_id);
            let error = ApiError::NotFound(message.clone());
            let context = ErrorContext::new("remove_student", "student")
                .with_id(&student_id)
                .with_user_message(&message);
            Err(error.to_response_with_context(context))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("remove_student", "student").with_id(&student_id);
            Err(error.to_response_with_context(context))
        }
    }
}

// Class endpoints

pub async fn get_classes(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ClassesPayload>>, ErrorResponse> {
    log_api_start!("get_classes");

    let students = match state.db.list_students(None).await {
        Ok(students) => students,
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_classes", "class");
            return Err(error.to_response_with_context(context));
        }
    };

    let mut classes: Vec<ClassSummary> = Vec::new();
    for student in students {
        let class_name = if student.class_name.is_empty() {
            "Unknown".to_string()
        } else {
            student.class_name
        };
        match classes.iter_mut().find(|c| c.class_name == class_name) {
            Some(summary) => summary.student_count += 1,
            None => classes.push(ClassSummary {
                class_name,
                student_count: 1,
            }),
        }
    }
    classes.sort_by(|a, b| a.class_name.cmp(&b.class_name));

    Ok(Json(ApiResponse::success(ClassesPayload { classes })))
}

pub async fn get_class_insights(
    State(state): State<AppState>,
    Path(class_name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<ApiResponse<ClassInsight>>, ErrorResponse> {
    log_api_start!("get_class_insights", class_name = class_name);

    let students = match state.db.list_students(Some(&class_name)).await {
        Ok(students) => students,
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_class_insights", "class").with_id(&class_name);
            return Err(error.to_response_with_context(context));
        }
    };
    if students.is_empty() {
        let error = ApiError::NotFound("Class not found or has no students".to_string());
        let context = ErrorContext::new("get_class_insights", "class")
            .with_id(&class_name)
            .with_user_message("Class not found or has no students");
        return Err(error.to_response_with_context(context));
    }

    // Most recent analysis per student in the class
    let mut records: Vec<AnalysisRecord> = Vec::new();
    for student in &students {
        match state.db.list_analyses_by_student(&student.name, None).await {
            Ok(analyses) => {
                if let Some(latest) = analyses.into_iter().next() {
                    records.push(latest);
                }
            }
            Err(e) => {
                let error = ApiError::DatabaseError(e);
                let context =
                    ErrorContext::new("get_class_insights", "class").with_id(&class_name);
                return Err(error.to_response_with_context(context));
            }
        }
    }

    let force = query.force.unwrap_or(false);
    let insights = state
        .grouping
        .build_class_insights(&records, &class_name, force)
        .await;
    log_api_success!("get_class_insights", class_name = class_name, "class insights built");
    Ok(Json(ApiResponse::success(insights)))
}

// Analysis endpoints

pub async fn get_analyses(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<AnalysesPayload>>, ErrorResponse> {
    log_api_start!("get_analyses");

    match state.db.list_analyses().await {
        Ok(analyses) => {
            log_api_success!("get_analyses", count = analyses.len(), "analyses listed");
            Ok(Json(ApiResponse::success(AnalysesPayload { analyses })))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_analyses", "analysis");
            Err(error.to_response_with_context(context))
        }
    }
}

pub async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> Result<Json<ApiResponse<AnalysisRecord>>, ErrorResponse> {
    log_api_start!("get_analysis", analysis_id = analysis_id);

    match state.db.get_analysis(&analysis_id).await {
        Ok(Some(analysis)) => Ok(Json(ApiResponse::success(analysis))),
        Ok(None) => {
            let message = format!("Analysis with ID '{}' not found", analysis_id);
            let error = ApiError::NotFound(message.clone());
            let context = ErrorContext::new("get_analysis", "analysis")
                .with_id(&analysis_id)
                .with_user_message(&message);
            Err(error.to_response_with_context(context))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_analysis", "analysis").with_id(&analysis_id);
            Err(error.to_response_with_context(context))
        }
    }
}

struct ExerciseUpload {
    filename: String,
    mime_type: String,
    bytes: Vec<u8>,
    student_id: Option<String>,
    subject: String,
}

async fn read_exercise_upload(mut multipart: Multipart) -> Result<ExerciseUpload, ApiError> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut student_id: Option<String> = None;
    let mut subject = "Mathematics".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart payload: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.jpg")
                    .to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("image/jpeg")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
                file = Some((filename, mime_type, bytes.to_vec()));
            }
            Some("student_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?;
                if !value.is_empty() {
                    student_id = Some(value);
                }
            }
            Some("subject") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?;
                if !value.trim().is_empty() {
                    subject = value;
                }
            }
            _ => {}
        }
    }

    let (filename, mime_type, bytes) =
        file.ok_or_else(|| ApiError::BadRequest("Missing 'file' field".to_string()))?;
    Ok(ExerciseUpload {
        filename,
        mime_type,
        bytes,
        student_id,
        subject,
    })
}

/// Full pipeline: transcription, pedagogical analysis, history enrichment,
/// persistence.
pub async fn analyze_exercise(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<AnalyzeExercisePayload>>, ErrorResponse> {
    log_api_start!("analyze_exercise");

    let upload = match read_exercise_upload(multipart).await {
        Ok(upload) => upload,
        Err(error) => {
            let context = ErrorContext::new("analyze_exercise", "analysis");
            return Err(error.to_response_with_context(context));
        }
    };

    let student_name = match &upload.student_id {
        Some(student_id) => match state.db.get_student(student_id).await {
            Ok(Some(student)) => student.name,
            Ok(None) => "Unknown Student".to_string(),
            Err(e) => {
                let error = ApiError::DatabaseError(e);
                let context = ErrorContext::new("analyze_exercise", "student").with_id(student_id);
                return Err(error.to_response_with_context(context));
            }
        },
        None => "Unknown Student".to_string(),
    };

    let detected_text = match state
        .transcription
        .transcribe_image(&upload.bytes, &upload.mime_type)
        .await
    {
        Ok(text) => text,
        Err(e) => {
            log_engine_error!("transcription_engine", "transcribe_image", error = e);
            let error = ApiError::ModelError(format!("Failed to transcribe image: {}", e));
            let context = ErrorContext::new("analyze_exercise", "analysis");
            return Err(error.to_response_with_context(context));
        }
    };

    let result = analyze_text(&state.gateway, &detected_text, &upload.subject).await;

    // Fill in the historical analysis from stored records instead of spending
    // another model call.
    let mut legacy = result.legacy;
    let needs_history = legacy
        .as_ref()
        .map(|l| l.historical_analysis.is_none())
        .unwrap_or(true);
    if needs_history {
        let history = match state
            .db
            .list_analyses_by_student(&student_name, Some(&upload.subject))
            .await
        {
            Ok(records) => compute_historical_summary(&records, &student_name, &upload.subject),
            Err(_) => None,
        };
        if let Some(summary) = history {
            let entry = legacy.get_or_insert_with(LegacyAnalysis::default);
            entry.historical_analysis = Some(summary);
        }
    }

    let student_feedback = result
        .student_feedback
        .map(|template| substitute_student_name(&template, &student_name));

    let record = AnalysisRecord {
        id: Uuid::new_v4().to_string(),
        student_name,
        subject: upload.subject.clone(),
        timestamp: Utc::now(),
        data: AnalysisData {
            image_url: None,
            detected_text,
            main_error: result.main_error,
            error_percentage: result.error_percentage,
            concepts: result.concepts,
            suggestions: result.suggestions,
            reasoning: Some(result.reasoning),
            raw_payload: result.raw_payload,
            legacy,
            score: result.score,
            student_feedback,
        },
    };

    if let Err(e) = state.db.insert_analysis(&record).await {
        let error = ApiError::DatabaseError(e);
        let context = ErrorContext::new("analyze_exercise", "analysis").with_id(&record.id);
        return Err(error.to_response_with_context(context));
    }

    log_api_success!("analyze_exercise", analysis_id = record.id, "analysis stored");
    Ok(Json(ApiResponse::success(AnalyzeExercisePayload {
        analysis: record,
        ocr_info: OcrInfo {
            filename: upload.filename,
            transcription_engine: "Gemini 2.5 Flash".to_string(),
        },
    })))
}

/// Transcription only, no analysis or persistence.
pub async fn analyze_simple(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<TranscriptionPayload>>, ErrorResponse> {
    log_api_start!("analyze_simple");

    let upload = match read_exercise_upload(multipart).await {
        Ok(upload) => upload,
        Err(error) => {
            let context = ErrorContext::new("analyze_simple", "transcription");
            return Err(error.to_response_with_context(context));
        }
    };

    match state
        .transcription
        .transcribe_image(&upload.bytes, &upload.mime_type)
        .await
    {
        Ok(detected_text) => {
            info!(filename = %upload.filename, "Image transcribed");
            Ok(Json(ApiResponse::success(TranscriptionPayload {
                filename: upload.filename,
                detected_text,
            })))
        }
        Err(e) => {
            log_engine_error!("transcription_engine", "transcribe_image", error = e);
            let error = ApiError::ModelError(format!("Failed to transcribe image: {}", e));
            let context = ErrorContext::new("analyze_simple", "transcription");
            Err(error.to_response_with_context(context))
        }
    }
}

// Grouping endpoints

pub async fn get_student_groups(
    State(state): State<AppState>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<ApiResponse<GroupingOutcome>>, ErrorResponse> {
    log_api_start!("get_student_groups");
    build_groups_response(&state, query.force.unwrap_or(false)).await
}

pub async fn recompute_student_groups(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<GroupingOutcome>>, ErrorResponse> {
    log_api_start!("recompute_student_groups");
    build_groups_response(&state, true).await
}

async fn build_groups_response(
    state: &AppState,
    force: bool,
) -> Result<Json<ApiResponse<GroupingOutcome>>, ErrorResponse> {
    let records = match state.db.list_analyses().await {
        Ok(records) => records,
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_student_groups", "grouping");
            return Err(error.to_response_with_context(context));
        }
    };

    let outcome = state.grouping.build_groups(&records, force).await;
    log_api_success!(
        "get_student_groups",
        count = outcome.groups.len(),
        "grouping computed"
    );
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn get_analyses_by_class(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ClassGroupsPayload>>, ErrorResponse> {
    log_api_start!("get_analyses_by_class");

    match state.db.list_analyses_grouped_by_class().await {
        Ok(groups) => {
            log_api_success!("get_analyses_by_class", count = groups.len(), "classes aggregated");
            Ok(Json(ApiResponse::success(ClassGroupsPayload { groups })))
        }
        Err(e) => {
            let error = ApiError::DatabaseError(e);
            let context = ErrorContext::new("get_analyses_by_class", "analysis");
            Err(error.to_response_with_context(context))
        }
    }
}

// Observability

pub async fn get_model_metrics(
    State(state): State<AppState>,
) -> Json<ApiResponse<ModelMetrics>> {
    Json(ApiResponse::success(state.gateway.metrics()))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Status
        .route("/", get(status))
        // Student routes
        .route("/students", get(get_students))
        .route("/students", post(create_student))
        .route("/students/:student_id", get(get_student))
        .route("/students/:student_id", delete(remove_student))
        // Class routes
        .route("/classes", get(get_classes))
        .route("/classes/:class_name", get(get_class_insights))
        // Analysis routes
        .route("/analyses", get(get_analyses))
        .route("/analyses/:analysis_id", get(get_analysis))
        .route("/analyze_exercise", post(analyze_exercise))
        .route("/analyze_simple", post(analyze_simple))
        // Grouping routes
        .route("/student_groups", get(get_student_groups))
        .route("/student_groups/recompute", post(recompute_student_groups))
        .route("/analyses_by_class", get(get_analyses_by_class))
        // Observability
        .route("/model_metrics", get(get_model_metrics))
        .with_state(state)
}
