#[cfg(test)]
mod tests {
    use crate::api::{create_router, AppState};
    use crate::config::ModelConfig;
    use crate::database::Database;
    use crate::grouping::GroupingEngine;
    use crate::llm_gateway::ModelGateway;
    use crate::models::{AnalysisData, AnalysisRecord};
    use crate::result_cache::ResultCache;
    use crate::transcription::TranscriptionEngine;
    use axum::http::StatusCode;
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::TestServer;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn offline_model_config() -> ModelConfig {
        ModelConfig {
            groq_api_key: None,
            groq_url: None,
            groq_model: None,
            gemini_api_key: None,
            gemini_model: None,
        }
    }

    async fn test_server() -> (TestServer, Database) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let config = offline_model_config();
        let gateway = Arc::new(ModelGateway::new(&config));
        let grouping = Arc::new(GroupingEngine::new(gateway.clone(), ResultCache::new(120)));
        let transcription = Arc::new(TranscriptionEngine::new(&config));

        let state = AppState {
            db: db.clone(),
            gateway,
            grouping,
            transcription,
        };
        (TestServer::new(create_router(state)).unwrap(), db)
    }

    fn analysis_record(id: &str, student: &str, pct: u8) -> AnalysisRecord {
        AnalysisRecord {
            id: id.to_string(),
            student_name: student.to_string(),
            subject: "Mathematics".to_string(),
            timestamp: Utc::now(),
            data: AnalysisData {
                image_url: None,
                detected_text: "1. 2+2=5".to_string(),
                main_error: "arithmetic slip".to_string(),
                error_percentage: pct,
                concepts: vec!["addition".to_string()],
                suggestions: Vec::new(),
                reasoning: None,
                raw_payload: None,
                legacy: None,
                score: None,
                student_feedback: None,
            },
        }
    }

    #[tokio::test]
    async fn status_endpoint_reports_running() {
        let (server, _db) = test_server().await;
        let response = server.get("/").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["version"], "2.0.0");
    }

    #[tokio::test]
    async fn students_listing_and_class_filter() {
        let (server, _db) = test_server().await;

        let response = server.get("/students").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert!(body["success"].as_bool().unwrap());
        assert_eq!(body["data"]["students"].as_array().unwrap().len(), 8);

        let response = server.get("/students").add_query_param("class_name", "6th Z").await;
        let body: Value = response.json();
        assert!(body["data"]["students"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn student_creation_conflict_and_validation() {
        let (server, _db) = test_server().await;

        let response = server
            .post("/students")
            .json(&json!({"name": "Nina Lopez", "class_name": "6th B"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body: Value = response.json();
        let student_id = body["data"]["student"]["id"].as_str().unwrap().to_string();

        let response = server
            .post("/students")
            .json(&json!({"name": "nina lopez", "class_name": "6TH B"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::CONFLICT);

        let response = server
            .post("/students")
            .json(&json!({"name": "  ", "class_name": "6th B"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

        let response = server.delete(&format!("/students/{}", student_id)).await;
        assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
        let response = server.delete(&format!("/students/{}", student_id)).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_student_is_not_found() {
        let (server, _db) = test_server().await;
        let response = server.get("/students/not-a-real-id").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert!(!body["success"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn classes_listing_counts_students() {
        let (server, _db) = test_server().await;
        let response = server.get("/classes").await;
        let body: Value = response.json();
        let classes = body["data"]["classes"].as_array().unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0]["class_name"], "5th A");
        assert_eq!(classes[0]["student_count"], 8);
    }

    #[tokio::test]
    async fn class_insights_for_unknown_class_is_not_found() {
        let (server, _db) = test_server().await;
        let response = server.get("/classes/9th%20Z").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn class_insights_without_analyses_are_empty() {
        let (server, _db) = test_server().await;
        let response = server.get("/classes/5th%20A").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["data"]["student_count"], 0);
        assert_eq!(body["data"]["class_name"], "5th A");
    }

    #[tokio::test]
    async fn class_insights_aggregate_latest_analyses() {
        let (server, db) = test_server().await;
        db.insert_analysis(&analysis_record("a1", "Anna Smith", 20)).await.unwrap();
        db.insert_analysis(&analysis_record("b1", "Bruno Johnson", 40)).await.unwrap();

        let response = server.get("/classes/5th%20A").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["student_count"], 2);
        assert_eq!(body["data"]["average_error"], 30.0);
        assert_eq!(body["data"]["llm"], false);
    }

    #[tokio::test]
    async fn analysis_lookup_roundtrip() {
        let (server, db) = test_server().await;
        db.insert_analysis(&analysis_record("a1", "Anna Smith", 20)).await.unwrap();

        let response = server.get("/analyses").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["analyses"].as_array().unwrap().len(), 1);

        let response = server.get("/analyses/a1").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["data"]["data"]["mainError"], "arithmetic slip");

        let response = server.get("/analyses/missing").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn student_groups_cache_and_recompute() {
        let (server, db) = test_server().await;
        db.insert_analysis(&analysis_record("a1", "Anna Smith", 20)).await.unwrap();
        db.insert_analysis(&analysis_record("b1", "Bruno Johnson", 75)).await.unwrap();

        let response = server.get("/student_groups").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["llm"], false);
        assert_eq!(body["data"]["cached"], false);
        assert_eq!(body["data"]["groups"].as_array().unwrap().len(), 2);

        let response = server.get("/student_groups").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["cached"], true);

        let response = server.post("/student_groups/recompute").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["cached"], false);
    }

    #[tokio::test]
    async fn analyses_grouped_by_class() {
        let (server, db) = test_server().await;
        db.insert_analysis(&analysis_record("a1", "Anna Smith", 20)).await.unwrap();
        db.insert_analysis(&analysis_record("x1", "Stranger", 80)).await.unwrap();

        let response = server.get("/analyses_by_class").await;
        let body: Value = response.json();
        let groups = body["data"]["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["class_name"], "5th A");
        assert_eq!(groups[1]["class_name"], "Unknown");
    }

    #[tokio::test]
    async fn transcription_without_credentials_is_unavailable() {
        let (server, _db) = test_server().await;
        let form = MultipartForm::new().add_part(
            "file",
            Part::bytes(b"not really an image".to_vec())
                .file_name("exercise.jpg")
                .mime_type("image/jpeg"),
        );

        let response = server.post("/analyze_simple").multipart(form).await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn analyze_exercise_requires_a_file() {
        let (server, _db) = test_server().await;
        let form = MultipartForm::new().add_text("subject", "Mathematics");
        let response = server.post("/analyze_exercise").multipart(form).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_start_at_zero() {
        let (server, _db) = test_server().await;
        let response = server.get("/model_metrics").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["requests"], 0);
        assert_eq!(body["data"]["errors"], 0);
        assert_eq!(body["data"]["last_latency_ms"], Value::Null);
    }
}
