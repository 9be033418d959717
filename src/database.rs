use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::log_db_operation;
use crate::models::{AnalysisRecord, ClassAnalyses, Student};
use crate::sanitize::round2;

// Roster seeded on first start so the API is usable before any import.
const DEFAULT_STUDENTS: [(&str, &str, &str); 8] = [
    ("d6133d2a-d708-4110-b994-b8fdb8b38649", "Anna Smith", "5th A"),
    ("d20743a8-ab9e-454f-a2ea-43b15141675e", "Bruno Johnson", "5th A"),
    ("1d426497-ecdd-46f2-b268-63d2d55d9609", "Carla Williams", "5th A"),
    ("a9ae0072-3700-400f-a0c9-d8366b0796c3", "Daniel Brown", "5th A"),
    ("0f426d1b-1551-4736-b205-87fb34fcddfd", "Elena Davis", "5th A"),
    ("e15c33ae-6827-4def-9a07-7c819b569065", "Felix Miller", "5th A"),
    ("ce6991e6-81d4-4976-a98d-bad4c3279d5c", "Gabriela Wilson", "5th A"),
    ("f25a13cb-70df-446e-bf6c-15b3e3a87b5a", "Hugo Garcia", "5th A"),
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let db = Database { pool };
        db.migrate().await?;
        db.seed_default_students().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                class_name TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analyses (
                id TEXT PRIMARY KEY,
                student_name TEXT NOT NULL,
                subject TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analyses_student_ts ON analyses (student_name, timestamp DESC)"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_subject ON analyses (subject)")
            .execute(&self.pool)
            .await?;

        log_db_operation!(info, "migration", "database initialized");
        Ok(())
    }

    async fn seed_default_students(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM students")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }

        for (id, name, class_name) in DEFAULT_STUDENTS {
            sqlx::query("INSERT INTO students (id, name, class_name) VALUES (?1, ?2, ?3)")
                .bind(id)
                .bind(name)
                .bind(class_name)
                .execute(&self.pool)
                .await?;
        }

        log_db_operation!(info, "seed", "seeded default students");
        Ok(())
    }

    // Student operations
    pub async fn list_students(&self, class_name: Option<&str>) -> Result<Vec<Student>> {
        let rows = match class_name {
            Some(class_name) => {
                sqlx::query("SELECT * FROM students WHERE class_name = ?1 ORDER BY name")
                    .bind(class_name)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM students ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| Student {
                id: row.get("id"),
                name: row.get("name"),
                class_name: row.get("class_name"),
            })
            .collect())
    }

    pub async fn get_student(&self, student_id: &str) -> Result<Option<Student>> {
        let row = sqlx::query("SELECT * FROM students WHERE id = ?1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Student {
            id: row.get("id"),
            name: row.get("name"),
            class_name: row.get("class_name"),
        }))
    }

    /// Create a student. Duplicates by name plus class (case-insensitive) are
    /// rejected.
    pub async fn create_student(&self, name: &str, class_name: &str) -> Result<Student> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM students WHERE LOWER(name) = LOWER(?1) AND LOWER(class_name) = LOWER(?2)",
        )
        .bind(name)
        .bind(class_name)
        .fetch_one(&self.pool)
        .await?;
        if existing > 0 {
            return Err(anyhow!(
                "Student '{}' already exists in class '{}'",
                name,
                class_name
            ));
        }

        let student = Student {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            class_name: class_name.to_string(),
        };

        sqlx::query("INSERT INTO students (id, name, class_name) VALUES (?1, ?2, ?3)")
            .bind(&student.id)
            .bind(&student.name)
            .bind(&student.class_name)
            .execute(&self.pool)
            .await?;

        Ok(student)
    }

    pub async fn delete_student(&self, student_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM students WHERE id = ?1")
            .bind(student_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Analysis operations
    pub async fn insert_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        let data_json = serde_json::to_string(&record.data)?;

        sqlx::query(
            r#"
            INSERT INTO analyses (id, student_name, subject, timestamp, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                student_name = excluded.student_name,
                subject = excluded.subject,
                timestamp = excluded.timestamp,
                data = excluded.data
            "#,
        )
        .bind(&record.id)
        .bind(&record.student_name)
        .bind(&record.subject)
        .bind(record.timestamp.to_rfc3339())
        .bind(data_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_analysis(&self, analysis_id: &str) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query("SELECT * FROM analyses WHERE id = ?1")
            .bind(analysis_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_analysis(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_analyses(&self) -> Result<Vec<AnalysisRecord>> {
        let rows = sqlx::query("SELECT * FROM analyses ORDER BY timestamp DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_analysis).collect()
    }

    /// All analyses for one student, newest first, optionally filtered by
    /// subject.
    pub async fn list_analyses_by_student(
        &self,
        student_name: &str,
        subject: Option<&str>,
    ) -> Result<Vec<AnalysisRecord>> {
        let rows = match subject {
            Some(subject) => {
                sqlx::query(
                    "SELECT * FROM analyses WHERE student_name = ?1 AND subject = ?2 ORDER BY timestamp DESC",
                )
                .bind(student_name)
                .bind(subject)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM analyses WHERE student_name = ?1 ORDER BY timestamp DESC")
                    .bind(student_name)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::row_to_analysis).collect()
    }

    /// Analyses grouped by the student's class, with a rounded average error
    /// per class. Students without a roster entry land in "Unknown". Classes
    /// are sorted by name.
    pub async fn list_analyses_grouped_by_class(&self) -> Result<Vec<ClassAnalyses>> {
        let analyses = self.list_analyses().await?;
        let students = self.list_students(None).await?;

        let name_to_class: std::collections::HashMap<String, String> = students
            .into_iter()
            .map(|s| (s.name, s.class_name))
            .collect();

        let mut grouped: Vec<ClassAnalyses> = Vec::new();
        for record in analyses {
            let class_name = name_to_class
                .get(&record.student_name)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            match grouped.iter_mut().find(|g| g.class_name == class_name) {
                Some(group) => group.analyses.push(record),
                None => grouped.push(ClassAnalyses {
                    class_name,
                    analyses: vec![record],
                    count: 0,
                    average_error: 0.0,
                }),
            }
        }

        for group in &mut grouped {
            group.count = group.analyses.len();
            let total: f64 = group
                .analyses
                .iter()
                .map(|a| f64::from(a.data.error_percentage))
                .sum();
            group.average_error = round2(total / group.count as f64);
        }
        grouped.sort_by(|a, b| a.class_name.cmp(&b.class_name));

        log_db_operation!(debug, "list_analyses_grouped_by_class", count = grouped.len(), duration_ms = 0);
        Ok(grouped)
    }

    fn row_to_analysis(row: &sqlx::sqlite::SqliteRow) -> Result<AnalysisRecord> {
        let data_json: String = row.get("data");
        Ok(AnalysisRecord {
            id: row.get("id"),
            student_name: row.get("student_name"),
            subject: row.get("subject"),
            timestamp: chrono::DateTime::parse_from_rfc3339(&row.get::<String, _>("timestamp"))?
                .with_timezone(&Utc),
            data: serde_json::from_str(&data_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisData;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn record(id: &str, student: &str, pct: u8) -> AnalysisRecord {
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
    async fn seeds_default_roster_once() {
        let db = test_db().await;
        let students = db.list_students(Some("5th A")).await.unwrap();
        assert_eq!(students.len(), 8);
        assert_eq!(students[0].name, "Anna Smith");
    }

    #[tokio::test]
    async fn create_and_delete_student() {
        let db = test_db().await;
        let created = db.create_student("Nina Lopez", "6th B").await.unwrap();
        assert_eq!(
            db.get_student(&created.id).await.unwrap().unwrap().name,
            "Nina Lopez"
        );

        assert!(db.delete_student(&created.id).await.unwrap());
        assert!(!db.delete_student(&created.id).await.unwrap());
        assert!(db.get_student(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_student_is_rejected_case_insensitively() {
        let db = test_db().await;
        db.create_student("Nina Lopez", "6th B").await.unwrap();
        let err = db.create_student("nina lopez", "6TH B").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn analysis_roundtrip_and_upsert() {
        let db = test_db().await;
        let mut rec = record("a1", "Anna Smith", 40);
        db.insert_analysis(&rec).await.unwrap();

        let stored = db.get_analysis("a1").await.unwrap().unwrap();
        assert_eq!(stored.data.main_error, "arithmetic slip");
        assert_eq!(stored.data.error_percentage, 40);

        rec.data.error_percentage = 70;
        db.insert_analysis(&rec).await.unwrap();
        let stored = db.get_analysis("a1").await.unwrap().unwrap();
        assert_eq!(stored.data.error_percentage, 70);
        assert_eq!(db.list_analyses().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_by_student_filters_subject() {
        let db = test_db().await;
        db.insert_analysis(&record("a1", "Anna Smith", 40)).await.unwrap();
        let mut science = record("a2", "Anna Smith", 20);
        science.subject = "Science".to_string();
        db.insert_analysis(&science).await.unwrap();
        db.insert_analysis(&record("b1", "Bruno Johnson", 60)).await.unwrap();

        let all = db.list_analyses_by_student("Anna Smith", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let math = db
            .list_analyses_by_student("Anna Smith", Some("Mathematics"))
            .await
            .unwrap();
        assert_eq!(math.len(), 1);
        assert_eq!(math[0].id, "a1");
    }

    #[tokio::test]
    async fn grouping_by_class_averages_and_sorts() {
        let db = test_db().await;
        db.insert_analysis(&record("a1", "Anna Smith", 20)).await.unwrap();
        db.insert_analysis(&record("a2", "Bruno Johnson", 41)).await.unwrap();
        db.insert_analysis(&record("x1", "Stranger", 80)).await.unwrap();

        let groups = db.list_analyses_grouped_by_class().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].class_name, "5th A");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].average_error, 30.5);
        assert_eq!(groups[1].class_name, "Unknown");
        assert_eq!(groups[1].average_error, 80.0);
    }
}
