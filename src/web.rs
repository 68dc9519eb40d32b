//! HTTP surface: upload form, `/analyze`, artifact downloads and health.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::classify::PlacementPolicy;
use crate::config::AppConfig;
use crate::pdf::Typeface;
use crate::report::{self, CLASS_REPORT_FILE, STUDENT_CSV_FILE, STUDENT_REPORT_FILE};
use crate::roster::{self, Roster};
use crate::suggest::SuggestionGenerator;

/// Uniform JSON envelope for every API reply.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub success: bool,
    pub data: T,
    pub message: String,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self
    where
        T: Default,
    {
        Self {
            success: false,
            data: T::default(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Default, Serialize)]
pub struct AnalyzeResult {
    pub files: Vec<String>,
    /// `/download/{name}` link for each entry of `files`.
    pub downloads: Vec<String>,
    pub transcript: Option<String>,
}

impl AnalyzeResult {
    fn add_file(&mut self, name: &str) {
        self.files.push(name.to_string());
        self.downloads.push(download_url(name));
    }
}

fn download_url(name: &str) -> String {
    format!("/download/{name}")
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub reports_dir: PathBuf,
    pub policy: PlacementPolicy,
    pub suggestions: SuggestionGenerator,
    pub typeface: Typeface,
}

#[derive(Debug, Default)]
struct AnalyzeForm {
    file: Option<Vec<u8>>,
    option_class: bool,
    option_student: bool,
    option_posttest: bool,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<Empty>::error(message))).into_response()
}

fn internal_error(context: &str, err: anyhow::Error) -> Response {
    tracing::error!(error = ?err, "{context}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {err:#}"))
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Class Placement</title></head>
<body>
<h1>Class Placement</h1>
<form action="/analyze" method="post" enctype="multipart/form-data">
  <p><input type="file" name="file" accept=".csv" required></p>
  <p><label><input type="checkbox" name="option_class"> Class assignment report</label></p>
  <p><label><input type="checkbox" name="option_student"> Student feedback report</label></p>
  <p><label><input type="checkbox" name="option_posttest"> Post-test suggestions</label></p>
  <p><button type="submit">Analyze</button></p>
</form>
</body>
</html>
"#;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/analyze", post(analyze))
        .route("/download/{filename}", get(download))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HOST/PORT '{}:{}': {e}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, reports_dir = %state.reports_dir.display(), "listening");
    println!("Serving on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<ApiResponse<Health>> {
    Json(ApiResponse::success(Health { status: "ok" }, "Service is healthy"))
}

async fn read_form(multipart: &mut Multipart) -> Result<AnalyzeForm, Response> {
    let mut form = AnalyzeForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return Err(error_response(StatusCode::BAD_REQUEST, format!("Malformed form data: {err}")));
            }
        };

        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => form.file = Some(bytes.to_vec()),
                Err(err) => {
                    return Err(error_response(StatusCode::BAD_REQUEST, format!("Failed to read upload: {err}")));
                }
            },
            "option_class" => form.option_class = true,
            "option_student" => form.option_student = true,
            "option_posttest" => form.option_posttest = true,
            _ => continue,
        }
    }
    Ok(form)
}

async fn analyze(State(state): State<AppState>, multipart: Multipart) -> Response {
    let request_id = Uuid::new_v4();
    run_analysis(state, multipart)
        .instrument(tracing::info_span!("analyze", %request_id))
        .await
}

async fn run_analysis(state: AppState, mut multipart: Multipart) -> Response {
    let form = match read_form(&mut multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };

    let Some(bytes) = form.file else {
        return error_response(StatusCode::BAD_REQUEST, "No file uploaded");
    };

    let (table, students) = match Roster::from_reader(bytes.as_slice())
        .and_then(|roster| roster.classified(&state.policy))
    {
        Ok(classified) => classified,
        Err(err) => {
            tracing::warn!(error = %err, "rejected upload");
            return error_response(StatusCode::BAD_REQUEST, format!("Could not read CSV: {err:#}"));
        }
    };
    tracing::info!(
        students = students.len(),
        class = form.option_class,
        student = form.option_student,
        posttest = form.option_posttest,
        "analyzing upload"
    );

    if let Err(err) = tokio::fs::create_dir_all(&state.reports_dir).await {
        return internal_error("Failed to create reports directory", err.into());
    }

    let mut result = AnalyzeResult::default();

    if form.option_class {
        let path = state.reports_dir.join(CLASS_REPORT_FILE);
        if let Err(err) = report::render_class_report(&table, &path, &state.typeface) {
            return internal_error("Failed to render class report", err);
        }
        result.add_file(CLASS_REPORT_FILE);
    }

    if form.option_student {
        let feedback = state.suggestions.student_feedback(&students).await;
        let pdf_path = state.reports_dir.join(STUDENT_REPORT_FILE);
        if let Err(err) = report::render_student_report(&feedback, &pdf_path, &state.typeface) {
            return internal_error("Failed to render student report", err);
        }
        let csv_path = state.reports_dir.join(STUDENT_CSV_FILE);
        if let Err(err) = roster::write_feedback_csv(&csv_path, &feedback) {
            return internal_error("Failed to write student feedback CSV", err);
        }
        result.add_file(STUDENT_REPORT_FILE);
        result.add_file(STUDENT_CSV_FILE);
    }

    if form.option_posttest {
        result.transcript = Some(
            state
                .suggestions
                .posttest_transcript(&students, &state.policy)
                .await,
        );
    }

    let message = if result.files.is_empty() && result.transcript.is_none() {
        "No option selected"
    } else {
        "Analysis complete"
    };
    (StatusCode::OK, Json(ApiResponse::success(result, message))).into_response()
}

fn content_type(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn download(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.contains("..") {
        return error_response(StatusCode::BAD_REQUEST, "Invalid file name");
    }

    let path = state.reports_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type(&filename))
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(Body::from(bytes))
            .unwrap_or_else(|err| internal_error("Failed to build response", err.into())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error_response(StatusCode::NOT_FOUND, "File not found")
        }
        Err(err) => internal_error("Failed to read file", err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::suggest::testing::ScriptedGenerator;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "----BoundaryTest";
    const ROSTER: &str = "姓名,聽力成績,口說成績,閱讀成績,寫作成績\n\
        Aiko,60,50,70,40\n\
        Ren,30,40,35,45\n";

    fn state(dir: &std::path::Path, script: Vec<Result<String, LlmError>>) -> (Arc<ScriptedGenerator>, AppState) {
        let scripted = Arc::new(ScriptedGenerator::new(script));
        let state = AppState {
            reports_dir: dir.to_path_buf(),
            policy: PlacementPolicy::default(),
            suggestions: SuggestionGenerator::new(scripted.clone(), 1),
            typeface: Typeface::Standard,
        };
        (scripted, state)
    }

    fn multipart_body(csv: Option<&str>, options: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(csv) = csv {
            body.extend(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend(
                "Content-Disposition: form-data; name=\"file\"; filename=\"roster.csv\"\r\nContent-Type: text/csv\r\n\r\n"
                    .as_bytes(),
            );
            body.extend(csv.as_bytes());
            body.extend(b"\r\n");
        }
        for option in options {
            body.extend(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend(format!("Content-Disposition: form-data; name=\"{option}\"\r\n\r\non\r\n").as_bytes());
        }
        body.extend(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn post_analyze(state: AppState, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn index_serves_the_upload_form() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let response = router(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("name=\"option_posttest\""));
    }

    #[tokio::test]
    async fn missing_file_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let (status, json) = post_analyze(state, multipart_body(None, &["option_class"])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "No file uploaded");
    }

    #[tokio::test]
    async fn unusable_csv_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let (status, json) =
            post_analyze(state, multipart_body(Some("Name,Listening\nA,1\n"), &["option_class"])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("missing column"));
    }

    #[tokio::test]
    async fn class_and_student_options_write_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (scripted, state) = state(
            dir.path(),
            vec![Ok("Practice writing.".into()), Err(LlmError::RateLimited("quota".into()))],
        );
        let (status, json) =
            post_analyze(state, multipart_body(Some(ROSTER), &["option_class", "option_student"])).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(
            json["data"]["files"],
            serde_json::json!([CLASS_REPORT_FILE, STUDENT_REPORT_FILE, STUDENT_CSV_FILE])
        );
        assert_eq!(
            json["data"]["downloads"],
            serde_json::json!([
                "/download/class_assignment_report.pdf",
                "/download/student_feedback_report.pdf",
                "/download/student_feedback_report.csv"
            ])
        );
        assert!(json["data"]["transcript"].is_null());
        assert_eq!(scripted.request_count(), 2);

        let pages = lopdf::Document::load(dir.path().join(STUDENT_REPORT_FILE))
            .unwrap()
            .get_pages()
            .len();
        assert_eq!(pages, 2);
        let feedback = Roster::from_path(&dir.path().join(STUDENT_CSV_FILE)).unwrap();
        assert_eq!(feedback.rows[0][7], "Practice writing.");
        assert_eq!(feedback.rows[1][7], crate::suggest::QUOTA_FALLBACK);
    }

    #[tokio::test]
    async fn posttest_option_returns_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![Ok("Beginner class: focus on listening.".into())]);
        let (status, json) = post_analyze(state, multipart_body(Some(ROSTER), &["option_posttest"])).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["transcript"], "Beginner class: focus on listening.");
        assert_eq!(json["data"]["files"], serde_json::json!([]));
        assert_eq!(json["data"]["downloads"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn zero_row_upload_still_produces_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (scripted, state) = state(dir.path(), vec![]);
        let (status, json) = post_analyze(
            state,
            multipart_body(
                Some("姓名,聽力成績,口說成績,閱讀成績,寫作成績\n"),
                &["option_class", "option_student", "option_posttest"],
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["transcript"], "");
        assert_eq!(scripted.request_count(), 0);
        assert!(dir.path().join(CLASS_REPORT_FILE).exists());
        assert!(dir.path().join(STUDENT_REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn download_serves_attachment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("class_beginner.csv"), "Name\nRen\n").unwrap();
        let (_, state) = state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/download/class_beginner.csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"class_beginner.csv\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Name\nRen\n");
    }

    #[tokio::test]
    async fn advertised_download_links_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let app = router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/analyze")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(multipart_body(Some(ROSTER), &["option_class"])))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        let link = json["data"]["downloads"][0].as_str().unwrap().to_string();

        let response = app
            .oneshot(Request::builder().uri(link).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    }

    #[tokio::test]
    async fn download_rejects_traversal_and_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, state) = state(dir.path(), vec![]);
        let app = router(state);

        let traversal = app
            .clone()
            .oneshot(Request::builder().uri("/download/..secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .oneshot(Request::builder().uri("/download/nope.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
