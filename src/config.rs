//! Runtime configuration loaded from the environment (and `.env`).

use std::env;
use std::path::PathBuf;

use anyhow::Context;

use crate::llm::{self, GeminiClient};
use crate::pdf::Typeface;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub host: String,
    pub port: u16,
    pub reports_dir: PathBuf,
    pub charts_dir: PathBuf,
    pub suggestion_concurrency: usize,
    pub log_level: String,
    /// TrueType font embedded in reports and used for chart labels.
    pub pdf_font: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port = string("PORT", "5000");
        let concurrency = string("SUGGESTION_CONCURRENCY", "1");

        Ok(Self {
            gemini_api_key: lookup("GEMINI_API_KEY").filter(|key| !key.trim().is_empty()),
            gemini_model: string("GEMINI_MODEL", llm::DEFAULT_MODEL),
            gemini_api_base: string("GEMINI_API_BASE", llm::DEFAULT_API_BASE),
            host: string("HOST", "127.0.0.1"),
            port: port
                .parse()
                .with_context(|| format!("PORT must be a port number, got '{port}'"))?,
            reports_dir: PathBuf::from(string("REPORTS_DIR", "static/reports")),
            charts_dir: PathBuf::from(string("CHARTS_DIR", "static/quiz_scores")),
            suggestion_concurrency: concurrency.parse().with_context(|| {
                format!("SUGGESTION_CONCURRENCY must be a positive integer, got '{concurrency}'")
            })?,
            log_level: string("LOG_LEVEL", "cohort_placement=info"),
            pdf_font: lookup("PDF_FONT")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// Builds the service client, failing fast when the API key is absent.
    pub fn gemini_client(&self) -> anyhow::Result<GeminiClient> {
        let api_key = self
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY must be set (environment or .env)")?;
        Ok(GeminiClient::new(
            self.gemini_api_base.clone(),
            api_key,
            self.gemini_model.clone(),
        )?)
    }

    /// Report typeface: `PDF_FONT` when set (an unusable file is an error),
    /// otherwise the first installed candidate font.
    pub fn typeface(&self) -> anyhow::Result<Typeface> {
        Typeface::discover(self.pdf_font.as_deref()).context("PDF_FONT must name a single TrueType (.ttf) font")
    }
}
