use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod chart;
mod classify;
mod coding;
mod config;
mod digest;
mod llm;
mod models;
mod pdf;
mod report;
mod roster;
mod suggest;
mod web;

use classify::PlacementPolicy;
use config::AppConfig;
use roster::Roster;
use suggest::SuggestionGenerator;

#[derive(Parser)]
#[command(name = "cohort-placement")]
#[command(about = "Class placement, reports and study suggestions for language cohorts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a pre-test roster and export one CSV per class level
    Classify {
        #[arg(long)]
        csv: PathBuf,
        /// Student info CSV joined on StudentID
        #[arg(long)]
        info: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Also render a PDF per class
        #[arg(long)]
        pdf: bool,
    },
    /// Render the class assignment report PDF
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate per-student suggestions and the feedback report
    Feedback {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Print post-test design suggestions per class
    Posttest {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Plot one student's daily quiz scores
    Chart {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        student_id: String,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Code dialogue transcripts against a list of items
    Code {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Coding item, repeat for each item
        #[arg(long = "item", required = true)]
        items: Vec<String>,
        #[arg(long, default_value_t = coding::BATCH_SIZE)]
        batch_size: usize,
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Run agent conversations over classified rosters
    Digest {
        #[arg(long = "csv", required = true)]
        csvs: Vec<PathBuf>,
        #[arg(long, default_value = digest::OUTPUT_FILE)]
        out: PathBuf,
        #[arg(long, default_value_t = digest::CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = 10)]
        max_turns: usize,
    },
    /// Serve the upload form and analysis API
    Serve,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("cohort_placement=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn suggestions(config: &AppConfig) -> anyhow::Result<SuggestionGenerator> {
    let client = config.gemini_client()?;
    Ok(SuggestionGenerator::new(Arc::new(client), config.suggestion_concurrency))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    init_logging(&config.log_level);
    let policy = PlacementPolicy::default();

    match cli.command {
        Commands::Classify {
            csv,
            info,
            out_dir,
            pdf,
        } => {
            let mut roster = Roster::from_path(&csv)?;
            if let Some(info) = info {
                roster = roster.join(&Roster::from_path(&info)?, roster::ID_COLUMNS)?;
            }
            let (table, students) = roster.classified(&policy)?;
            let typeface = if pdf { Some(config.typeface()?) } else { None };
            let written = report::export_classes(&table, &students, &out_dir, typeface.as_ref())?;

            print!(
                "{}",
                report::build_summary(&classify::group_by_level(&students, &policy))
            );
            for path in written {
                println!("Wrote {}.", path.display());
            }
        }
        Commands::Report { csv, out } => {
            let (table, _) = Roster::from_path(&csv)?.classified(&policy)?;
            let out = match out {
                Some(out) => out,
                None => {
                    std::fs::create_dir_all(&config.reports_dir)?;
                    config.reports_dir.join(report::CLASS_REPORT_FILE)
                }
            };
            report::render_class_report(&table, &out, &config.typeface()?)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Feedback { csv, out_dir } => {
            let generator = suggestions(&config)?;
            let (_, students) = Roster::from_path(&csv)?.classified(&policy)?;
            let out_dir = out_dir.unwrap_or_else(|| config.reports_dir.clone());
            std::fs::create_dir_all(&out_dir)?;

            let feedback = generator.student_feedback(&students).await;
            let pdf_path = out_dir.join(report::STUDENT_REPORT_FILE);
            let csv_path = out_dir.join(report::STUDENT_CSV_FILE);
            report::render_student_report(&feedback, &pdf_path, &config.typeface()?)?;
            roster::write_feedback_csv(&csv_path, &feedback)?;
            println!(
                "Feedback for {} students written to {} and {}.",
                feedback.len(),
                pdf_path.display(),
                csv_path.display()
            );
        }
        Commands::Posttest { csv } => {
            let generator = suggestions(&config)?;
            let (_, students) = Roster::from_path(&csv)?.classified(&policy)?;
            let transcript = generator.posttest_transcript(&students, &policy).await;
            if transcript.is_empty() {
                println!("No students to design a post-test for.");
            } else {
                println!("{transcript}");
            }
        }
        Commands::Chart {
            csv,
            student_id,
            out_dir,
        } => {
            let points = chart::quiz_points(&Roster::from_path(&csv)?)?;
            let out_dir = out_dir.unwrap_or_else(|| config.charts_dir.clone());
            let typeface = config.typeface()?;
            let font = typeface
                .truetype()
                .context("quiz charts need a TrueType font, set PDF_FONT")?;
            let path = chart::render_quiz_chart(&student_id, &points, &out_dir, font)?;
            println!("Chart written to {}.", path.display());
        }
        Commands::Code {
            csv,
            out,
            items,
            batch_size,
            pause_ms,
        } => {
            let client = config.gemini_client()?;
            let input = Roster::from_path(&csv)?;
            let run = coding::CodingRun {
                generator: &client,
                items,
                batch_size,
                pause: Duration::from_millis(pause_ms),
            };
            let rows = run.run(&input, &out).await?;
            println!("Coded {rows} rows into {}.", out.display());
        }
        Commands::Digest {
            csvs,
            out,
            chunk_size,
            max_turns,
        } => {
            let client = config.gemini_client()?;
            let rosters = csvs
                .iter()
                .map(|path| Roster::from_path(path))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let combined = digest::concat(&rosters);
            let run = digest::Digest {
                generator: &client,
                chunk_size,
                max_turns,
            };
            let messages = run.run(&combined).await;
            digest::write_log(&out, &messages)?;
            println!(
                "Recorded {} messages over {} rows in {}.",
                messages.len(),
                combined.len(),
                out.display()
            );
        }
        Commands::Serve => {
            let state = web::AppState {
                reports_dir: config.reports_dir.clone(),
                policy,
                suggestions: suggestions(&config)?,
                typeface: config.typeface()?,
            };
            web::serve(&config, state).await?;
        }
    }

    Ok(())
}
