use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::classify;
use crate::models::{ClassGroup, ClassLevel, StudentFeedback, StudentRecord};
use crate::pdf::{self, Align, Flow, Font, Table, TableStyle, Typeface};
use crate::roster::{format_score, Roster};

pub const CLASS_REPORT_FILE: &str = "class_assignment_report.pdf";
pub const STUDENT_REPORT_FILE: &str = "student_feedback_report.pdf";
pub const STUDENT_CSV_FILE: &str = "student_feedback_report.csv";

const MARGIN: f32 = 36.0;

pub fn roster_table(roster: &Roster) -> Table {
    Table {
        headers: roster.headers.clone(),
        rows: roster.rows.clone(),
    }
}

/// Python-style `str.title()`: uppercase after any non-letter.
pub fn title_case(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut boundary = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            if boundary {
                output.extend(c.to_uppercase());
            } else {
                output.extend(c.to_lowercase());
            }
            boundary = false;
        } else {
            output.push(c);
            boundary = true;
        }
    }
    output
}

/// Renders a roster as a landscape table report at `path`.
pub fn render_table_report(roster: &Roster, title: &str, path: &Path, typeface: &Typeface) -> anyhow::Result<()> {
    let mut flow = Flow::new(pdf::A4.landscape(), MARGIN, typeface);
    flow.line(title, Font::Bold, 16.0);
    flow.spacer(12.0);
    flow.table(&roster_table(roster), &TableStyle::default());
    flow.finish().save(path)?;
    tracing::info!(path = %path.display(), rows = roster.len(), "table report written");
    Ok(())
}

pub fn render_class_report(roster: &Roster, path: &Path, typeface: &Typeface) -> anyhow::Result<()> {
    render_table_report(roster, "Class Assignment Report", path, typeface)
}

/// One page per student: heading, score table, strengths, weaknesses and suggestion.
pub fn render_student_report(entries: &[StudentFeedback], path: &Path, typeface: &Typeface) -> anyhow::Result<()> {
    let mut flow = Flow::new(pdf::A4, MARGIN, typeface);
    let score_style = TableStyle {
        header_background: pdf::LIGHT_BLUE,
        header_text: pdf::WHITE,
        row_backgrounds: Vec::new(),
        align: Align::Center,
        padding_top: 4.0,
        header_padding_bottom: 4.0,
        column_widths: Some(vec![80.0, 60.0]),
        ..TableStyle::default()
    };

    if entries.is_empty() {
        flow.line("Student Feedback Report", Font::Bold, 14.0);
        flow.spacer(6.0);
        flow.line("No students in this upload.", Font::Regular, 12.0);
    }

    for entry in entries {
        flow.line(&format!("Student: {}", entry.name), Font::Bold, 14.0);
        flow.spacer(6.0);

        let scores = Table {
            headers: vec!["Skill".to_string(), "Score".to_string()],
            rows: vec![
                vec!["Listening".to_string(), format_score(entry.listening)],
                vec!["Speaking".to_string(), format_score(entry.speaking)],
                vec!["Reading".to_string(), format_score(entry.reading)],
                vec!["Writing".to_string(), format_score(entry.writing)],
            ],
        };
        flow.table(&scores, &score_style);
        flow.spacer(6.0);

        flow.paragraph(&format!("Strengths: {}", entry.strengths), Font::Regular, 12.0);
        flow.paragraph(&format!("Weaknesses: {}", entry.weaknesses), Font::Regular, 12.0);
        flow.spacer(6.0);
        flow.line("Study suggestions:", Font::Bold, 12.0);
        flow.paragraph(&entry.suggestion, Font::Regular, 12.0);
        flow.page_break();
    }

    flow.finish().save(path)?;
    tracing::info!(path = %path.display(), students = entries.len(), "student report written");
    Ok(())
}

/// Splits a classified table into one `class_<level>` CSV per level (and a
/// PDF each when a typeface is given). `students` must be in table row order.
pub fn export_classes(
    table: &Roster,
    students: &[StudentRecord],
    out_dir: &Path,
    pdf_typeface: Option<&Typeface>,
) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut written = Vec::new();
    for level in ClassLevel::ALL {
        let indices: Vec<usize> = students
            .iter()
            .enumerate()
            .filter(|(_, student)| student.class_level == Some(level))
            .map(|(index, _)| index)
            .collect();
        let class = table.subset(&indices);
        let stem = level.file_stem();

        let csv_path = out_dir.join(format!("{stem}.csv"));
        class.write_path(&csv_path)?;
        written.push(csv_path);

        if let Some(typeface) = pdf_typeface {
            let pdf_path = out_dir.join(format!("{stem}.pdf"));
            let title = format!("Class Report: {}", title_case(&stem));
            render_table_report(&class, &title, &pdf_path, typeface)?;
            written.push(pdf_path);
        }
        tracing::info!(level = %level, students = indices.len(), "class exported");
    }

    Ok(written)
}

/// Plain-text placement summary printed after classification.
pub fn build_summary(groups: &[ClassGroup]) -> String {
    let mut output = String::new();
    let total: usize = groups.iter().map(|group| group.students.len()).sum();

    let _ = writeln!(output, "# Class Placement Summary");
    let _ = writeln!(output, "{total} students placed");
    let _ = writeln!(output);

    for group in groups {
        let _ = writeln!(output, "## {}", group.level);
        match classify::group_averages(&group.students) {
            None => {
                let _ = writeln!(output, "No students in this class.");
            }
            Some(averages) => {
                let _ = writeln!(output, "- {} students", group.students.len());
                for (skill, average) in averages.iter() {
                    let _ = writeln!(output, "- {skill} average {average:.1}");
                }
                let weak = classify::weaknesses(&averages);
                let _ = writeln!(output, "- weakest: {}", classify::join_skills(&weak));
            }
        }
        let _ = writeln!(output);
    }

    output
}
