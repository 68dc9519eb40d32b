use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{Days, NaiveDate};
use plotters::prelude::*;
use plotters::style::register_font;

use crate::models::QuizPoint;
use crate::pdf::TrueTypeFont;
use crate::roster::Roster;

const DATE_COLUMNS: &[&str] = &["Date", "date", "日期"];
const SCORE_COLUMNS: &[&str] = &["Quiz Score", "quiz_score", "分數"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

const CHART_SIZE: (u32, u32) = (1000, 600);
const FONT_FAMILY: &str = "sans-serif";
const ORANGE: RGBColor = RGBColor(255, 165, 0);

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok())
}

/// Parses quiz rows, dropping any row whose date or score does not parse.
pub fn quiz_points(roster: &Roster) -> anyhow::Result<Vec<QuizPoint>> {
    let date_col = roster
        .column_index(DATE_COLUMNS)
        .context("quiz CSV needs a Date column")?;
    let score_col = roster
        .column_index(SCORE_COLUMNS)
        .context("quiz CSV needs a Quiz Score column")?;

    let mut points: Vec<QuizPoint> = (0..roster.len())
        .filter_map(|row| {
            let date = parse_date(roster.cell(row, date_col)?)?;
            let score = roster.cell(row, score_col)?.parse::<f64>().ok()?;
            score.is_finite().then_some(QuizPoint { date, score })
        })
        .collect();
    points.sort_by_key(|point| point.date);
    Ok(points)
}

pub fn average(points: &[QuizPoint]) -> Option<f64> {
    if points.is_empty() {
        None
    } else {
        Some(points.iter().map(|p| p.score).sum::<f64>() / points.len() as f64)
    }
}

pub fn chart_path(dir: &Path, student_id: &str) -> PathBuf {
    let safe: String = student_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("quiz_score_{safe}.png"))
}

/// Date axis bounds; a single day (or no data) is widened so the axis has extent.
fn date_range(points: &[QuizPoint], today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = points.first().map(|p| p.date).unwrap_or(today);
    let end = points.last().map(|p| p.date).unwrap_or(today);
    if start < end {
        (start, end)
    } else {
        (start, end.checked_add_days(Days::new(1)).unwrap_or(end))
    }
}

/// Draws the daily quiz trend for one student as a PNG and returns the
/// written path. Labels are set in `font`.
pub fn render_quiz_chart(
    student_id: &str,
    points: &[QuizPoint],
    dir: &Path,
    font: &TrueTypeFont,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = chart_path(dir, student_id);
    register_font(FONT_FAMILY, FontStyle::Normal, font.bytes())
        .map_err(|_| anyhow!("chart renderer rejected font {}", font.name()))?;

    let (start, end) = date_range(points, chrono::Local::now().date_naive());
    {
        let root = BitMapBackend::new(&path, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(format!("{student_id} 's trend of quiz"), (FONT_FAMILY, 24))
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(60)
            .build_cartesian_2d(RangedDate::from(start..end), 0f64..100f64)?;

        chart
            .configure_mesh()
            .x_desc("Date")
            .y_desc("Quiz Scores")
            .x_labels(10)
            .y_labels(11)
            .x_label_formatter(&|date: &NaiveDate| date.format("%Y-%m-%d").to_string())
            .label_style((FONT_FAMILY, 14))
            .draw()?;

        let series = points.iter().map(|p| (p.date, p.score));
        chart
            .draw_series(LineSeries::new(series, BLUE.stroke_width(2)).point_size(4))?
            .label("scores daily")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE.stroke_width(2)));

        if let Some(avg) = average(points) {
            chart
                .draw_series(DashedLineSeries::new(
                    vec![(start, avg), (end, avg)],
                    8,
                    6,
                    ORANGE.stroke_width(2),
                ))?
                .label(format!("avg_scores ({avg:.2})"))
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], ORANGE.stroke_width(2)));
        }

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .label_font((FONT_FAMILY, 14))
            .draw()?;

        root.present()
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    tracing::info!(path = %path.display(), points = points.len(), "quiz chart written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIZ: &str = "Date,Quiz Score\n\
        2025-03-03,70\n\
        2025-03-01,50\n\
        not-a-date,90\n\
        2025-03-02,abc\n\
        2025/03/04,90\n";

    #[test]
    fn unparsable_rows_are_dropped_and_sorted() {
        let roster = Roster::from_reader(QUIZ.as_bytes()).unwrap();
        let points = quiz_points(&roster).unwrap();

        assert_eq!(points.len(), 3);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(points[2].score, 90.0);
        assert!((average(&points).unwrap() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn missing_columns_are_reported() {
        let roster = Roster::from_reader("Day,Score\n1,2\n".as_bytes()).unwrap();
        assert!(quiz_points(&roster).is_err());
    }

    #[test]
    fn chart_file_name_is_derived_from_id() {
        let path = chart_path(Path::new("out"), "S 01/x");
        assert_eq!(path, Path::new("out").join("quiz_score_S_01_x.png"));
    }

    #[test]
    fn single_day_range_is_widened() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let points = [QuizPoint { date: day, score: 80.0 }];
        assert_eq!(date_range(&points, day), (day, NaiveDate::from_ymd_opt(2025, 3, 2).unwrap()));
        assert_eq!(date_range(&[], day).0, day);
    }

    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[test]
    fn renders_chart_into_created_directory() {
        let Some(font) = crate::pdf::testing::system_font() else {
            eprintln!("no TrueType font installed, skipping");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("quiz_scores");
        let roster = Roster::from_reader(QUIZ.as_bytes()).unwrap();
        let points = quiz_points(&roster).unwrap();

        let path = render_quiz_chart("S001", &points, &target, &font).unwrap();
        assert!(path.ends_with("quiz_score_S001.png"));
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(PNG_SIGNATURE));
    }

    #[test]
    fn empty_series_still_renders_axes() {
        let Some(font) = crate::pdf::testing::system_font() else {
            eprintln!("no TrueType font installed, skipping");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = render_quiz_chart("S002", &[], dir.path(), &font).unwrap();
        assert!(std::fs::read(&path).unwrap().starts_with(PNG_SIGNATURE));
    }
}
