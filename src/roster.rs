use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context};

use crate::classify::{self, PlacementPolicy};
use crate::models::{SkillScores, StudentFeedback, StudentRecord};

pub const NAME_COLUMNS: &[&str] = &["姓名", "Name", "name"];
pub const LISTENING_COLUMNS: &[&str] = &["聽力成績", "Listening", "listening"];
pub const SPEAKING_COLUMNS: &[&str] = &["口說成績", "Speaking", "speaking"];
pub const READING_COLUMNS: &[&str] = &["閱讀成績", "Reading", "reading"];
pub const WRITING_COLUMNS: &[&str] = &["寫作成績", "Writing", "writing"];
pub const TOTAL_COLUMNS: &[&str] = &["總分", "Total_Score", "total_score"];
pub const ID_COLUMNS: &[&str] = &["StudentID", "student_id"];

pub const TOTAL_COLUMN: &str = "Total_Score";
pub const CLASS_LEVEL_COLUMN: &str = "Class_Level";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A CSV table kept as text so unknown columns pass through untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Roster {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Roster {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .context("failed to read CSV header")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("failed to read CSV row {}", index + 1))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes the table with a UTF-8 BOM so spreadsheet tools pick up the encoding.
    pub fn write_path(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(UTF8_BOM)?;
        self.to_writer(file)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, aliases: &[&str]) -> Option<usize> {
        aliases
            .iter()
            .find_map(|alias| self.headers.iter().position(|header| header == alias))
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(column))
            .map(String::as_str)
    }

    fn required_column(&self, aliases: &[&str]) -> anyhow::Result<usize> {
        match self.column_index(aliases) {
            Some(index) => Ok(index),
            None => bail!("missing column: expected one of {}", aliases.join(", ")),
        }
    }

    /// Parses every row into a student record.
    pub fn students(&self) -> anyhow::Result<Vec<StudentRecord>> {
        let name_col = self.column_index(NAME_COLUMNS);
        let id_col = self.column_index(ID_COLUMNS);
        let total_col = self.column_index(TOTAL_COLUMNS);
        let skill_cols = [
            self.required_column(LISTENING_COLUMNS)?,
            self.required_column(SPEAKING_COLUMNS)?,
            self.required_column(READING_COLUMNS)?,
            self.required_column(WRITING_COLUMNS)?,
        ];

        let mut students = Vec::with_capacity(self.rows.len());
        for row in 0..self.rows.len() {
            let score = |column: usize| -> anyhow::Result<f64> {
                let raw = self.cell(row, column).unwrap_or_default();
                raw.parse::<f64>().with_context(|| {
                    format!(
                        "row {}: column '{}' is not a number: '{}'",
                        row + 1,
                        self.headers[column],
                        raw
                    )
                })
            };

            let name = name_col
                .and_then(|column| self.cell(row, column))
                .filter(|value| !value.is_empty())
                .unwrap_or("Unnamed")
                .to_string();
            let student_id = id_col
                .and_then(|column| self.cell(row, column))
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            let total_score = match total_col {
                Some(column) if !self.cell(row, column).unwrap_or_default().is_empty() => {
                    Some(score(column)?)
                }
                _ => None,
            };

            students.push(StudentRecord {
                student_id,
                name,
                scores: SkillScores {
                    listening: score(skill_cols[0])?,
                    speaking: score(skill_cols[1])?,
                    reading: score(skill_cols[2])?,
                    writing: score(skill_cols[3])?,
                },
                total_score,
                class_level: None,
            });
        }

        Ok(students)
    }

    /// Classifies every row, returning the table with total and class-level
    /// columns filled in alongside the parsed records.
    pub fn classified(
        &self,
        policy: &PlacementPolicy,
    ) -> anyhow::Result<(Roster, Vec<StudentRecord>)> {
        let mut students = self.students()?;
        classify::classify_students(&mut students, policy);

        let mut table = self.clone();
        let total_col = match self.column_index(TOTAL_COLUMNS) {
            Some(index) => index,
            None => table.push_column(TOTAL_COLUMN),
        };
        let level_col = match self.column_index(&[CLASS_LEVEL_COLUMN]) {
            Some(index) => index,
            None => table.push_column(CLASS_LEVEL_COLUMN),
        };

        for (row, student) in table.rows.iter_mut().zip(students.iter()) {
            if row[total_col].is_empty() {
                row[total_col] = format_score(classify::total_score(student));
            }
            row[level_col] = student
                .class_level
                .map(|level| level.to_string())
                .unwrap_or_default();
        }

        Ok((table, students))
    }

    fn push_column(&mut self, header: &str) -> usize {
        self.headers.push(header.to_string());
        for row in self.rows.iter_mut() {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    /// Rows at the given indices, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Roster {
        Roster {
            headers: self.headers.clone(),
            rows: indices
                .iter()
                .filter_map(|index| self.rows.get(*index).cloned())
                .collect(),
        }
    }

    /// Inner join on a key column present in both tables. The right table's
    /// other columns are appended; rows keep the left table's order.
    pub fn join(&self, other: &Roster, key_aliases: &[&str]) -> anyhow::Result<Roster> {
        let left_key = self
            .column_index(key_aliases)
            .context("left table has no join key column")?;
        let right_key = other
            .column_index(key_aliases)
            .context("right table has no join key column")?;

        let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (row, cells) in other.rows.iter().enumerate() {
            index.entry(cells[right_key].as_str()).or_default().push(row);
        }

        let extra: Vec<usize> = (0..other.headers.len())
            .filter(|column| *column != right_key)
            .collect();
        let mut headers = self.headers.clone();
        headers.extend(extra.iter().map(|column| other.headers[*column].clone()));

        let mut rows = Vec::new();
        for cells in &self.rows {
            let Some(matches) = index.get(cells[left_key].as_str()) else {
                continue;
            };
            for right_row in matches {
                let mut joined = cells.clone();
                joined.extend(extra.iter().map(|column| other.rows[*right_row][*column].clone()));
                rows.push(joined);
            }
        }

        Ok(Roster { headers, rows })
    }
}

pub fn format_score(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        let text = format!("{value:.4}");
        text.trim_end_matches('0').to_string()
    }
}

/// Writes per-student feedback rows, one column per field.
pub fn write_feedback_csv(path: &Path, entries: &[StudentFeedback]) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(UTF8_BOM)?;
    let mut writer = csv::Writer::from_writer(file);
    if entries.is_empty() {
        writer.write_record([
            "name",
            "listening",
            "speaking",
            "reading",
            "writing",
            "strengths",
            "weaknesses",
            "suggestion",
        ])?;
    }
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    Ok(())
}
