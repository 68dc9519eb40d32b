//! Batched coding of dialogue transcripts against a list of coding items.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Map, Value};

use crate::llm::{GenerationRequest, TextGenerator};
use crate::roster::Roster;

pub const BATCH_SIZE: usize = 12;
pub const DELIMITER: &str = "-----";
const DIALOGUE_COLUMNS: &[&str] = &["text", "utterance", "content", "dialogue", "Dialogue"];

pub type Coding = Map<String, Value>;

/// First preferred dialogue column present, else the first column.
pub fn dialogue_column(roster: &Roster) -> usize {
    match roster.column_index(DIALOGUE_COLUMNS) {
        Some(index) => index,
        None => {
            tracing::warn!(columns = ?roster.headers, "no dialogue column found, using the first column");
            0
        }
    }
}

pub fn blank_coding(items: &[String]) -> Coding {
    items
        .iter()
        .map(|item| (item.clone(), Value::String(String::new())))
        .collect()
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return "",
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parses one JSON object from a reply part, filling missing items with "".
pub fn parse_coding(part: &str, items: &[String]) -> Coding {
    let cleaned = strip_code_fence(part);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(mut object)) => {
            for item in items {
                object
                    .entry(item.clone())
                    .or_insert_with(|| Value::String(String::new()));
            }
            object
        }
        Ok(_) | Err(_) => {
            tracing::warn!(part = cleaned, "failed to parse coding reply");
            blank_coding(items)
        }
    }
}

/// Splits a batch reply into exactly `expected` codings.
pub fn split_reply(reply: &str, items: &[String], expected: usize) -> Vec<Coding> {
    let mut codings: Vec<Coding> = reply
        .split(DELIMITER)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_coding(part, items))
        .collect();
    codings.resize_with(expected, || blank_coding(items));
    codings
}

pub fn batch_prompt(items: &[String], dialogues: &[String]) -> String {
    format!(
        "You are a Japanese teaching expert. Judge whether each transcript touches the following coding items:\n{}\n\n\
For every item answer Yes if the transcript touches it, otherwise No. \
Reply with one JSON object per transcript, separated by this line:\n{DELIMITER}\n\
For example:\n```json\n{{ \"Vocab\": \"Yes\", \"Listening\": \"No\" }}\n{DELIMITER}\n{{...}}\n```\n\n{}",
        items.join("\n"),
        dialogues.join(&format!("\n{DELIMITER}\n"))
    )
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub struct CodingRun<'a> {
    pub generator: &'a dyn TextGenerator,
    pub items: Vec<String>,
    pub batch_size: usize,
    pub pause: Duration,
}

impl CodingRun<'_> {
    async fn code_batch(&self, dialogues: &[String]) -> Vec<Coding> {
        let request = GenerationRequest::prompt(batch_prompt(&self.items, dialogues)).with_temperature(0.0);
        match self.generator.generate(request).await {
            Ok(generation) => split_reply(&generation.text, &self.items, dialogues.len()),
            Err(err) => {
                tracing::error!(error = %err, "coding request failed, leaving batch blank");
                vec![blank_coding(&self.items); dialogues.len()]
            }
        }
    }

    /// Codes every row of `input` and writes the table with one appended
    /// column per item to `output`. Returns the number of rows written.
    pub async fn run(&self, input: &Roster, output: &Path) -> anyhow::Result<usize> {
        let column = dialogue_column(input);
        tracing::info!(column = input.headers.get(column).map(String::as_str).unwrap_or(""), "coding dialogue column");

        let mut headers = input.headers.clone();
        headers.extend(self.items.iter().cloned());

        let mut file = std::fs::File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        file.write_all(b"\xEF\xBB\xBF")?;
        Roster::new(headers).to_writer(&mut file)?;
        drop(file);

        let total = input.len();
        let batch_size = self.batch_size.max(1);
        let mut start = 0;
        while start < total {
            let end = (start + batch_size).min(total);
            let dialogues: Vec<String> = (start..end)
                .map(|row| input.cell(row, column).unwrap_or_default().trim().to_string())
                .collect();
            let codings = self.code_batch(&dialogues).await;

            let rows: Vec<Vec<String>> = (start..end)
                .zip(codings.iter())
                .map(|(row, coding)| {
                    let mut cells = input.rows[row].clone();
                    cells.extend(self.items.iter().map(|item| value_text(coding.get(item))));
                    cells
                })
                .collect();

            let file = OpenOptions::new()
                .append(true)
                .open(output)
                .with_context(|| format!("failed to append to {}", output.display()))?;
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
            for cells in &rows {
                writer.write_record(cells)?;
            }
            writer.flush()?;
            tracing::info!(done = end, total, "coded batch");

            start = end;
            if start < total && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        Ok(total)
    }
}
