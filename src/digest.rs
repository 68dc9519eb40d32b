//! Round-robin "agent" conversations over chunks of classified rosters.
//!
//! Each chunk gets its own conversation; chunks run concurrently and every
//! message is gathered before the log is written.

use std::path::Path;

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::llm::{GenerationRequest, Message, TextGenerator};
use crate::roster::Roster;

pub const CHUNK_SIZE: usize = 1000;
pub const TERMINATION_WORD: &str = "exit";
pub const OUTPUT_FILE: &str = "final_conversation.csv";

#[derive(Debug, Clone, Copy)]
pub struct Agent {
    pub name: &'static str,
    pub instruction: &'static str,
}

pub const AGENTS: [Agent; 2] = [
    Agent {
        name: "data_agent",
        instruction: "You are a data analyst for a Japanese language learning centre. \
Summarise the score distribution of the batch by class level and point out the weakest skills.",
    },
    Agent {
        name: "assistant",
        instruction: "You are a Japanese curriculum advisor. Building on the analysis so far, \
propose study plans for beginner, intermediate and advanced learners and outline a 100-point placement test for each level. \
Reply with the word exit on its own line when the recommendation is complete.",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestMessage {
    pub batch_start: usize,
    pub batch_end: usize,
    pub source: String,
    pub content: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Concatenates several tables. Rows are re-keyed onto the union of headers.
pub fn concat(rosters: &[Roster]) -> Roster {
    let mut headers: Vec<String> = Vec::new();
    for roster in rosters {
        for header in &roster.headers {
            if !headers.contains(header) {
                headers.push(header.clone());
            }
        }
    }

    let mut combined = Roster::new(headers.clone());
    for roster in rosters {
        let positions: Vec<Option<usize>> = headers
            .iter()
            .map(|header| roster.headers.iter().position(|h| h == header))
            .collect();
        for row in &roster.rows {
            combined.rows.push(
                positions
                    .iter()
                    .map(|position| position.map(|p| row[p].clone()).unwrap_or_default())
                    .collect(),
            );
        }
    }
    combined
}

fn chunk_json(roster: &Roster, rows: std::ops::Range<usize>) -> String {
    let records: Vec<Value> = rows
        .map(|row| {
            let object: Map<String, Value> = roster
                .headers
                .iter()
                .zip(roster.rows[row].iter())
                .map(|(header, cell)| (header.clone(), Value::String(cell.clone())))
                .collect();
            Value::Object(object)
        })
        .collect();
    Value::Array(records).to_string()
}

pub fn chunk_prompt(start: usize, end: usize, total: usize, data: &str) -> String {
    format!(
        "Now processing records {start} to {end} (of {total}).\n\
Batch data:\n{data}\n\n\
Analyse the data above and give complete recommendations. In particular:\n\
  1. Compare common Japanese course progressions and separate beginner, intermediate and advanced learners;\n\
  2. Describe assessment benchmarks for Japanese learning (speaking, vocabulary size, grammar use, listening, reading);\n\
  3. Finally provide three 100-point Japanese tests of different levels with reference notes.\n\
Cooperate to produce one complete, useful recommendation and a test that discriminates between learners."
    )
}

pub struct Digest<'a> {
    pub generator: &'a dyn TextGenerator,
    pub chunk_size: usize,
    pub max_turns: usize,
}

impl Digest<'_> {
    async fn converse(&self, start: usize, end: usize, prompt: String) -> Vec<DigestMessage> {
        let mut transcript = vec![Message::user(prompt)];
        let mut messages = Vec::new();

        for turn in 0..self.max_turns {
            let agent = AGENTS[turn % AGENTS.len()];
            let mut conversation = vec![Message::system(agent.instruction)];
            conversation.extend(transcript.iter().cloned());

            let generation = match self.generator.generate(GenerationRequest::new(conversation)).await {
                Ok(generation) => generation,
                Err(err) => {
                    tracing::warn!(batch_start = start, agent = agent.name, error = %err, "agent turn failed, ending conversation");
                    break;
                }
            };

            let content = generation.text.trim().to_string();
            tracing::info!(batch_start = start, agent = agent.name, "agent replied");
            messages.push(DigestMessage {
                batch_start: start,
                batch_end: end,
                source: agent.name.to_string(),
                content: content.clone(),
                prompt_tokens: generation.usage.map(|u| u.prompt_tokens),
                completion_tokens: generation.usage.map(|u| u.completion_tokens),
            });

            let done = content.to_lowercase().contains(TERMINATION_WORD);
            transcript.push(Message::assistant(format!("[{}] {}", agent.name, content)));
            if done {
                break;
            }
        }

        messages
    }

    /// Runs one conversation per chunk concurrently and returns all messages
    /// in chunk order.
    pub async fn run(&self, roster: &Roster) -> Vec<DigestMessage> {
        let total = roster.len();
        let chunk_size = self.chunk_size.max(1);
        let tasks = (0..total).step_by(chunk_size).map(|start| {
            let end = (start + chunk_size).min(total);
            let prompt = chunk_prompt(start, end - 1, total, &chunk_json(roster, start..end));
            self.converse(start, end - 1, prompt)
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }
}

pub fn write_log(path: &Path, messages: &[DigestMessage]) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    std::io::Write::write_all(&mut file, b"\xEF\xBB\xBF")?;
    let mut writer = csv::Writer::from_writer(file);
    if messages.is_empty() {
        writer.write_record([
            "batch_start",
            "batch_end",
            "source",
            "content",
            "prompt_tokens",
            "completion_tokens",
        ])?;
    }
    for message in messages {
        writer.serialize(message)?;
    }
    writer.flush()?;
    Ok(())
}
