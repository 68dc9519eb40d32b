use std::fmt::Write;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::classify::{self, PlacementPolicy};
use crate::llm::{GenerationRequest, LlmError, TextGenerator};
use crate::models::{ClassWeakness, StudentFeedback, StudentRecord};

pub const QUOTA_FALLBACK: &str = "Suggestion quota has been reached, please try again later. \
Default suggestion: keep practising the weaker skills and use the course materials for regular self-assessment.";

pub const NO_CONTENT: &str = "No suggestion content was returned.";

const QUOTA_NOTICE: &str = "The suggestion service quota has been reached, so the following are \
preliminary suggestions. Try again later for a tailored version.";

const MAX_NAME_CHARS: usize = 80;

/// Output caps for a per-student suggestion and for the whole post-test transcript.
pub const SUGGESTION_MAX_TOKENS: u32 = 1024;
pub const POSTTEST_MAX_TOKENS: u32 = 2048;

fn bounded(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

pub fn student_prompt(record: &StudentRecord) -> String {
    let strengths = classify::strengths(&record.scores);
    let weaknesses = classify::weaknesses(&record.scores);
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are a Japanese language teaching expert. Give concrete study suggestions for the student below."
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Name: {}", bounded(&record.name, MAX_NAME_CHARS));
    for (skill, score) in record.scores.iter() {
        let _ = writeln!(prompt, "{skill}: {score}");
    }
    let _ = writeln!(prompt, "Strengths: {}", classify::join_skills(&strengths));
    let _ = writeln!(prompt, "Weaknesses: {}", classify::join_skills(&weaknesses));
    let _ = writeln!(prompt);
    let _ = write!(
        prompt,
        "Use clear paragraphs covering the student's strengths, weak points and improvement strategies. \
Do not describe the format, only give the suggestions."
    );
    prompt
}

pub fn posttest_prompt(weaknesses: &[ClassWeakness]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are a Japanese curriculum design expert. Based on the average weakest skills of each class, write post-test design suggestions."
    );
    let _ = writeln!(
        prompt,
        "Each paragraph must name the class, its weak skills, student tendencies and item design suggestions, in a natural and professional tone. Do not use the word Exit."
    );
    let _ = writeln!(prompt);
    for class in weaknesses {
        let _ = writeln!(
            prompt,
            "[{} class]: weak skills: {}, {}",
            class.level, class.weak_skills[0], class.weak_skills[1]
        );
    }
    prompt.trim_end().to_string()
}

/// Locally templated transcript used when the service refuses the request.
pub fn fallback_transcript(weaknesses: &[ClassWeakness]) -> String {
    let mut output = String::new();
    let _ = write!(output, "{QUOTA_NOTICE}");
    for class in weaknesses {
        let [first, second] = class.weak_skills;
        let _ = writeln!(output);
        let _ = writeln!(output);
        let _ = writeln!(output, "[{} class]", class.level);
        let _ = writeln!(
            output,
            "Students in this class are relatively weak in {first} and {second}."
        );
        let _ = writeln!(output, "{}", first.posttest_template());
        let _ = write!(output, "{}", second.posttest_template());
    }
    output
}

/// Best-effort text generation: every outcome is a displayable string.
#[derive(Clone)]
pub struct SuggestionGenerator {
    generator: Arc<dyn TextGenerator>,
    concurrency: usize,
}

impl SuggestionGenerator {
    pub fn new(generator: Arc<dyn TextGenerator>, concurrency: usize) -> Self {
        Self {
            generator,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn suggest(&self, record: &StudentRecord) -> String {
        let request = GenerationRequest::prompt(student_prompt(record))
            .with_max_output_tokens(SUGGESTION_MAX_TOKENS);
        match self.generator.generate(request).await {
            Ok(generation) => generation.text.trim().to_string(),
            Err(LlmError::EmptyResponse) => NO_CONTENT.to_string(),
            Err(err) if err.is_service_error() => {
                tracing::warn!(student = %record.name, error = %err, "suggestion service error, using fallback");
                QUOTA_FALLBACK.to_string()
            }
            Err(err) => {
                tracing::warn!(student = %record.name, error = %err, "suggestion generation failed");
                format!("Suggestion generation failed: {err}")
            }
        }
    }

    /// Feedback entries in record order. At most `concurrency` calls are in flight.
    /// Each call owns its generator handle and record, so the future is `Send`.
    pub async fn student_feedback(&self, records: &[StudentRecord]) -> Vec<StudentFeedback> {
        let concurrency = self.concurrency;
        let this = self.clone();
        stream::iter(records.to_vec())
            .map(move |record| {
                let this = this.clone();
                async move {
                    let suggestion = this.suggest(&record).await;
                    StudentFeedback {
                        strengths: classify::join_skills(&classify::strengths(&record.scores)),
                        weaknesses: classify::join_skills(&classify::weaknesses(&record.scores)),
                        listening: record.scores.listening,
                        speaking: record.scores.speaking,
                        reading: record.scores.reading,
                        writing: record.scores.writing,
                        name: record.name,
                        suggestion,
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    pub async fn posttest_transcript(
        &self,
        records: &[StudentRecord],
        policy: &PlacementPolicy,
    ) -> String {
        let weaknesses = classify::class_weaknesses(&classify::group_by_level(records, policy));
        if weaknesses.is_empty() {
            return String::new();
        }

        let request = GenerationRequest::prompt(posttest_prompt(&weaknesses))
            .with_max_output_tokens(POSTTEST_MAX_TOKENS);
        match self.generator.generate(request).await {
            Ok(generation) => generation.text.trim().to_string(),
            Err(LlmError::EmptyResponse) => {
                tracing::warn!("post-test service returned no text");
                String::new()
            }
            Err(err) if err.is_service_error() => {
                tracing::warn!(error = %err, "post-test service error, using templated transcript");
                fallback_transcript(&weaknesses)
            }
            Err(err) => {
                tracing::warn!(error = %err, "post-test transcript generation failed");
                format!("Post-test suggestion generation failed: {err}")
            }
        }
    }
}
