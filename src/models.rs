use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClassLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl ClassLevel {
    pub const ALL: [ClassLevel; 3] = [
        ClassLevel::Beginner,
        ClassLevel::Intermediate,
        ClassLevel::Advanced,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClassLevel::Beginner => "Beginner",
            ClassLevel::Intermediate => "Intermediate",
            ClassLevel::Advanced => "Advanced",
        }
    }

    /// Stem used for per-level artifacts, e.g. `class_beginner.csv`.
    pub fn file_stem(self) -> String {
        format!("class_{}", self.as_str().to_lowercase())
    }
}

impl fmt::Display for ClassLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Skill {
    Listening,
    Speaking,
    Reading,
    Writing,
}

impl Skill {
    pub const ALL: [Skill; 4] = [
        Skill::Listening,
        Skill::Speaking,
        Skill::Reading,
        Skill::Writing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Skill::Listening => "Listening",
            Skill::Speaking => "Speaking",
            Skill::Reading => "Reading",
            Skill::Writing => "Writing",
        }
    }

    /// Suggested post-test item design for a class that is weak in this skill.
    pub fn posttest_template(self) -> &'static str {
        match self {
            Skill::Listening => {
                "Design basic everyday listening items, such as dictation of short dialogues and multiple choice after listening."
            }
            Skill::Speaking => {
                "Schedule interactive speaking tasks such as describing a picture or situational role play."
            }
            Skill::Reading => {
                "Add reading comprehension items such as paragraph ordering and choosing the main idea of a passage."
            }
            Skill::Writing => {
                "Design short sentence building and picture-prompted writing tasks to train structured expression."
            }
        }
    }
}

impl fmt::Display for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillScores {
    pub listening: f64,
    pub speaking: f64,
    pub reading: f64,
    pub writing: f64,
}

impl SkillScores {
    pub fn get(&self, skill: Skill) -> f64 {
        match skill {
            Skill::Listening => self.listening,
            Skill::Speaking => self.speaking,
            Skill::Reading => self.reading,
            Skill::Writing => self.writing,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Skill, f64)> + '_ {
        Skill::ALL.into_iter().map(move |skill| (skill, self.get(skill)))
    }

    pub fn mean(&self) -> f64 {
        (self.listening + self.speaking + self.reading + self.writing) / 4.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub student_id: Option<String>,
    pub name: String,
    pub scores: SkillScores,
    pub total_score: Option<f64>,
    pub class_level: Option<ClassLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentFeedback {
    pub name: String,
    pub listening: f64,
    pub speaking: f64,
    pub reading: f64,
    pub writing: f64,
    pub strengths: String,
    pub weaknesses: String,
    pub suggestion: String,
}

#[derive(Debug, Clone)]
pub struct ClassGroup {
    pub level: ClassLevel,
    pub students: Vec<StudentRecord>,
}

#[derive(Debug, Clone)]
pub struct ClassWeakness {
    pub level: ClassLevel,
    pub weak_skills: [Skill; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuizPoint {
    pub date: chrono::NaiveDate,
    pub score: f64,
}
