use crate::models::{ClassGroup, ClassLevel, ClassWeakness, Skill, SkillScores, StudentRecord};

/// Score thresholds separating the three class levels.
///
/// Intervals are half-open: `[.., beginner_below)` is Beginner,
/// `[beginner_below, advanced_from)` is Intermediate and everything from
/// `advanced_from` up is Advanced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementPolicy {
    pub beginner_below: f64,
    pub advanced_from: f64,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            beginner_below: 45.0,
            advanced_from: 55.0,
        }
    }
}

impl PlacementPolicy {
    pub fn classify(&self, score: f64) -> ClassLevel {
        if score >= self.advanced_from {
            ClassLevel::Advanced
        } else if score >= self.beginner_below {
            ClassLevel::Intermediate
        } else {
            // NaN lands here as well
            ClassLevel::Beginner
        }
    }
}

pub fn total_score(record: &StudentRecord) -> f64 {
    record.total_score.unwrap_or_else(|| record.scores.mean())
}

/// Fills in the total score and class level of every record.
pub fn classify_students(records: &mut [StudentRecord], policy: &PlacementPolicy) {
    for record in records.iter_mut() {
        let total = total_score(record);
        record.total_score = Some(total);
        record.class_level = Some(policy.classify(total));
    }
}

/// Partitions classified records into the three class groups, in level order.
pub fn group_by_level(records: &[StudentRecord], policy: &PlacementPolicy) -> Vec<ClassGroup> {
    let mut groups: Vec<ClassGroup> = ClassLevel::ALL
        .into_iter()
        .map(|level| ClassGroup {
            level,
            students: Vec::new(),
        })
        .collect();

    for record in records {
        let level = record
            .class_level
            .unwrap_or_else(|| policy.classify(total_score(record)));
        let index = ClassLevel::ALL
            .iter()
            .position(|candidate| *candidate == level)
            .unwrap_or(0);
        groups[index].students.push(record.clone());
    }

    groups
}

fn ranked(scores: &SkillScores, descending: bool) -> Vec<Skill> {
    let mut skills: Vec<(Skill, f64)> = scores.iter().collect();
    // sort_by is stable, so ties keep listening/speaking/reading/writing order
    skills.sort_by(|a, b| {
        let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    skills.into_iter().map(|(skill, _)| skill).collect()
}

pub fn strengths(scores: &SkillScores) -> [Skill; 2] {
    let skills = ranked(scores, true);
    [skills[0], skills[1]]
}

pub fn weaknesses(scores: &SkillScores) -> [Skill; 2] {
    let skills = ranked(scores, false);
    [skills[0], skills[1]]
}

pub fn join_skills(skills: &[Skill]) -> String {
    skills
        .iter()
        .map(|skill| skill.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Average skill scores of a non-empty group.
pub fn group_averages(students: &[StudentRecord]) -> Option<SkillScores> {
    if students.is_empty() {
        return None;
    }
    let count = students.len() as f64;
    let sum = |skill: Skill| students.iter().map(|s| s.scores.get(skill)).sum::<f64>() / count;
    Some(SkillScores {
        listening: sum(Skill::Listening),
        speaking: sum(Skill::Speaking),
        reading: sum(Skill::Reading),
        writing: sum(Skill::Writing),
    })
}

/// The two weakest skills (by group average) of every non-empty class group.
pub fn class_weaknesses(groups: &[ClassGroup]) -> Vec<ClassWeakness> {
    groups
        .iter()
        .filter_map(|group| {
            group_averages(&group.students).map(|averages| ClassWeakness {
                level: group.level,
                weak_skills: weaknesses(&averages),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(score: f64) -> ClassLevel {
        PlacementPolicy::default().classify(score)
    }

    fn student(name: &str, scores: [f64; 4], total: Option<f64>) -> StudentRecord {
        StudentRecord {
            student_id: None,
            name: name.to_string(),
            scores: SkillScores {
                listening: scores[0],
                speaking: scores[1],
                reading: scores[2],
                writing: scores[3],
            },
            total_score: total,
            class_level: None,
        }
    }

    #[test]
    fn boundaries_follow_half_open_intervals() {
        assert_eq!(classify(44.9), ClassLevel::Beginner);
        assert_eq!(classify(45.0), ClassLevel::Intermediate);
        assert_eq!(classify(54.9), ClassLevel::Intermediate);
        assert_eq!(classify(55.0), ClassLevel::Advanced);
    }

    #[test]
    fn out_of_range_scores_still_classify() {
        assert_eq!(classify(-10.0), ClassLevel::Beginner);
        assert_eq!(classify(250.0), ClassLevel::Advanced);
        assert_eq!(classify(f64::NAN), ClassLevel::Beginner);
    }

    #[test]
    fn classification_is_monotonic() {
        let mut previous = classify(-50.0);
        let mut score = -50.0;
        while score <= 150.0 {
            let level = classify(score);
            assert!(level >= previous, "level dropped at {score}");
            previous = level;
            score += 0.1;
        }
    }

    #[test]
    fn missing_total_uses_mean_of_skills() {
        let mut records = vec![student("Aiko", [60.0, 50.0, 70.0, 40.0], None)];
        classify_students(&mut records, &PlacementPolicy::default());
        assert_eq!(records[0].total_score, Some(55.0));
        assert_eq!(records[0].class_level, Some(ClassLevel::Advanced));
    }

    #[test]
    fn precomputed_total_wins_over_mean() {
        let mut records = vec![student("Ren", [90.0, 90.0, 90.0, 90.0], Some(30.0))];
        classify_students(&mut records, &PlacementPolicy::default());
        assert_eq!(records[0].class_level, Some(ClassLevel::Beginner));
    }

    #[test]
    fn groups_are_exhaustive_and_disjoint() {
        let mut records = vec![
            student("A", [10.0, 10.0, 10.0, 10.0], None),
            student("B", [50.0, 50.0, 50.0, 50.0], None),
            student("C", [80.0, 80.0, 80.0, 80.0], None),
            student("D", [20.0, 20.0, 20.0, 20.0], None),
        ];
        let policy = PlacementPolicy::default();
        classify_students(&mut records, &policy);
        let groups = group_by_level(&records, &policy);

        assert_eq!(groups.len(), 3);
        let total: usize = groups.iter().map(|g| g.students.len()).sum();
        assert_eq!(total, records.len());
        assert_eq!(groups[0].level, ClassLevel::Beginner);
        assert_eq!(groups[0].students.len(), 2);
        assert_eq!(groups[1].students[0].name, "B");
        assert_eq!(groups[2].students[0].name, "C");
    }

    #[test]
    fn strengths_and_weaknesses_break_ties_in_skill_order() {
        let scores = SkillScores {
            listening: 70.0,
            speaking: 40.0,
            reading: 70.0,
            writing: 40.0,
        };
        assert_eq!(strengths(&scores), [Skill::Listening, Skill::Reading]);
        assert_eq!(weaknesses(&scores), [Skill::Speaking, Skill::Writing]);
        assert_eq!(join_skills(&strengths(&scores)), "Listening, Reading");
    }

    #[test]
    fn class_weaknesses_skip_empty_groups() {
        let mut records = vec![
            student("A", [30.0, 20.0, 40.0, 50.0], None),
            student("B", [40.0, 30.0, 50.0, 20.0], None),
        ];
        let policy = PlacementPolicy::default();
        classify_students(&mut records, &policy);
        let weaknesses = class_weaknesses(&group_by_level(&records, &policy));

        assert_eq!(weaknesses.len(), 1);
        assert_eq!(weaknesses[0].level, ClassLevel::Beginner);
        // averages: listening 35, speaking 25, reading 45, writing 35
        assert_eq!(weaknesses[0].weak_skills, [Skill::Speaking, Skill::Listening]);
    }
}
