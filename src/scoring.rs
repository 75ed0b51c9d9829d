use std::collections::HashMap;

use crate::items::ItemMap;
use crate::models::{ObservationKey, ScoredObservation};

/// One student's answer strings, keyed by response column.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRow {
    pub student_id: String,
    pub responses: Vec<(String, String)>,
}

/// Characters passed over while scoring. Counted, never reported one by one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreStats {
    pub scored: usize,
    pub unmapped_offsets: usize,
    pub unscorable_chars: usize,
}

impl ScoreStats {
    pub fn absorb(&mut self, other: ScoreStats) {
        self.scored += other.scored;
        self.unmapped_offsets += other.unmapped_offsets;
        self.unscorable_chars += other.unscorable_chars;
    }
}

pub struct Scorer<'a> {
    items: &'a ItemMap,
    letters: &'a str,
}

impl<'a> Scorer<'a> {
    pub fn new(items: &'a ItemMap, letters: &'a str) -> Self {
        Self { items, letters }
    }

    /// Scores one student without collapsing repeated skills.
    pub fn score_row(&self, row: &ResponseRow, stats: &mut ScoreStats) -> Vec<ScoredObservation> {
        let mut observations = Vec::new();
        for (column, answers) in &row.responses {
            for (offset, given) in answers.chars().enumerate() {
                let Some(item) = self.items.get(column, offset) else {
                    stats.unmapped_offsets += 1;
                    continue;
                };
                if !self.letters.contains(given) {
                    stats.unscorable_chars += 1;
                    continue;
                }
                stats.scored += 1;
                observations.push(ScoredObservation {
                    key: ObservationKey {
                        student_id: row.student_id.clone(),
                        descriptor: item.descriptor.clone(),
                        subject: item.subject,
                    },
                    correct: given == item.answer,
                });
            }
        }
        observations
    }

    /// Scores a batch and collapses it to one bit per (student, skill,
    /// subject): a skill answered correctly at least once counts as correct.
    pub fn score_batch(&self, rows: &[ResponseRow]) -> (HashMap<ObservationKey, bool>, ScoreStats) {
        let mut stats = ScoreStats::default();
        let mut collapsed: HashMap<ObservationKey, bool> = HashMap::new();
        for row in rows {
            for observation in self.score_row(row, &mut stats) {
                let slot = collapsed.entry(observation.key).or_insert(false);
                *slot |= observation.correct;
            }
        }
        (collapsed, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{ItemFilter, ItemRow};
    use crate::models::Subject;
    use regex::Regex;

    fn items() -> ItemMap {
        let filter = ItemFilter {
            descriptor: Regex::new(r"^D\d+$").unwrap(),
            excluded_answers: vec!["X".into()],
        };
        let rows = [("D01", "A", 1.0), ("D02", "B", 2.0), ("D01", "C", 3.0)]
            .into_iter()
            .map(|(descriptor, answer, position)| ItemRow {
                item_id: String::new(),
                descriptor: descriptor.to_string(),
                subject: Subject::Lp,
                answer: answer.to_string(),
                position,
                block: 1,
            })
            .collect();
        ItemMap::build(rows, &filter)
    }

    fn row(student: &str, answers: &str) -> ResponseRow {
        ResponseRow {
            student_id: student.to_string(),
            responses: vec![("TX_RESP_BLOCO1_LP".to_string(), answers.to_string())],
        }
    }

    #[test]
    fn wrong_valid_letter_is_an_incorrect_observation() {
        let items = items();
        let scorer = Scorer::new(&items, "ABCDE");
        let mut stats = ScoreStats::default();
        let observations = scorer.score_row(&row("7", "AC"), &mut stats);

        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].key.descriptor, "D01");
        assert!(observations[0].correct);
        assert_eq!(observations[1].key.descriptor, "D02");
        assert!(!observations[1].correct);
    }

    #[test]
    fn letters_outside_the_alphabet_are_skipped() {
        let items = items();
        let scorer = Scorer::new(&items, "AB");
        let mut stats = ScoreStats::default();
        let observations = scorer.score_row(&row("7", "AC*"), &mut stats);

        assert_eq!(observations.len(), 1);
        assert_eq!(stats.unscorable_chars, 2);
    }

    #[test]
    fn characters_beyond_mapped_items_are_skipped() {
        let items = items();
        let scorer = Scorer::new(&items, "ABCDE");
        let mut stats = ScoreStats::default();
        let observations = scorer.score_row(&row("7", "ABCDD"), &mut stats);

        assert_eq!(observations.len(), 3);
        assert_eq!(stats.unmapped_offsets, 2);
    }

    #[test]
    fn repeated_skill_collapses_to_any_correct() {
        let items = items();
        let scorer = Scorer::new(&items, "ABCDE");
        // D01 wrong at offset 0, right at offset 2.
        let (collapsed, stats) = scorer.score_batch(&[row("7", "BBC"), row("8", "BAA")]);

        assert_eq!(stats.scored, 6);
        assert_eq!(collapsed.len(), 4);
        let key = |student: &str, descriptor: &str| ObservationKey {
            student_id: student.to_string(),
            descriptor: descriptor.to_string(),
            subject: Subject::Lp,
        };
        assert_eq!(collapsed[&key("7", "D01")], true);
        assert_eq!(collapsed[&key("7", "D02")], true);
        assert_eq!(collapsed[&key("8", "D01")], false);
        assert_eq!(collapsed[&key("8", "D02")], false);
    }

    #[test]
    fn empty_response_strings_produce_nothing() {
        let items = items();
        let scorer = Scorer::new(&items, "ABCDE");
        let (collapsed, stats) = scorer.score_batch(&[row("7", "")]);
        assert!(collapsed.is_empty());
        assert_eq!(stats, ScoreStats::default());
    }
}
