//! The closed set of plan sections.
//!
//! Patch paths address sections by name (`/title`, `/starterQuiz`, ...).
//! Each section has a shape its value must satisfy before it can be
//! committed, a fixed list of downstream sections invalidated when it
//! changes, and optionally experimental variant keys that can shadow it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A section of the teaching plan document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SectionKey {
    Title,
    Subject,
    KeyStage,
    Topic,
    LearningOutcome,
    LearningCycles,
    PriorKnowledge,
    KeyLearningPoints,
    Misconceptions,
    Keywords,
    BasedOn,
    StarterQuiz,
    Cycle1,
    Cycle2,
    Cycle3,
    ExitQuiz,
    AdditionalMaterials,
    #[serde(rename = "_experimental_starterQuizMathsV0")]
    StarterQuizMathsV0,
    #[serde(rename = "_experimental_exitQuizMathsV0")]
    ExitQuizMathsV0,
}

/// The value shape a section must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Non-empty string.
    Text,
    /// Array of non-empty strings.
    TextList,
    /// Array of question objects with answers and distractors.
    Quiz,
    /// A learning cycle object.
    Cycle,
    /// Array of misconception/description pairs.
    Misconceptions,
    /// Array of keyword/definition pairs.
    Keywords,
    /// Reference to an existing plan.
    BasedOn,
}

impl SectionKey {
    pub const ALL: &'static [SectionKey] = &[
        SectionKey::Title,
        SectionKey::Subject,
        SectionKey::KeyStage,
        SectionKey::Topic,
        SectionKey::LearningOutcome,
        SectionKey::LearningCycles,
        SectionKey::PriorKnowledge,
        SectionKey::KeyLearningPoints,
        SectionKey::Misconceptions,
        SectionKey::Keywords,
        SectionKey::BasedOn,
        SectionKey::StarterQuiz,
        SectionKey::Cycle1,
        SectionKey::Cycle2,
        SectionKey::Cycle3,
        SectionKey::ExitQuiz,
        SectionKey::AdditionalMaterials,
        SectionKey::StarterQuizMathsV0,
        SectionKey::ExitQuizMathsV0,
    ];

    /// The section name as it appears in patch paths, without the slash.
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKey::Title => "title",
            SectionKey::Subject => "subject",
            SectionKey::KeyStage => "keyStage",
            SectionKey::Topic => "topic",
            SectionKey::LearningOutcome => "learningOutcome",
            SectionKey::LearningCycles => "learningCycles",
            SectionKey::PriorKnowledge => "priorKnowledge",
            SectionKey::KeyLearningPoints => "keyLearningPoints",
            SectionKey::Misconceptions => "misconceptions",
            SectionKey::Keywords => "keywords",
            SectionKey::BasedOn => "basedOn",
            SectionKey::StarterQuiz => "starterQuiz",
            SectionKey::Cycle1 => "cycle1",
            SectionKey::Cycle2 => "cycle2",
            SectionKey::Cycle3 => "cycle3",
            SectionKey::ExitQuiz => "exitQuiz",
            SectionKey::AdditionalMaterials => "additionalMaterials",
            SectionKey::StarterQuizMathsV0 => "_experimental_starterQuizMathsV0",
            SectionKey::ExitQuizMathsV0 => "_experimental_exitQuizMathsV0",
        }
    }

    /// Resolve a patch path (`/title`) or bare name (`title`).
    pub fn from_path(path: &str) -> Option<SectionKey> {
        let name = path.strip_prefix('/').unwrap_or(path);
        SectionKey::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    pub fn kind(&self) -> SectionKind {
        match self {
            SectionKey::Title
            | SectionKey::Subject
            | SectionKey::KeyStage
            | SectionKey::Topic
            | SectionKey::LearningOutcome
            | SectionKey::AdditionalMaterials => SectionKind::Text,
            SectionKey::LearningCycles
            | SectionKey::PriorKnowledge
            | SectionKey::KeyLearningPoints => SectionKind::TextList,
            SectionKey::Misconceptions => SectionKind::Misconceptions,
            SectionKey::Keywords => SectionKind::Keywords,
            SectionKey::BasedOn => SectionKind::BasedOn,
            SectionKey::StarterQuiz
            | SectionKey::ExitQuiz
            | SectionKey::StarterQuizMathsV0
            | SectionKey::ExitQuizMathsV0 => SectionKind::Quiz,
            SectionKey::Cycle1 | SectionKey::Cycle2 | SectionKey::Cycle3 => SectionKind::Cycle,
        }
    }

    /// Sections whose committed values become stale when this one changes.
    /// The graph is acyclic: edges only point from foundation sections
    /// toward derived ones.
    pub fn dependants(&self) -> &'static [SectionKey] {
        match self {
            SectionKey::Title | SectionKey::Subject | SectionKey::KeyStage | SectionKey::Topic => {
                &[SectionKey::LearningOutcome, SectionKey::LearningCycles]
            }
            SectionKey::LearningOutcome => &[SectionKey::LearningCycles],
            SectionKey::LearningCycles => {
                &[SectionKey::Cycle1, SectionKey::Cycle2, SectionKey::Cycle3]
            }
            SectionKey::PriorKnowledge => &[SectionKey::StarterQuiz],
            SectionKey::KeyLearningPoints => &[SectionKey::StarterQuiz, SectionKey::ExitQuiz],
            SectionKey::Cycle1 | SectionKey::Cycle2 | SectionKey::Cycle3 => &[SectionKey::ExitQuiz],
            _ => &[],
        }
    }

    /// Experimental variant keys that may shadow this section.
    pub fn variants(&self) -> &'static [SectionKey] {
        match self {
            SectionKey::StarterQuiz => &[SectionKey::StarterQuizMathsV0],
            SectionKey::ExitQuiz => &[SectionKey::ExitQuizMathsV0],
            _ => &[],
        }
    }

    /// The canonical section this key is a variant of, if it is one.
    pub fn canonical(&self) -> Option<SectionKey> {
        match self {
            SectionKey::StarterQuizMathsV0 => Some(SectionKey::StarterQuiz),
            SectionKey::ExitQuizMathsV0 => Some(SectionKey::ExitQuiz),
            _ => None,
        }
    }

    /// Whether `value` satisfies this section's shape. Only values that
    /// pass may be committed; anything else stays speculative.
    pub fn validate(&self, value: &Value) -> bool {
        self.kind().validate(value)
    }
}

impl std::fmt::Display for SectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SectionKind {
    pub fn validate(&self, value: &Value) -> bool {
        match self {
            SectionKind::Text => non_empty_string(value),
            SectionKind::TextList => {
                value
                    .as_array()
                    .is_some_and(|items| !items.is_empty() && items.iter().all(non_empty_string))
            }
            SectionKind::Quiz => value.as_array().is_some_and(|items| {
                !items.is_empty() && items.iter().all(is_quiz_question)
            }),
            SectionKind::Cycle => is_cycle(value),
            SectionKind::Misconceptions => value.as_array().is_some_and(|items| {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|item| has_string_fields(item, &["misconception", "description"]))
            }),
            SectionKind::Keywords => value.as_array().is_some_and(|items| {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|item| has_string_fields(item, &["keyword", "definition"]))
            }),
            SectionKind::BasedOn => has_string_fields(value, &["id", "title"]),
        }
    }
}

fn non_empty_string(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.trim().is_empty())
}

fn has_string_fields(value: &Value, fields: &[&str]) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    fields
        .iter()
        .all(|f| obj.get(*f).is_some_and(non_empty_string))
}

fn is_quiz_question(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("question").is_some_and(non_empty_string)
        && obj.get("answers").is_some_and(|v| {
            v.as_array()
                .is_some_and(|a| !a.is_empty() && a.iter().all(non_empty_string))
        })
        && obj.get("distractors").is_some_and(|v| {
            v.as_array().is_some_and(|a| a.iter().all(non_empty_string))
        })
}

fn is_cycle(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("title").is_some_and(non_empty_string)
        && obj
            .get("durationInMinutes")
            .is_some_and(|v| v.as_u64().is_some())
        && obj.get("explanation").is_some_and(|v| v.is_object())
        && obj
            .get("checkForUnderstanding")
            .is_some_and(|v| v.is_array())
        && obj.get("practice").is_some_and(non_empty_string)
        && obj.get("feedback").is_some_and(non_empty_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn resolves_paths_and_bare_names() {
        assert_eq!(SectionKey::from_path("/title"), Some(SectionKey::Title));
        assert_eq!(
            SectionKey::from_path("starterQuiz"),
            Some(SectionKey::StarterQuiz)
        );
        assert_eq!(
            SectionKey::from_path("/_experimental_exitQuizMathsV0"),
            Some(SectionKey::ExitQuizMathsV0)
        );
        assert_eq!(SectionKey::from_path("/priorQuiz"), None);
    }

    #[test]
    fn serde_names_match_wire_names() {
        for key in SectionKey::ALL {
            let serialised = serde_json::to_string(key).unwrap();
            assert_eq!(serialised, format!("\"{}\"", key.as_str()));
        }
    }

    #[test]
    fn text_sections_reject_non_strings() {
        assert!(SectionKey::Title.validate(&json!("Forces and motion")));
        assert!(!SectionKey::Title.validate(&json!("")));
        assert!(!SectionKey::Title.validate(&json!(["Forces"])));
        assert!(!SectionKey::Title.validate(&json!(null)));
    }

    #[test]
    fn quiz_shape_requires_answers_and_distractors() {
        let good = json!([{
            "question": "What is a force?",
            "answers": ["A push or a pull"],
            "distractors": ["A kind of energy", "A material"]
        }]);
        assert!(SectionKey::StarterQuiz.validate(&good));

        let missing_answers = json!([{ "question": "What is a force?", "distractors": [] }]);
        assert!(!SectionKey::StarterQuiz.validate(&missing_answers));
        assert!(!SectionKey::ExitQuiz.validate(&json!([])));
    }

    #[test]
    fn cycle_shape_is_checked() {
        let good = json!({
            "title": "Explaining friction",
            "durationInMinutes": 15,
            "explanation": { "spokenExplanation": ["Friction opposes motion"] },
            "checkForUnderstanding": [],
            "practice": "Label the force diagrams.",
            "feedback": "Model answer: arrows oppose motion."
        });
        assert!(SectionKey::Cycle1.validate(&good));

        let mut bad = good.clone();
        bad.as_object_mut().unwrap().remove("practice");
        assert!(!SectionKey::Cycle1.validate(&bad));
    }

    #[test]
    fn keyword_and_misconception_shapes() {
        assert!(SectionKey::Keywords.validate(&json!([
            { "keyword": "friction", "definition": "A force opposing motion" }
        ])));
        assert!(!SectionKey::Keywords.validate(&json!([{ "keyword": "friction" }])));
        assert!(SectionKey::Misconceptions.validate(&json!([
            { "misconception": "Heavier objects fall faster", "description": "Mass does not change acceleration in free fall." }
        ])));
    }

    #[test]
    fn variant_tables_are_consistent() {
        for key in SectionKey::ALL {
            for variant in key.variants() {
                assert_eq!(variant.canonical(), Some(*key));
                assert_eq!(variant.kind(), key.kind());
            }
        }
    }

    #[test]
    fn dependency_graph_is_acyclic() {
        fn visit(key: SectionKey, path: &mut HashSet<SectionKey>) {
            assert!(path.insert(key), "cycle through {key}");
            for dep in key.dependants() {
                visit(*dep, path);
            }
            path.remove(&key);
        }
        for key in SectionKey::ALL {
            visit(*key, &mut HashSet::new());
        }
    }
}
