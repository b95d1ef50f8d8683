//! Plan document synthesis.
//!
//! The synthesizer folds the patch stream into a two-layer document.
//! Patches land in a speculative overlay while the turn streams;
//! committing a turn promotes every section that passes its shape check
//! and discards the rest. Aborting a turn throws the overlay away, so
//! the committed document only ever reflects complete turns. Committed
//! sections carry provenance: machine-written, or tweaked by the user
//! with the machine's original kept alongside for diffing.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use planweave_protocol::{PatchError, PatchOp, SectionKey};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("patch path does not name a known section: {path}")]
    UnknownPath { path: String },

    #[error("cannot tweak {key}: section has no committed value")]
    MissingSection { key: SectionKey },

    #[error("value for {key} does not satisfy the section shape")]
    InvalidShape { key: SectionKey },

    #[error("{variant} is not a variant of {canonical}")]
    InvalidVariant {
        canonical: SectionKey,
        variant: SectionKey,
    },
}

impl From<PatchError> for DocumentError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::UnknownPath { path } => DocumentError::UnknownPath { path },
        }
    }
}

/// Who authored a committed section value.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// Written by the model in the named generation.
    AiGenerated { generation_id: String },
    /// Edited by the user. `original` is the machine-written value the
    /// first tweak replaced; later tweaks carry it forward unchanged,
    /// along with the generation that produced it.
    UserTweaked {
        original: Value,
        generation_id: String,
    },
}

/// A committed section value with its provenance and staleness.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionState {
    pub value: Value,
    pub provenance: Provenance,
    /// Set when a section this one derives from changed after commit.
    pub stale: bool,
}

/// Active experiment variants, keyed by canonical section.
#[derive(Debug, Clone, Default)]
pub struct ExperimentAssignment {
    active: BTreeMap<SectionKey, SectionKey>,
}

impl ExperimentAssignment {
    pub fn none() -> Self {
        Self::default()
    }

    /// Activate `variant` for its canonical section.
    pub fn activate(
        mut self,
        canonical: SectionKey,
        variant: SectionKey,
    ) -> Result<Self, DocumentError> {
        if !canonical.variants().contains(&variant) {
            return Err(DocumentError::InvalidVariant { canonical, variant });
        }
        self.active.insert(canonical, variant);
        Ok(self)
    }

    pub fn variant_for(&self, canonical: SectionKey) -> Option<SectionKey> {
        self.active.get(&canonical).copied()
    }
}

/// What one turn commit did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    pub committed: Vec<SectionKey>,
    /// Sections whose speculative value failed the shape check.
    pub rejected: Vec<SectionKey>,
    pub removed: Vec<SectionKey>,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.rejected.is_empty() && self.removed.is_empty()
    }
}

/// Deterministic fold of a patch stream into a plan document.
#[derive(Debug, Default)]
pub struct DocumentSynthesizer {
    committed: BTreeMap<SectionKey, SectionState>,
    speculative: BTreeMap<SectionKey, Value>,
    speculative_removals: BTreeSet<SectionKey>,
    experiments: ExperimentAssignment,
}

impl DocumentSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_experiments(mut self, experiments: ExperimentAssignment) -> Self {
        self.experiments = experiments;
        self
    }

    /// Apply one streamed patch to the speculative overlay.
    ///
    /// A patch addressed to a canonical key with an active experiment
    /// variant lands on the variant key, so only one of the pair ever
    /// holds a committed value. The value is not shape-checked here;
    /// invalid values stay speculative until the commit pass rejects
    /// them. Returns the section the patch landed on.
    pub fn apply_patch(&mut self, op: &PatchOp) -> Result<SectionKey, DocumentError> {
        let addressed = op.section()?;
        let key = self.experiments.variant_for(addressed).unwrap_or(addressed);
        match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                self.speculative_removals.remove(&key);
                self.speculative.insert(key, value.clone());
            }
            PatchOp::Remove { .. } => {
                self.speculative.remove(&key);
                self.speculative_removals.insert(key);
            }
        }
        tracing::debug!(section = %key, "patch applied speculatively");
        Ok(key)
    }

    /// Promote the speculative overlay into the committed document.
    ///
    /// Sections that pass their shape check are committed with
    /// machine-written provenance under `generation_id`; the rest are
    /// rejected and dropped. Every committed change marks its dependant
    /// sections stale.
    pub fn commit_turn(&mut self, generation_id: &str) -> CommitSummary {
        let mut summary = CommitSummary::default();

        let removals = std::mem::take(&mut self.speculative_removals);
        for key in removals {
            if self.committed.remove(&key).is_some() {
                summary.removed.push(key);
                self.on_trigger_changed(key);
            }
        }

        let speculative = std::mem::take(&mut self.speculative);
        for (key, value) in speculative {
            if !key.validate(&value) {
                tracing::warn!(section = %key, "rejecting speculative value at commit");
                summary.rejected.push(key);
                continue;
            }
            self.committed.insert(
                key,
                SectionState {
                    value,
                    provenance: Provenance::AiGenerated {
                        generation_id: generation_id.to_string(),
                    },
                    stale: false,
                },
            );
            summary.committed.push(key);
            self.on_trigger_changed(key);
        }

        if !summary.is_empty() {
            tracing::info!(
                committed = summary.committed.len(),
                rejected = summary.rejected.len(),
                removed = summary.removed.len(),
                "turn committed"
            );
        }
        summary
    }

    /// Drop the speculative overlay, e.g. on cancellation or timeout.
    /// The committed document is untouched.
    pub fn discard_speculative(&mut self) {
        if !self.speculative.is_empty() || !self.speculative_removals.is_empty() {
            tracing::debug!(
                dropped = self.speculative.len(),
                "discarding speculative overlay"
            );
        }
        self.speculative.clear();
        self.speculative_removals.clear();
    }

    /// Mark every committed dependant of `key` stale.
    pub fn on_trigger_changed(&mut self, key: SectionKey) {
        for dep in key.dependants() {
            if let Some(state) = self.committed.get_mut(dep) {
                if !state.stale {
                    tracing::debug!(section = %dep, trigger = %key, "section marked stale");
                    state.stale = true;
                }
            }
        }
    }

    /// Apply a user edit to a committed section.
    ///
    /// The first tweak of a machine-written value preserves that value
    /// as the original; tweaking a tweak carries the same original
    /// forward. The edit is shape-checked immediately.
    pub fn tweak_section(&mut self, key: SectionKey, value: Value) -> Result<(), DocumentError> {
        if !key.validate(&value) {
            return Err(DocumentError::InvalidShape { key });
        }
        let state = self
            .committed
            .get_mut(&key)
            .ok_or(DocumentError::MissingSection { key })?;

        let (original, generation_id) = match &state.provenance {
            Provenance::AiGenerated { generation_id } => {
                (state.value.clone(), generation_id.clone())
            }
            Provenance::UserTweaked {
                original,
                generation_id,
            } => (original.clone(), generation_id.clone()),
        };
        *state = SectionState {
            value,
            provenance: Provenance::UserTweaked {
                original,
                generation_id,
            },
            stale: false,
        };
        self.on_trigger_changed(key);
        Ok(())
    }

    /// The committed value a reader should see for `canonical`: the
    /// active experiment variant's value when one is committed, the
    /// canonical value otherwise.
    pub fn resolve_candidate(&self, canonical: SectionKey) -> Option<&SectionState> {
        if let Some(variant) = self.experiments.variant_for(canonical) {
            if let Some(state) = self.committed.get(&variant) {
                return Some(state);
            }
        }
        self.committed.get(&canonical)
    }

    /// Raw committed state for a key, without variant resolution.
    pub fn section(&self, key: SectionKey) -> Option<&SectionState> {
        self.committed.get(&key)
    }

    pub fn is_stale(&self, key: SectionKey) -> bool {
        self.committed.get(&key).is_some_and(|s| s.stale)
    }

    /// The committed document keyed by canonical section names. Variant
    /// values appear under their canonical key; variant keys themselves
    /// are never exposed.
    pub fn view(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for key in SectionKey::ALL {
            if key.canonical().is_some() {
                continue;
            }
            if let Some(state) = self.resolve_candidate(*key) {
                out.insert(key.as_str().to_string(), state.value.clone());
            }
        }
        out
    }

    /// The committed view with the speculative overlay applied, for
    /// progress reporting while a turn streams.
    pub fn working_view(&self) -> Map<String, Value> {
        let mut out = self.view();
        for key in &self.speculative_removals {
            out.remove(key.canonical().unwrap_or(*key).as_str());
        }
        for (key, value) in &self.speculative {
            let name = key
                .canonical()
                .unwrap_or(*key)
                .as_str()
                .to_string();
            out.insert(name, value.clone());
        }
        out
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    pub fn speculative_count(&self) -> usize {
        self.speculative.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(path: &str, value: Value) -> PatchOp {
        PatchOp::Add {
            path: path.into(),
            value,
        }
    }

    fn replace(path: &str, value: Value) -> PatchOp {
        PatchOp::Replace {
            path: path.into(),
            value,
        }
    }

    fn quiz() -> Value {
        json!([{
            "question": "What opposes motion between surfaces?",
            "answers": ["Friction"],
            "distractors": ["Gravity", "Magnetism"]
        }])
    }

    #[test]
    fn patches_stay_speculative_until_commit() {
        let mut doc = DocumentSynthesizer::new();
        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();
        assert!(doc.view().is_empty());
        assert_eq!(doc.working_view().get("title"), Some(&json!("Forces")));

        let summary = doc.commit_turn("gen-1");
        assert_eq!(summary.committed, vec![SectionKey::Title]);
        assert_eq!(doc.view().get("title"), Some(&json!("Forces")));
        assert_eq!(doc.speculative_count(), 0);
    }

    #[test]
    fn invalid_values_are_rejected_at_commit() {
        let mut doc = DocumentSynthesizer::new();
        // A quiz section holding a bare string fails its shape check.
        doc.apply_patch(&add("/starterQuiz", json!("not a quiz"))).unwrap();
        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();

        let summary = doc.commit_turn("gen-1");
        assert_eq!(summary.committed, vec![SectionKey::Title]);
        assert_eq!(summary.rejected, vec![SectionKey::StarterQuiz]);
        assert!(doc.section(SectionKey::StarterQuiz).is_none());
    }

    #[test]
    fn unknown_paths_are_refused() {
        let mut doc = DocumentSynthesizer::new();
        let err = doc.apply_patch(&add("/banner", json!("x"))).unwrap_err();
        assert!(matches!(err, DocumentError::UnknownPath { .. }));
    }

    #[test]
    fn replay_of_the_same_ops_yields_the_same_document() {
        let ops = vec![
            add("/title", json!("Forces")),
            add("/keyStage", json!("key-stage-3")),
            replace("/title", json!("Forces and motion")),
            add("/starterQuiz", quiz()),
        ];

        let build = || {
            let mut doc = DocumentSynthesizer::new();
            for op in &ops {
                doc.apply_patch(op).unwrap();
            }
            doc.commit_turn("gen-1");
            doc.view()
        };

        assert_eq!(build(), build());
        assert_eq!(build().get("title"), Some(&json!("Forces and motion")));
    }

    #[test]
    fn discard_leaves_previous_commits_intact() {
        let mut doc = DocumentSynthesizer::new();
        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();
        doc.commit_turn("gen-1");

        // A later turn is interrupted partway through.
        doc.apply_patch(&replace("/title", json!("Energy"))).unwrap();
        doc.apply_patch(&add("/topic", json!("Stores of energy"))).unwrap();
        doc.discard_speculative();

        let mut fresh = DocumentSynthesizer::new();
        fresh.apply_patch(&add("/title", json!("Forces"))).unwrap();
        fresh.commit_turn("gen-1");
        assert_eq!(doc.view(), fresh.view());
    }

    #[test]
    fn tweak_wraps_the_machine_value_once() {
        let mut doc = DocumentSynthesizer::new();
        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();
        doc.commit_turn("gen-1");

        doc.tweak_section(SectionKey::Title, json!("Forces (edited)"))
            .unwrap();
        doc.tweak_section(SectionKey::Title, json!("Forces (edited twice)"))
            .unwrap();

        let state = doc.section(SectionKey::Title).unwrap();
        assert_eq!(state.value, json!("Forces (edited twice)"));
        // The original machine-written value survives repeated tweaks.
        assert_eq!(
            state.provenance,
            Provenance::UserTweaked {
                original: json!("Forces"),
                generation_id: "gen-1".into()
            }
        );
    }

    #[test]
    fn tweaks_are_shape_checked_and_need_a_committed_value() {
        let mut doc = DocumentSynthesizer::new();
        assert!(matches!(
            doc.tweak_section(SectionKey::Title, json!("x")),
            Err(DocumentError::MissingSection { .. })
        ));

        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();
        doc.commit_turn("gen-1");
        assert!(matches!(
            doc.tweak_section(SectionKey::Title, json!(42)),
            Err(DocumentError::InvalidShape { .. })
        ));
    }

    #[test]
    fn changing_a_trigger_marks_dependants_stale() {
        let mut doc = DocumentSynthesizer::new();
        doc.apply_patch(&add("/priorKnowledge", json!(["Pushes and pulls"])))
            .unwrap();
        doc.apply_patch(&add("/starterQuiz", quiz())).unwrap();
        doc.commit_turn("gen-1");
        // commit order is section order; priorKnowledge commits before
        // starterQuiz, whose fresh value clears the flag.
        assert!(!doc.is_stale(SectionKey::StarterQuiz));

        doc.apply_patch(&replace("/priorKnowledge", json!(["Balanced forces"])))
            .unwrap();
        doc.commit_turn("gen-2");
        assert!(doc.is_stale(SectionKey::StarterQuiz));

        // Regenerating the quiz clears the flag again.
        doc.apply_patch(&replace("/starterQuiz", quiz())).unwrap();
        doc.commit_turn("gen-3");
        assert!(!doc.is_stale(SectionKey::StarterQuiz));
    }

    #[test]
    fn remove_deletes_the_committed_section() {
        let mut doc = DocumentSynthesizer::new();
        doc.apply_patch(&add("/title", json!("Forces"))).unwrap();
        doc.commit_turn("gen-1");

        doc.apply_patch(&PatchOp::Remove {
            path: "/title".into(),
        })
        .unwrap();
        let summary = doc.commit_turn("gen-2");
        assert_eq!(summary.removed, vec![SectionKey::Title]);
        assert!(doc.view().is_empty());
    }

    #[test]
    fn active_variant_captures_writes_and_shadows_reads() {
        let experiments = ExperimentAssignment::none()
            .activate(SectionKey::StarterQuiz, SectionKey::StarterQuizMathsV0)
            .unwrap();
        let mut doc = DocumentSynthesizer::new().with_experiments(experiments);

        // The patch addresses the canonical key; the variant takes it.
        let landed = doc.apply_patch(&add("/starterQuiz", quiz())).unwrap();
        assert_eq!(landed, SectionKey::StarterQuizMathsV0);
        doc.commit_turn("gen-1");

        assert!(doc.section(SectionKey::StarterQuiz).is_none());
        assert!(doc.section(SectionKey::StarterQuizMathsV0).is_some());

        // Readers still see the value under the canonical name.
        let view = doc.view();
        assert_eq!(view.get("starterQuiz"), Some(&quiz()));
        assert!(!view.contains_key("_experimental_starterQuizMathsV0"));
    }

    #[test]
    fn removing_an_active_variant_hides_the_canonical_entry_mid_turn() {
        let experiments = ExperimentAssignment::none()
            .activate(SectionKey::StarterQuiz, SectionKey::StarterQuizMathsV0)
            .unwrap();
        let mut doc = DocumentSynthesizer::new().with_experiments(experiments);
        doc.apply_patch(&add("/starterQuiz", quiz())).unwrap();
        doc.commit_turn("gen-1");
        assert!(doc.view().contains_key("starterQuiz"));

        // The removal also lands on the variant; the working view must
        // drop the canonical entry the variant was exposed under.
        doc.apply_patch(&PatchOp::Remove {
            path: "/starterQuiz".into(),
        })
        .unwrap();
        assert!(!doc.working_view().contains_key("starterQuiz"));

        doc.commit_turn("gen-2");
        assert!(!doc.view().contains_key("starterQuiz"));
    }

    #[test]
    fn missing_variant_falls_back_to_canonical() {
        let experiments = ExperimentAssignment::none()
            .activate(SectionKey::ExitQuiz, SectionKey::ExitQuizMathsV0)
            .unwrap();
        let mut doc = DocumentSynthesizer::new().with_experiments(experiments);
        doc.apply_patch(&add("/exitQuiz", quiz())).unwrap();
        doc.commit_turn("gen-1");
        assert_eq!(doc.view().get("exitQuiz"), Some(&quiz()));
    }

    #[test]
    fn variant_assignment_is_validated() {
        assert!(matches!(
            ExperimentAssignment::none().activate(SectionKey::Title, SectionKey::ExitQuizMathsV0),
            Err(DocumentError::InvalidVariant { .. })
        ));
    }
}
