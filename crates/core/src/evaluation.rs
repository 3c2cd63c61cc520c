//! Structured evaluation result attached to a scored submission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::band::{BandScore, Criterion};
use crate::error::{DomainError, DomainResult};

/// Outcome of a successful evaluation.
///
/// The overall band is always derived from the four criterion bands, so two
/// results with the same criterion scores carry the same overall band no matter
/// which provider produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEvaluation")]
pub struct EvaluationResult {
    overall_band: BandScore,
    criteria_scores: BTreeMap<Criterion, BandScore>,
    feedback: BTreeMap<Criterion, Vec<String>>,
    priority_fixes: Vec<String>,
    improved_essay: Option<String>,
}

impl EvaluationResult {
    /// Build a result, validating that every criterion is scored.
    ///
    /// Feedback for criteria that were not commented on is stored as an empty
    /// list; empty strings in feedback and fixes are dropped.
    pub fn new(
        criteria_scores: BTreeMap<Criterion, BandScore>,
        feedback: BTreeMap<Criterion, Vec<String>>,
        priority_fixes: Vec<String>,
        improved_essay: Option<String>,
    ) -> DomainResult<Self> {
        if let Some(missing) = Criterion::ALL
            .iter()
            .find(|c| !criteria_scores.contains_key(c))
        {
            return Err(DomainError::validation(format!(
                "missing score for criterion {missing}"
            )));
        }

        let overall_band = BandScore::overall(criteria_scores.values().copied())
            .ok_or_else(|| DomainError::validation("no criterion scores"))?;

        let mut feedback: BTreeMap<Criterion, Vec<String>> = feedback
            .into_iter()
            .map(|(c, items)| (c, non_blank(items)))
            .collect();
        for c in Criterion::ALL {
            feedback.entry(c).or_default();
        }

        Ok(Self {
            overall_band,
            criteria_scores,
            feedback,
            priority_fixes: non_blank(priority_fixes),
            improved_essay: improved_essay.filter(|s| !s.trim().is_empty()),
        })
    }

    pub fn overall_band(&self) -> BandScore {
        self.overall_band
    }

    pub fn criteria_scores(&self) -> &BTreeMap<Criterion, BandScore> {
        &self.criteria_scores
    }

    pub fn score(&self, criterion: Criterion) -> BandScore {
        // Every criterion is present by construction.
        self.criteria_scores
            .get(&criterion)
            .copied()
            .unwrap_or(BandScore::MIN)
    }

    pub fn feedback(&self) -> &BTreeMap<Criterion, Vec<String>> {
        &self.feedback
    }

    pub fn priority_fixes(&self) -> &[String] {
        &self.priority_fixes
    }

    pub fn improved_essay(&self) -> Option<&str> {
        self.improved_essay.as_deref()
    }
}

/// Wire form of [`EvaluationResult`]. Decoding goes through
/// [`EvaluationResult::new`]; a stored `overall_band` is ignored and recomputed.
#[derive(Deserialize)]
struct RawEvaluation {
    criteria_scores: BTreeMap<Criterion, BandScore>,
    #[serde(default)]
    feedback: BTreeMap<Criterion, Vec<String>>,
    #[serde(default)]
    priority_fixes: Vec<String>,
    #[serde(default)]
    improved_essay: Option<String>,
}

impl TryFrom<RawEvaluation> for EvaluationResult {
    type Error = DomainError;

    fn try_from(raw: RawEvaluation) -> Result<Self, Self::Error> {
        EvaluationResult::new(
            raw.criteria_scores,
            raw.feedback,
            raw.priority_fixes,
            raw.improved_essay,
        )
    }
}

fn non_blank(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: [f64; 4]) -> BTreeMap<Criterion, BandScore> {
        Criterion::ALL
            .into_iter()
            .zip(values)
            .map(|(c, v)| (c, BandScore::from_f64(v).unwrap()))
            .collect()
    }

    #[test]
    fn overall_is_derived_from_criteria() {
        let result =
            EvaluationResult::new(scores([6.5, 6.0, 7.0, 6.5]), BTreeMap::new(), vec![], None)
                .unwrap();
        assert_eq!(result.overall_band(), BandScore::from_f64(6.5).unwrap());
        assert_eq!(result.feedback().len(), 4);
        assert!(result.improved_essay().is_none());
    }

    #[test]
    fn missing_criterion_is_rejected() {
        let mut partial = scores([6.0, 6.0, 6.0, 6.0]);
        partial.remove(&Criterion::LexicalResource);
        let err = EvaluationResult::new(partial, BTreeMap::new(), vec![], None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("lexical_resource")));
    }

    #[test]
    fn blank_entries_are_dropped() {
        let result = EvaluationResult::new(
            scores([5.0, 5.0, 5.0, 5.0]),
            BTreeMap::from([(Criterion::TaskResponse, vec!["  ".into(), "Good".into()])]),
            vec!["".into(), "Plan paragraphs".into()],
            Some("   ".into()),
        )
        .unwrap();
        assert_eq!(result.feedback()[&Criterion::TaskResponse], vec!["Good"]);
        assert_eq!(result.priority_fixes(), ["Plan paragraphs"]);
        assert!(result.improved_essay().is_none());
    }

    #[test]
    fn serde_round_trip_keeps_overall() {
        let result =
            EvaluationResult::new(scores([7.0, 6.5, 7.5, 7.0]), BTreeMap::new(), vec![], None)
                .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["overall_band"], 7.0);
        assert_eq!(json["criteria_scores"]["coherence_cohesion"], 6.5);
        let back: EvaluationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn decoding_validates_and_recomputes_overall() {
        let result =
            EvaluationResult::new(scores([7.0, 6.5, 7.5, 7.0]), BTreeMap::new(), vec![], None)
                .unwrap();
        let mut json = serde_json::to_value(&result).unwrap();

        json["overall_band"] = serde_json::json!(9.0);
        let back: EvaluationResult = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back.overall_band(), BandScore::from_f64(7.0).unwrap());

        json["criteria_scores"]
            .as_object_mut()
            .unwrap()
            .remove("lexical_resource");
        let err = serde_json::from_value::<EvaluationResult>(json).unwrap_err();
        assert!(err.to_string().contains("lexical_resource"), "{err}");
    }
}
