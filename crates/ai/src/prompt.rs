//! Examiner prompt construction and strict parsing of the model's reply.

use std::collections::BTreeMap;

use bandscore_core::{BandScore, Criterion, EvaluationResult};
use serde::Deserialize;
use tracing::debug;

use crate::provider::{EvaluationRequest, ProviderError};

const INSTRUCTIONS: &str = r#"You are an expert IELTS examiner. Evaluate the response according to the official IELTS Writing band descriptors.

Return ONLY a JSON object with exactly this structure (no markdown, no commentary):

{
  "overall_band": 7.0,
  "criteria_scores": {
    "task_response": 7.0,
    "coherence_cohesion": 6.5,
    "lexical_resource": 7.5,
    "grammatical_range": 7.0
  },
  "feedback": {
    "task_response": ["..."],
    "coherence_cohesion": ["..."],
    "lexical_resource": ["..."],
    "grammatical_range": ["..."]
  },
  "priority_fixes": ["...", "...", "..."],
  "improved_essay": "..."
}

Rules:
- Every band is between 1.0 and 9.0 in steps of 0.5.
- overall_band is the mean of the four criteria rounded to the nearest 0.5.
- Each feedback list has at least one item.
- priority_fixes has between 3 and 5 items, most important first.
- improved_essay may be null."#;

const MIN_FIXES: usize = 3;
const MAX_FIXES: usize = 5;

/// Full prompt text for one essay.
pub fn build_prompt(request: &EvaluationRequest) -> String {
    format!(
        "{INSTRUCTIONS}\n\n{label}\n\nTask prompt:\n{prompt}\n\nCandidate response:\n{essay}\n\nEvaluate this response and return the JSON object.",
        label = request.task_type.label(),
        prompt = request.task_prompt.trim(),
        essay = request.essay_text.trim(),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PerCriterion<T> {
    task_response: T,
    coherence_cohesion: T,
    lexical_resource: T,
    grammatical_range: T,
}

impl<T> PerCriterion<T> {
    fn into_pairs(self) -> [(Criterion, T); 4] {
        [
            (Criterion::TaskResponse, self.task_response),
            (Criterion::CoherenceCohesion, self.coherence_cohesion),
            (Criterion::LexicalResource, self.lexical_resource),
            (Criterion::GrammaticalRange, self.grammatical_range),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EvaluationPayload {
    overall_band: f64,
    criteria_scores: PerCriterion<f64>,
    feedback: PerCriterion<Vec<String>>,
    priority_fixes: Vec<String>,
    #[serde(default)]
    improved_essay: Option<String>,
}

/// Remove a surrounding Markdown code fence (```json ... ```), if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string (e.g. "json") on the opening line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse and validate the model's reply.
///
/// Anything that does not match the schema exactly is `InvalidResponse`; no
/// field is ever defaulted. The reported overall band is ignored in favour of
/// the one derived from the criteria.
pub fn parse_evaluation(raw: &str) -> Result<EvaluationResult, ProviderError> {
    let payload: EvaluationPayload = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| ProviderError::invalid_response(format!("malformed evaluation JSON: {e}")))?;

    let mut scores = BTreeMap::new();
    for (criterion, value) in payload.criteria_scores.into_pairs() {
        let band = BandScore::from_f64(value)
            .map_err(|e| ProviderError::invalid_response(format!("{criterion}: {e}")))?;
        if band.halves() < 2 {
            return Err(ProviderError::invalid_response(format!(
                "{criterion}: band {band} is below 1.0"
            )));
        }
        scores.insert(criterion, band);
    }

    let mut feedback = BTreeMap::new();
    for (criterion, items) in payload.feedback.into_pairs() {
        if items.iter().all(|s| s.trim().is_empty()) {
            return Err(ProviderError::invalid_response(format!(
                "no feedback for {criterion}"
            )));
        }
        feedback.insert(criterion, items);
    }

    let fixes = payload
        .priority_fixes
        .iter()
        .filter(|s| !s.trim().is_empty())
        .count();
    if !(MIN_FIXES..=MAX_FIXES).contains(&fixes) {
        return Err(ProviderError::invalid_response(format!(
            "expected {MIN_FIXES}-{MAX_FIXES} priority fixes, got {fixes}"
        )));
    }

    let result = EvaluationResult::new(scores, feedback, payload.priority_fixes, payload.improved_essay)
        .map_err(|e| ProviderError::invalid_response(e.to_string()))?;

    if (result.overall_band().value() - payload.overall_band).abs() > f64::EPSILON {
        debug!(
            reported = payload.overall_band,
            derived = result.overall_band().value(),
            "provider overall band differs from criteria mean"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bandscore_core::TaskType;

    const VALID: &str = r#"{
      "overall_band": 7.0,
      "criteria_scores": {"task_response": 7.0, "coherence_cohesion": 6.5, "lexical_resource": 7.5, "grammatical_range": 7.0},
      "feedback": {
        "task_response": ["Clear position"],
        "coherence_cohesion": ["Good paragraphing"],
        "lexical_resource": ["Wide range"],
        "grammatical_range": ["Mostly accurate"]
      },
      "priority_fixes": ["One", "Two", "Three"],
      "improved_essay": null
    }"#;

    #[test]
    fn parses_valid_payload() {
        let result = parse_evaluation(VALID).unwrap();
        assert_eq!(result.overall_band(), BandScore::from_f64(7.0).unwrap());
        assert_eq!(result.feedback()[&Criterion::LexicalResource], vec!["Wide range"]);
    }

    #[test]
    fn strips_markdown_fences() {
        let fenced = format!("```json\n{VALID}\n```");
        assert!(parse_evaluation(&fenced).is_ok());
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("  {} "), "{}");
    }

    #[test]
    fn overall_is_recomputed_not_trusted() {
        let lying = VALID.replace("\"overall_band\": 7.0", "\"overall_band\": 9.0");
        let result = parse_evaluation(&lying).unwrap();
        assert_eq!(result.overall_band(), BandScore::from_f64(7.0).unwrap());
    }

    #[test]
    fn schema_violations_are_invalid_response() {
        let cases = [
            VALID.replace("\"lexical_resource\": 7.5", "\"lexical_resource\": 7.3"),
            VALID.replace("\"lexical_resource\": 7.5", "\"lexical_resource\": 0.5"),
            VALID.replace("[\"Wide range\"]", "[]"),
            VALID.replace("[\"One\", \"Two\", \"Three\"]", "[\"One\"]"),
            VALID.replace("\"improved_essay\": null", "\"improved_essay\": null, \"extra\": 1"),
            VALID.replace(", \"grammatical_range\": 7.0}", "}"),
            "not json at all".to_string(),
        ];
        for case in cases {
            let err = parse_evaluation(&case).unwrap_err();
            assert!(
                matches!(err, ProviderError::InvalidResponse(_)),
                "expected InvalidResponse for {case}"
            );
        }
    }

    #[test]
    fn prompt_contains_task_and_essay() {
        let prompt = build_prompt(&EvaluationRequest {
            essay_text: "  My essay.  ".into(),
            task_prompt: "Describe the chart.".into(),
            task_type: TaskType::Task1,
        });
        assert!(prompt.contains("IELTS Writing Task 1"));
        assert!(prompt.contains("Task prompt:\nDescribe the chart."));
        assert!(prompt.ends_with("Candidate response:\nMy essay.\n\nEvaluate this response and return the JSON object."));
    }
}
