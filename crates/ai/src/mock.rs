//! Deterministic offline provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bandscore_core::{BandScore, Criterion, EvaluationResult, TaskType, count_words};

use crate::provider::{EvaluationProvider, EvaluationRequest, ProviderError};

/// Grades purely from word count and task type.
///
/// Used when no API key is configured, and in tests. Identical input always
/// yields an identical result; nothing leaves the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }

    /// The synchronous core of [`EvaluationProvider::evaluate`].
    pub fn grade(&self, essay_text: &str, task_type: TaskType) -> Result<EvaluationResult, ProviderError> {
        let words = count_words(essay_text);
        let base = base_band(words, task_type);

        let scores = BTreeMap::from([
            (Criterion::TaskResponse, base),
            (Criterion::CoherenceCohesion, base.offset(-1)),
            (Criterion::LexicalResource, base.offset(1)),
            (Criterion::GrammaticalRange, base),
        ]);

        EvaluationResult::new(scores, feedback(task_type), priority_fixes(task_type), None)
            .map_err(|e| ProviderError::invalid_response(e.to_string()))
    }
}

fn base_band(words: u32, task_type: TaskType) -> BandScore {
    let halves = match task_type {
        TaskType::Task1 => match words {
            200.. => 14,
            170..=199 => 13,
            150..=169 => 12,
            _ => 10,
        },
        TaskType::Task2 => match words {
            250.. => 14,
            200..=249 => 13,
            150..=199 => 12,
            _ => 10,
        },
    };
    BandScore::from_halves(halves).unwrap_or(BandScore::MIN)
}

fn feedback(task_type: TaskType) -> BTreeMap<Criterion, Vec<String>> {
    let task_response = match task_type {
        TaskType::Task1 => vec![
            "Your report covers the main features of the visual information.".to_string(),
            "Add a clear overview that summarises the key trends.".to_string(),
        ],
        TaskType::Task2 => vec![
            "Your essay addresses the main task requirements.".to_string(),
            "Develop your ideas more fully with specific examples.".to_string(),
        ],
    };

    BTreeMap::from([
        (Criterion::TaskResponse, task_response),
        (
            Criterion::CoherenceCohesion,
            vec![
                "The response has a clear overall structure.".to_string(),
                "Some paragraphs could be linked more smoothly with cohesive devices.".to_string(),
            ],
        ),
        (
            Criterion::LexicalResource,
            vec![
                "You use a reasonable range of vocabulary.".to_string(),
                "Try more precise topic-specific collocations.".to_string(),
            ],
        ),
        (
            Criterion::GrammaticalRange,
            vec![
                "You use a variety of sentence structures.".to_string(),
                "A few minor grammatical errors remain.".to_string(),
            ],
        ),
    ])
}

fn priority_fixes(task_type: TaskType) -> Vec<String> {
    let first = match task_type {
        TaskType::Task1 => "Open with an overview of the most significant trends",
        TaskType::Task2 => "Support each main argument with a specific example",
    };
    vec![
        first.to_string(),
        "Link paragraphs with a wider range of cohesive devices".to_string(),
        "Replace general vocabulary with topic-specific terms".to_string(),
    ]
}

#[async_trait]
impl EvaluationProvider for MockProvider {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult, ProviderError> {
        self.grade(&request.essay_text, request.task_type)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
