//! Writing task metadata carried by each submission.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// IELTS writing task kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "IELTS_T1")]
    Task1,
    #[serde(rename = "IELTS_T2")]
    Task2,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Task1 => "IELTS_T1",
            TaskType::Task2 => "IELTS_T2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IELTS_T1" => Some(TaskType::Task1),
            "IELTS_T2" => Some(TaskType::Task2),
            _ => None,
        }
    }

    /// Minimum word count examiners expect for this task kind.
    pub fn default_min_words(self) -> u32 {
        match self {
            TaskType::Task1 => 150,
            TaskType::Task2 => 250,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskType::Task1 => "IELTS Writing Task 1",
            TaskType::Task2 => "IELTS Writing Task 2",
        }
    }
}

impl core::fmt::Display for TaskType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the task an essay answers.
///
/// Submissions keep their own copy so later edits to the task bank never change
/// how an already-submitted essay is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritingTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub prompt: String,
    pub min_words: u32,
}

impl WritingTask {
    /// Task with the default minimum word count for its kind.
    pub fn new(id: TaskId, task_type: TaskType, prompt: impl Into<String>) -> Self {
        Self {
            id,
            task_type,
            prompt: prompt.into(),
            min_words: task_type.default_min_words(),
        }
    }

    pub fn with_min_words(mut self, min_words: u32) -> Self {
        self.min_words = min_words;
        self
    }
}
