//! Essay text normalisation and IELTS word counting.

use std::sync::LazyLock;

use regex::Regex;

// Order matters: dotted abbreviations must win over single letters.
static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:(?:[A-Za-z]\.){2,}|[A-Za-z]+(?:['\x{2019}][A-Za-z]+)*|\d+(?:[.,]\d+)*)(?:-[A-Za-z0-9]+)*",
    )
    .expect("word pattern is valid")
});

static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("space pattern is valid"));

static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"));

/// Count words the way IELTS examiners do.
///
/// Contractions and possessives (`don't`, `writer's`), hyphenated compounds
/// (`well-known`), numbers (`1,000`, `3.5`) and dotted abbreviations (`U.S.`)
/// each count as a single word. Punctuation on its own is not a word.
pub fn count_words(text: &str) -> u32 {
    WORD.find_iter(text).count() as u32
}

/// Normalise whitespace in essay text.
///
/// Runs of spaces and tabs collapse to one space, lines are trimmed, and at
/// most one blank line is kept between paragraphs.
pub fn clean_essay_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = INLINE_SPACE.replace_all(&unified, " ");
    let trimmed_lines = collapsed
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}
