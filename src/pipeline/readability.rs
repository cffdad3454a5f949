//! Flesch-Kincaid grade level for patient-facing text.
//!
//! `0.39 * (words / sentences) + 11.8 * (syllables / words) - 15.59`
//!
//! Pure and deterministic. Used as a quality signal on the patient report,
//! never as a gate.

/// Grade returned for text with no words.
pub const EMPTY_TEXT_GRADE: f64 = 0.0;

const SENTENCE_WEIGHT: f64 = 0.39;
const SYLLABLE_WEIGHT: f64 = 11.8;
const GRADE_OFFSET: f64 = 15.59;

/// Raw counts behind a grade computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextStats {
    pub sentences: usize,
    pub words: usize,
    pub syllables: usize,
}

/// Count sentences, words and syllables.
///
/// Sentences end at `.`, `!` or `?` followed by whitespace or the end of
/// the text, so decimals such as `5.5` stay inside one sentence. Trailing
/// text without terminal punctuation still counts as a sentence.
pub fn text_stats(text: &str) -> TextStats {
    let mut stats = TextStats {
        sentences: 0,
        words: 0,
        syllables: 0,
    };

    for sentence in split_sentences(text) {
        let words: Vec<&str> = sentence
            .split_whitespace()
            .filter(|w| w.chars().any(char::is_alphanumeric))
            .collect();
        if words.is_empty() {
            continue;
        }
        stats.sentences += 1;
        stats.words += words.len();
        stats.syllables += words.iter().map(|w| count_syllables(w)).sum::<usize>();
    }

    stats
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if at_boundary {
            sentences.push(&text[start..i]);
            start = i + c.len_utf8();
        }
    }
    sentences.push(&text[start..]);
    sentences
}

/// Vowel-group syllable estimate with a silent trailing "e"; at least one.
pub fn count_syllables(word: &str) -> usize {
    let letters: Vec<char> = word
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if letters.is_empty() {
        return 1;
    }

    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');

    let mut count = 0;
    let mut previous_vowel = false;
    for &c in &letters {
        let vowel = is_vowel(c);
        if vowel && !previous_vowel {
            count += 1;
        }
        previous_vowel = vowel;
    }

    // Silent "e" ("make", "note"), but not "-le" after a consonant ("table").
    let n = letters.len();
    if count > 1 && letters[n - 1] == 'e' {
        let consonant_le = n >= 3 && letters[n - 2] == 'l' && !is_vowel(letters[n - 3]);
        if !consonant_le {
            count -= 1;
        }
    }

    count.max(1)
}

/// Grade level from precomputed counts.
pub fn grade_from_stats(stats: TextStats) -> f64 {
    if stats.sentences == 0 || stats.words == 0 {
        return EMPTY_TEXT_GRADE;
    }
    let words_per_sentence = stats.words as f64 / stats.sentences as f64;
    let syllables_per_word = stats.syllables as f64 / stats.words as f64;
    SENTENCE_WEIGHT * words_per_sentence + SYLLABLE_WEIGHT * syllables_per_word - GRADE_OFFSET
}

/// Flesch-Kincaid grade level of `text`.
///
/// Returns [`EMPTY_TEXT_GRADE`] for text without words. Very simple text can
/// score below zero; the value is not clamped.
pub fn flesch_kincaid_grade(text: &str) -> f64 {
    grade_from_stats(text_stats(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    #[test]
    fn three_word_sentence_matches_formula() {
        let stats = text_stats("The cat sat.");
        assert_eq!(
            stats,
            TextStats {
                sentences: 1,
                words: 3,
                syllables: 3
            }
        );
        let expected = 0.39 * 3.0 + 11.8 * 1.0 - 15.59;
        assert!((flesch_kincaid_grade("The cat sat.") - expected).abs() < TOLERANCE);
    }

    #[test]
    fn empty_text_returns_fallback() {
        assert_eq!(flesch_kincaid_grade(""), EMPTY_TEXT_GRADE);
        assert_eq!(flesch_kincaid_grade("   \n"), EMPTY_TEXT_GRADE);
        assert_eq!(flesch_kincaid_grade("...!?"), EMPTY_TEXT_GRADE);
    }

    #[test]
    fn simple_text_scores_low() {
        let grade = flesch_kincaid_grade("The cat sat on the mat. It was a good cat.");
        assert!(grade < 5.0, "got {grade}");
    }

    #[test]
    fn complex_text_scores_high() {
        let text = "The dermatological examination revealed an erythematous papule \
                    with irregular borders and heterogeneous pigmentation consistent \
                    with a potentially malignant neoplastic transformation.";
        let grade = flesch_kincaid_grade(text);
        assert!(grade > 10.0, "got {grade}");
    }

    #[test]
    fn missing_terminal_punctuation_is_one_sentence() {
        assert_eq!(text_stats("see your doctor soon").sentences, 1);
    }

    #[test]
    fn decimals_do_not_end_sentences() {
        let stats = text_stats("The spot is 5.5 mm wide.");
        assert_eq!(stats.sentences, 1);
        assert_eq!(stats.words, 6);

        let stats = text_stats("It grew to 1.2 cm. Call us! Is it 0.5 mm?");
        assert_eq!(stats.sentences, 3);
    }

    #[test]
    fn syllable_heuristic() {
        assert_eq!(count_syllables("the"), 1);
        assert_eq!(count_syllables("cat"), 1);
        assert_eq!(count_syllables("make"), 1);
        assert_eq!(count_syllables("table"), 2);
        assert_eq!(count_syllables("doctor"), 2);
        assert_eq!(count_syllables("biopsy"), 3);
        assert_eq!(count_syllables("5mm"), 1);
        assert_eq!(count_syllables("42"), 1);
    }

    #[test]
    fn grade_is_reproducible() {
        let text = "There is a small raised spot on your left arm. It is about the size of a pencil eraser.";
        let first = flesch_kincaid_grade(text);
        let second = flesch_kincaid_grade(text);
        assert_eq!(first.to_bits(), second.to_bits());
    }
}
