//! Word-level translation overlay.
//!
//! Splits rendered text into segments, attaching a translation to every span
//! that matches a known word. Works on scripts without word delimiters: the
//! scan is character by character and never needs whitespace.
//!
//! The matcher is greedy and never backtracks. At each position the longest
//! candidate that matches is taken, even when a shorter one there would let
//! more words match further on. For candidates `{"ab", "bcd"}` and input
//! `"abcd"` the result is `ab` + `c` + `d`, not `a` + `bcd`. This is accepted
//! behaviour.

use crate::models::WordTranslation;

/// A span of the input, optionally carrying a translation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub translation: Option<String>,
}

impl Segment {
    fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            translation: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.translation.is_some()
    }
}

/// Segments `text` against `words`.
///
/// Concatenating the `text` of the returned segments always yields `text`.
/// Unmatched characters come out as one-character segments. Candidates with
/// an empty `original_word` are ignored. Runs in O(n * k) for n characters
/// and k candidates.
pub fn tokenize(text: &str, words: &[WordTranslation]) -> Vec<Segment> {
    let candidates = by_length(words);
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(first) = rest.chars().next() {
        let matched = candidates
            .iter()
            .find(|candidate| rest.starts_with(candidate.original_word.as_str()));

        match matched {
            Some(candidate) => {
                let len = candidate.original_word.len();
                segments.push(Segment {
                    text: rest[..len].to_string(),
                    translation: Some(candidate.translation.clone()),
                });
                rest = &rest[len..];
            }
            None => {
                let len = first.len_utf8();
                segments.push(Segment::plain(&rest[..len]));
                rest = &rest[len..];
            }
        }
    }

    segments
}

/// Longest first by character count; ties keep their original order.
fn by_length(words: &[WordTranslation]) -> Vec<&WordTranslation> {
    let mut candidates: Vec<&WordTranslation> = words
        .iter()
        .filter(|w| !w.original_word.is_empty())
        .collect();
    candidates.sort_by_key(|w| std::cmp::Reverse(w.original_word.chars().count()));
    candidates
}

/// Number of segments carrying a translation.
pub fn match_count(segments: &[Segment]) -> usize {
    segments.iter().filter(|s| s.is_match()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(pairs: &[(&str, &str)]) -> Vec<WordTranslation> {
        pairs
            .iter()
            .map(|(o, t)| WordTranslation::new(*o, *t))
            .collect()
    }

    fn rebuild(segments: &[Segment]) -> String {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn longest_match_wins() {
        let segments = tokenize("abcd", &words(&[("ab", "X"), ("abcd", "Y")]));
        assert_eq!(
            segments,
            vec![Segment {
                text: "abcd".into(),
                translation: Some("Y".into())
            }]
        );
    }

    #[test]
    fn unmatched_text_becomes_single_characters() {
        let segments = tokenize("xyz", &words(&[("q", "Q")]));
        assert_eq!(
            segments,
            vec![Segment::plain("x"), Segment::plain("y"), Segment::plain("z")]
        );
    }

    #[test]
    fn segments_chinese_without_delimiters() {
        let segments = tokenize(
            "我喜欢学习中文。",
            &words(&[("学习", "study"), ("中文", "Chinese"), ("喜欢", "like")]),
        );
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["我", "喜欢", "学习", "中文", "。"]);
        assert_eq!(match_count(&segments), 3);
        assert_eq!(segments[2].translation.as_deref(), Some("study"));
    }

    #[test]
    fn compound_beats_its_prefix() {
        let segments = tokenize(
            "中华人民共和国",
            &words(&[("中华", "China"), ("中华人民共和国", "PRC"), ("人民", "people")]),
        );
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].translation.as_deref(), Some("PRC"));
    }

    #[test]
    fn greedy_choice_is_not_revisited() {
        let segments = tokenize("abcd", &words(&[("ab", "1"), ("bcd", "2")]));
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["ab", "c", "d"]);
        assert_eq!(match_count(&segments), 1);
    }

    #[test]
    fn equal_length_ties_keep_original_order() {
        let segments = tokenize("ab", &words(&[("ab", "first"), ("ab", "second")]));
        assert_eq!(segments[0].translation.as_deref(), Some("first"));
    }

    #[test]
    fn mixed_script_compound_beats_prefix() {
        let segments = tokenize("日本abc", &words(&[("日本", "Japan"), ("日本abc", "long")]));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].translation.as_deref(), Some("long"));
    }

    #[test]
    fn empty_candidates_do_not_stall() {
        let segments = tokenize("hi", &words(&[("", "nothing")]));
        assert_eq!(rebuild(&segments), "hi");
        assert_eq!(match_count(&segments), 0);
    }

    #[test]
    fn empty_input_yields_no_segments() {
        assert!(tokenize("", &words(&[("a", "A")])).is_empty());
    }

    #[test]
    fn round_trips_mixed_input() {
        let inputs = [
            "",
            "hello world",
            "Il fait beau aujourd'hui.",
            "今天天气很好，我们去公园吧！",
            "emoji 🎉 and ñ and 中文",
            "aaaaaa",
        ];
        let candidates = words(&[
            ("a", "1"),
            ("aa", "2"),
            ("天气", "weather"),
            ("公园", "park"),
            ("🎉", "party"),
            ("中", "middle"),
            ("world", "monde"),
            ("not present", "x"),
        ]);
        for input in inputs {
            assert_eq!(rebuild(&tokenize(input, &candidates)), input);
            assert_eq!(rebuild(&tokenize(input, &[])), input);
        }
    }

    #[test]
    fn repeated_words_all_match() {
        let segments = tokenize("aaaaa", &words(&[("a", "1"), ("aa", "2")]));
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["aa", "aa", "a"]);
        assert_eq!(match_count(&segments), 3);
    }
}
