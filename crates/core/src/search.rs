//! Full-text tokenization rules shared by the Buffer's naive scan and the
//! Database's search index (spec §4.3).
//!
//! Tokenization is ASCII whitespace + case-insensitive matching; extended
//! Unicode segmentation is a documented implementation choice left for a
//! future extension (spec §9 Open Question (c)).

/// Default longest indexed substring, matching `max_search_substring_length`.
pub const DEFAULT_MAX_SUBSTRING_LENGTH: usize = 40;

/// Static stopword list excluded from indexing and querying.
pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Split `text` into whitespace-delimited, lowercased, non-stopword words,
/// paired with the byte offset each word starts at in `text`.
pub fn words(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                push_word(&mut out, &text[s..idx], s);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        push_word(&mut out, &text[s..], s);
    }
    out
}

fn push_word(out: &mut Vec<(usize, String)>, raw: &str, offset: usize) {
    let lower = raw.to_lowercase();
    if !lower.is_empty() && !is_stopword(&lower) {
        out.push((offset, lower));
    }
}

/// One indexable unit: a substring of a word, the byte offset of the word
/// it came from, and the substring itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchToken {
    /// Byte offset of the parent word within the original string.
    pub position: u32,
    /// The substring to index.
    pub substring: String,
}

/// Every indexable substring of every non-stopword word in `text`, up to
/// `max_len` characters long (spec §4.3). Substrings are deduplicated per
/// word (e.g. "aa" only yields one token for "a" even though it occurs
/// twice) but position always refers to the *word's* start offset.
pub fn index_tokens(text: &str, max_len: usize) -> Vec<SearchToken> {
    let mut out = Vec::new();
    for (offset, word) in words(text) {
        let chars: Vec<char> = word.chars().collect();
        let n = chars.len();
        let mut seen = std::collections::HashSet::new();
        for start in 0..n {
            let max_end = (start + max_len).min(n);
            for end in (start + 1)..=max_end {
                let substring: String = chars[start..end].iter().collect();
                if seen.insert(substring.clone()) {
                    out.push(SearchToken {
                        position: offset as u32,
                        substring,
                    });
                }
            }
        }
    }
    out
}

/// Tokenize `query` the same way as indexing, returning the distinct
/// lowercased words (stopwords excluded) to intersect against the index.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    words(query)
        .into_iter()
        .map(|(_, w)| w)
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Whether every token of `query` appears as a substring of some word in
/// `text`. Used by layers (like the Buffer) that answer `search` via a
/// direct scan rather than a maintained index — recall-equivalent to the
/// indexed path because both sides use [`words`]/substring containment.
pub fn matches_search(text: &str, query: &str) -> bool {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return false;
    }
    let haystacks: Vec<String> = words(text).into_iter().map(|(_, w)| w).collect();
    tokens
        .iter()
        .all(|tok| haystacks.iter().any(|w| w.contains(tok.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_splits_and_lowercases_and_drops_stopwords() {
        let w = words("The Quick Brown Fox");
        let just_words: Vec<&str> = w.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(just_words, vec!["quick", "brown", "fox"]);
    }

    #[test]
    fn index_tokens_includes_whole_word_and_substrings() {
        let tokens = index_tokens("quick", 40);
        let subs: Vec<&str> = tokens.iter().map(|t| t.substring.as_str()).collect();
        assert!(subs.contains(&"quick"));
        assert!(subs.contains(&"qui"));
        assert!(subs.contains(&"ick"));
    }

    #[test]
    fn max_len_bounds_substring_length() {
        let tokens = index_tokens("abcdefgh", 3);
        assert!(tokens.iter().all(|t| t.substring.chars().count() <= 3));
        assert!(tokens.iter().any(|t| t.substring == "abc"));
    }

    #[test]
    fn search_recall_matches_scenario_6() {
        assert!(matches_search("the quick brown fox", "quick"));
        assert!(!matches_search("the quick brown fox", "zz"));
    }

    #[test]
    fn search_is_case_insensitive() {
        assert!(matches_search("The Quick Brown Fox", "QUICK"));
    }

    #[test]
    fn multi_word_query_requires_all_tokens() {
        assert!(matches_search("the quick brown fox", "quick fox"));
        assert!(!matches_search("the quick brown fox", "quick zebra"));
    }
}
