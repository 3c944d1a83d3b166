//! Code-aware tokenization.
//!
//! Splits source text into lowercase terms while keeping compound identifiers
//! intact: `getUserById` and `snake_case` each come out as a single token.
//! The classifier table is built lazily and memoized; if construction fails
//! the tokenizer degrades to a per-char fallback that produces identical
//! output, so tokenization never raises on arbitrary UTF-8.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Longest term kept in the index. Runs beyond this are truncated at a char
/// boundary; minified one-line blobs otherwise produce unbounded terms.
const MAX_TERM_LEN: usize = 128;

/// ASCII classification table for identifier characters.
/// Built once on first use; the latch is cleared on failure so a later call
/// can retry initialization.
struct TokenRules {
    ident: [bool; 128],
}

impl TokenRules {
    fn build() -> Result<TokenRules, String> {
        let mut ident = [false; 128];
        for c in 0u8..128 {
            ident[c as usize] =
                (c as char).is_ascii_alphanumeric() || c == b'_';
        }
        // A table where '_' is not an identifier char would glue-split
        // snake_case; treat that as a construction failure.
        if !ident[b'_' as usize] {
            return Err("identifier table missing underscore class".into());
        }
        Ok(TokenRules { ident })
    }

    #[inline]
    fn is_ident(&self, c: char) -> bool {
        if (c as u32) < 128 {
            self.ident[c as usize]
        } else {
            c.is_alphanumeric()
        }
    }
}

/// Deterministic code tokenizer with memoized lazy initialization.
pub struct CodeTokenizer {
    rules: Mutex<Option<Arc<TokenRules>>>,
}

impl Default for CodeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeTokenizer {
    pub fn new() -> Self {
        Self { rules: Mutex::new(None) }
    }

    /// One-shot latch: the first caller builds the table, concurrent callers
    /// wait on the lock and observe the result. A failed build leaves the
    /// latch empty so the next call retries.
    fn rules(&self) -> Option<Arc<TokenRules>> {
        let mut guard = match self.rules.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            match TokenRules::build() {
                Ok(r) => *guard = Some(Arc::new(r)),
                Err(e) => {
                    warn!(error = %e, "tokenizer init failed, using fallback splitter");
                    return None;
                }
            }
        }
        guard.clone()
    }

    /// Tokenize text into an ordered sequence of lowercase terms.
    /// Empty or whitespace-only input yields the empty sequence.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        match self.rules() {
            Some(rules) => split_terms(text, |c| rules.is_ident(c)),
            None => split_terms(text, |c| c.is_alphanumeric() || c == '_'),
        }
    }

    /// Raw term frequencies plus total token count for one chunk of text.
    pub fn term_frequencies(&self, text: &str) -> (HashMap<String, u32>, u32) {
        let terms = self.tokenize(text);
        let total = terms.len() as u32;
        let mut freq: HashMap<String, u32> = HashMap::new();
        for term in terms {
            *freq.entry(term).or_insert(0) += 1;
        }
        (freq, total)
    }
}

/// Walk the text emitting maximal identifier runs, lowercased.
fn split_terms(text: &str, is_ident: impl Fn(char) -> bool) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if is_ident(c) {
            if current.len() < MAX_TERM_LEN {
                for lc in c.to_lowercase() {
                    current.push(lc);
                }
            }
        } else if !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_identifiers_stay_whole() {
        let t = CodeTokenizer::new();
        assert_eq!(t.tokenize("getUserById"), vec!["getuserbyid"]);
        assert_eq!(t.tokenize("snake_case_name"), vec!["snake_case_name"]);
        assert_eq!(t.tokenize("HTTPServer2"), vec!["httpserver2"]);
    }

    #[test]
    fn test_splits_on_punctuation_and_whitespace() {
        let t = CodeTokenizer::new();
        assert_eq!(
            t.tokenize("fn parse_query(query: &str) -> Vec<String>"),
            vec!["fn", "parse_query", "query", "str", "vec", "string"]
        );
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        let t = CodeTokenizer::new();
        assert!(t.tokenize("").is_empty());
        assert!(t.tokenize("   \n\t  ").is_empty());
        assert!(t.tokenize("+-*/ (){}").is_empty());
    }

    #[test]
    fn test_deterministic() {
        let t = CodeTokenizer::new();
        let src = "let userCount = fetchUsers().len(); // count";
        assert_eq!(t.tokenize(src), t.tokenize(src));
    }

    #[test]
    fn test_arbitrary_utf8_never_panics() {
        let t = CodeTokenizer::new();
        let terms = t.tokenize("héllo wörld — ラスト rust_λ");
        assert!(terms.contains(&"héllo".to_string()));
        assert!(terms.contains(&"ラスト".to_string()));
    }

    #[test]
    fn test_fallback_matches_primary() {
        let src = "impl FooBar { fn do_thing(&self) -> u32 { 42 } }";
        let primary = split_terms(src, |c| {
            let rules = TokenRules::build().unwrap();
            rules.is_ident(c)
        });
        let fallback = split_terms(src, |c| c.is_alphanumeric() || c == '_');
        assert_eq!(primary, fallback);
    }

    #[test]
    fn test_term_frequencies() {
        let t = CodeTokenizer::new();
        let (freq, total) = t.term_frequencies("foo bar foo baz foo");
        assert_eq!(total, 5);
        assert_eq!(freq["foo"], 3);
        assert_eq!(freq["bar"], 1);
        assert_eq!(freq["baz"], 1);
    }

    #[test]
    fn test_long_run_truncated() {
        let t = CodeTokenizer::new();
        let blob = "a".repeat(4096);
        let terms = t.tokenize(&blob);
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].len(), MAX_TERM_LEN);
    }
}
