//! Query preprocessing: the first retrieval stage.
//!
//! Normalizes whitespace, tokenizes, and rewrites plain queries into a
//! deduplicated token form for matching, while the original text is kept for
//! display. Queries containing URI-like sequences or non-ASCII text are
//! preserved verbatim so path lookups and multilingual content still match.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct QueryPreprocess {
    pub original_query: String,
    pub normalized_query: String,
    pub rewritten_query: String,
    pub tokens: Vec<String>,
    pub changed: bool,
}

pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut tokens = Vec::new();
    for token in lowered.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if !token.is_empty() && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

pub fn preprocess_query(query: &str) -> QueryPreprocess {
    let original = query.trim().to_string();
    let normalized = original.split_whitespace().collect::<Vec<_>>().join(" ");
    let tokens: Vec<String> = tokenize(&normalized).into_iter().take(16).collect();

    let has_uri_hint = normalized.contains("://") || normalized.contains('/');
    let has_non_ascii = normalized.chars().any(|c| !c.is_ascii());
    let rewritten = if has_uri_hint || has_non_ascii || tokens.is_empty() {
        normalized.clone()
    } else {
        tokens.join(" ")
    };

    let changed = rewritten != original;
    QueryPreprocess {
        original_query: original,
        normalized_query: normalized,
        rewritten_query: rewritten,
        tokens,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_dedupes_tokens() {
        let result = preprocess_query("  Rust   rust  MEMORY tips ");
        assert_eq!(result.normalized_query, "Rust rust MEMORY tips");
        assert_eq!(result.rewritten_query, "rust memory tips");
        assert_eq!(result.tokens, vec!["rust", "memory", "tips"]);
        assert!(result.changed);
    }

    #[test]
    fn preserves_uri_like_queries() {
        let result = preprocess_query("core://agent/style");
        assert_eq!(result.rewritten_query, "core://agent/style");
    }

    #[test]
    fn preserves_non_ascii_queries() {
        let result = preprocess_query("昨天的会议记录");
        assert_eq!(result.rewritten_query, "昨天的会议记录");
        assert!(!result.changed);
    }

    #[test]
    fn caps_token_count() {
        let many: String = (0..30).map(|i| format!("tok{i} ")).collect();
        let result = preprocess_query(&many);
        assert_eq!(result.tokens.len(), 16);
    }

    #[test]
    fn empty_query_stays_empty() {
        let result = preprocess_query("   ");
        assert_eq!(result.rewritten_query, "");
        assert!(result.tokens.is_empty());
    }
}
