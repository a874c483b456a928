use std::sync::LazyLock;

use regex::Regex;

/// Words too common to be useful as search terms.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "mix", "remix", "edit", "feat", "prod",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_-]+)").unwrap());

static CREDIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:feat\.|ft\.|featuring|remix(?:ed)? by|prod\. by|produced by)\s+([^)(\[\]\-–—.\n]+)")
        .unwrap()
});

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:released (?:by|on)|©\s*(?:\d{4})?)\s*([A-Z][A-Za-z ]*(?:Records|Recordings|Music|Label))",
    )
    .unwrap()
});

/// Salient lowercase terms from a track title, stopword-filtered, in order
/// of first appearance.
pub fn key_terms(title: &str) -> Vec<String> {
    let lower = title.to_lowercase();
    let mut terms: Vec<String> = Vec::new();
    for m in WORD_RE.find_iter(&lower) {
        let word = m.as_str();
        if word.len() <= 2 || STOPWORDS.contains(&word) {
            continue;
        }
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}

/// Normalized title similarity in [0, 1] (1.0 = identical after folding).
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let fold = |s: &str| s.trim().to_lowercase();
    strsim::normalized_levenshtein(&fold(a), &fold(b))
}

/// Free-text entity mentions pulled from a track's title and description.
#[derive(Debug, Default, PartialEq)]
pub struct ContextualMentions {
    /// @handle mentions.
    pub handles: Vec<String>,
    /// Featuring / remixer / producer credits.
    pub credits: Vec<String>,
    /// Label names from the label field or description patterns.
    pub labels: Vec<String>,
}

impl ContextualMentions {
    /// All extracted names, deduplicated, in extraction order.
    pub fn names(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for name in self
            .handles
            .iter()
            .chain(self.credits.iter())
            .chain(self.labels.iter())
        {
            if !seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                seen.push(name);
            }
        }
        seen
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.credits.is_empty() && self.labels.is_empty()
    }
}

/// Extract contextual entity mentions from track metadata.
/// `label_field` is the platform's structured label name, when present.
pub fn extract_mentions(
    title: &str,
    description: &str,
    label_field: Option<&str>,
) -> ContextualMentions {
    let mut out = ContextualMentions::default();

    for cap in MENTION_RE.captures_iter(description) {
        push_unique(&mut out.handles, cap[1].trim());
    }

    let combined = format!("{title}\n{description}");
    for cap in CREDIT_RE.captures_iter(&combined) {
        // A credit span may name several artists: "feat. Mara & DJ Ocelot"
        for name in cap[1].split([',', '&']) {
            push_unique(&mut out.credits, name.trim());
        }
    }

    if let Some(label) = label_field {
        push_unique(&mut out.labels, label.trim());
    }
    for cap in LABEL_RE.captures_iter(description) {
        push_unique(&mut out.labels, cap[1].trim());
    }

    out
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if name.len() < 2 {
        return;
    }
    if !list.iter().any(|n| n.eq_ignore_ascii_case(name)) {
        list.push(name.to_string());
    }
}
