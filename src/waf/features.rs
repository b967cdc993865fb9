use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result as WafResult;
use super::RequestRecord;

/// Keywords counted as SQL/script injection indicators
pub const SQL_KEYWORDS: &[&str] = &[
    "select", "union", "insert", "update", "delete", "drop", "create", "alter", "exec",
    "execute", "script", "javascript", "onerror", "onload", "alert", "prompt", "confirm",
    "eval", "expression", "or", "and",
];

pub const SQL_COMMENT_TOKENS: &[&str] = &["--", "/*", "*/", "#"];

/// Headers inspected besides path and body; everything else is ignored.
const INSPECTED_HEADERS: &[&str] = &["cookie", "user-agent", "referer"];

const MAX_DECODE_ITERATIONS: u32 = 10;

/// Decimal places kept when a value becomes part of a state key
const STATE_KEY_PRECISION: i32 = 4;

static SQL_KEYWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = SQL_KEYWORDS
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).unwrap()
});

/// Named numeric features; the set is closed and identical for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    SqlKeywordCount,
    QuoteCount,
    SemicolonCount,
    CommentPatternCount,
    EqualsCount,
    OrAndCount,
    Length,
    Entropy,
    SpecialCharRatio,
    DigitRatio,
    UppercaseRatio,
    EncodingDepth,
    MethodIsPost,
    HasBody,
    HasCookie,
}

impl Feature {
    pub const ALL: [Feature; 15] = [
        Feature::SqlKeywordCount,
        Feature::QuoteCount,
        Feature::SemicolonCount,
        Feature::CommentPatternCount,
        Feature::EqualsCount,
        Feature::OrAndCount,
        Feature::Length,
        Feature::Entropy,
        Feature::SpecialCharRatio,
        Feature::DigitRatio,
        Feature::UppercaseRatio,
        Feature::EncodingDepth,
        Feature::MethodIsPost,
        Feature::HasBody,
        Feature::HasCookie,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::SqlKeywordCount => "sql_keyword_count",
            Feature::QuoteCount => "quote_count",
            Feature::SemicolonCount => "semicolon_count",
            Feature::CommentPatternCount => "comment_pattern_count",
            Feature::EqualsCount => "equals_count",
            Feature::OrAndCount => "or_and_count",
            Feature::Length => "length",
            Feature::Entropy => "entropy",
            Feature::SpecialCharRatio => "special_char_ratio",
            Feature::DigitRatio => "digit_ratio",
            Feature::UppercaseRatio => "uppercase_ratio",
            Feature::EncodingDepth => "encoding_depth",
            Feature::MethodIsPost => "method_is_post",
            Feature::HasBody => "has_body",
            Feature::HasCookie => "has_cookie",
        }
    }
}

/// Fixed-shape numeric feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: BTreeMap<Feature, f64>,
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl FeatureVector {
    pub fn zeroed() -> Self {
        Self {
            values: Feature::ALL.iter().map(|f| (*f, 0.0)).collect(),
        }
    }

    /// Build from arbitrary (feature, value) pairs; missing features stay zero.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Feature, f64)>,
    {
        let mut vector = Self::zeroed();
        for (feature, value) in pairs {
            vector.set(feature, value);
        }
        vector
    }

    pub fn set(&mut self, feature: Feature, value: f64) {
        self.values.insert(feature, value);
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values.get(&feature).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        self.values.iter().map(|(f, v)| (*f, *v))
    }

    /// Canonical lookup key: fields sorted by name, values rounded.
    pub fn state_key(&self) -> StateKey {
        let mut fields: Vec<(&'static str, f64)> =
            self.values.iter().map(|(f, v)| (f.as_str(), *v)).collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        let key = fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, canonical_value(*value)))
            .collect::<Vec<_>>()
            .join("|");
        StateKey(key)
    }
}

fn canonical_value(value: f64) -> String {
    let scale = 10f64.powi(STATE_KEY_PRECISION);
    let rounded = (value * scale).round() / scale;
    // -0.0 and 0.0 must share a key
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", STATE_KEY_PRECISION as usize, rounded)
}

/// Discretised representation of a feature vector used to index learned values
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StateKey {
    fn from(key: String) -> Self {
        StateKey(key)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts numeric risk features from request records. Stateless.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the feature vector for a request; only malformed records fail.
    pub fn extract(&self, record: &RequestRecord) -> WafResult<FeatureVector> {
        record.validate()?;

        let (combined, encoding_depth) = Self::combined_text(record);
        let mut features = if combined.is_empty() {
            FeatureVector::zeroed()
        } else {
            Self::text_features(&combined, encoding_depth)
        };

        features.set(Feature::MethodIsPost, flag(record.method.eq_ignore_ascii_case("POST")));
        features.set(
            Feature::HasBody,
            flag(record.body.as_deref().map_or(false, |b| !b.trim().is_empty())),
        );
        features.set(Feature::HasCookie, flag(record.has_header("cookie")));

        debug!(
            "Extracted features for {} {}: keywords={} quotes={} depth={}",
            record.method,
            record.path,
            features.get(Feature::SqlKeywordCount),
            features.get(Feature::QuoteCount),
            features.get(Feature::EncodingDepth)
        );

        Ok(features)
    }

    /// Decoded, whitespace-normalised path, body and inspected headers joined by a space,
    /// with the deepest encoding layer count seen across them.
    fn combined_text(record: &RequestRecord) -> (String, u32) {
        let mut sources: Vec<&str> = vec![record.path.as_str()];
        if let Some(body) = record.body.as_deref() {
            sources.push(body);
        }
        for name in INSPECTED_HEADERS {
            if let Some(value) = record.header(name) {
                sources.push(value);
            }
        }

        let mut parts = Vec::with_capacity(sources.len());
        let mut depth = 0;
        for source in sources {
            if source.is_empty() {
                continue;
            }
            let (decoded, layers) = decode_layers(source);
            depth = depth.max(layers);
            let cleaned = normalize_whitespace(&decoded);
            if !cleaned.is_empty() {
                parts.push(cleaned);
            }
        }

        (parts.join(" "), depth)
    }

    fn text_features(text: &str, encoding_depth: u32) -> FeatureVector {
        let lower = text.to_lowercase();
        let length = text.chars().count();

        let quote_count = text.chars().filter(|c| *c == '\'' || *c == '"').count();
        let semicolon_count = text.matches(';').count();
        let equals_count = text.matches('=').count();
        let comment_count: usize = SQL_COMMENT_TOKENS.iter().map(|t| text.matches(t).count()).sum();
        let or_and_count = lower.matches(" or ").count() + lower.matches(" and ").count();

        let special = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        let digits = text.chars().filter(|c| c.is_numeric()).count();
        let uppercase = text.chars().filter(|c| c.is_uppercase()).count();

        FeatureVector::from_pairs([
            (Feature::SqlKeywordCount, count_sql_keywords(text) as f64),
            (Feature::QuoteCount, quote_count as f64),
            (Feature::SemicolonCount, semicolon_count as f64),
            (Feature::CommentPatternCount, comment_count as f64),
            (Feature::EqualsCount, equals_count as f64),
            (Feature::OrAndCount, or_and_count as f64),
            (Feature::Length, length as f64),
            (Feature::Entropy, shannon_entropy(text)),
            (Feature::SpecialCharRatio, ratio(special, length)),
            (Feature::DigitRatio, ratio(digits, length)),
            (Feature::UppercaseRatio, ratio(uppercase, length)),
            (Feature::EncodingDepth, encoding_depth as f64),
        ])
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

pub fn count_sql_keywords(text: &str) -> usize {
    SQL_KEYWORD_PATTERN.find_iter(text).count()
}

/// Shannon entropy in bits over the character distribution; 0.0 for empty text.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut length = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        length += 1;
    }
    if length == 0 {
        return 0.0;
    }

    let length = length as f64;
    counts
        .values()
        .map(|count| {
            let p = *count as f64 / length;
            -p * p.log2()
        })
        .sum()
}

/// Repeatedly URL-decode (`+` as space) until a fixed point or the iteration cap.
/// Returns the decoded text and the number of decodes that changed it.
pub fn decode_layers(text: &str) -> (String, u32) {
    let mut current = text.to_string();
    let mut depth = 0;
    for _ in 0..MAX_DECODE_ITERATIONS {
        let decoded = unquote_plus(&current);
        if decoded == current {
            break;
        }
        current = decoded;
        depth += 1;
    }
    (current, depth)
}

fn unquote_plus(text: &str) -> String {
    let spaced = text.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WafError;

    fn extract(record: RequestRecord) -> FeatureVector {
        FeatureExtractor::new().extract(&record).unwrap()
    }

    #[test]
    fn test_benign_request() {
        let features = extract(RequestRecord::new("GET", "/api/user?id=1"));
        assert_eq!(features.get(Feature::SqlKeywordCount), 0.0);
        assert_eq!(features.get(Feature::QuoteCount), 0.0);
        assert_eq!(features.get(Feature::EqualsCount), 1.0);
        assert_eq!(features.get(Feature::Length), 14.0);
        assert_eq!(features.get(Feature::MethodIsPost), 0.0);
        assert_eq!(features.get(Feature::HasBody), 0.0);
    }

    #[test]
    fn test_tautology_injection() {
        let features = extract(RequestRecord::new("GET", "/api/user?id=1' OR '1'='1'"));
        assert!(features.get(Feature::QuoteCount) >= 4.0);
        assert!(features.get(Feature::OrAndCount) >= 1.0);
        assert!(features.get(Feature::SqlKeywordCount) >= 1.0);
    }

    #[test]
    fn test_union_injection_with_comment() {
        let features = extract(RequestRecord::new(
            "GET",
            "/api/user?id=1 UNION SELECT username,password FROM users--",
        ));
        assert_eq!(features.get(Feature::SqlKeywordCount), 2.0);
        assert_eq!(features.get(Feature::CommentPatternCount), 1.0);
        assert!(features.get(Feature::UppercaseRatio) > 0.0);
    }

    #[test]
    fn test_keywords_use_word_boundaries() {
        // "selection" and "password" contain keywords but are not keywords
        assert_eq!(count_sql_keywords("selection password organic"), 0);
        assert_eq!(count_sql_keywords("SELECT a OR b and c"), 3);
        assert_eq!(count_sql_keywords("exec execute"), 2);
    }

    #[test]
    fn test_encoding_depth_counts_layers() {
        let (decoded, depth) = decode_layers("%2527");
        assert_eq!(decoded, "'");
        assert_eq!(depth, 2);

        let features = extract(RequestRecord::new("GET", "/search?q=%2527%2520OR%25201%253D1"));
        assert_eq!(features.get(Feature::EncodingDepth), 2.0);
        assert_eq!(features.get(Feature::QuoteCount), 1.0);
        assert_eq!(features.get(Feature::OrAndCount), 1.0);
    }

    #[test]
    fn test_decode_stops_at_iteration_cap() {
        let mut text = "'".to_string();
        for _ in 0..12 {
            text = text.replace('%', "%25").replace('\'', "%27");
        }
        let (_, depth) = decode_layers(&text);
        assert_eq!(depth, 10);
    }

    #[test]
    fn test_whitespace_is_normalised() {
        let features = extract(RequestRecord::new("POST", "/a").with_body("x  =\n\n 1\t"));
        // "/a" + " " + "x = 1"
        assert_eq!(features.get(Feature::Length), 8.0);
        assert_eq!(features.get(Feature::MethodIsPost), 1.0);
        assert_eq!(features.get(Feature::HasBody), 1.0);
    }

    #[test]
    fn test_inspected_headers_only() {
        let plain = extract(RequestRecord::new("GET", "/"));
        let with_ignored = extract(RequestRecord::new("GET", "/").with_header("X-Custom", "' OR 1=1"));
        assert_eq!(plain, with_ignored);

        let with_cookie = extract(RequestRecord::new("GET", "/").with_header("Cookie", "id=' OR 1=1"));
        assert_eq!(with_cookie.get(Feature::HasCookie), 1.0);
        assert_eq!(with_cookie.get(Feature::QuoteCount), 1.0);

        let with_agent =
            extract(RequestRecord::new("GET", "/").with_header("User_Agent", "sqlmap select"));
        assert_eq!(with_agent.get(Feature::SqlKeywordCount), 1.0);
    }

    #[test]
    fn test_empty_request_is_all_zero() {
        let features = extract(RequestRecord::new("GET", ""));
        for (feature, value) in features.iter() {
            assert_eq!(value, 0.0, "{} should be zero", feature.as_str());
        }
        assert_eq!(features.iter().count(), Feature::ALL.len());
    }

    #[test]
    fn test_blank_body_is_not_a_body() {
        let features = extract(RequestRecord::new("POST", "/").with_body("   "));
        assert_eq!(features.get(Feature::HasBody), 0.0);
    }

    #[test]
    fn test_entropy() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("aabb") - 1.0).abs() < 1e-12);
        assert!((shannon_entropy("abcd") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_state_key_ignores_insertion_order() {
        let forward = FeatureVector::from_pairs([
            (Feature::QuoteCount, 4.0),
            (Feature::Entropy, 3.141_59),
            (Feature::HasCookie, 1.0),
        ]);
        let backward = FeatureVector::from_pairs([
            (Feature::HasCookie, 1.0),
            (Feature::Entropy, 3.141_59),
            (Feature::QuoteCount, 4.0),
        ]);
        assert_eq!(forward.state_key(), backward.state_key());
    }

    #[test]
    fn test_state_key_rounds_floats() {
        let a = FeatureVector::from_pairs([(Feature::DigitRatio, 0.123_41)]);
        let b = FeatureVector::from_pairs([(Feature::DigitRatio, 0.123_44)]);
        let c = FeatureVector::from_pairs([(Feature::DigitRatio, 0.123_6)]);
        assert_eq!(a.state_key(), b.state_key());
        assert_ne!(a.state_key(), c.state_key());

        let negative_zero = FeatureVector::from_pairs([(Feature::Entropy, -0.0)]);
        assert_eq!(negative_zero.state_key(), FeatureVector::zeroed().state_key());
    }

    #[test]
    fn test_state_key_is_sorted_by_name() {
        let key = FeatureVector::zeroed().state_key();
        let names: Vec<&str> = key
            .as_str()
            .split('|')
            .map(|field| field.split('=').next().unwrap())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(key.as_str().starts_with("comment_pattern_count=0.0000|"));
    }

    #[test]
    fn test_malformed_record_is_rejected() {
        let result = FeatureExtractor::new().extract(&RequestRecord::new("", "/"));
        assert!(matches!(result, Err(WafError::MalformedRecord(_))));
    }
}
