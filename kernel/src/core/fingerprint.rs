//! Input normalization, fingerprints and similarity scoring for the cache.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Verbs that decide what kind of work an instruction asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionTag {
    Read,
    Create,
    Run,
    Delete,
}

/// Canonical form of an instruction: single spaces, no trailing sentence
/// punctuation. Case is kept; `print X` and `print x` are different tasks.
pub fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', '?', '。', '！', '？'])
        .trim_end()
        .to_string()
}

/// Case-folded [`normalize`], the key space for approximate intent matching.
pub fn normalize_intent(text: &str) -> String {
    normalize(text).to_lowercase()
}

/// Deterministic fingerprint of already-normalized text.
pub fn fingerprint(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Han}+|[a-z0-9]+").expect("token regex should be valid"));

/// Lowercase alphanumeric tokens plus CJK runs.
pub fn tokens(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Jaccard similarity of the token sets of `a` and `b`, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

const READ_WORDS: &[&str] = &["read", "show", "cat", "open", "view", "display", "读取", "查看"];
const CREATE_WORDS: &[&str] = &[
    "create", "write", "make", "generate", "save", "new", "创建", "写入",
];
const RUN_WORDS: &[&str] = &["run", "execute", "exec", "launch", "start", "运行", "执行"];
const DELETE_WORDS: &[&str] = &["delete", "remove", "rm", "erase", "删除"];

pub fn action_tags(text: &str) -> BTreeSet<ActionTag> {
    let toks = tokens(text);
    let lower = text.to_lowercase();
    let has = |words: &[&str]| {
        words.iter().any(|w| {
            if w.is_ascii() {
                toks.contains(*w)
            } else {
                lower.contains(*w)
            }
        })
    };
    let mut tags = BTreeSet::new();
    if has(READ_WORDS) {
        tags.insert(ActionTag::Read);
    }
    if has(CREATE_WORDS) {
        tags.insert(ActionTag::Create);
    }
    if has(RUN_WORDS) {
        tags.insert(ActionTag::Run);
    }
    if has(DELETE_WORDS) {
        tags.insert(ActionTag::Delete);
    }
    tags
}

/// False when both texts carry action tags and the tag sets are disjoint.
pub fn actions_compatible(a: &str, b: &str) -> bool {
    let left = action_tags(a);
    let right = action_tags(b);
    left.is_empty() || right.is_empty() || !left.is_disjoint(&right)
}
