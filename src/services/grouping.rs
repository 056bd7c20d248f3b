//! 场景分组 - 业务能力层
//!
//! 把一串扁平的问答还原成"属于同一场景"的若干簇。
//!
//! 两种分组方式：
//! - [`group`]：只看题干内容。去掉序号前缀后取前 30 个字符做哈希，哈希相同即同簇。
//! - [`group_linked`]：优先按条目携带的原始场景ID分组，没有ID的旧数据才退回内容哈希。
//!
//! 簇编号按首次出现的顺序从 1 开始，哈希值只作为内部分组键，不会对外暴露。

use std::collections::HashMap;
use std::sync::LazyLock;

use phf::phf_set;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::{ConversationEntry, ScenarioId};

/// 参与哈希的题干长度（字符数）
const KEY_LENGTH: usize = 30;

/// 分组键中至少需要的字母 / 数字个数
const MIN_MEANINGFUL_CHARS: usize = 5;

/// 追问序号标记，例如 `1.a)`
pub static FOLLOW_UP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.[a-z]\)").expect("follow-up marker pattern"));

/// 题干开头的序号 / 标签前缀
static LABEL_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:question|scenario|q)\s*\d+\s*[:.)\-]?\s*|\d+\.[a-z]\)\s*|\d+[a-z]\)\s*|\d+[.)]\s*|[-*•·]\s*)+",
    )
    .expect("label prefix pattern")
});

/// 追问常见的开头过渡词
static TRANSITIONAL_WORDS: phf::Set<&'static str> = phf_set! {
    "additionally",
    "also",
    "besides",
    "building",
    "elaborating",
    "expanding",
    "following",
    "further",
    "furthermore",
    "moreover",
    "specifically",
};

/// 一个场景簇
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioCluster {
    /// 从 1 开始的顺序编号
    pub id: usize,
    pub entries: Vec<ConversationEntry>,
}

impl ScenarioCluster {
    /// 簇内所有条目是否考察同一个能力维度
    pub fn single_competency(&self) -> Option<&str> {
        let first = self.entries.first()?.assessed_competency.as_str();
        self.entries
            .iter()
            .all(|e| e.assessed_competency == first)
            .then_some(first)
    }
}

/// 分组结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupingResult {
    pub clusters: Vec<ScenarioCluster>,
    /// 题干太短、无法可靠分组的条目
    pub ungrouped: Vec<ConversationEntry>,
}

impl GroupingResult {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.ungrouped.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ClusterKey {
    Scenario(ScenarioId),
    Content(String),
}

/// 按题干内容分组（只处理已作答的条目）
pub fn group(entries: &[ConversationEntry]) -> GroupingResult {
    cluster_by(entries, |entry| content_key(&entry.question).map(ClusterKey::Content))
}

/// 按原始场景ID分组，没有ID的条目退回内容哈希
pub fn group_linked(entries: &[ConversationEntry]) -> GroupingResult {
    cluster_by(entries, |entry| match entry.root_scenario_id() {
        Some(id) => Some(ClusterKey::Scenario(id)),
        None => content_key(&entry.question).map(ClusterKey::Content),
    })
}

fn cluster_by<F>(entries: &[ConversationEntry], key_of: F) -> GroupingResult
where
    F: Fn(&ConversationEntry) -> Option<ClusterKey>,
{
    let mut positions: HashMap<ClusterKey, usize> = HashMap::new();
    let mut result = GroupingResult::default();

    for entry in entries.iter().filter(|e| e.is_answered()) {
        let Some(key) = key_of(entry) else {
            result.ungrouped.push(entry.clone());
            continue;
        };

        let position = *positions.entry(key).or_insert_with(|| {
            result.clusters.push(ScenarioCluster {
                id: result.clusters.len() + 1,
                entries: Vec::new(),
            });
            result.clusters.len() - 1
        });
        result.clusters[position].entries.push(entry.clone());
    }

    result
}

/// 去掉题干开头的序号、标签和项目符号
pub fn strip_label_prefix(question: &str) -> &str {
    match LABEL_PREFIX.find(question) {
        Some(m) => question[m.end()..].trim(),
        None => question.trim(),
    }
}

/// 题干的内容分组键；有效字符不足时返回 None
pub fn content_key(question: &str) -> Option<String> {
    let stem: String = strip_label_prefix(question).chars().take(KEY_LENGTH).collect();
    let meaningful = stem.chars().filter(|c| c.is_alphanumeric()).count();
    if meaningful < MIN_MEANINGFUL_CHARS {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(stem.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

/// 题干是否看起来是一道追问（仅用于分析标注，不参与分组）
pub fn is_follow_up(question: &str) -> bool {
    if FOLLOW_UP_MARKER.is_match(question) {
        return true;
    }

    let lower = question.trim().to_lowercase();
    if lower.contains("follow-up") || lower.contains("follow up") || lower.contains("additional") {
        return true;
    }

    lower
        .split_whitespace()
        .next()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .map(|word| TRANSITIONAL_WORDS.contains(word))
        .unwrap_or(false)
}
