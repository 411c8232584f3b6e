//! 缓存键：查询归一化 + 命名空间
//!
//! 归一化：小写、去首尾空白、标点转空格、去掉填充词、限制长度。
//! 完整键为 `{domain}:{environment}:{version}:{normalized}`，升级 version 即让旧条目整体失效。

use std::collections::HashSet;

const DEFAULT_FILLERS: &[&str] = &[
    "a", "an", "the", "please", "me", "show", "find", "give", "some", "i", "im", "want", "need",
    "looking", "can", "you", "could",
];

/// 缓存命名空间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    pub domain: String,
    pub environment: String,
    pub version: String,
}

impl CacheNamespace {
    pub fn new(
        domain: impl Into<String>,
        environment: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            environment: environment.into(),
            version: version.into(),
        }
    }

    pub fn key_for(&self, normalized: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.domain, self.environment, self.version, normalized
        )
    }
}

/// 查询归一化器
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    fillers: HashSet<String>,
    max_len: usize,
}

impl QueryNormalizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            fillers: DEFAULT_FILLERS.iter().map(|s| s.to_string()).collect(),
            max_len: max_len.max(1),
        }
    }

    /// 替换填充词表
    pub fn with_fillers<I, S>(mut self, fillers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fillers = fillers.into_iter().map(|s| s.into().to_lowercase()).collect();
        self
    }

    pub fn normalize(&self, query: &str) -> String {
        let cleaned: String = query
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let meaningful: Vec<&str> = tokens
            .iter()
            .copied()
            .filter(|t| !self.fillers.contains(*t))
            .collect();

        // 全是填充词时保留原词，避免不同查询落到同一个空键上
        let joined = if meaningful.is_empty() {
            tokens.join(" ")
        } else {
            meaningful.join(" ")
        };
        truncate_chars(&joined, self.max_len)
    }
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self::new(200)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].trim_end().to_string(),
        None => s.to_string(),
    }
}
