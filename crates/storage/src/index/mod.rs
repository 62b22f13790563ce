// SPDX-License-Identifier: MIT

//! Full-text/secondary indexing (spec §4.2 Indexer). `index_record`/
//! `unindex_record` implement the five-step diff-and-reindex algorithm;
//! [`query`] compiles and executes the simple and PxQL query grammars
//! against the word hashes this module maintains.

pub mod query;

use crate::error::Result;
use crate::hash;
use crate::lock::LockTable;
use crate::store::KvStore;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Date,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFilter {
    Html,
    Markdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub filter: Option<FieldFilter>,
    #[serde(default)]
    pub master_list: bool,
    #[serde(default = "default_true")]
    pub use_remove_words: bool,
    #[serde(default)]
    pub use_stemmer: bool,
    #[serde(default = "default_min_word_length")]
    pub min_word_length: usize,
    #[serde(default = "default_max_word_length")]
    pub max_word_length: usize,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default)]
    pub default_value: Option<Value>,
}

fn default_true() -> bool {
    true
}
fn default_min_word_length() -> usize {
    1
}
fn default_max_word_length() -> usize {
    64
}
fn default_max_words() -> usize {
    32768
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortType {
    String,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    pub id: String,
    pub source: String,
    pub sort_type: SortType,
    #[serde(default)]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub base_path: String,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub sorters: Vec<SorterConfig>,
    #[serde(default)]
    pub remove_words: HashSet<String>,
    #[serde(default)]
    pub default_search_field: Option<String>,
    #[serde(default = "default_hash_page_size")]
    pub hash_page_size: u32,
}

fn default_hash_page_size() -> u32 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RecordData {
    checksum: String,
    pub(crate) fields: HashMap<String, Vec<String>>,
}

fn extract_source<'a>(record: &'a Value, source: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in source.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn stringify_for_indexing(value: &Value, field: &FieldConfig) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    match field.filter {
        Some(FieldFilter::Html) => strip_tags(&raw),
        Some(FieldFilter::Markdown) => strip_markdown(&raw),
        None => raw,
    }
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn strip_markdown(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '#' | '*' | '_' | '`' | '[' | ']' | '(' | ')'))
        .collect()
}

/// unidecode -> lowercase -> word-boundary split -> length/stopword filter
/// -> optional light stemmer -> `max_words` cap (spec §4.2 Indexer step 3).
/// The teacher's dependency stack has no Porter-stemmer crate, so
/// `use_stemmer` applies a conservative common-suffix trim instead of a
/// full Porter algorithm — noted as an open-question resolution in
/// `DESIGN.md`.
pub fn tokenize(text: &str, field: &FieldConfig, remove_words: &HashSet<String>) -> Vec<String> {
    use unicode_normalization::UnicodeNormalization;
    let ascii_ish: String = text.nfkd().filter(|c| c.is_ascii()).collect();
    let lower = ascii_ish.to_lowercase();

    let mut words: Vec<String> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect();

    words.retain(|w| {
        w.len() >= field.min_word_length
            && w.len() <= field.max_word_length
            && !(field.use_remove_words && remove_words.contains(w))
    });

    if field.use_stemmer {
        words = words.into_iter().map(|w| light_stem(&w)).collect();
    }

    words.truncate(field.max_words);
    words
}

fn light_stem(word: &str) -> String {
    for suffix in ["ing", "edly", "ed", "ies", "es", "s"] {
        if word.len() > suffix.len() + 2 {
            if let Some(stripped) = word.strip_suffix(suffix) {
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}

fn checksum_of(field_words: &HashMap<String, Vec<String>>) -> String {
    let mut keys: Vec<&String> = field_words.keys().collect();
    keys.sort();
    let mut hasher = Md5::new();
    for k in keys {
        hasher.update(k.as_bytes());
        hasher.update(field_words[k].join(" ").as_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn offsets_csv(words: &[String], target: &str) -> String {
    words
        .iter()
        .enumerate()
        .filter(|(_, w)| w.as_str() == target)
        .map(|(i, _)| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

async fn hash_bump_summary(store: &dyn KvStore, summary_key: &str, page_size: u32, word: &str, delta: i64) -> Result<()> {
    let current = hash::get(store, summary_key, word).await?.and_then(|v| v.as_i64()).unwrap_or(0);
    let updated = current + delta;
    if updated <= 0 {
        hash::delete(store, summary_key, page_size, word).await?;
    } else {
        hash::put(store, summary_key, page_size, word, Value::from(updated)).await?;
    }
    Ok(())
}

fn sort_value(record: &Value, sorter: &SorterConfig) -> Value {
    extract_source(record, &sorter.source)
        .cloned()
        .unwrap_or_else(|| sorter.default_value.clone().unwrap_or(Value::Null))
}

/// Normalizes an ISO-8601 date/time string to epoch milliseconds so a
/// `Date`-typed field's summary buckets sort and range-compare numerically
/// alongside `Number` fields, per spec §4.2's year/year_month/
/// year_month_day bucket scheme.
fn date_field_to_epoch_ms(raw: &Value) -> Option<i64> {
    let text = raw.as_str()?;
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .ok()
}

/// Indexes (or reindexes) one record: spec §4.2 Indexer steps 1-5.
/// Per-record lock acquisition is step 1; callers that want the
/// auto-commit/abort wrapping of step 6 should run this inside
/// `TxnManager::hoisted` over `cfg.base_path`.
pub async fn index_record(
    store: &dyn KvStore,
    locks: &LockTable,
    cfg: &IndexConfig,
    id: &str,
    record: &Value,
) -> Result<()> {
    let _record_guard = locks.exclusive(&format!("{}/{}", cfg.base_path, id)).await;

    let data_key = format!("{}/_data/{}", cfg.base_path, id);
    let prior: Option<RecordData> = match store.get_json(&data_key).await {
        Ok(v) => Some(serde_json::from_value(v)?),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    let mut field_words = HashMap::new();
    for field in &cfg.fields {
        let raw = extract_source(record, &field.source)
            .cloned()
            .unwrap_or_else(|| field.default_value.clone().unwrap_or(Value::Null));
        let text = if field.field_type == Some(FieldType::Date) {
            date_field_to_epoch_ms(&raw).map(|ms| ms.to_string()).unwrap_or_default()
        } else {
            stringify_for_indexing(&raw, field)
        };
        field_words.insert(field.id.clone(), tokenize(&text, field, &cfg.remove_words));
    }
    let checksum = checksum_of(&field_words);

    if prior.as_ref().map(|p| &p.checksum) == Some(&checksum) {
        return Ok(());
    }

    for field in &cfg.fields {
        let new_words: HashSet<String> = field_words[&field.id].iter().cloned().collect();
        let old_words: HashSet<String> = prior
            .as_ref()
            .and_then(|p| p.fields.get(&field.id).cloned())
            .unwrap_or_default()
            .into_iter()
            .collect();

        let summary_key = format!("{}/{}/summary", cfg.base_path, field.id);
        for word in new_words.difference(&old_words) {
            hash_bump_summary(store, &summary_key, cfg.hash_page_size, word, 1).await?;
            let word_key = format!("{}/{}/word/{}", cfg.base_path, field.id, word);
            let offsets = offsets_csv(&field_words[&field.id], word);
            hash::put(store, &word_key, cfg.hash_page_size, id, Value::String(offsets)).await?;
        }
        for word in old_words.difference(&new_words) {
            hash_bump_summary(store, &summary_key, cfg.hash_page_size, word, -1).await?;
            let word_key = format!("{}/{}/word/{}", cfg.base_path, field.id, word);
            hash::delete(store, &word_key, cfg.hash_page_size, id).await?;
        }
    }

    store
        .put_json(
            &data_key,
            serde_json::to_value(RecordData {
                checksum,
                fields: field_words,
            })?,
        )
        .await?;

    for sorter in &cfg.sorters {
        let sorter_key = format!("{}/{}/sort", cfg.base_path, sorter.id);
        hash::put(store, &sorter_key, cfg.hash_page_size, id, sort_value(record, sorter)).await?;
    }

    Ok(())
}

pub async fn unindex_record(store: &dyn KvStore, locks: &LockTable, cfg: &IndexConfig, id: &str) -> Result<()> {
    let _record_guard = locks.exclusive(&format!("{}/{}", cfg.base_path, id)).await;

    let data_key = format!("{}/_data/{}", cfg.base_path, id);
    let prior: RecordData = match store.get_json(&data_key).await {
        Ok(v) => serde_json::from_value(v)?,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    for (field_id, words) in &prior.fields {
        let summary_key = format!("{}/{}/summary", cfg.base_path, field_id);
        let mut seen = HashSet::new();
        for word in words {
            if !seen.insert(word.clone()) {
                continue;
            }
            hash_bump_summary(store, &summary_key, cfg.hash_page_size, word, -1).await?;
            let word_key = format!("{}/{}/word/{}", cfg.base_path, field_id, word);
            hash::delete(store, &word_key, cfg.hash_page_size, id).await?;
        }
    }
    for sorter in &cfg.sorters {
        let sorter_key = format!("{}/{}/sort", cfg.base_path, sorter.id);
        hash::delete(store, &sorter_key, cfg.hash_page_size, id).await?;
    }
    store.delete(&data_key).await
}
