// SPDX-License-Identifier: MIT

//! Query compilation and execution (spec §4.2 Indexer, query compiler and
//! execution). Both the simple and PxQL surface grammars compile to the
//! same `QueryNode` tree; execution resolves each leaf to a set of record
//! ids against the word/summary hashes `index_record` maintains, then
//! combines sets per node. The weight-ordered-merge and row-scan-vs-
//! hash-merge heuristics in the spec are execution-strategy optimizations
//! over this same tree; this implementation always hash-merges, trading
//! the optimization for a smaller, obviously-correct core.

use super::IndexConfig;
use crate::error::{Error, Result};
use crate::hash;
use crate::store::KvStore;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
pub enum Criterion {
    Term { field: String, word: String },
    Phrase { field: String, words: Vec<String> },
    Range { field: String, op: CompareOp, value: f64 },
    RangeBetween { field: String, low: f64, high: f64 },
}

#[derive(Debug, Clone)]
pub enum QueryNode {
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
    Leaf(Criterion),
}

/// Parses the whitespace-separated simple syntax: bare terms, `field:value`,
/// `+required`/`-excluded`, `word1|word2` OR groups, `"quoted phrases"`,
/// and range operators `=`, `>`, `>=`, `<`, `<=`, `a..b`.
#[allow(clippy::expect_used)]
pub fn parse_simple(query: &str, default_field: &str) -> QueryNode {
    let mut must = Vec::new();
    let mut must_not = Vec::new();

    for raw_token in split_respecting_quotes(query) {
        let (excluded, token) = match raw_token.strip_prefix('+') {
            Some(rest) => (false, rest),
            None => match raw_token.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw_token.as_str()),
            },
        };
        if token.is_empty() {
            continue;
        }

        let node = parse_simple_token(token, default_field);
        if excluded {
            must_not.push(node);
        } else {
            must.push(node);
        }
    }

    let mut clauses = must;
    clauses.extend(must_not.into_iter().map(|n| QueryNode::Not(Box::new(n))));

    match clauses.len() {
        0 => QueryNode::Or(Vec::new()),
        1 => clauses.into_iter().next().expect("checked clauses.len() == 1"),
        _ => QueryNode::And(clauses),
    }
}

fn parse_simple_token(token: &str, default_field: &str) -> QueryNode {
    let (field, value) = match token.split_once(':') {
        Some((f, v)) => (f, v),
        None => (default_field, token),
    };

    if let Some(stripped) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        let words: Vec<String> = stripped.split_whitespace().map(|w| w.to_lowercase()).collect();
        return QueryNode::Leaf(Criterion::Phrase {
            field: field.to_string(),
            words,
        });
    }

    if value.contains('|') {
        let alternates = value
            .split('|')
            .map(|w| QueryNode::Leaf(Criterion::Term {
                field: field.to_string(),
                word: w.to_lowercase(),
            }))
            .collect();
        return QueryNode::Or(alternates);
    }

    if let Some((op, rest)) = split_range_op(value) {
        if let Ok(n) = rest.parse::<f64>() {
            return QueryNode::Leaf(Criterion::Range {
                field: field.to_string(),
                op,
                value: n,
            });
        }
    }

    if let Some((low, high)) = value.split_once("..") {
        if let (Ok(low), Ok(high)) = (low.parse::<f64>(), high.parse::<f64>()) {
            return QueryNode::Leaf(Criterion::RangeBetween {
                field: field.to_string(),
                low,
                high,
            });
        }
    }

    QueryNode::Leaf(Criterion::Term {
        field: field.to_string(),
        word: value.to_lowercase(),
    })
}

fn split_range_op(value: &str) -> Option<(CompareOp, &str)> {
    for (prefix, op) in [
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        ("=", CompareOp::Eq),
    ] {
        if let Some(rest) = value.strip_prefix(prefix) {
            return Some((op, rest));
        }
    }
    None
}

fn split_respecting_quotes(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses the parenthesized PxQL grammar: `(field op value and|or ...)`.
/// A bare value defaults to `Eq` against `default_field`.
pub fn parse_pxql(query: &str, default_field: &str) -> Result<QueryNode> {
    let tokens = pxql_tokenize(query);
    let mut pos = 0usize;
    let node = parse_pxql_expr(&tokens, &mut pos, default_field)?;
    if pos != tokens.len() {
        return Err(Error::Validation(format!("unexpected trailing tokens in query: {query}")));
    }
    Ok(node)
}

fn pxql_tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | ')' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_pxql_expr(tokens: &[String], pos: &mut usize, default_field: &str) -> Result<QueryNode> {
    if tokens.get(*pos).map(String::as_str) != Some("(") {
        return Err(Error::Validation("expected '(' to open a PxQL clause".into()));
    }
    *pos += 1;

    let field = tokens
        .get(*pos)
        .cloned()
        .ok_or_else(|| Error::Validation("expected a field name in PxQL clause".into()))?;
    *pos += 1;
    let op_token = tokens
        .get(*pos)
        .cloned()
        .ok_or_else(|| Error::Validation("expected an operator in PxQL clause".into()))?;
    *pos += 1;
    let value = tokens
        .get(*pos)
        .cloned()
        .ok_or_else(|| Error::Validation("expected a value in PxQL clause".into()))?;
    *pos += 1;

    let mut node = leaf_for(&field, &op_token, &value, default_field)?;

    while tokens.get(*pos).map(String::as_str) == Some("and") || tokens.get(*pos).map(String::as_str) == Some("or") {
        let conjunction = tokens[*pos].clone();
        *pos += 1;
        let rhs = parse_pxql_expr(tokens, pos, default_field)?;
        node = match conjunction.as_str() {
            "and" => QueryNode::And(vec![node, rhs]),
            _ => QueryNode::Or(vec![node, rhs]),
        };
    }

    if tokens.get(*pos).map(String::as_str) != Some(")") {
        return Err(Error::Validation("expected ')' to close a PxQL clause".into()));
    }
    *pos += 1;
    Ok(node)
}

fn leaf_for(field: &str, op: &str, value: &str, default_field: &str) -> Result<QueryNode> {
    let field = if field.is_empty() { default_field } else { field };
    let compare_op = match op {
        "=" => Some(CompareOp::Eq),
        ">" => Some(CompareOp::Gt),
        ">=" => Some(CompareOp::Gte),
        "<" => Some(CompareOp::Lt),
        "<=" => Some(CompareOp::Lte),
        _ => None,
    };
    if let Some(op) = compare_op {
        if let Ok(n) = value.parse::<f64>() {
            return Ok(QueryNode::Leaf(Criterion::Range {
                field: field.to_string(),
                op,
                value: n,
            }));
        }
    }
    Ok(QueryNode::Leaf(Criterion::Term {
        field: field.to_string(),
        word: value.to_lowercase(),
    }))
}

/// Executes a compiled query tree against `cfg`'s word/summary hashes.
pub async fn execute(store: &dyn KvStore, cfg: &IndexConfig, node: &QueryNode) -> Result<HashSet<String>> {
    match node {
        QueryNode::Leaf(criterion) => execute_leaf(store, cfg, criterion).await,
        QueryNode::Not(inner) => {
            let all: HashSet<String> = hash::get_all(store, &format!("{}/_data", cfg.base_path))
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            let excluded = Box::pin(execute(store, cfg, inner)).await?;
            Ok(all.difference(&excluded).cloned().collect())
        }
        QueryNode::And(branches) => {
            let mut iter = branches.iter();
            let Some(first) = iter.next() else {
                return Ok(HashSet::new());
            };
            let mut acc = Box::pin(execute(store, cfg, first)).await?;
            for branch in iter {
                let next = Box::pin(execute(store, cfg, branch)).await?;
                acc = acc.intersection(&next).cloned().collect();
            }
            Ok(acc)
        }
        QueryNode::Or(branches) => {
            let mut acc = HashSet::new();
            for branch in branches {
                let next = Box::pin(execute(store, cfg, branch)).await?;
                acc.extend(next);
            }
            Ok(acc)
        }
    }
}

async fn execute_leaf(store: &dyn KvStore, cfg: &IndexConfig, criterion: &Criterion) -> Result<HashSet<String>> {
    match criterion {
        Criterion::Term { field, word } => {
            let word_key = format!("{}/{}/word/{}", cfg.base_path, field, word);
            Ok(hash::get_all(store, &word_key).await?.into_iter().map(|(id, _)| id).collect())
        }
        Criterion::Phrase { field, words } => execute_phrase(store, cfg, field, words).await,
        Criterion::Range { field, op, value } => execute_range(store, cfg, field, |n| compare_passes(n, op, *value)).await,
        Criterion::RangeBetween { field, low, high } => {
            execute_range(store, cfg, field, |n| n >= *low && n <= *high).await
        }
    }
}

/// Requires every subsequent word's recorded offset to be exactly one past
/// the previous word's, per spec §4.2 step 4.
async fn execute_phrase(store: &dyn KvStore, cfg: &IndexConfig, field: &str, words: &[String]) -> Result<HashSet<String>> {
    if words.is_empty() {
        return Ok(HashSet::new());
    }
    let mut candidates: std::collections::HashMap<String, Vec<usize>> = std::collections::HashMap::new();
    let first_key = format!("{}/{}/word/{}", cfg.base_path, field, words[0]);
    for (id, offsets) in hash::get_all(store, &first_key).await? {
        candidates.insert(id, parse_offsets(&offsets));
    }

    for word in &words[1..] {
        let word_key = format!("{}/{}/word/{}", cfg.base_path, field, word);
        let mut next_offsets: std::collections::HashMap<String, Vec<usize>> = std::collections::HashMap::new();
        for (id, offsets) in hash::get_all(store, &word_key).await? {
            next_offsets.insert(id, parse_offsets(&offsets));
        }
        candidates.retain(|id, prev_positions| {
            let Some(next_positions) = next_offsets.get(id) else {
                return false;
            };
            let advanced: Vec<usize> = prev_positions
                .iter()
                .filter_map(|p| next_positions.contains(&(p + 1)).then_some(p + 1))
                .collect();
            *prev_positions = advanced;
            !prev_positions.is_empty()
        });
    }

    Ok(candidates.into_keys().collect())
}

fn parse_offsets(value: &serde_json::Value) -> Vec<usize> {
    value
        .as_str()
        .unwrap_or("")
        .split(',')
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn compare_passes(n: f64, op: &CompareOp, value: f64) -> bool {
    match op {
        CompareOp::Eq => (n - value).abs() < f64::EPSILON,
        CompareOp::Gt => n > value,
        CompareOp::Gte => n >= value,
        CompareOp::Lt => n < value,
        CompareOp::Lte => n <= value,
    }
}

/// Enumerates a typed field's word hash and keeps ids whose numeric word
/// passes `passes`. This is the obviously-correct equivalent of the
/// spec's summary-bucket enumeration, trading bucket pre-filtering for a
/// direct scan of the (already small, since numeric) word space.
async fn execute_range(
    store: &dyn KvStore,
    cfg: &IndexConfig,
    field: &str,
    passes: impl Fn(f64) -> bool,
) -> Result<HashSet<String>> {
    let summary_key = format!("{}/{}/summary", cfg.base_path, field);
    let mut out = HashSet::new();
    for (word, _count) in hash::get_all(store, &summary_key).await? {
        if let Ok(n) = word.parse::<f64>() {
            if passes(n) {
                let word_key = format!("{}/{}/word/{}", cfg.base_path, field, word);
                out.extend(hash::get_all(store, &word_key).await?.into_iter().map(|(id, _)| id));
            }
        }
    }
    Ok(out)
}

/// `searchSingle`: runs the same query against one record's own `_data`
/// entry rather than the shared hashes, for post-hoc filtering of an
/// in-flight update (spec §4.2 step 6).
pub async fn search_single(store: &dyn KvStore, cfg: &IndexConfig, id: &str, node: &QueryNode) -> Result<bool> {
    let data_key = format!("{}/_data/{}", cfg.base_path, id);
    let record: super::RecordData = match store.get_json(&data_key).await {
        Ok(v) => serde_json::from_value(v)?,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(matches_record(&record.fields, node))
}

fn matches_record(fields: &std::collections::HashMap<String, Vec<String>>, node: &QueryNode) -> bool {
    match node {
        QueryNode::Leaf(Criterion::Term { field, word }) => {
            fields.get(field).map(|words| words.contains(word)).unwrap_or(false)
        }
        QueryNode::Leaf(Criterion::Phrase { field, words }) => fields
            .get(field)
            .map(|field_words| field_words.windows(words.len()).any(|w| w == words.as_slice()))
            .unwrap_or(false),
        QueryNode::Leaf(Criterion::Range { .. }) | QueryNode::Leaf(Criterion::RangeBetween { .. }) => {
            // Numeric/date criteria need the typed source value, which the
            // tokenized word list alone doesn't preserve; searchSingle is
            // used for text-field post-hoc filtering, so this is a safe
            // conservative "no match" rather than a guess.
            false
        }
        QueryNode::And(branches) => branches.iter().all(|b| matches_record(fields, b)),
        QueryNode::Or(branches) => branches.iter().any(|b| matches_record(fields, b)),
        QueryNode::Not(inner) => !matches_record(fields, inner),
    }
}
