// SPDX-License-Identifier: MIT

//! Sharded hashes (spec §4.2 Hashes): a header at `<key>` plus a radix
//! tree rooted at `<key>/data`, routed by successive hex nibbles of
//! `md5(item_key)`. A node is either a `Page` (an items map plus a count)
//! or an `Index` (16 implicit children, never both — invariant ii); pages
//! split into 16 children once they exceed `page_size`, and unsplit back
//! into one empty page once every sibling is gone.

use crate::error::Result;
use crate::store::KvStore;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HashHeader {
    pub length: u64,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum HashNode {
    Page { items: HashMap<String, Value>, count: u64 },
    Index,
}

fn digest_hex(item_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(item_key.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn node_path(key: &str, digest: &str, depth: usize) -> String {
    if depth == 0 {
        format!("{key}/data")
    } else {
        let nibbles: String = digest.chars().take(depth).map(|c| format!("/{c}")).collect();
        format!("{key}/data{nibbles}")
    }
}

async fn read_header(store: &dyn KvStore, key: &str, page_size: u32) -> Result<HashHeader> {
    match store.get_json(key).await {
        Ok(v) => Ok(serde_json::from_value(v)?),
        Err(e) if e.is_not_found() => Ok(HashHeader { length: 0, page_size }),
        Err(e) => Err(e),
    }
}

async fn write_header(store: &dyn KvStore, key: &str, header: HashHeader) -> Result<()> {
    store.put_json(key, serde_json::to_value(header)?).await
}

async fn read_node(store: &dyn KvStore, path: &str) -> Result<HashNode> {
    match store.get_json(path).await {
        Ok(v) => Ok(serde_json::from_value(v)?),
        Err(e) if e.is_not_found() => Ok(HashNode::Page {
            items: HashMap::new(),
            count: 0,
        }),
        Err(e) => Err(e),
    }
}

async fn write_node(store: &dyn KvStore, path: &str, node: &HashNode) -> Result<()> {
    store.put_json(path, serde_json::to_value(node)?).await
}

pub async fn put(store: &dyn KvStore, key: &str, page_size: u32, item_key: &str, value: Value) -> Result<()> {
    let mut header = read_header(store, key, page_size).await?;
    let digest = digest_hex(item_key);
    let mut depth = 0usize;

    loop {
        let path = node_path(key, &digest, depth);
        match read_node(store, &path).await? {
            HashNode::Index => {
                depth += 1;
                continue;
            }
            HashNode::Page { mut items, mut count } => {
                let is_new = !items.contains_key(item_key);
                items.insert(item_key.to_string(), value);
                if is_new {
                    count += 1;
                    header.length += 1;
                }
                if count > header.page_size as u64 {
                    split(store, &path, &items, depth).await?;
                } else {
                    write_node(store, &path, &HashNode::Page { items, count }).await?;
                }
                break;
            }
        }
    }
    write_header(store, key, header).await
}

pub async fn put_multi(store: &dyn KvStore, key: &str, page_size: u32, items: Vec<(String, Value)>) -> Result<()> {
    for (item_key, value) in items {
        put(store, key, page_size, &item_key, value).await?;
    }
    Ok(())
}

async fn split(store: &dyn KvStore, path: &str, items: &HashMap<String, Value>, depth: usize) -> Result<()> {
    let mut buckets: Vec<HashMap<String, Value>> = (0..16).map(|_| HashMap::new()).collect();
    for (item_key, value) in items {
        let digest = digest_hex(item_key);
        let nibble = digest.chars().nth(depth).and_then(|c| c.to_digit(16)).unwrap_or(0) as usize;
        buckets[nibble].insert(item_key.clone(), value.clone());
    }
    for (nibble, bucket) in buckets.into_iter().enumerate() {
        let child_path = format!("{path}/{nibble:x}");
        let count = bucket.len() as u64;
        write_node(store, &child_path, &HashNode::Page { items: bucket, count }).await?;
    }
    write_node(store, path, &HashNode::Index).await
}

pub async fn get(store: &dyn KvStore, key: &str, item_key: &str) -> Result<Option<Value>> {
    let digest = digest_hex(item_key);
    let mut depth = 0usize;
    loop {
        let path = node_path(key, &digest, depth);
        match read_node(store, &path).await? {
            HashNode::Index => depth += 1,
            HashNode::Page { items, .. } => return Ok(items.get(item_key).cloned()),
        }
    }
}

pub async fn get_multi(store: &dyn KvStore, key: &str, item_keys: &[String]) -> Result<Vec<Option<Value>>> {
    let mut out = Vec::with_capacity(item_keys.len());
    for item_key in item_keys {
        out.push(get(store, key, item_key).await?);
    }
    Ok(out)
}

pub async fn delete(store: &dyn KvStore, key: &str, page_size: u32, item_key: &str) -> Result<bool> {
    let mut header = read_header(store, key, page_size).await?;
    let digest = digest_hex(item_key);
    let mut depth = 0usize;

    loop {
        let path = node_path(key, &digest, depth);
        match read_node(store, &path).await? {
            HashNode::Index => {
                depth += 1;
                continue;
            }
            HashNode::Page { mut items, mut count } => {
                if items.remove(item_key).is_none() {
                    return Ok(false);
                }
                count -= 1;
                header.length -= 1;
                write_node(store, &path, &HashNode::Page { items, count }).await?;
                if count == 0 && depth > 0 {
                    maybe_unsplit(store, key, &digest, depth).await?;
                }
                break;
            }
        }
    }
    write_header(store, key, header).await?;
    Ok(true)
}

pub async fn delete_multi(store: &dyn KvStore, key: &str, page_size: u32, item_keys: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for item_key in item_keys {
        if delete(store, key, page_size, item_key).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// If every one of the 16 siblings at `depth` is an empty/absent page,
/// collapses their shared parent back into a single empty page.
async fn maybe_unsplit(store: &dyn KvStore, key: &str, digest: &str, depth: usize) -> Result<()> {
    let parent_path = node_path(key, digest, depth - 1);
    for nibble in 0..16u32 {
        let sibling = format!("{parent_path}/{nibble:x}");
        if let HashNode::Page { count, .. } = read_node(store, &sibling).await? {
            if count != 0 {
                return Ok(());
            }
        } else {
            return Ok(());
        }
    }
    for nibble in 0..16u32 {
        let sibling = format!("{parent_path}/{nibble:x}");
        let _ = store.delete(&sibling).await;
    }
    write_node(
        store,
        &parent_path,
        &HashNode::Page {
            items: HashMap::new(),
            count: 0,
        },
    )
    .await
}

fn collect_all<'a>(
    store: &'a dyn KvStore,
    path: String,
    out: &'a mut Vec<(String, Value)>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match read_node(store, &path).await? {
            HashNode::Page { items, .. } => {
                out.extend(items.into_iter());
                Ok(())
            }
            HashNode::Index => {
                for nibble in 0..16u32 {
                    collect_all(store, format!("{path}/{nibble:x}"), out).await?;
                }
                Ok(())
            }
        }
    })
}

pub async fn get_all(store: &dyn KvStore, key: &str) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::new();
    collect_all(store, format!("{key}/data"), &mut out).await?;
    Ok(out)
}

pub async fn each<F>(store: &dyn KvStore, key: &str, mut visit: F) -> Result<()>
where
    F: FnMut(&str, &Value),
{
    for (item_key, value) in get_all(store, key).await? {
        visit(&item_key, &value);
    }
    Ok(())
}

/// Synchronous-style early-abort iteration: `visit` returning `false`
/// stops the walk immediately.
pub async fn each_sync<F>(store: &dyn KvStore, key: &str, mut visit: F) -> Result<()>
where
    F: FnMut(&str, &Value) -> bool,
{
    for (item_key, value) in get_all(store, key).await? {
        if !visit(&item_key, &value) {
            break;
        }
    }
    Ok(())
}

pub async fn copy(store: &dyn KvStore, src_key: &str, dst_key: &str, page_size: u32) -> Result<()> {
    let items = get_all(store, src_key).await?;
    put_multi(store, dst_key, page_size, items).await
}

pub async fn rename(store: &dyn KvStore, src_key: &str, dst_key: &str, page_size: u32) -> Result<()> {
    copy(store, src_key, dst_key, page_size).await?;
    delete_all(store, src_key).await
}

fn delete_subtree<'a>(store: &'a dyn KvStore, path: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match read_node(store, &path).await? {
            HashNode::Page { .. } => {
                let _ = store.delete(&path).await;
                Ok(())
            }
            HashNode::Index => {
                let _ = store.delete(&path).await;
                for nibble in 0..16u32 {
                    delete_subtree(store, format!("{path}/{nibble:x}")).await?;
                }
                Ok(())
            }
        }
    })
}

pub async fn delete_all(store: &dyn KvStore, key: &str) -> Result<()> {
    delete_subtree(store, format!("{key}/data")).await?;
    let _ = store.delete(key).await;
    Ok(())
}

pub async fn get_info(store: &dyn KvStore, key: &str, page_size: u32) -> Result<HashHeader> {
    read_header(store, key, page_size).await
}
