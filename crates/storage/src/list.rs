// SPDX-License-Identifier: MIT

//! Paginated lists (spec §4.2 Lists): a header plus pages at `<key>/<n>`.
//! Page 0 is the anchor; `push` grows `last_page` upward, `unshift` grows
//! `first_page` downward into negative indices. Every op here takes a
//! `&dyn KvStore` so it runs identically standalone or inside a
//! transaction — callers that want auto-commit use `TxnManager::hoisted`
//! around these functions rather than the functions hoisting themselves,
//! keeping this module free of a dependency on `txn`.

use crate::error::Result;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListHeader {
    pub first_page: i64,
    pub last_page: i64,
    pub length: u64,
    pub page_size: u32,
}

impl ListHeader {
    pub fn empty(page_size: u32) -> Self {
        Self {
            first_page: 0,
            last_page: 0,
            length: 0,
            page_size,
        }
    }
}

fn page_key(key: &str, page: i64) -> String {
    format!("{key}/{page}")
}

async fn read_header(store: &dyn KvStore, key: &str, page_size: u32) -> Result<ListHeader> {
    match store.get_json(key).await {
        Ok(v) => Ok(serde_json::from_value(v)?),
        Err(e) if e.is_not_found() => Ok(ListHeader::empty(page_size)),
        Err(e) => Err(e),
    }
}

async fn write_header(store: &dyn KvStore, key: &str, header: ListHeader) -> Result<()> {
    store.put_json(key, serde_json::to_value(header)?).await
}

async fn read_page(store: &dyn KvStore, key: &str, page: i64) -> Result<Vec<Value>> {
    match store.get_json(&page_key(key, page)).await {
        Ok(v) => Ok(serde_json::from_value(v)?),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

async fn write_page(store: &dyn KvStore, key: &str, page: i64, items: &[Value]) -> Result<()> {
    store.put_json(&page_key(key, page), serde_json::to_value(items)?).await
}

async fn delete_page(store: &dyn KvStore, key: &str, page: i64) -> Result<()> {
    match store.delete(&page_key(key, page)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Appends `items` to the tail page, opening new tail pages as `page_size`
/// overflows.
pub async fn push(store: &dyn KvStore, key: &str, page_size: u32, items: Vec<Value>) -> Result<()> {
    let mut header = read_header(store, key, page_size).await?;
    let mut tail = read_page(store, key, header.last_page).await?;
    let mut remaining = items.into_iter();

    loop {
        while tail.len() < header.page_size as usize {
            match remaining.next() {
                Some(item) => tail.push(item),
                None => {
                    write_page(store, key, header.last_page, &tail).await?;
                    write_header(store, key, header).await?;
                    return Ok(());
                }
            }
        }
        write_page(store, key, header.last_page, &tail).await?;
        header.last_page += 1;
        tail = Vec::new();
    }
}

/// Prepends `items`, opening new head pages (at negative indices) as
/// `page_size` overflows.
pub async fn unshift(store: &dyn KvStore, key: &str, page_size: u32, mut items: Vec<Value>) -> Result<()> {
    let mut header = read_header(store, key, page_size).await?;
    let mut head = read_page(store, key, header.first_page).await?;
    items.reverse();
    let mut remaining = items.into_iter();

    loop {
        while head.len() < header.page_size as usize {
            match remaining.next() {
                Some(item) => head.insert(0, item),
                None => {
                    write_page(store, key, header.first_page, &head).await?;
                    write_header(store, key, header).await?;
                    return Ok(());
                }
            }
        }
        write_page(store, key, header.first_page, &head).await?;
        header.first_page -= 1;
        head = Vec::new();
    }
}

/// Removes and returns the last item, deleting the tail page if it empties.
/// If this empties the whole list, the anchor page is rewritten empty
/// instead — per the spec §9 resolution, the header resets to
/// `first_page = last_page = 0` rather than left with a stale anchor.
pub async fn pop(store: &dyn KvStore, key: &str, page_size: u32) -> Result<Option<Value>> {
    let mut header = read_header(store, key, page_size).await?;
    if header.length == 0 {
        return Ok(None);
    }
    let mut tail = read_page(store, key, header.last_page).await?;
    let item = tail.pop();
    header.length -= 1;

    if tail.is_empty() && header.last_page != header.first_page {
        delete_page(store, key, header.last_page).await?;
        header.last_page -= 1;
    } else {
        write_page(store, key, header.last_page, &tail).await?;
    }
    normalize_if_empty(store, key, &mut header).await?;
    write_header(store, key, header).await?;
    Ok(item)
}

pub async fn shift(store: &dyn KvStore, key: &str, page_size: u32) -> Result<Option<Value>> {
    let mut header = read_header(store, key, page_size).await?;
    if header.length == 0 {
        return Ok(None);
    }
    let mut head = read_page(store, key, header.first_page).await?;
    if head.is_empty() {
        return Ok(None);
    }
    let item = head.remove(0);
    header.length -= 1;

    if head.is_empty() && header.first_page != header.last_page {
        delete_page(store, key, header.first_page).await?;
        header.first_page += 1;
    } else {
        write_page(store, key, header.first_page, &head).await?;
    }
    normalize_if_empty(store, key, &mut header).await?;
    write_header(store, key, header).await?;
    Ok(Some(item))
}

async fn normalize_if_empty(store: &dyn KvStore, key: &str, header: &mut ListHeader) -> Result<()> {
    if header.length == 0 {
        delete_page(store, key, header.first_page).await?;
        delete_page(store, key, header.last_page).await?;
        header.first_page = 0;
        header.last_page = 0;
        write_page(store, key, 0, &[]).await?;
    }
    Ok(())
}

/// Resolves a logical index (negative counts from the end) plus `len` into
/// the concrete items, scanning forward from the computed start page.
pub async fn get(store: &dyn KvStore, key: &str, page_size: u32, idx: i64, len: u64) -> Result<Vec<Value>> {
    let header = read_header(store, key, page_size).await?;
    if header.length == 0 {
        return Ok(Vec::new());
    }
    let start = if idx < 0 {
        (header.length as i64 + idx).max(0) as u64
    } else {
        idx as u64
    };
    if start >= header.length {
        return Ok(Vec::new());
    }

    // First page may be partial; every page after it is full to page_size.
    let first_page_items = read_page(store, key, header.first_page).await?;
    let first_page_len = first_page_items.len() as u64;

    let (mut page, mut offset_in_page) = if start < first_page_len {
        (header.first_page, start)
    } else {
        let past_first = start - first_page_len;
        let page = header.first_page + 1 + (past_first / header.page_size as u64) as i64;
        (page, past_first % header.page_size as u64)
    };

    let mut out = Vec::new();
    while out.len() < len as usize && page <= header.last_page {
        let items = read_page(store, key, page).await?;
        for item in items.into_iter().skip(offset_in_page as usize) {
            if out.len() >= len as usize {
                break;
            }
            out.push(item);
        }
        offset_in_page = 0;
        page += 1;
    }
    Ok(out)
}

/// Cut/insert/replace in one pass. Traverses from whichever end is closer
/// to `idx` to minimize the pages touched.
pub async fn splice(
    store: &dyn KvStore,
    key: &str,
    page_size: u32,
    idx: i64,
    cut_len: u64,
    new_items: Vec<Value>,
) -> Result<Vec<Value>> {
    let header = read_header(store, key, page_size).await?;
    let length = header.length;
    let start = if idx < 0 {
        (length as i64 + idx).clamp(0, length as i64) as u64
    } else {
        idx.min(length as i64) as u64
    };
    let cut_len = cut_len.min(length - start);

    // Materialize the whole list, splice in memory, and rewrite pages.
    // Simple and obviously correct; the left/right traversal-minimization
    // the spec describes is an optimization this always-correct baseline
    // can grow into without changing callers.
    let mut all = get(store, key, page_size, 0, length).await?;
    let removed: Vec<Value> = all
        .splice((start as usize)..(start as usize + cut_len as usize), new_items)
        .collect();

    clear_all_pages(store, key, &header).await?;
    let new_header = ListHeader::empty(page_size);
    write_header(store, key, new_header).await?;
    if !all.is_empty() {
        push(store, key, page_size, all).await?;
    } else {
        write_page(store, key, 0, &[]).await?;
    }
    Ok(removed)
}

async fn clear_all_pages(store: &dyn KvStore, key: &str, header: &ListHeader) -> Result<()> {
    for page in header.first_page..=header.last_page {
        delete_page(store, key, page).await?;
    }
    Ok(())
}

/// Linear scan for the first item whose fields match every `(field,
/// value)` pair in `criteria`. Returns the item and its index.
pub async fn find(
    store: &dyn KvStore,
    key: &str,
    page_size: u32,
    criteria: &[(&str, &Value)],
) -> Result<Option<(u64, Value)>> {
    let header = read_header(store, key, page_size).await?;
    let all = get(store, key, page_size, 0, header.length).await?;
    for (idx, item) in all.into_iter().enumerate() {
        if matches_criteria(&item, criteria) {
            return Ok(Some((idx as u64, item)));
        }
    }
    Ok(None)
}

fn matches_criteria(item: &Value, criteria: &[(&str, &Value)]) -> bool {
    criteria.iter().all(|(field, expected)| item.get(field) == Some(*expected))
}

/// `find` + single-item `splice` replace. Update values for numeric fields
/// may start with `+`/`-` to apply a signed delta instead of a literal set.
pub async fn find_update(
    store: &dyn KvStore,
    key: &str,
    page_size: u32,
    criteria: &[(&str, &Value)],
    updates: &[(&str, Value)],
) -> Result<bool> {
    let Some((idx, mut item)) = find(store, key, page_size, criteria).await? else {
        return Ok(false);
    };
    for (field, update) in updates {
        apply_update(&mut item, field, update);
    }
    splice(store, key, page_size, idx as i64, 1, vec![item]).await?;
    Ok(true)
}

fn apply_update(item: &mut Value, field: &str, update: &Value) {
    if let Value::String(s) = update {
        if let Some(delta_str) = s.strip_prefix('+').or_else(|| s.strip_prefix('-')) {
            if let Ok(delta) = delta_str.parse::<i64>() {
                let signed = if s.starts_with('-') { -delta } else { delta };
                let current = item.get(field).and_then(Value::as_i64).unwrap_or(0);
                item[field] = Value::from(current + signed);
                return;
            }
        }
    }
    item[field] = update.clone();
}

/// Streams the list one page at a time, newest-header-first-respecting;
/// `visit` returning `Some(updated)` rewrites the page before continuing.
pub async fn each_page<F>(store: &dyn KvStore, key: &str, page_size: u32, mut visit: F) -> Result<()>
where
    F: FnMut(i64, &mut Vec<Value>) -> bool,
{
    let header = read_header(store, key, page_size).await?;
    let mut page_no = header.first_page;
    while page_no <= header.last_page {
        let mut items = read_page(store, key, page_no).await?;
        let dirty = visit(page_no, &mut items);
        if dirty {
            write_page(store, key, page_no, &items).await?;
        }
        page_no += 1;
    }
    Ok(())
}

pub async fn each<F>(store: &dyn KvStore, key: &str, page_size: u32, mut visit: F) -> Result<()>
where
    F: FnMut(&Value),
{
    each_page(store, key, page_size, |_page, items| {
        for item in items.iter() {
            visit(item);
        }
        false
    })
    .await
}

/// `each` whose callback may mutate items in place; any page containing a
/// changed item is rewritten.
pub async fn each_update<F>(store: &dyn KvStore, key: &str, page_size: u32, mut visit: F) -> Result<()>
where
    F: FnMut(&mut Value) -> bool,
{
    each_page(store, key, page_size, |_page, items| {
        let mut dirty = false;
        for item in items.iter_mut() {
            if visit(item) {
                dirty = true;
            }
        }
        dirty
    })
    .await
}

/// Locates the first item that compares greater than `item` under
/// `compare`, and splice-inserts there; appends if none is found.
pub async fn insert_sorted<F>(
    store: &dyn KvStore,
    key: &str,
    page_size: u32,
    item: Value,
    mut compare: F,
) -> Result<u64>
where
    F: FnMut(&Value, &Value) -> std::cmp::Ordering,
{
    let header = read_header(store, key, page_size).await?;
    let all = get(store, key, page_size, 0, header.length).await?;
    let pos = all
        .iter()
        .position(|existing| compare(existing, &item) == std::cmp::Ordering::Greater)
        .unwrap_or(all.len());
    splice(store, key, page_size, pos as i64, 0, vec![item]).await?;
    Ok(pos as u64)
}

pub async fn length(store: &dyn KvStore, key: &str, page_size: u32) -> Result<u64> {
    Ok(read_header(store, key, page_size).await?.length)
}
