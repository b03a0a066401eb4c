//! Tree (XML) path discovery and entity streaming.
//!
//! Discovery makes one streaming pass that counts every closed tag path up to
//! `max_depth` and keeps nothing but a path stack, so memory is bounded by the
//! number of distinct paths rather than document size. Collections are then
//! read off the census:
//!
//! - `/root/container/entity`: the most frequent entity under each container,
//!   when it repeats at least `min_repeats` times. Named after the container.
//! - `/root/container/entity/child_container/child_entity`: one nested level,
//!   named after the child container (prefixed by the parent when taken).
//! - `/root/child` occurring once: a singleton, unless it is the container of
//!   a collection.
//!
//! Entity streams materialize only the elements at the target path; everything
//! else is skipped as it is read. Parsing is lenient: end tags are not checked
//! against start tags and unclosed elements are closed at end of input.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    rc::Rc,
};

use itertools::Itertools;
use log::{debug, info};
use quick_xml::{
    Reader,
    events::{BytesStart, BytesText, Event},
};

use crate::{
    config::InferenceConfig,
    error::{IngestError, Result},
    mapping::{CollectionRule, Mapping},
    record::{ATTR_SLOT, RawRecord, RawValue, Scalar, TEXT_SLOT},
    source::SourceFormat,
};

/// Fallback key names appended after observed ones.
pub const TREE_PK_BASE: &[&str] = &[
    "@id", "id", "@ID", "ID", "@code", "code", "@Code", "Code", "@key", "key",
];
const DISCOVERY_PK_BASE: &[&str] = &["@id", "id", "@code", "code", "@key", "key"];
const SINGLETON_PK_BASE: &[&str] = &["@id", "id", "Code", "code", "@key", "key"];
const OBSERVED_NAME_LIMIT: usize = 50;
const KEY_LIKE_ELEMENTS: &[&str] = &["id", "code", "key"];
const SINGLETON_PREFIX: &str = "Meta_";

/// Absolute tag path of 2, 3, or 5 segments. Comparison ignores case.
#[derive(Debug, Clone)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<String> = raw
            .trim()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        match segments.len() {
            2 | 3 | 5 => Ok(Self { segments }),
            _ => Err(IngestError::UnsupportedPath(raw.to_string())),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn is_nested(&self) -> bool {
        self.segments.len() == 5
    }

    /// Entity path that owns a nested path.
    pub fn parent(&self) -> Option<TreePath> {
        self.is_nested().then(|| TreePath {
            segments: self.segments[..3].to_vec(),
        })
    }

    fn lowered(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.to_lowercase()).collect()
    }
}

impl PartialEq for TreePath {
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for TreePath {}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

fn configured_reader<R: BufRead>(input: R) -> Reader<R> {
    let mut reader = Reader::from_reader(input);
    let config = reader.config_mut();
    config.trim_text(true);
    config.expand_empty_elements = true;
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    reader
}

fn open_file(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn decode_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn text_content(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

/// Closed-tag counts per path, plus the root tag.
#[derive(Debug, Default)]
pub struct PathCensus {
    root: Option<String>,
    counts: HashMap<Vec<String>, usize>,
}

impl PathCensus {
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn count(&self, path: &[&str]) -> usize {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn distinct_paths(&self) -> usize {
        self.counts.len()
    }

    fn record(&mut self, stack: &[String]) {
        if let Some(count) = self.counts.get_mut(stack) {
            *count += 1;
        } else {
            self.counts.insert(stack.to_vec(), 1);
        }
    }

    /// Paths of `len` segments under the root, in sorted order.
    fn paths_of_len(&self, len: usize) -> Vec<(&[String], usize)> {
        let root = self.root.as_deref();
        self.counts
            .iter()
            .filter(|(path, _)| path.len() == len && Some(path[0].as_str()) == root)
            .map(|(path, count)| (path.as_slice(), *count))
            .sorted()
            .collect()
    }
}

/// Counts every tag path up to `max_depth` in one streaming pass.
pub fn count_paths<R: BufRead>(input: R, max_depth: usize) -> Result<PathCensus> {
    let mut reader = configured_reader(input);
    let mut census = PathCensus::default();
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = decode_name(e.local_name().as_ref());
                if census.root.is_none() {
                    census.root = Some(name.clone());
                }
                stack.push(name);
            }
            Event::End(_) => {
                if !stack.is_empty() {
                    if stack.len() <= max_depth {
                        census.record(&stack);
                    }
                    stack.pop();
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    while !stack.is_empty() {
        if stack.len() <= max_depth {
            census.record(&stack);
        }
        stack.pop();
    }
    Ok(census)
}

pub fn count_paths_in_file(path: &Path, max_depth: usize) -> Result<PathCensus> {
    count_paths(open_file(path)?, max_depth)
}

fn base_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Most frequent entity; ties go to the lexically smallest tag.
fn dominant_entity(entities: &[(String, usize)]) -> Option<&(String, usize)> {
    entities
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
}

/// Builds the provisional mapping from a census.
pub fn discover_mapping(
    census: &PathCensus,
    source_name: &str,
    config: &InferenceConfig,
) -> Result<Mapping> {
    let root = census
        .root()
        .ok_or_else(|| IngestError::NoStructure(source_name.to_string()))?
        .to_string();
    let mut mapping = Mapping::new(source_name, SourceFormat::Xml);
    mapping.root = Some(root.clone());

    let mut by_container: BTreeMap<&str, Vec<(String, usize)>> = BTreeMap::new();
    for (path, count) in census.paths_of_len(3) {
        by_container
            .entry(path[1].as_str())
            .or_default()
            .push((path[2].clone(), count));
    }
    // container -> (collection name, entity tag)
    let mut owners: HashMap<&str, (String, String)> = HashMap::new();
    for (container, entities) in &by_container {
        let Some((entity, count)) = dominant_entity(entities) else {
            continue;
        };
        if *count < config.min_repeats {
            continue;
        }
        let rule = CollectionRule::tree(
            format!("/{root}/{container}/{entity}"),
            base_list(DISCOVERY_PK_BASE),
        );
        let name = mapping.insert_unique(container, rule);
        debug!("[{source_name}] Collection '{name}' -> /{root}/{container}/{entity} ({count})");
        owners.insert(*container, (name, entity.clone()));
    }

    let mut nested: BTreeMap<(&str, &str, &str), Vec<(String, usize)>> = BTreeMap::new();
    for (path, count) in census.paths_of_len(5) {
        nested
            .entry((path[1].as_str(), path[2].as_str(), path[3].as_str()))
            .or_default()
            .push((path[4].clone(), count));
    }
    for ((container, entity, child_container), children) in &nested {
        let Some((child_entity, count)) = dominant_entity(children) else {
            continue;
        };
        if *count < config.min_repeats {
            continue;
        }
        let parent = owners
            .get(container)
            .filter(|(_, owned_entity)| owned_entity == entity)
            .map(|(name, _)| name.clone());
        let mut rule = CollectionRule::tree(
            format!("/{root}/{container}/{entity}/{child_container}/{child_entity}"),
            base_list(DISCOVERY_PK_BASE),
        );
        rule.parent_fk = Some(config.parent_fk_column.clone());
        rule.parent = parent.clone();
        let preferred = if mapping.collections.contains_key(*child_container) {
            let prefix = parent.as_deref().unwrap_or(*container);
            format!("{prefix}_{child_container}")
        } else {
            child_container.to_string()
        };
        let name = mapping.insert_unique(&preferred, rule);
        debug!("[{source_name}] Nested collection '{name}' under {parent:?}");
    }

    for (path, count) in census.paths_of_len(2) {
        let tag = path[1].as_str();
        if count != 1 || owners.contains_key(tag) {
            continue;
        }
        let rule =
            CollectionRule::tree(format!("/{root}/{tag}"), base_list(SINGLETON_PK_BASE)).as_singleton();
        let preferred = if mapping.collections.contains_key(tag) {
            format!("{SINGLETON_PREFIX}{tag}")
        } else {
            tag.to_string()
        };
        mapping.insert_unique(&preferred, rule);
    }

    if mapping.collections.is_empty() {
        return Err(IngestError::NoStructure(source_name.to_string()));
    }
    Ok(mapping)
}

/// Attribute and key-like element names seen in a sample, most common first.
#[derive(Debug, Default)]
pub struct KeyObservation {
    attributes: Vec<(String, usize)>,
    elements: Vec<(String, usize)>,
}

fn bump(counter: &mut Vec<(String, usize)>, key: &str) {
    if let Some(entry) = counter.iter_mut().find(|(k, _)| k == key) {
        entry.1 += 1;
    } else {
        counter.push((key.to_string(), 1));
    }
}

fn most_common(counter: &[(String, usize)]) -> impl Iterator<Item = &str> {
    counter
        .iter()
        .enumerate()
        .sorted_by(|(ia, a), (ib, b)| b.1.cmp(&a.1).then(ia.cmp(ib)))
        .take(OBSERVED_NAME_LIMIT)
        .map(|(_, (k, _))| k.as_str())
}

fn has_scalar_value(value: &RawValue) -> bool {
    match value {
        RawValue::Scalar(s) => s.as_key_string().is_some(),
        RawValue::Object(node) => node.text().and_then(Scalar::as_key_string).is_some(),
        RawValue::List(items) => items.iter().any(|item| {
            item.as_object()
                .and_then(RawRecord::text)
                .and_then(Scalar::as_key_string)
                .is_some()
        }),
    }
}

impl KeyObservation {
    pub fn observe(&mut self, record: &RawRecord) {
        if let Some(attrs) = record.attributes() {
            for key in attrs.keys() {
                bump(&mut self.attributes, key);
            }
        }
        for (key, value) in record.iter() {
            if key == ATTR_SLOT || key == TEXT_SLOT {
                continue;
            }
            if has_scalar_value(value) {
                bump(&mut self.elements, key);
            }
        }
    }

    /// Observed attributes as `@name`, then key-like elements, then the base list.
    pub fn prefer_list(&self) -> Vec<String> {
        let attrs = most_common(&self.attributes).map(|k| format!("@{k}"));
        let elements = most_common(&self.elements)
            .filter(|k| KEY_LIKE_ELEMENTS.iter().any(|b| k.eq_ignore_ascii_case(b)))
            .map(str::to_string);
        attrs
            .chain(elements)
            .chain(TREE_PK_BASE.iter().map(|s| s.to_string()))
            .unique()
            .collect()
    }
}

/// Discovers collections and builds each one's provisional PK list.
pub fn infer_tree_mapping(path: &Path, source_name: &str, config: &InferenceConfig) -> Result<Mapping> {
    let census = count_paths_in_file(path, config.max_depth)?;
    info!(
        "[{source_name}] Tree census: root={:?}, {} distinct path(s)",
        census.root(),
        census.distinct_paths()
    );
    let mut mapping = discover_mapping(&census, source_name, config)?;
    for (name, rule) in mapping.collections.iter_mut() {
        let Some(raw_path) = rule.locator.tree_path() else {
            continue;
        };
        let tree_path = TreePath::parse(raw_path)?;
        let mut observation = KeyObservation::default();
        for record in open_records(path, &tree_path)?.take(config.pk_observe_limit) {
            observation.observe(&record?);
        }
        rule.pk.prefer = observation.prefer_list();
        debug!("[{source_name}] Provisional PK list for '{name}': {:?}", rule.pk.prefer);
    }
    Ok(mapping)
}

struct ElementBuilder {
    attributes: RawRecord,
    children: Vec<(String, Vec<RawValue>)>,
    text: Vec<String>,
}

impl ElementBuilder {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let mut attributes = RawRecord::new();
        let mut attrs = start.attributes();
        attrs.with_checks(false);
        for attr in attrs.flatten() {
            let raw_key = attr.key.as_ref();
            if raw_key == b"xmlns" || raw_key.starts_with(b"xmlns:") {
                continue;
            }
            let key = decode_name(attr.key.local_name().as_ref());
            let value = match attr.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            attributes.insert(key, Scalar::String(value));
        }
        Self {
            attributes,
            children: Vec::new(),
            text: Vec::new(),
        }
    }

    fn push_text(&mut self, text: String) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.text.push(trimmed.to_string());
        }
    }

    fn push_child(&mut self, tag: String, child: RawRecord) {
        match self.children.iter_mut().find(|(k, _)| *k == tag) {
            Some((_, items)) => items.push(RawValue::Object(child)),
            None => self.children.push((tag, vec![RawValue::Object(child)])),
        }
    }

    /// Attributes under `@`, children grouped in first-seen order (one child
    /// is a value, several a list), then text under `#text`.
    fn finish(self) -> RawRecord {
        let mut record = RawRecord::new();
        if !self.attributes.is_empty() {
            record.insert(ATTR_SLOT, self.attributes);
        }
        for (tag, mut items) in self.children {
            let value = if items.len() == 1 {
                items.remove(0)
            } else {
                RawValue::List(items)
            };
            record.insert(tag, value);
        }
        if !self.text.is_empty() {
            record.insert(TEXT_SLOT, Scalar::String(self.text.join(" ")));
        }
        record
    }
}

/// Streams the elements found at one absolute path as lossless records.
pub struct EntityStream<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    target: Vec<String>,
    stack: Vec<String>,
    open: Vec<(String, ElementBuilder)>,
    done: bool,
}

impl<R: BufRead> EntityStream<R> {
    pub fn new(input: R, path: &TreePath) -> Self {
        Self {
            reader: configured_reader(input),
            buf: Vec::new(),
            target: path.lowered(),
            stack: Vec::new(),
            open: Vec::new(),
            done: false,
        }
    }

    /// Closes whatever is still open at end of input.
    fn drain_unclosed(&mut self) -> Option<RawRecord> {
        let mut finished: Option<(String, RawRecord)> = None;
        while let Some((tag, mut builder)) = self.open.pop() {
            if let Some((child_tag, child)) = finished.take() {
                builder.push_child(child_tag, child);
            }
            finished = Some((tag, builder.finish()));
        }
        finished.map(|(_, record)| record)
    }
}

impl<R: BufRead> Iterator for EntityStream<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            };
            match event {
                Event::Start(e) => {
                    let name = decode_name(e.local_name().as_ref());
                    self.stack.push(name.to_lowercase());
                    if !self.open.is_empty() || self.stack == self.target {
                        self.open.push((name, ElementBuilder::from_start(&e)));
                    }
                }
                Event::Text(t) => {
                    if let Some((_, builder)) = self.open.last_mut() {
                        builder.push_text(text_content(&t));
                    }
                }
                Event::CData(c) => {
                    if let Some((_, builder)) = self.open.last_mut() {
                        builder.push_text(String::from_utf8_lossy(&c).into_owned());
                    }
                }
                Event::End(_) => {
                    if self.stack.pop().is_none() {
                        continue;
                    }
                    if let Some((tag, builder)) = self.open.pop() {
                        let record = builder.finish();
                        match self.open.last_mut() {
                            Some((_, parent)) => parent.push_child(tag, record),
                            None => return Some(Ok(record)),
                        }
                    }
                }
                Event::Eof => {
                    self.done = true;
                    return self.drain_unclosed().map(Ok);
                }
                _ => {}
            }
        }
    }
}

fn list_items(value: &RawValue) -> Vec<&RawValue> {
    match value {
        RawValue::List(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Child entities of one parent record, matched case-insensitively.
pub fn child_entities(parent: &RawRecord, container: &str, entity: &str) -> Vec<RawRecord> {
    let Some(holder) = parent.get_ci(container) else {
        return Vec::new();
    };
    list_items(holder)
        .into_iter()
        .filter_map(RawValue::as_object)
        .filter_map(|h| h.get_ci(entity))
        .flat_map(list_items)
        .filter_map(RawValue::as_object)
        .cloned()
        .collect()
}

/// Streams nested entities paired with the parent entity that holds them.
/// Each parent is materialized once and shared by its children.
pub struct NestedEntityStream<R: BufRead> {
    parents: EntityStream<R>,
    child_container: String,
    child_entity: String,
    pending: VecDeque<(RawRecord, Rc<RawRecord>)>,
}

impl<R: BufRead> NestedEntityStream<R> {
    pub fn new(input: R, child_path: &TreePath) -> Result<Self> {
        let parent = child_path
            .parent()
            .ok_or_else(|| IngestError::UnsupportedPath(child_path.to_string()))?;
        let segments = child_path.segments();
        Ok(Self {
            parents: EntityStream::new(input, &parent),
            child_container: segments[3].clone(),
            child_entity: segments[4].clone(),
            pending: VecDeque::new(),
        })
    }
}

impl<R: BufRead> Iterator for NestedEntityStream<R> {
    type Item = Result<(RawRecord, Rc<RawRecord>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(Ok(pair));
            }
            let parent = match self.parents.next()? {
                Ok(parent) => Rc::new(parent),
                Err(err) => return Some(Err(err)),
            };
            for child in child_entities(&parent, &self.child_container, &self.child_entity) {
                self.pending.push_back((child, Rc::clone(&parent)));
            }
        }
    }
}

pub fn open_entities(path: &Path, tree_path: &TreePath) -> Result<EntityStream<BufReader<File>>> {
    Ok(EntityStream::new(open_file(path)?, tree_path))
}

pub fn open_nested(path: &Path, child_path: &TreePath) -> Result<NestedEntityStream<BufReader<File>>> {
    NestedEntityStream::new(open_file(path)?, child_path)
}

/// Records at `tree_path`, without parents.
pub fn open_records(
    path: &Path,
    tree_path: &TreePath,
) -> Result<Box<dyn Iterator<Item = Result<RawRecord>>>> {
    if tree_path.is_nested() {
        let stream = open_nested(path, tree_path)?;
        Ok(Box::new(stream.map(|item| item.map(|(child, _)| child))))
    } else {
        Ok(Box::new(open_entities(path, tree_path)?))
    }
}
