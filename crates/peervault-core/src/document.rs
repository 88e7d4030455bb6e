//! DocumentManager: the replicated vault document.
//!
//! One Loro document per vault:
//! - `vault`: a LoroTree of nodes; each node's meta map carries `name`,
//!   `kind`, timestamps, the soft-delete flag, and either a `content`
//!   LoroText (text files) or a `blob` hash (binary files)
//! - `meta`: a LoroMap holding `vaultId` and `schemaVersion`
//!
//! Paths are derived from ancestor names, never stored. The manager is the
//! only mutation path for the live document; historical reads go through
//! forked views. `vaultId` is assigned at the first local commit; a replica
//! that has never committed adopts the vault id of the first snapshot it
//! imports.

use crate::events::{EventBus, Subscription};
use crate::replica_id::ReplicaId;
use crate::storage::{StorageAdapter, StorageError, KEY_SNAPSHOT};
use loro::{
    Container, ExportMode, Frontiers, LoroDoc, LoroMap, LoroText, LoroTree, LoroValue, TreeID,
    UpdateOptions, ValueOrContainer, VersionVector, ID,
};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Schema version written into fresh documents. Kept in lockstep with the
/// migration chain's latest version.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const TREE: &str = "vault";
const META: &str = "meta";

const K_NAME: &str = "name";
const K_KIND: &str = "kind";
const K_MIME: &str = "mime";
const K_CTIME: &str = "ctime";
const K_MTIME: &str = "mtime";
const K_DELETED: &str = "deleted";
const K_BLOB: &str = "blob";
const K_CONTENT: &str = "content";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Incompatible schema version {0}")]
    IncompatibleSchema(i64),

    #[error("Vault mismatch: update belongs to {0}")]
    VaultMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Node type mismatch at {0}")]
    TypeMismatch(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Node classification. Immutable after creation: switching file<->binary is
/// delete + create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Folder,
    File,
    Binary,
}

impl NodeKind {
    fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::File => "file",
            NodeKind::Binary => "binary",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "folder" => Some(NodeKind::Folder),
            "file" => Some(NodeKind::File),
            "binary" => Some(NodeKind::Binary),
            _ => None,
        }
    }
}

/// Whether a node is live or soft-deleted. Deleted nodes keep their content
/// so undelete is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Live,
    Deleted,
}

/// Metadata snapshot of one node.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Stable opaque node id (`counter@peer`).
    pub node_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub mime_type: Option<String>,
    /// Creation time, ms since epoch. Immutable.
    pub ctime: i64,
    /// Last modification, ms since epoch. Monotonic per replica.
    pub mtime: i64,
    pub status: NodeStatus,
    /// Content digest for binary nodes. The referenced bytes may be absent
    /// locally; absence is a state, not an error.
    pub blob_hash: Option<String>,
}

/// Where imported bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOrigin {
    Local,
    Remote(ReplicaId),
}

/// One contributing replica observed in an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditObservation {
    pub peer: ReplicaId,
    /// Observation wall-clock, ms since epoch.
    pub timestamp: u64,
}

/// Result of applying remote (or replayed local) update bytes.
#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    /// Paths whose node metadata or content changed, sorted.
    pub changed_paths: Vec<String>,
    /// Replicas whose operations were newly applied.
    pub edits: Vec<EditObservation>,
}

/// One entry of the version history walk, newest first.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub frontiers: Frontiers,
    pub peer: ReplicaId,
    pub lamport: u32,
    /// Engine change timestamp (epoch seconds).
    pub timestamp: i64,
}

/// Advisory sibling-name collision (allowed by the CRDT, reported to the
/// embedder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub parent_path: String,
    pub name: String,
    pub node_ids: Vec<String>,
}

/// Outcome of an operation-log compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactOutcome {
    pub before_size: usize,
    pub after_size: usize,
    pub compacted: bool,
}

/// Change notifications emitted by the manager.
#[derive(Debug, Clone)]
pub enum DocEvent {
    /// A local mutation committed.
    LocalChange { paths: Vec<String> },
    /// Update bytes were applied.
    RemoteChange {
        peer: Option<ReplicaId>,
        paths: Vec<String>,
    },
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn tree_id_str(id: TreeID) -> String {
    format!("{}@{}", id.counter, id.peer)
}

fn engine_err(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Engine(e.to_string())
}

/// Split a `/`-joined vault path into non-empty segments.
fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(DocumentError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Read helpers shared by the live manager and historical views
// ---------------------------------------------------------------------------

/// Children of `parent` (`None` for the tree roots), in tree order.
fn child_ids(tree: &LoroTree, parent: Option<TreeID>) -> Vec<TreeID> {
    tree.children(parent).unwrap_or_default()
}

fn node_meta(tree: &LoroTree, id: TreeID) -> Result<LoroMap> {
    tree.get_meta(id).map_err(engine_err)
}

fn meta_str(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn meta_i64(map: &LoroMap, key: &str) -> Option<i64> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::I64(n)) => Some(n),
        _ => None,
    }
}

fn meta_bool(map: &LoroMap, key: &str) -> Option<bool> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::Bool(b)) => Some(b),
        _ => None,
    }
}

fn meta_text(map: &LoroMap, key: &str) -> Option<LoroText> {
    match map.get(key)? {
        ValueOrContainer::Container(Container::Text(text)) => Some(text),
        _ => None,
    }
}

fn node_is_deleted(tree: &LoroTree, id: TreeID) -> bool {
    node_meta(tree, id)
        .ok()
        .and_then(|m| meta_bool(&m, K_DELETED))
        .unwrap_or(false)
}

fn node_name(tree: &LoroTree, id: TreeID) -> String {
    node_meta(tree, id)
        .ok()
        .and_then(|m| meta_str(&m, K_NAME))
        .unwrap_or_default()
}

/// Find the child of `parent` named `name`, preferring live nodes. Sibling
/// name collisions resolve to the first match in tree order; readers that
/// need the others disambiguate via [`NameCollision`] node ids.
fn child_by_name(tree: &LoroTree, parent: Option<TreeID>, name: &str) -> Option<TreeID> {
    let mut deleted_match = None;
    for child in child_ids(tree, parent) {
        if node_name(tree, child) == name {
            if node_is_deleted(tree, child) {
                deleted_match.get_or_insert(child);
            } else {
                return Some(child);
            }
        }
    }
    deleted_match
}

/// Resolve a path to a node. Intermediate segments must be live; the final
/// segment may be soft-deleted (so deleted files stay addressable).
fn resolve(tree: &LoroTree, path: &str) -> Result<TreeID> {
    let segments = split_path(path)?;
    let mut current: Option<TreeID> = None;
    for (i, segment) in segments.iter().enumerate() {
        let found = child_by_name(tree, current, segment)
            .ok_or_else(|| DocumentError::NotFound(path.to_string()))?;
        if i + 1 < segments.len() && node_is_deleted(tree, found) {
            return Err(DocumentError::NotFound(path.to_string()));
        }
        current = Some(found);
    }
    current.ok_or_else(|| DocumentError::NotFound(path.to_string()))
}

fn collect_paths(tree: &LoroTree, parent: Option<TreeID>, prefix: &str, out: &mut Vec<String>) {
    for child in child_ids(tree, parent) {
        if node_is_deleted(tree, child) {
            continue;
        }
        let name = node_name(tree, child);
        let path = format!("{prefix}/{name}");
        out.push(path.clone());
        collect_paths(tree, Some(child), &path, out);
    }
}

fn read_meta_of(tree: &LoroTree, id: TreeID) -> Result<FileMeta> {
    let map = node_meta(tree, id)?;
    let kind = meta_str(&map, K_KIND)
        .and_then(|k| NodeKind::parse(&k))
        .ok_or_else(|| DocumentError::Engine(format!("node {} has no kind", tree_id_str(id))))?;
    Ok(FileMeta {
        node_id: tree_id_str(id),
        name: meta_str(&map, K_NAME).unwrap_or_default(),
        kind,
        mime_type: meta_str(&map, K_MIME),
        ctime: meta_i64(&map, K_CTIME).unwrap_or(0),
        mtime: meta_i64(&map, K_MTIME).unwrap_or(0),
        status: if meta_bool(&map, K_DELETED).unwrap_or(false) {
            NodeStatus::Deleted
        } else {
            NodeStatus::Live
        },
        blob_hash: meta_str(&map, K_BLOB),
    })
}

fn read_text_of(tree: &LoroTree, id: TreeID, path: &str) -> Result<String> {
    let map = node_meta(tree, id)?;
    match meta_str(&map, K_KIND).as_deref() {
        Some("file") => {}
        _ => return Err(DocumentError::TypeMismatch(path.to_string())),
    }
    Ok(meta_text(&map, K_CONTENT)
        .map(|t| t.to_string())
        .unwrap_or_default())
}

fn doc_meta_str(doc: &LoroDoc, key: &str) -> Option<String> {
    meta_str(&doc.get_map(META), key)
}

fn doc_meta_i64(doc: &LoroDoc, key: &str) -> Option<i64> {
    meta_i64(&doc.get_map(META), key)
}

/// Stamp used to diff document state across an import. Every content
/// change bumps `mtime`, so `(mtime, deleted, blob, kind)` captures all
/// observable changes.
type Projection = HashMap<String, (i64, bool, Option<String>, String)>;

fn project(doc: &LoroDoc) -> Projection {
    let tree = doc.get_tree(TREE);
    let mut out = Projection::new();
    let mut stack: Vec<(Option<TreeID>, String)> = vec![(None, String::new())];
    while let Some((parent, prefix)) = stack.pop() {
        for child in child_ids(&tree, parent) {
            let Ok(map) = node_meta(&tree, child) else {
                continue;
            };
            let name = meta_str(&map, K_NAME).unwrap_or_default();
            let path = format!("{prefix}/{name}");
            out.insert(
                path.clone(),
                (
                    meta_i64(&map, K_MTIME).unwrap_or(0),
                    meta_bool(&map, K_DELETED).unwrap_or(false),
                    meta_str(&map, K_BLOB),
                    meta_str(&map, K_KIND).unwrap_or_default(),
                ),
            );
            stack.push((Some(child), path));
        }
    }
    out
}

fn configure_doc(doc: &LoroDoc, replica: ReplicaId) -> Result<()> {
    doc.set_peer_id(replica.as_u64()).map_err(engine_err)?;
    doc.set_record_timestamp(true);
    doc.get_tree(TREE).enable_fractional_index(0);
    Ok(())
}

// ---------------------------------------------------------------------------
// DocumentManager
// ---------------------------------------------------------------------------

/// Owns the single replicated document of a vault.
pub struct DocumentManager {
    doc: LoroDoc,
    storage: Arc<dyn StorageAdapter>,
    replica: ReplicaId,
    vault_id: Option<String>,
    bus: Arc<EventBus<DocEvent>>,
}

impl DocumentManager {
    /// Open the persisted snapshot if present, otherwise start an empty
    /// document. The `vaultId` of a new document is assigned at its first
    /// local commit (or adopted from the first imported snapshot).
    pub async fn initialize(
        storage: Arc<dyn StorageAdapter>,
        replica: ReplicaId,
    ) -> Result<Self> {
        let doc = LoroDoc::new();
        configure_doc(&doc, replica)?;

        let vault_id = match storage.read(KEY_SNAPSHOT).await? {
            Some(bytes) => {
                doc.import(&bytes)
                    .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
                let vault_id = doc_meta_str(&doc, "vaultId");
                debug!(vault_id = ?vault_id, "opened persisted vault document");
                vault_id
            }
            None => None,
        };

        Ok(Self {
            doc,
            storage,
            replica,
            vault_id,
            bus: Arc::new(EventBus::new()),
        })
    }

    /// The vault id, once frozen by a first commit or import.
    pub fn vault_id(&self) -> Option<&str> {
        self.vault_id.as_deref()
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn schema_version(&self) -> i64 {
        doc_meta_i64(&self.doc, "schemaVersion").unwrap_or(0)
    }

    /// Subscribe to change events. Dropping the handle unsubscribes.
    pub fn on_change(&self, cb: impl Fn(&DocEvent) + Send + Sync + 'static) -> Subscription {
        self.bus.subscribe(cb)
    }

    fn tree(&self) -> LoroTree {
        self.doc.get_tree(TREE)
    }

    /// Freeze the vault identity at the first commit.
    fn ensure_vault_id(&mut self) -> Result<()> {
        if self.vault_id.is_some() {
            return Ok(());
        }
        let vault_id = Uuid::new_v4().to_string();
        let meta = self.doc.get_map(META);
        meta.insert("vaultId", vault_id.as_str()).map_err(engine_err)?;
        meta.insert("schemaVersion", CURRENT_SCHEMA_VERSION)
            .map_err(engine_err)?;
        info!(vault_id = %vault_id, "assigned vault id");
        self.vault_id = Some(vault_id);
        Ok(())
    }

    // ---------------- reads ----------------

    /// All live paths, sorted.
    pub fn list_all_paths(&self) -> Vec<String> {
        let tree = self.tree();
        let mut out = Vec::new();
        collect_paths(&tree, None, "", &mut out);
        out.sort();
        out
    }

    pub fn get_file_meta(&self, path: &str) -> Result<FileMeta> {
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        read_meta_of(&tree, id)
    }

    pub fn get_text_content(&self, path: &str) -> Result<String> {
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        read_text_of(&tree, id, path)
    }

    /// Blob hashes referenced by non-deleted binary nodes.
    pub fn live_blob_hashes(&self) -> HashSet<String> {
        let tree = self.tree();
        let mut out = HashSet::new();
        let mut stack: Vec<TreeID> = child_ids(&tree, None);
        while let Some(id) = stack.pop() {
            if node_is_deleted(&tree, id) {
                continue;
            }
            if let Ok(map) = node_meta(&tree, id) {
                if let Some(hash) = meta_str(&map, K_BLOB) {
                    out.insert(hash);
                }
            }
            stack.extend(child_ids(&tree, Some(id)));
        }
        out
    }

    /// Live sibling pairs sharing a name (allowed by the CRDT after
    /// concurrent creates; reported as advisory conflicts).
    pub fn sibling_collisions(&self) -> Vec<NameCollision> {
        let tree = self.tree();
        let mut out = Vec::new();
        let mut stack: Vec<(Option<TreeID>, String)> = vec![(None, String::new())];
        while let Some((parent, prefix)) = stack.pop() {
            let mut by_name: HashMap<String, Vec<TreeID>> = HashMap::new();
            for child in child_ids(&tree, parent) {
                if node_is_deleted(&tree, child) {
                    continue;
                }
                let name = node_name(&tree, child);
                stack.push((Some(child), format!("{prefix}/{name}")));
                by_name.entry(name).or_default().push(child);
            }
            for (name, ids) in by_name {
                if ids.len() > 1 {
                    out.push(NameCollision {
                        parent_path: if prefix.is_empty() {
                            "/".into()
                        } else {
                            prefix.clone()
                        },
                        name,
                        node_ids: ids.into_iter().map(tree_id_str).collect(),
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.parent_path, &a.name).cmp(&(&b.parent_path, &b.name)));
        out
    }

    // ---------------- mutations ----------------

    fn touch(&self, map: &LoroMap) -> Result<()> {
        let old = meta_i64(map, K_MTIME).unwrap_or(0);
        // Monotonic per replica; never below ctime.
        let mtime = now_ms().max(old);
        map.insert(K_MTIME, mtime).map_err(engine_err)?;
        Ok(())
    }

    fn create_node(
        &self,
        parent: Option<TreeID>,
        name: &str,
        kind: NodeKind,
        mime_type: Option<&str>,
    ) -> Result<TreeID> {
        let tree = self.tree();
        let id = tree.create(parent).map_err(engine_err)?;
        let map = node_meta(&tree, id)?;
        let now = now_ms();
        map.insert(K_NAME, name).map_err(engine_err)?;
        map.insert(K_KIND, kind.as_str()).map_err(engine_err)?;
        map.insert(K_CTIME, now).map_err(engine_err)?;
        map.insert(K_MTIME, now).map_err(engine_err)?;
        map.insert(K_DELETED, false).map_err(engine_err)?;
        if let Some(mime) = mime_type {
            map.insert(K_MIME, mime).map_err(engine_err)?;
        }
        if kind == NodeKind::File {
            map.insert_container(K_CONTENT, LoroText::new())
                .map_err(engine_err)?;
        }
        Ok(id)
    }

    /// Walk to the parent of `path`, creating missing folders and reviving
    /// soft-deleted ones on the way.
    fn ensure_parent(&self, segments: &[&str]) -> Result<Option<TreeID>> {
        let tree = self.tree();
        let mut current: Option<TreeID> = None;
        for segment in &segments[..segments.len() - 1] {
            current = Some(match child_by_name(&tree, current, segment) {
                Some(found) => {
                    let map = node_meta(&tree, found)?;
                    match meta_str(&map, K_KIND).as_deref() {
                        Some("folder") => {}
                        _ => return Err(DocumentError::TypeMismatch(segment.to_string())),
                    }
                    if meta_bool(&map, K_DELETED).unwrap_or(false) {
                        map.insert(K_DELETED, false).map_err(engine_err)?;
                        self.touch(&map)?;
                    }
                    found
                }
                None => self.create_node(current, segment, NodeKind::Folder, None)?,
            });
        }
        Ok(current)
    }

    fn commit_local(&mut self, paths: Vec<String>) -> Result<()> {
        self.ensure_vault_id()?;
        self.doc.commit();
        self.bus.emit(&DocEvent::LocalChange { paths });
        Ok(())
    }

    /// Idempotent text write: creates ancestors and the file as needed,
    /// diffs the content, bumps `mtime`.
    pub fn set_text_content(&mut self, path: &str, text: &str) -> Result<()> {
        let segments = split_path(path)?;
        let tree = self.tree();
        let name = segments[segments.len() - 1];

        let id = match resolve(&tree, path) {
            Ok(id) => id,
            Err(DocumentError::NotFound(_)) => {
                let parent = self.ensure_parent(&segments)?;
                self.create_node(
                    parent,
                    name,
                    NodeKind::File,
                    Some(crate::mime::mime_type_for(name)),
                )?
            }
            Err(e) => return Err(e),
        };

        let map = node_meta(&tree, id)?;
        match meta_str(&map, K_KIND).as_deref() {
            Some("file") => {}
            _ => return Err(DocumentError::TypeMismatch(path.to_string())),
        }

        let content = match meta_text(&map, K_CONTENT) {
            Some(text) => text,
            None => map
                .insert_container(K_CONTENT, LoroText::new())
                .map_err(engine_err)?,
        };
        if content.to_string() != text {
            content
                .update(text, UpdateOptions::default())
                .map_err(|e| engine_err(format!("{e:?}")))?;
            self.touch(&map)?;
        }
        self.commit_local(vec![path.to_string()])
    }

    pub fn create_folder(&mut self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        let tree = self.tree();
        if resolve(&tree, path).is_ok() {
            return Err(DocumentError::AlreadyExists(path.to_string()));
        }
        let parent = self.ensure_parent(&segments)?;
        self.create_node(parent, segments[segments.len() - 1], NodeKind::Folder, None)?;
        self.commit_local(vec![path.to_string()])
    }

    pub fn create_file(&mut self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        let tree = self.tree();
        if resolve(&tree, path).is_ok() {
            return Err(DocumentError::AlreadyExists(path.to_string()));
        }
        let parent = self.ensure_parent(&segments)?;
        let name = segments[segments.len() - 1];
        self.create_node(
            parent,
            name,
            NodeKind::File,
            Some(crate::mime::mime_type_for(name)),
        )?;
        self.commit_local(vec![path.to_string()])
    }

    /// Create (or idempotently update) a binary node referencing an
    /// already-stored blob.
    pub fn create_binary(&mut self, path: &str, blob_hash: &str, mime_type: &str) -> Result<()> {
        let segments = split_path(path)?;
        let tree = self.tree();
        if let Ok(id) = resolve(&tree, path) {
            let map = node_meta(&tree, id)?;
            match meta_str(&map, K_KIND).as_deref() {
                Some("binary") => {}
                _ => return Err(DocumentError::TypeMismatch(path.to_string())),
            }
            if meta_str(&map, K_BLOB).as_deref() != Some(blob_hash) {
                map.insert(K_BLOB, blob_hash).map_err(engine_err)?;
                map.insert(K_MIME, mime_type).map_err(engine_err)?;
                self.touch(&map)?;
            }
            return self.commit_local(vec![path.to_string()]);
        }
        let parent = self.ensure_parent(&segments)?;
        let id = self.create_node(
            parent,
            segments[segments.len() - 1],
            NodeKind::Binary,
            Some(mime_type),
        )?;
        node_meta(&tree, id)?
            .insert(K_BLOB, blob_hash)
            .map_err(engine_err)?;
        self.commit_local(vec![path.to_string()])
    }

    /// Move a node under a new parent folder (`""` or `"/"` for the root).
    pub fn move_node(&mut self, path: &str, new_parent: &str) -> Result<()> {
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        let parent = if new_parent.is_empty() || new_parent == "/" {
            None
        } else {
            let pid = resolve(&tree, new_parent)?;
            let map = node_meta(&tree, pid)?;
            match meta_str(&map, K_KIND).as_deref() {
                Some("folder") => {}
                _ => return Err(DocumentError::TypeMismatch(new_parent.to_string())),
            }
            Some(pid)
        };
        tree.mov(id, parent).map_err(engine_err)?;
        let map = node_meta(&tree, id)?;
        self.touch(&map)?;
        self.commit_local(vec![path.to_string(), new_parent.to_string()])
    }

    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(DocumentError::InvalidPath(new_name.to_string()));
        }
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        let map = node_meta(&tree, id)?;
        map.insert(K_NAME, new_name).map_err(engine_err)?;
        self.touch(&map)?;
        self.commit_local(vec![path.to_string()])
    }

    /// Soft-delete: flips the flag, keeps the content.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        let map = node_meta(&tree, id)?;
        map.insert(K_DELETED, true).map_err(engine_err)?;
        self.touch(&map)?;
        self.commit_local(vec![path.to_string()])
    }

    pub fn undelete(&mut self, path: &str) -> Result<()> {
        let tree = self.tree();
        let id = resolve(&tree, path)?;
        let map = node_meta(&tree, id)?;
        if !meta_bool(&map, K_DELETED).unwrap_or(false) {
            return Ok(());
        }
        map.insert(K_DELETED, false).map_err(engine_err)?;
        self.touch(&map)?;
        self.commit_local(vec![path.to_string()])
    }

    // ---------------- sync surface ----------------

    /// Full snapshot bytes.
    pub fn export_full(&self) -> Result<Vec<u8>> {
        self.doc.export(ExportMode::Snapshot).map_err(engine_err)
    }

    /// Incremental updates since `from`.
    pub fn export_delta(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc.export(ExportMode::updates(from)).map_err(engine_err)
    }

    /// Apply update bytes.
    ///
    /// Bytes are first validated on a fork so malformed updates, foreign
    /// vaults, and future schemas never touch the live document.
    pub fn import(&mut self, bytes: &[u8], origin: ImportOrigin) -> Result<ImportOutcome> {
        let probe = self.doc.fork();
        probe
            .import(bytes)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        if let (Some(ours), Some(theirs)) =
            (self.vault_id.as_deref(), doc_meta_str(&probe, "vaultId"))
        {
            if ours != theirs {
                return Err(DocumentError::VaultMismatch(theirs));
            }
        }
        if let Some(schema) = doc_meta_i64(&probe, "schemaVersion") {
            if schema > CURRENT_SCHEMA_VERSION {
                return Err(DocumentError::IncompatibleSchema(schema));
            }
        }

        let before = project(&self.doc);
        let status = self
            .doc
            .import(bytes)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let after = project(&self.doc);

        // A replica that never committed adopts the imported vault id.
        if self.vault_id.is_none() {
            self.vault_id = doc_meta_str(&self.doc, "vaultId");
        }

        let mut changed_paths: Vec<String> = after
            .iter()
            .filter(|(path, stamp)| before.get(*path) != Some(*stamp))
            .map(|(path, _)| path.clone())
            .chain(
                before
                    .keys()
                    .filter(|path| !after.contains_key(*path))
                    .cloned(),
            )
            .collect();
        changed_paths.sort();
        changed_paths.dedup();

        let observed = now_ms() as u64;
        let mut edits: Vec<EditObservation> = status
            .success
            .iter()
            .filter(|(peer, _)| **peer != self.replica.as_u64())
            .map(|(peer, _)| EditObservation {
                peer: ReplicaId::from(*peer),
                timestamp: observed,
            })
            .collect();
        edits.sort_by_key(|e| e.peer);

        debug!(
            origin = ?origin,
            bytes_len = bytes.len(),
            changed = changed_paths.len(),
            "applied update"
        );
        let peer = match origin {
            ImportOrigin::Remote(p) => Some(p),
            ImportOrigin::Local => None,
        };
        self.bus.emit(&DocEvent::RemoteChange {
            peer,
            paths: changed_paths.clone(),
        });

        Ok(ImportOutcome {
            changed_paths,
            edits,
        })
    }

    pub fn current_version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    pub fn current_frontiers(&self) -> Frontiers {
        self.doc.state_frontiers()
    }

    /// Read-only view of the document at historical frontiers. Forks the
    /// document; the live document is never mutated.
    pub fn checkout_to_frontiers(&self, frontiers: &Frontiers) -> Result<VaultView> {
        Ok(VaultView {
            doc: self.doc.fork_at(frontiers).map_err(engine_err)?,
        })
    }

    /// Per-peer newest operation ids, used as history traversal heads.
    fn oplog_head_ids(&self) -> Vec<ID> {
        self.doc
            .oplog_vv()
            .iter()
            .filter(|(_, counter)| **counter > 0)
            .map(|(peer, counter)| ID::new(*peer, *counter - 1))
            .collect()
    }

    /// Newest-first history walk, at most `limit` entries.
    pub fn version_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let head_ids = self.oplog_head_ids();
        if head_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        self.doc
            .travel_change_ancestors(&head_ids, &mut |change| {
                entries.push(HistoryEntry {
                    frontiers: Frontiers::from(vec![change.id]),
                    peer: ReplicaId::from(change.id.peer),
                    lamport: change.lamport,
                    timestamp: change.timestamp,
                });
                if entries.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .map_err(engine_err)?;
        Ok(entries)
    }

    /// Persist the current state under the snapshot key.
    pub async fn save(&self) -> Result<()> {
        let bytes = self.export_full()?;
        self.storage.write(KEY_SNAPSHOT, &bytes).await?;
        debug!(bytes_len = bytes.len(), "saved document snapshot");
        Ok(())
    }

    /// Serialized size of the document, history included.
    pub fn document_size(&self) -> Result<usize> {
        Ok(self.export_full()?.len())
    }

    pub fn len_ops(&self) -> usize {
        self.doc.len_ops()
    }

    pub fn len_changes(&self) -> usize {
        self.doc.len_changes()
    }

    /// Discard operations with change timestamps at or before `cutoff_ms`
    /// that are also causally below `below`, preserving current state.
    ///
    /// The document is rebuilt from a shallow snapshot; if the rebuilt
    /// state does not project identically, the live document is kept.
    pub fn compact(&mut self, below: &VersionVector, cutoff_ms: i64) -> Result<CompactOutcome> {
        let before_size = self.document_size()?;
        let cutoff_secs = cutoff_ms / 1000;

        let head_ids = self.oplog_head_ids();
        if head_ids.is_empty() {
            return Ok(CompactOutcome {
                before_size,
                after_size: before_size,
                compacted: false,
            });
        }

        // Per-peer highest counter end whose change is old enough.
        let mut aged: HashMap<u64, i32> = HashMap::new();
        self.doc
            .travel_change_ancestors(&head_ids, &mut |change| {
                if change.timestamp <= cutoff_secs {
                    let end = change.id.counter + change.len as i32;
                    let slot = aged.entry(change.id.peer).or_insert(0);
                    *slot = (*slot).max(end);
                }
                ControlFlow::Continue(())
            })
            .map_err(engine_err)?;

        // Meet with the consensus bound.
        let mut capped = VersionVector::default();
        let mut any = false;
        for (peer, end) in &aged {
            if let Some(limit) = below.get(peer) {
                let end = (*end).min(*limit);
                if end > 0 {
                    capped.set_end(ID::new(*peer, end));
                    any = true;
                }
            }
        }
        if !any {
            return Ok(CompactOutcome {
                before_size,
                after_size: before_size,
                compacted: false,
            });
        }

        let frontiers = self.doc.vv_to_frontiers(&capped);
        let bytes = self
            .doc
            .export(ExportMode::ShallowSnapshot(Cow::Borrowed(&frontiers)))
            .map_err(engine_err)?;

        let rebuilt = LoroDoc::new();
        configure_doc(&rebuilt, self.replica)?;
        rebuilt
            .import(&bytes)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;

        if project(&rebuilt) != project(&self.doc) {
            warn!("compaction would alter observable state; keeping full history");
            return Ok(CompactOutcome {
                before_size,
                after_size: before_size,
                compacted: false,
            });
        }

        self.doc = rebuilt;
        let after_size = self.document_size()?;
        info!(before = before_size, after = after_size, "compacted document history");
        Ok(CompactOutcome {
            before_size,
            after_size,
            compacted: true,
        })
    }
}

/// Read-only historical view produced by
/// [`DocumentManager::checkout_to_frontiers`].
pub struct VaultView {
    doc: LoroDoc,
}

impl VaultView {
    pub fn list_all_paths(&self) -> Vec<String> {
        let tree = self.doc.get_tree(TREE);
        let mut out = Vec::new();
        collect_paths(&tree, None, "", &mut out);
        out.sort();
        out
    }

    pub fn get_file_meta(&self, path: &str) -> Result<FileMeta> {
        let tree = self.doc.get_tree(TREE);
        let id = resolve(&tree, path)?;
        read_meta_of(&tree, id)
    }

    pub fn get_text_content(&self, path: &str) -> Result<String> {
        let tree = self.doc.get_tree(TREE);
        let id = resolve(&tree, path)?;
        read_text_of(&tree, id, path)
    }
}
