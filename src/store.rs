//! # Hierarchical Resource Tree
//!
//! The resource engine: a two-tier tree where the root holds named
//! databases, a database holds documents keyed by name, and each document
//! may hold named sub-collections of further documents, recursively. Every
//! tier is a [`SkipList`], so sibling order is key order and concurrent
//! writers coordinate through the map's upsert checks.
//!
//! ```text
//! Root ── databases ──► Collection ── documents ──► Document
//!                            ▲                          │
//!                            └────────── children ──────┘
//! ```
//!
//! Path depth classifies the resource kind: depth 1 is a database, even
//! depth a document, odd depth > 1 a collection. Resolution walks from the
//! root consuming all but the last segment; the final segment names the
//! target inside the resolved owner container.
//!
//! ## Write semantics
//!
//! All writes go through the owner map's `upsert` with a check function, so
//! each contract is atomic with respect to the named entry:
//!
//! - PUT document: create, or overwrite unless `nooverwrite` was requested
//!   (then the existing document wins and the caller sees a conflict).
//! - PUT collection/database: create only; a collision is a bad request.
//! - POST: create a document under a fresh generated name, retrying until
//!   the no-overwrite insert succeeds.
//! - PATCH: apply the operation sequence to a copy of the content, validate
//!   the result, and commit by replacing the document.
//!
//! Document updates always produce a replacement value for the skip list to
//! swap in: the new document carries the previous `created*` metadata and
//! shares the previous child-collection map, so sub-collections survive
//! content overwrites. Deletion removes the owner's map entry; the whole
//! subtree becomes unreachable with it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::json::JsonValue;
use crate::patch::{self, PatchOp};
use crate::schema::SchemaValidator;
use crate::skiplist::{SkipList, MAX_STRING_KEY};

// =============================================================================
// Requests & Responses
// =============================================================================

/// The verbs the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Put,
    Post,
    Delete,
    Patch,
}

/// One resolved engine operation, assembled by the dispatch layer.
pub struct Request<'a> {
    /// The verb to execute.
    pub verb: Verb,
    /// Path segments after `/v1/`, trailing slash already stripped.
    pub path: &'a [String],
    /// Raw request body.
    pub body: &'a [u8],
    /// Authenticated requester, recorded in metadata.
    pub username: &'a str,
    /// Key range for listings: `[lo, hi)`. `None` scans the whole map.
    pub interval: Option<(String, String)>,
    /// PUT creates only; an existing document is a conflict.
    pub no_overwrite: bool,
}

/// Document metadata, set at creation and advanced on every overwrite or
/// patch. `createdBy`/`createdAt` never change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    created_by: String,
    created_at: i64,
    last_modified_by: String,
    last_modified_at: i64,
}

impl Metadata {
    fn new(created_by: &str, now: i64) -> Self {
        Metadata {
            created_by: created_by.to_string(),
            created_at: now,
            last_modified_by: created_by.to_string(),
            last_modified_at: now,
        }
    }

    fn modified(&self, modified_by: &str, now: i64) -> Self {
        Metadata {
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            last_modified_by: modified_by.to_string(),
            last_modified_at: now,
        }
    }

    /// Milliseconds since epoch at which the document was created.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Milliseconds since epoch of the last overwrite or patch.
    pub fn last_modified_at(&self) -> i64 {
        self.last_modified_at
    }
}

/// Response body for PUT and POST: the path of the written resource.
#[derive(Debug, Clone, Serialize)]
pub struct PutResponse {
    /// Full external path, `/v1/...`.
    pub uri: String,
}

/// Response body for a successful PATCH.
#[derive(Debug, Clone, Serialize)]
pub struct PatchResponse {
    /// Full external path of the patched document.
    pub uri: String,
    /// Always `false` on the success path; failures abort with an error.
    pub patch_failed: bool,
    /// Human-readable outcome.
    pub message: String,
}

/// A document as returned by GET: path, content, and metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentContent {
    /// Full external path.
    pub path: String,
    /// The stored content.
    pub doc: JsonValue,
    /// Creation/modification metadata.
    pub meta: Metadata,
}

/// What a successful operation returns to the dispatch layer.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Body {
    /// PUT/POST result.
    Uri(PutResponse),
    /// Point GET result.
    Document(DocumentContent),
    /// Listing GET result, in key order.
    Listing(Vec<DocumentContent>),
    /// PATCH result.
    Patch(PatchResponse),
    /// No body (DELETE).
    None,
}

/// How the operation concluded; the dispatch layer maps this to an HTTP
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A resource was created (201).
    Created,
    /// A read succeeded (200).
    Fetched,
    /// An existing document was overwritten (200).
    Overwritten,
    /// A patch was applied (200).
    Patched,
    /// A resource was deleted (204).
    Deleted,
}

/// Content and conclusion of a successful operation.
#[derive(Debug)]
pub struct Response {
    /// Serializable response body.
    pub body: Body,
    /// Status classification.
    pub outcome: Outcome,
}

impl Response {
    fn new(body: Body, outcome: Outcome) -> Self {
        Response { body, outcome }
    }
}

// =============================================================================
// Tree Nodes
// =============================================================================

/// A named group of documents: a database when its parent is the root, a
/// sub-collection when its parent is a document.
pub struct Collection {
    path: String,
    name: String,
    documents: SkipList<String, Document>,
}

impl Collection {
    fn new(path: String, name: String) -> Self {
        Collection {
            path,
            name,
            documents: SkipList::with_string_keys(),
        }
    }

    /// Documents in `[lo, hi)` (or all of them), as deep copies in key
    /// order.
    fn listing(&self, interval: &Option<(String, String)>) -> Result<Vec<DocumentContent>> {
        let (lo, hi) = match interval {
            // An interval with an empty upper bound means the whole map.
            Some((lo, hi)) if !hi.is_empty() => (lo.clone(), hi.clone()),
            _ => (String::new(), MAX_STRING_KEY.to_string()),
        };
        let copies = self
            .documents
            .range_copies(&lo, &hi, |doc| Ok(doc.snapshot()))?;
        debug!(collection = %self.name, count = copies.len(), "listed documents");
        Ok(copies.iter().map(Document::to_content).collect())
    }
}

/// A JSON document with metadata and child collections.
///
/// Documents are immutable values: every overwrite or patch builds a
/// replacement that the owner map swaps in atomically. The replacement
/// shares the child-collection map of its predecessor.
pub struct Document {
    path: String,
    content: JsonValue,
    metadata: Metadata,
    children: Arc<SkipList<String, Collection>>,
}

impl Document {
    fn new(path: String, content: JsonValue, created_by: &str) -> Self {
        Document {
            path,
            content,
            metadata: Metadata::new(created_by, now_millis()),
            children: Arc::new(SkipList::with_string_keys()),
        }
    }

    /// The replacement for an overwrite or patch commit: new content, the
    /// old `created*` metadata, the shared child map.
    fn replaced(&self, content: JsonValue, modified_by: &str) -> Self {
        Document {
            path: self.path.clone(),
            content,
            metadata: self.metadata.modified(modified_by, now_millis()),
            children: Arc::clone(&self.children),
        }
    }

    /// Deep copy for read responses: content and metadata are cloned, the
    /// child map is not carried along.
    fn snapshot(&self) -> Document {
        Document {
            path: self.path.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            children: Arc::new(SkipList::with_string_keys()),
        }
    }

    fn to_content(&self) -> DocumentContent {
        DocumentContent {
            path: self.path.clone(),
            doc: self.content.clone(),
            meta: self.metadata.clone(),
        }
    }
}

/// A resolved position in the tree. Databases and sub-collections share the
/// [`Collection`] shape; the root is its own case because its children live
/// directly in the store.
enum TreeNode {
    Root,
    Collection(Arc<Collection>),
    Document(Arc<Document>),
}

// =============================================================================
// Store
// =============================================================================

/// The resource engine: the root map of databases plus the process-wide
/// schema validator applied to every document write.
pub struct Store {
    databases: SkipList<String, Collection>,
    validator: Arc<SchemaValidator>,
}

impl Store {
    /// An empty tree validating writes with `validator`.
    pub fn new(validator: Arc<SchemaValidator>) -> Self {
        Store {
            databases: SkipList::with_string_keys(),
            validator,
        }
    }

    /// Executes one operation: resolve the owner, dispatch the verb.
    pub fn handle(&self, req: &Request<'_>) -> Result<Response> {
        if req.path.is_empty() {
            return Err(Error::BadRequest("invalid request path".to_string()));
        }

        let parent = self.resolve_parent(req.path)?;

        // POST operates on the named container itself, not on its owner.
        if req.verb == Verb::Post {
            let target = req.path.last().expect("path checked non-empty");
            let child = self.child_of(&parent, target).ok_or_else(|| {
                Error::NotFound("containing collection/document does not exist".to_string())
            })?;
            return self.dispatch(&child, req);
        }

        self.dispatch(&parent, req)
    }

    /// Walks from the root through all but the last segment. A missing
    /// intermediate segment fails resolution.
    fn resolve_parent(&self, path: &[String]) -> Result<TreeNode> {
        let mut current = TreeNode::Root;
        for segment in &path[..path.len() - 1] {
            current = self.child_of(&current, segment).ok_or_else(|| {
                warn!(segment = %segment, "missing intermediate path segment");
                Error::NotFound("containing collection/document does not exist".to_string())
            })?;
        }
        Ok(current)
    }

    /// One resolution step. Tiers alternate: root to database, collection to
    /// document, document to sub-collection.
    fn child_of(&self, node: &TreeNode, name: &String) -> Option<TreeNode> {
        match node {
            TreeNode::Root => self.databases.get(name).map(TreeNode::Collection),
            TreeNode::Collection(collection) => {
                collection.documents.get(name).map(TreeNode::Document)
            }
            TreeNode::Document(document) => {
                document.children.get(name).map(TreeNode::Collection)
            }
        }
    }

    fn dispatch(&self, node: &TreeNode, req: &Request<'_>) -> Result<Response> {
        match node {
            TreeNode::Root => self.handle_root(req),
            TreeNode::Collection(collection) => self.handle_collection(collection, req),
            TreeNode::Document(document) => self.handle_document(document, req),
        }
    }

    // =========================================================================
    // Root: databases
    // =========================================================================

    fn handle_root(&self, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        match req.verb {
            Verb::Get => {
                let database = self.databases.get(name).ok_or_else(|| {
                    Error::NotFound(format!("Database does not exist {name}: not found"))
                })?;
                let listing = database.listing(&req.interval)?;
                Ok(Response::new(Body::Listing(listing), Outcome::Fetched))
            }
            Verb::Put => {
                let path = external_path(req.path);
                self.databases.upsert(name.clone(), |_, current, _| {
                    if current.is_some() {
                        return Err(Error::BadRequest(format!(
                            "Database already exists {name}: already exists"
                        )));
                    }
                    Ok(Some(Arc::new(Collection::new(path.clone(), name.clone()))))
                })?;
                info!(database = %name, "database created");
                Ok(Response::new(
                    Body::Uri(PutResponse { uri: path }),
                    Outcome::Created,
                ))
            }
            Verb::Delete => {
                let removed = self.databases.remove(name)?;
                if !removed {
                    return Err(Error::NotFound(format!(
                        "Database does not exist {name}: not found"
                    )));
                }
                info!(database = %name, "database deleted");
                Ok(Response::new(Body::None, Outcome::Deleted))
            }
            _ => Err(Error::BadRequest("invalid HTTP request".to_string())),
        }
    }

    // =========================================================================
    // Collection: documents
    // =========================================================================

    fn handle_collection(&self, collection: &Arc<Collection>, req: &Request<'_>) -> Result<Response> {
        match req.verb {
            Verb::Get => self.collection_get(collection, req),
            Verb::Put => self.collection_put(collection, req),
            Verb::Post => self.collection_post(collection, req),
            Verb::Delete => self.collection_delete(collection, req),
            Verb::Patch => self.collection_patch(collection, req),
        }
    }

    fn collection_get(&self, collection: &Collection, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        let copy = collection
            .documents
            .get_copy(name, |doc| Ok(doc.snapshot()))
            .map_err(|_| Error::NotFound(format!("Document does not exist {name}: not found")))?;
        Ok(Response::new(
            Body::Document(copy.to_content()),
            Outcome::Fetched,
        ))
    }

    fn collection_put(&self, collection: &Collection, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        let path = external_path(req.path);
        let content = self.validated_content(req.body)?;

        let updated = collection
            .documents
            .upsert(name.clone(), |_, current, _| match current {
                Some(existing) => {
                    if req.no_overwrite {
                        return Err(Error::Conflict("document already exists".to_string()));
                    }
                    Ok(Some(Arc::new(
                        existing.replaced(content.clone(), req.username),
                    )))
                }
                None => Ok(Some(Arc::new(Document::new(
                    path.clone(),
                    content.clone(),
                    req.username,
                )))),
            })?;

        let outcome = if updated {
            info!(document = %path, "document overwritten");
            Outcome::Overwritten
        } else {
            info!(document = %path, "document created");
            Outcome::Created
        };
        Ok(Response::new(Body::Uri(PutResponse { uri: path }), outcome))
    }

    fn collection_post(&self, collection: &Collection, req: &Request<'_>) -> Result<Response> {
        let content = self.validated_content(req.body)?;

        // Generated names collide only when two documents are created in the
        // same nanosecond; the no-overwrite insert detects that and we draw
        // a fresh name.
        loop {
            let name = generate_doc_name();
            let path = format!("{}/{}", external_path(req.path), name);

            let result = collection.documents.upsert(name.clone(), |_, current, _| {
                if current.is_some() {
                    return Err(Error::Conflict("document already exists".to_string()));
                }
                Ok(Some(Arc::new(Document::new(
                    path.clone(),
                    content.clone(),
                    req.username,
                ))))
            });

            match result {
                Ok(_) => {
                    info!(document = %path, "document created");
                    return Ok(Response::new(
                        Body::Uri(PutResponse { uri: path }),
                        Outcome::Created,
                    ));
                }
                Err(Error::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn collection_delete(&self, collection: &Collection, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        let removed = collection.documents.remove(name)?;
        if !removed {
            return Err(Error::NotFound(format!(
                "Document does not exist {name}: not found"
            )));
        }
        info!(collection = %collection.name, document = %name, "document deleted");
        Ok(Response::new(Body::None, Outcome::Deleted))
    }

    fn collection_patch(&self, collection: &Collection, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        let path = external_path(req.path);
        let ops: Vec<PatchOp> = serde_json::from_slice(req.body)
            .map_err(|_| Error::BadRequest("failed to parse patch operations".to_string()))?;

        // The whole sequence applies to a copy inside the upsert check, so a
        // failure at any step leaves the stored document untouched.
        collection.documents.upsert(name.clone(), |_, current, _| {
            let Some(existing) = current else {
                return Err(Error::NotFound(
                    "object does not exist at this path".to_string(),
                ));
            };
            let patched = patch::apply_all(&existing.content, &ops)?;
            self.validator.validate(&patched)?;
            Ok(Some(Arc::new(existing.replaced(patched, req.username))))
        })?;

        info!(document = %path, ops = ops.len(), "document patched");
        Ok(Response::new(
            Body::Patch(PatchResponse {
                uri: path,
                patch_failed: false,
                message: "patches applied".to_string(),
            }),
            Outcome::Patched,
        ))
    }

    // =========================================================================
    // Document: sub-collections
    // =========================================================================

    fn handle_document(&self, document: &Arc<Document>, req: &Request<'_>) -> Result<Response> {
        let name = req.path.last().expect("path checked non-empty");
        match req.verb {
            Verb::Get => {
                let collection = document.children.get(name).ok_or_else(|| {
                    Error::NotFound(format!("Collection does not exist {name}: not found"))
                })?;
                let listing = collection.listing(&req.interval)?;
                Ok(Response::new(Body::Listing(listing), Outcome::Fetched))
            }
            Verb::Put => {
                let path = external_path(req.path);
                document.children.upsert(name.clone(), |_, current, _| {
                    if current.is_some() {
                        return Err(Error::BadRequest(format!(
                            "Collection already exists {name}: already exists"
                        )));
                    }
                    Ok(Some(Arc::new(Collection::new(path.clone(), name.clone()))))
                })?;
                info!(collection = %path, "collection created");
                Ok(Response::new(
                    Body::Uri(PutResponse { uri: path }),
                    Outcome::Created,
                ))
            }
            Verb::Delete => {
                let removed = document.children.remove(name)?;
                if !removed {
                    return Err(Error::NotFound(format!(
                        "Collection does not exist {name}: not found"
                    )));
                }
                info!(collection = %name, "collection deleted");
                Ok(Response::new(Body::None, Outcome::Deleted))
            }
            _ => Err(Error::BadRequest("invalid HTTP request".to_string())),
        }
    }

    /// Parses and validates a document body. Parse failures and schema
    /// rejections both abort before anything is stored.
    fn validated_content(&self, body: &[u8]) -> Result<JsonValue> {
        let content = JsonValue::from_slice(body)
            .map_err(|_| Error::BadRequest("request body is not valid JSON".to_string()))?;
        self.validator.validate(&content)?;
        Ok(content)
    }
}

/// Renders path segments as the external `/v1/...` form.
fn external_path(segments: &[String]) -> String {
    format!("/v1/{}", segments.join("/"))
}

/// Fresh document name for POST, from the wall clock.
fn generate_doc_name() -> String {
    format!("doc_{}", now_nanos())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

// =============================================================================
// Tests
// =============================================================================
