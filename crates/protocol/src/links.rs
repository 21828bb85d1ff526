use serde::{Deserialize, Serialize};

/// Fully-qualified reference to a node in the remote storage tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRef {
    pub share_id: String,
    pub link_id: String,
}

impl LinkRef {
    pub fn new(share_id: impl Into<String>, link_id: impl Into<String>) -> Self {
        Self {
            share_id: share_id.into(),
            link_id: link_id.into(),
        }
    }
}

/// Kind of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkKind {
    File,
    Folder,
    /// A live collaborative document. Has no downloadable content blocks and
    /// is excluded from transfers rather than failing them.
    Document,
}

/// One remote child as listed by the children API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildLink {
    pub link: LinkRef,
    pub name: String,
    pub kind: LinkKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    /// Active revision of a file node; empty for folders and documents.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision_id: String,
    /// Set when the name or content signature failed verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_issue: Option<String>,
}

/// A descendant discovered by the folder tree loader.
///
/// `parent_link_ids` and `parent_path` run from the traversal root (the root
/// folder itself included) down to the immediate parent, so a node is only
/// ever produced after all of its ancestors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedChild {
    pub link: LinkRef,
    pub name: String,
    pub is_file: bool,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision_id: String,
    pub parent_link_ids: Vec<String>,
    pub parent_path: Vec<String>,
}

impl NestedChild {
    /// Path of this node inside a generated archive, `/`-separated.
    pub fn archive_path(&self) -> String {
        let mut parts: Vec<&str> = self.parent_path.iter().map(String::as_str).collect();
        parts.push(&self.name);
        parts.join("/")
    }

    /// Link ids progress increments for this node are attributed to:
    /// every ancestor plus the node itself.
    pub fn owning_link_ids(&self) -> Vec<String> {
        let mut ids = self.parent_link_ids.clone();
        ids.push(self.link.link_id.clone());
        ids
    }
}
