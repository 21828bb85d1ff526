use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::links::LinkRef;
use crate::state::TransferState;

/// Display metadata of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    /// Unknown until folder/archive sizes resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Direction-specific payload of a transfer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "direction")]
pub enum TransferKind {
    #[serde(rename_all = "camelCase")]
    Download {
        /// Source nodes packed into this transfer.
        links: Vec<LinkRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scan_issue: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Upload {
        share_id: String,
        /// Absent until the destination folder exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        /// Content already fully buffered in memory; bypasses admission
        /// load accounting.
        #[serde(default)]
        buffered: bool,
        #[serde(default)]
        original_is_draft: bool,
        #[serde(default)]
        original_is_folder: bool,
    },
}

/// One user-initiated upload or download, possibly spanning many nodes.
///
/// Records are owned and mutated exclusively by the transfer queue; everything
/// else reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub state: TransferState,
    /// State to restore on un-pause. Set only while `state == Paused`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<TransferState>,
    pub meta: TransferMeta,
    /// Creation timestamp; newest-first display ordering.
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(flatten)]
    pub kind: TransferKind,
}

impl Transfer {
    /// Creates a download record. Single files start `Pending`; anything
    /// whose size is still resolving starts `Initializing`.
    pub fn new_download(meta: TransferMeta, links: Vec<LinkRef>) -> Self {
        let state = if meta.size.is_some() && links.len() == 1 {
            TransferState::Pending
        } else {
            TransferState::Initializing
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            resume_state: None,
            meta,
            start_date: Utc::now(),
            error: None,
            retries: 0,
            kind: TransferKind::Download {
                links,
                scan_issue: None,
            },
        }
    }

    /// Creates an upload record. Starts `Initializing` until the destination
    /// folder exists, `Pending` otherwise.
    pub fn new_upload(
        meta: TransferMeta,
        share_id: impl Into<String>,
        parent_id: Option<String>,
        buffered: bool,
    ) -> Self {
        let state = if parent_id.is_some() {
            TransferState::Pending
        } else {
            TransferState::Initializing
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            resume_state: None,
            meta,
            start_date: Utc::now(),
            error: None,
            retries: 0,
            kind: TransferKind::Upload {
                share_id: share_id.into(),
                parent_id,
                buffered,
                original_is_draft: false,
                original_is_folder: false,
            },
        }
    }

    pub fn is_download(&self) -> bool {
        matches!(self.kind, TransferKind::Download { .. })
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// True when this transfer skips admission load accounting: its content
    /// is already in memory and completes synchronously.
    pub fn bypasses_load(&self) -> bool {
        matches!(self.kind, TransferKind::Upload { buffered: true, .. })
    }

    /// Two transfers overlap when their underlying node identities intersect.
    ///
    /// Downloads overlap on shared link ids. Uploads overlap when they target
    /// the same name under the same parent folder of the same share.
    pub fn overlaps(&self, other: &Transfer) -> bool {
        match (&self.kind, &other.kind) {
            (TransferKind::Download { links: a, .. }, TransferKind::Download { links: b, .. }) => {
                a.iter().any(|la| b.iter().any(|lb| la.link_id == lb.link_id))
            }
            (
                TransferKind::Upload {
                    share_id: sa,
                    parent_id: pa,
                    ..
                },
                TransferKind::Upload {
                    share_id: sb,
                    parent_id: pb,
                    ..
                },
            ) => sa == sb && pa == pb && self.meta.filename == other.meta.filename,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: Option<u64>) -> TransferMeta {
        TransferMeta {
            filename: name.into(),
            mime_type: String::new(),
            size,
        }
    }

    #[test]
    fn single_file_download_starts_pending() {
        let t = Transfer::new_download(
            meta("report.pdf", Some(1024)),
            vec![LinkRef::new("s1", "l1")],
        );
        assert_eq!(t.state, TransferState::Pending);
        assert!(t.resume_state.is_none());
    }

    #[test]
    fn folder_download_starts_initializing() {
        let t = Transfer::new_download(meta("Holidays", None), vec![LinkRef::new("s1", "l1")]);
        assert_eq!(t.state, TransferState::Initializing);
    }

    #[test]
    fn multi_link_download_starts_initializing() {
        let t = Transfer::new_download(
            meta("selection.tar", Some(2048)),
            vec![LinkRef::new("s1", "l1"), LinkRef::new("s1", "l2")],
        );
        assert_eq!(t.state, TransferState::Initializing);
    }

    #[test]
    fn upload_without_parent_starts_initializing() {
        let t = Transfer::new_upload(meta("a.txt", Some(10)), "s1", None, false);
        assert_eq!(t.state, TransferState::Initializing);

        let t = Transfer::new_upload(meta("a.txt", Some(10)), "s1", Some("parent".into()), false);
        assert_eq!(t.state, TransferState::Pending);
    }

    #[test]
    fn downloads_overlap_on_shared_link() {
        let a = Transfer::new_download(
            meta("a", Some(1)),
            vec![LinkRef::new("s1", "l1"), LinkRef::new("s1", "l2")],
        );
        let b = Transfer::new_download(meta("b", Some(1)), vec![LinkRef::new("s1", "l2")]);
        let c = Transfer::new_download(meta("c", Some(1)), vec![LinkRef::new("s1", "l3")]);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn uploads_overlap_on_same_destination_name() {
        let a = Transfer::new_upload(meta("a.txt", Some(1)), "s1", Some("p1".into()), false);
        let b = Transfer::new_upload(meta("a.txt", Some(2)), "s1", Some("p1".into()), false);
        let c = Transfer::new_upload(meta("a.txt", Some(2)), "s1", Some("p2".into()), false);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn upload_and_download_never_overlap() {
        let d = Transfer::new_download(meta("a.txt", Some(1)), vec![LinkRef::new("s1", "l1")]);
        let u = Transfer::new_upload(meta("a.txt", Some(1)), "s1", Some("l1".into()), false);
        assert!(!d.overlaps(&u));
    }

    #[test]
    fn buffered_upload_bypasses_load() {
        let t = Transfer::new_upload(meta("small.txt", Some(64)), "s1", Some("p".into()), true);
        assert!(t.bypasses_load());
        let t = Transfer::new_upload(meta("big.bin", Some(64)), "s1", Some("p".into()), false);
        assert!(!t.bypasses_load());
    }

    #[test]
    fn transfer_json_roundtrip() {
        let t = Transfer::new_download(
            meta("report.pdf", Some(1024)),
            vec![LinkRef::new("s1", "l1")],
        );
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"direction\":\"download\""));
        let parsed: Transfer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, t);
    }
}
