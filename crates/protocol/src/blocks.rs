use serde::{Deserialize, Serialize};

/// Descriptor of one content block of a file revision.
///
/// The URL/token pair is time-limited; an expired pair is replaced by
/// re-requesting block metadata, never by partial resume — retried blocks
/// are always re-fetched in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub index: u32,
    pub url: String,
    pub token: String,
    /// SHA-256 of the block ciphertext. Base64 on the wire to match the
    /// server's `[]byte` serialization.
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
    pub size: u64,
}

/// One page of the block listing for a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockList {
    pub blocks: Vec<BlockRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnail_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manifest_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<serde_json::Value>,
    /// More pages follow; request again from the next index.
    #[serde(default)]
    pub has_more: bool,
}

/// Signed destination for uploading one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    pub index: u32,
    pub url: String,
    pub token: String,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
