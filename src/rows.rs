//! Entity rows and the text each kind contributes to its embedding.
//!
//! The synthesis rule is part of the stored data contract: vectors are only
//! comparable when they were produced from the same rule, so changing
//! [`EntityKind::embedding_text`] invalidates every stored vector.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::eid::Eid;

/// Maximum embedding input length (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Separator placed between synthesized fields
const FIELD_SEPARATOR: &str = " ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Products, collections and options.
    Node,
    /// People and organisations the workspace deals with.
    Actor,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Node, EntityKind::Actor];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Actor => "actor",
        }
    }

    /// Builds the embedding input for a row of this kind.
    ///
    /// Node: `type_tag title description`. Actor: `title description`.
    /// Fields are trimmed and empty ones skipped. Returns `None` when
    /// nothing is left to embed.
    pub fn embedding_text(&self, row: &Row) -> Option<String> {
        let fields: Vec<&str> = match self {
            EntityKind::Node => vec![
                row.type_tag.as_str(),
                row.title.as_str(),
                row.description.as_str(),
            ],
            EntityKind::Actor => vec![row.title.as_str(), row.description.as_str()],
        };

        let content = fields
            .into_iter()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect::<Vec<_>>()
            .join(FIELD_SEPARATOR);

        if content.is_empty() {
            return None;
        }

        Some(truncate_content(&content))
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "node" => Ok(EntityKind::Node),
            "actor" => Ok(EntityKind::Actor),
            other => anyhow::bail!("unknown entity kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: Eid,
    pub kind: EntityKind,
    /// Finer-grained label within the kind, e.g. `product` or `collection`.
    pub type_tag: String,
    pub title: String,
    pub description: String,
}

impl Row {
    pub fn embedding_text(&self) -> Option<String> {
        self.kind.embedding_text(self)
    }

    /// Hash of the synthesized embedding input, used to detect rows whose
    /// stored vector no longer matches their text.
    pub fn content_hash(&self) -> u64 {
        let text = self.embedding_text().unwrap_or_default();
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RowCreate {
    pub kind: EntityKind,
    #[serde(default)]
    pub type_tag: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RowUpdate {
    pub fn is_empty(&self) -> bool {
        self.type_tag.is_none() && self.title.is_none() && self.description.is_none()
    }
}

/// Truncate content to MAX_CONTENT_LENGTH, adding ellipsis if truncated.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: EntityKind, type_tag: &str, title: &str, description: &str) -> Row {
        Row {
            id: Eid::new(),
            kind,
            type_tag: type_tag.to_string(),
            title: title.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_node_text_includes_type_tag() {
        let node = row(EntityKind::Node, "product", "Trail Shoes", "Waterproof runners");
        assert_eq!(
            node.embedding_text(),
            Some("product Trail Shoes Waterproof runners".to_string())
        );
    }

    #[test]
    fn test_actor_text_ignores_type_tag() {
        let actor = row(EntityKind::Actor, "customer", "Ada", "Buys shoes in bulk");
        assert_eq!(actor.embedding_text(), Some("Ada Buys shoes in bulk".to_string()));
    }

    #[test]
    fn test_empty_fields_are_skipped() {
        let node = row(EntityKind::Node, "  ", " Hat ", "");
        assert_eq!(node.embedding_text(), Some("Hat".to_string()));

        let empty = row(EntityKind::Actor, "customer", "  ", "\n\t");
        assert!(empty.embedding_text().is_none());
    }

    #[test]
    fn test_truncation() {
        let long = "x".repeat(600);
        let node = row(EntityKind::Actor, "", &long, "");

        let text = node.embedding_text().unwrap();
        assert_eq!(text.chars().count(), MAX_CONTENT_LENGTH);
        assert!(text.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_content_hash_tracks_text() {
        let a = row(EntityKind::Node, "product", "Hat", "Wool");
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        // whitespace-only edits leave the embedding input unchanged
        b.title = "  Hat  ".to_string();
        assert_eq!(a.content_hash(), b.content_hash());

        b.description = "Cotton".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Node".parse::<EntityKind>().unwrap(), EntityKind::Node);
        assert_eq!(" actor ".parse::<EntityKind>().unwrap(), EntityKind::Actor);
        assert!("task".parse::<EntityKind>().is_err());
    }
}
