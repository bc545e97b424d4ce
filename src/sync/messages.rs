//! Message payloads exchanged between clients and the server.
//!
//! Field names follow the JSON contract (camelCase). Tree versions and root
//! ids travel as strings and are parsed to `u64` where they are compared.

use serde::{Deserialize, Serialize};

use super::{ClientId, FileEditSessionKey};
use crate::ot::{DocOp, DocumentSelection};

/// A batch of local edits a client made against `cc_revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientToServerDocOp {
    pub file_edit_session_key: FileEditSessionKey,
    pub client_id: ClientId,
    pub cc_revision: u64,
    pub selection: Option<DocumentSelection>,
    /// Serialized DocOps, all made against `cc_revision` one after another.
    pub doc_ops: Vec<String>,
}

/// One op as applied by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToClientDocOp {
    pub file_edit_session_key: FileEditSessionKey,
    /// Author of the op
    pub client_id: ClientId,
    pub applied_cc_revision: u64,
    pub doc_op: DocOp,
    pub selection: Option<DocumentSelection>,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToClientDocOps {
    pub doc_ops: Vec<ServerToClientDocOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverFromMissedDocOps {
    pub file_edit_session_key: FileEditSessionKey,
    pub client_id: ClientId,
    pub current_cc_revision: u64,
    /// Unacknowledged local ops, made against `current_cc_revision`.
    pub doc_ops: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverFromMissedDocOpsResponse {
    pub doc_ops: Vec<ServerToClientDocOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFileContents {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFileContentsResponse {
    pub path: String,
    pub file_edit_session_key: FileEditSessionKey,
    pub cc_revision: u64,
    pub contents: String,
}

/// Request for a directory listing. A negative depth means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDirectory {
    pub path: String,
    pub depth: i32,
    pub root_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDirectoryResponse {
    pub path: String,
    pub base_directory: Option<DirInfo>,
    /// Tree version the listing reflects
    pub root_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub file_edit_session_key: FileEditSessionKey,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirInfo {
    pub name: String,
    pub file_edit_session_key: FileEditSessionKey,
    /// False when children past the requested depth were left out
    pub is_complete: bool,
    pub files: Vec<FileInfo>,
    pub sub_directories: Vec<DirInfo>,
}

impl DirInfo {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_edit_session_key: key.into(),
            is_complete: true,
            files: Vec::new(),
            sub_directories: Vec::new(),
        }
    }
}

/// A single file or directory description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeNodeInfo {
    File(FileInfo),
    Directory(DirInfo),
}

impl TreeNodeInfo {
    pub fn name(&self) -> &str {
        match self {
            TreeNodeInfo::File(file) => &file.name,
            TreeNodeInfo::Directory(dir) => &dir.name,
        }
    }

    pub fn file_edit_session_key(&self) -> &str {
        match self {
            TreeNodeInfo::File(file) => &file.file_edit_session_key,
            TreeNodeInfo::Directory(dir) => &dir.file_edit_session_key,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, TreeNodeInfo::Directory(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    Add,
    Delete,
    Move,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub mutation_type: MutationType,
    pub old_path: String,
    pub new_path: String,
    /// Node being added or copied. Requests only need the node kind and
    /// name; broadcasts carry the server's full description.
    pub new_node_info: Option<TreeNodeInfo>,
}

impl Mutation {
    pub fn add(path: impl Into<String>, info: TreeNodeInfo) -> Self {
        Self {
            mutation_type: MutationType::Add,
            old_path: String::new(),
            new_path: path.into(),
            new_node_info: Some(info),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Delete,
            old_path: path.into(),
            new_path: String::new(),
            new_node_info: None,
        }
    }

    pub fn moved(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Move,
            old_path: old_path.into(),
            new_path: new_path.into(),
            new_node_info: None,
        }
    }

    pub fn copy(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Copy,
            old_path: old_path.into(),
            new_path: new_path.into(),
            new_node_info: None,
        }
    }
}

/// Client request to change the workspace tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTreeUpdate {
    pub author_client_id: ClientId,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTreeUpdateBroadcast {
    pub author_client_id: ClientId,
    pub mutations: Vec<Mutation>,
    pub new_tree_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::DocOpBuilder;

    #[test]
    fn test_doc_op_message_json_fields() {
        let msg = ServerToClientDocOp {
            file_edit_session_key: "7".to_string(),
            client_id: "c1".to_string(),
            applied_cc_revision: 3,
            doc_op: DocOpBuilder::new().insert("a").build(),
            selection: None,
            file_path: "/a.txt".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["fileEditSessionKey"], "7");
        assert_eq!(json["appliedCcRevision"], 3);
        assert_eq!(json["docOp"][0]["insert"], "a");
        assert_eq!(json["filePath"], "/a.txt");
    }

    #[test]
    fn test_mutation_json_shape() {
        let mutation = Mutation::moved("/a", "/b");
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["mutationType"], "MOVE");
        assert_eq!(json["oldPath"], "/a");
        assert_eq!(json["newPath"], "/b");
        assert!(json["newNodeInfo"].is_null());
    }

    #[test]
    fn test_tree_node_info_accessors() {
        let info = TreeNodeInfo::Directory(DirInfo::new("src", "4"));
        assert!(info.is_directory());
        assert_eq!(info.name(), "src");
        assert_eq!(info.file_edit_session_key(), "4");
    }
}
