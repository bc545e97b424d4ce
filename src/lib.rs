//! collab-sync: collaborative editing over operational transform.
//!
//! Clients edit shared text files by exchanging DocOps with a server that
//! keeps one authoritative revision counter per file, and mirror the
//! server's workspace directory tree in a lazily loaded model.
//!
//! - [`ot`]: the DocOp model, transform and application
//! - [`documents`]: versioned documents and file edit sessions (server)
//! - [`workspace`]: the authoritative workspace tree (server)
//! - [`storage`]: file contents on disk and the sled journal
//! - [`sync`]: message payloads, the wire protocol and the server context
//! - [`client`]: in-order op delivery, recovery, the local document and the
//!   file tree model

pub mod client;
pub mod documents;
pub mod ot;
pub mod storage;
pub mod sync;
pub mod workspace;
