//! Rust client for the WebHDFS REST API.
//!
//! Covers the slice of the protocol a filesystem mount needs: namespace
//! metadata, streaming reads with an explicit offset, and whole-file
//! creation. Kerberos and delegation tokens are out of scope; simple auth
//! (`user.name`) only.

mod client;
mod error;
mod models;

pub use client::{Client, FileReader, FileWriter};
pub use error::WebHdfsError;
pub use models::{ContentSummary, FileStatus, FileType, RemoteException};
