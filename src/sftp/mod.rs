//! SFTP file management module
//!
//! Provides remote file browsing, upload, download, mkdir and delete over
//! file-transfer sub-channels of a connected session.

mod channel;
pub mod error;
pub mod session;
pub mod types;

pub use channel::{FileChannel, RusshFileChannel};
pub use error::SftpError;
pub use session::{FileSession, FileSessionManager};
pub use types::{FileEntry, RemoteEntry};
