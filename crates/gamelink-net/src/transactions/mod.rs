//! Ready-made transactions.

pub mod download;
pub mod ping;
pub mod request;
pub(crate) mod wait;

pub use download::{DOWNLOAD_REQUEST_MSG_ID, DownloadTrans};
pub use ping::{PingReply, PingRequestTrans};
pub use request::RequestTrans;
