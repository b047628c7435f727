//! SMB protocol definitions

pub mod header;
pub mod message;
pub mod smb2_constants;

pub use header::*;
pub use message::{Smb2Request, Smb2Response};
pub use smb2_constants::{Smb2Command, Smb2HeaderFlags};
