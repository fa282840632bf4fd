//! Overlay-provided identity of a remote caller.

use serde::{Deserialize, Serialize};

/// Headers set on upstream requests when the caller's identity is known.
/// They are stripped from every inbound request first so clients cannot
/// spoof them.
pub const HEADER_USERNAME: &str = "X-Tsdproxy-Username";
pub const HEADER_DISPLAY_NAME: &str = "X-Tsdproxy-DisplayName";
pub const HEADER_PROFILE_PIC_URL: &str = "X-Tsdproxy-ProfilePicUrl";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whois {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub profile_pic_url: String,
}
