/// Application name
pub const APP_NAME: &str = "Courier";

/// Number of feed entries returned per page
pub const FEED_PAGE_SIZE: usize = 10;

/// Maximum message length in characters, after trimming
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Maximum group name length in characters
pub const MAX_GROUP_NAME_LENGTH: usize = 32;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default header carrying the user id resolved by the auth proxy
pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

/// Header naming the live connection a write came from. That connection
/// already applied the write locally and is left out of room broadcasts.
pub const SESSION_HEADER: &str = "x-session-id";

/// Search results returned per page
pub const SEARCH_PAGE_SIZE: usize = 20;

/// Group login length bounds, in characters
pub const MIN_GROUP_LOGIN_LENGTH: usize = 4;
pub const MAX_GROUP_LOGIN_LENGTH: usize = 32;
