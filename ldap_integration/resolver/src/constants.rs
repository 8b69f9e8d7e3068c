use crate::ldap_config::MemberAttr;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ldap-resolver/resolver.toml";
pub const DEFAULT_DB_PATH: &str = "/var/lib/ldap-resolver/mapping.db";
pub const DEFAULT_CONN_TIMEOUT: u64 = 2;
// Seconds a whole paged enumeration may take, each page is held to the
// connection timeout.
pub const DEFAULT_ENUMERATION_TIMEOUT: u64 = 120;
// Seconds a failed server is left alone before we attempt to reconnect.
pub const DEFAULT_OFFLINE_CHECK: u64 = 15;
pub const DEFAULT_CACHE_TIMEOUT: u64 = 600;
pub const DEFAULT_CACHE_SIZE: usize = 4096;
pub const DEFAULT_PAGING_SIZE: usize = 500;
pub const DEFAULT_MEMBER_ATTR: MemberAttr = MemberAttr::UniqueMember;
pub const DEFAULT_USER_DISPLAY_NAME: &str = "displayname";
pub const DEFAULT_GROUP_DISPLAY_NAME: &str = "cn";
pub const DEFAULT_LOGIN_FILTER: &str = "uid=%uid";
pub const DEFAULT_NESTED_GROUPS: bool = false;
pub const DEFAULT_PRIMARY_GROUPS: bool = true;
pub const DEFAULT_GID_NUMBER_ATTR: &str = "gidnumber";

/// Placeholder substituted in the login filter with the (escaped) login name.
pub const LOGIN_FILTER_PLACEHOLDER: &str = "%uid";

/// Upper bound of groups enumerated by a paged group listing.
pub const MAX_GROUP_ENUMERATION: usize = 100_000;

// Active Directory has a 10MB default input buffer, stay well below it when
// building OR filters out of raw member identifiers.
pub const MEMBER_FILTER_BYTE_LIMIT: usize = 9_000_000;
