use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::Duration;

use hashbrown::HashSet;
use serde::Deserialize;

use crate::constants::{
    DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TIMEOUT, DEFAULT_CONN_TIMEOUT, DEFAULT_DB_PATH,
    DEFAULT_ENUMERATION_TIMEOUT, DEFAULT_GID_NUMBER_ATTR, DEFAULT_GROUP_DISPLAY_NAME,
    DEFAULT_LOGIN_FILTER, DEFAULT_MEMBER_ATTR, DEFAULT_NESTED_GROUPS, DEFAULT_OFFLINE_CHECK,
    DEFAULT_PAGING_SIZE, DEFAULT_PRIMARY_GROUPS, DEFAULT_USER_DISPLAY_NAME,
};

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing(&'static str),
    Invalid(&'static str),
}

#[derive(Debug, Deserialize)]
struct ConfigInt {
    db_path: Option<String>,
    cache_timeout: Option<u64>,
    cache_size: Option<usize>,
    #[serde(default)]
    server: Vec<ServerConfigInt>,
}

#[derive(Debug, Deserialize)]
struct ServerConfigInt {
    prefix: Option<String>,
    uri: Option<String>,
    starttls: Option<bool>,
    conn_timeout: Option<u64>,
    enumeration_timeout: Option<u64>,
    offline_check: Option<u64>,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    #[serde(default)]
    base_users: Vec<String>,
    #[serde(default)]
    base_groups: Vec<String>,
    user_filter: Option<String>,
    group_filter: Option<String>,
    login_filter: Option<String>,
    group_member_attr: Option<String>,
    nested_groups: Option<bool>,
    paging_size: Option<usize>,
    user_display_name: Option<String>,
    group_display_name: Option<String>,
    #[serde(default)]
    user_search_attributes: Vec<String>,
    #[serde(default)]
    group_search_attributes: Vec<String>,
    ignore_naming_rules: Option<bool>,
    dynamic_group_member_url: Option<String>,
    use_member_of: Option<bool>,
    primary_groups: Option<bool>,
    gid_number_attr: Option<String>,
}

/// How the membership attribute of a group addresses its members.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemberAddressing {
    /// Members are stored as distinguished names.
    Dn,
    /// Members are stored as raw login identifiers (posix `memberUid`).
    Uid,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemberAttr {
    Member,
    UniqueMember,
    MemberUid,
}

impl MemberAttr {
    pub fn attr_name(self) -> &'static str {
        match self {
            MemberAttr::Member => "member",
            MemberAttr::UniqueMember => "uniquemember",
            MemberAttr::MemberUid => "memberuid",
        }
    }

    pub fn addressing(self) -> MemberAddressing {
        match self {
            MemberAttr::Member | MemberAttr::UniqueMember => MemberAddressing::Dn,
            MemberAttr::MemberUid => MemberAddressing::Uid,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "member" => Some(MemberAttr::Member),
            "uniquemember" => Some(MemberAttr::UniqueMember),
            "memberuid" => Some(MemberAttr::MemberUid),
            _ => None,
        }
    }
}

impl Display for MemberAttr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.attr_name())
    }
}

/// Settings of one directory server. Each server is addressed by its
/// configuration prefix, which also namespaces its cache entries.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub prefix: String,
    pub uri: String,
    pub starttls: bool,
    pub conn_timeout: u64,
    /// Seconds a whole paged enumeration may take.
    pub enumeration_timeout: u64,
    pub offline_check: u64,
    pub bind_dn: String,
    pub bind_password: String,
    pub base_users: Vec<String>,
    pub base_groups: Vec<String>,
    pub user_filter: String,
    pub group_filter: String,
    pub login_filter: String,
    pub group_member_attr: Option<MemberAttr>,
    pub nested_groups: bool,
    pub paging_size: usize,
    pub user_display_name: String,
    pub group_display_name: String,
    pub user_search_attributes: Vec<String>,
    pub group_search_attributes: Vec<String>,
    pub ignore_naming_rules: bool,
    pub dynamic_group_member_url: Option<String>,
    pub use_member_of: bool,
    /// Resolve Active Directory primary groups (`primaryGroupID`).
    pub primary_groups: bool,
    /// Lowercased attribute holding a posix gid number on users and groups.
    /// Empty disables gid number membership.
    pub gid_number_attr: String,
}

impl ServerConfig {
    pub fn new(prefix: &str, uri: &str) -> Self {
        ServerConfig {
            prefix: prefix.to_string(),
            uri: uri.to_string(),
            starttls: false,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            enumeration_timeout: DEFAULT_ENUMERATION_TIMEOUT,
            offline_check: DEFAULT_OFFLINE_CHECK,
            bind_dn: String::new(),
            bind_password: String::new(),
            base_users: Vec::new(),
            base_groups: Vec::new(),
            user_filter: "objectclass=*".to_string(),
            group_filter: String::new(),
            login_filter: DEFAULT_LOGIN_FILTER.to_string(),
            group_member_attr: Some(DEFAULT_MEMBER_ATTR),
            nested_groups: DEFAULT_NESTED_GROUPS,
            paging_size: DEFAULT_PAGING_SIZE,
            user_display_name: DEFAULT_USER_DISPLAY_NAME.to_string(),
            group_display_name: DEFAULT_GROUP_DISPLAY_NAME.to_string(),
            user_search_attributes: Vec::new(),
            group_search_attributes: Vec::new(),
            ignore_naming_rules: false,
            dynamic_group_member_url: None,
            use_member_of: false,
            primary_groups: DEFAULT_PRIMARY_GROUPS,
            gid_number_attr: DEFAULT_GID_NUMBER_ATTR.to_string(),
        }
    }

    /// Checks the settings that can't be defaulted. This is performed once when a
    /// backend is built from this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::Missing("prefix"));
        }
        if self.uri.is_empty() {
            return Err(ConfigError::Missing("uri"));
        }
        if self.base_users.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Missing("base_users"));
        }
        if self.base_groups.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Missing("base_groups"));
        }
        if self.login_filter.is_empty() {
            return Err(ConfigError::Missing("login_filter"));
        }
        if self.user_display_name.is_empty() {
            return Err(ConfigError::Missing("user_display_name"));
        }
        if self.group_display_name.is_empty() {
            return Err(ConfigError::Missing("group_display_name"));
        }
        Ok(())
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_secs(self.enumeration_timeout)
    }

    pub fn offline_check(&self) -> Duration {
        Duration::from_secs(self.offline_check)
    }

    /// Group support is only active when both a group filter and a membership
    /// attribute are configured.
    pub fn groups_enabled(&self) -> bool {
        !self.group_filter.is_empty() && self.group_member_attr.is_some()
    }

    fn from_int(idx: usize, config: ServerConfigInt) -> Result<Self, ConfigError> {
        let prefix = config
            .prefix
            .unwrap_or_else(|| format!("s{:02}", idx + 1));
        let defaults = ServerConfig::new(&prefix, "");

        let group_member_attr = match config.group_member_attr {
            Some(v) if v.is_empty() => None,
            Some(v) => match MemberAttr::parse(&v) {
                Some(attr) => Some(attr),
                None => {
                    error!(prefix = %prefix, value = %v, "Invalid group_member_attr");
                    return Err(ConfigError::Invalid("group_member_attr"));
                }
            },
            None => defaults.group_member_attr,
        };

        Ok(ServerConfig {
            uri: config.uri.ok_or(ConfigError::Missing("uri"))?,
            starttls: config.starttls.unwrap_or(defaults.starttls),
            conn_timeout: config.conn_timeout.unwrap_or(defaults.conn_timeout),
            enumeration_timeout: config
                .enumeration_timeout
                .unwrap_or(defaults.enumeration_timeout),
            offline_check: config.offline_check.unwrap_or(defaults.offline_check),
            bind_dn: config.bind_dn.unwrap_or(defaults.bind_dn),
            bind_password: config.bind_password.unwrap_or(defaults.bind_password),
            base_users: config.base_users,
            base_groups: config.base_groups,
            user_filter: config.user_filter.unwrap_or(defaults.user_filter),
            group_filter: config.group_filter.unwrap_or(defaults.group_filter),
            login_filter: config.login_filter.unwrap_or(defaults.login_filter),
            group_member_attr,
            nested_groups: config.nested_groups.unwrap_or(defaults.nested_groups),
            paging_size: config.paging_size.unwrap_or(defaults.paging_size),
            user_display_name: config
                .user_display_name
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.user_display_name),
            group_display_name: config
                .group_display_name
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.group_display_name),
            user_search_attributes: config.user_search_attributes,
            group_search_attributes: config.group_search_attributes,
            ignore_naming_rules: config
                .ignore_naming_rules
                .unwrap_or(defaults.ignore_naming_rules),
            dynamic_group_member_url: config
                .dynamic_group_member_url
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase()),
            use_member_of: config.use_member_of.unwrap_or(defaults.use_member_of),
            primary_groups: config.primary_groups.unwrap_or(defaults.primary_groups),
            gid_number_attr: config
                .gid_number_attr
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.gid_number_attr),
            prefix,
        })
    }
}

#[derive(Debug)]
pub struct ResolverConfig {
    pub db_path: String,
    pub cache_timeout: u64,
    pub cache_size: usize,
    pub servers: Vec<ServerConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::new()
    }
}

impl Display for ResolverConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "db_path: {}", &self.db_path)?;
        writeln!(f, "cache_timeout: {}", self.cache_timeout)?;
        writeln!(f, "cache_size: {}", self.cache_size)?;
        for server in &self.servers {
            writeln!(f, "server {}:", server.prefix)?;
            writeln!(f, "  uri: {}", server.uri)?;
            writeln!(f, "  starttls: {}", server.starttls)?;
            writeln!(f, "  bind_dn: {}", server.bind_dn)?;
            writeln!(f, "  base_users: {:?}", server.base_users)?;
            writeln!(f, "  base_groups: {:?}", server.base_groups)?;
            writeln!(f, "  group_filter: {}", server.group_filter)?;
            match server.group_member_attr {
                Some(attr) => writeln!(f, "  group_member_attr: {}", attr)?,
                None => writeln!(f, "  group_member_attr: unset")?,
            }
            writeln!(f, "  nested_groups: {}", server.nested_groups)?;
            writeln!(f, "  paging_size: {}", server.paging_size)?;
            writeln!(f, "  primary_groups: {}", server.primary_groups)?;
            writeln!(f, "  gid_number_attr: {}", server.gid_number_attr)?;
        }
        Ok(())
    }
}

impl ResolverConfig {
    pub fn new() -> Self {
        ResolverConfig {
            db_path: DEFAULT_DB_PATH.to_string(),
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
            servers: Vec::new(),
        }
    }

    pub fn read_options_from_optional_config<P: AsRef<Path> + std::fmt::Debug>(
        self,
        config_path: P,
    ) -> Result<Self, ConfigError> {
        debug!("Attempting to load configuration from {:#?}", &config_path);
        let mut f = match File::open(&config_path) {
            Ok(f) => {
                debug!("Successfully opened configuration file {:#?}", &config_path);
                f
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::NotFound => {
                        debug!(
                            "Configuration file {:#?} not found, skipping.",
                            &config_path
                        );
                    }
                    ErrorKind::PermissionDenied => {
                        warn!(
                            "Permission denied loading configuration file {:#?}, skipping.",
                            &config_path
                        );
                    }
                    _ => {
                        debug!(
                            "Unable to open config file {:#?} [{:?}], skipping ...",
                            &config_path, e
                        );
                    }
                };
                return Ok(self);
            }
        };

        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            error!("{:?}", e);
            ConfigError::Io
        })?;

        self.apply_toml(contents.as_str())
    }

    /// Overlay the content of a toml document onto this configuration.
    pub fn apply_toml(self, contents: &str) -> Result<Self, ConfigError> {
        let config: ConfigInt = toml::from_str(contents).map_err(|e| {
            error!("{:?}", e);
            ConfigError::Parse
        })?;

        let servers = if config.server.is_empty() {
            self.servers
        } else {
            config
                .server
                .into_iter()
                .enumerate()
                .map(|(idx, s)| ServerConfig::from_int(idx, s))
                .collect::<Result<Vec<_>, _>>()?
        };

        {
            let mut seen = HashSet::new();
            if let Some(dup) = servers.iter().find(|s| !seen.insert(s.prefix.as_str())) {
                error!(prefix = %dup.prefix, "Duplicate server prefix in configuration");
                return Err(ConfigError::Invalid("prefix"));
            }
        }

        Ok(ResolverConfig {
            db_path: config.db_path.unwrap_or(self.db_path),
            cache_timeout: config.cache_timeout.unwrap_or(self.cache_timeout),
            cache_size: config.cache_size.unwrap_or(self.cache_size),
            servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE_CONFIG: &str = r#"
db_path = ""
cache_timeout = 30

[[server]]
uri = "ldap://ldap.example.com"
bind_dn = "cn=reader,dc=example,dc=com"
bind_password = "reader password"
base_users = ["ou=people,dc=example,dc=com"]
base_groups = ["ou=groups,dc=example,dc=com"]
group_filter = "objectClass=groupOfNames"
group_member_attr = "member"
nested_groups = true
user_display_name = "displayName"

[[server]]
prefix = "corp"
uri = "ldaps://dc.corp.example.net"
base_users = ["cn=users,dc=corp,dc=example,dc=net"]
base_groups = ["cn=users,dc=corp,dc=example,dc=net"]
group_filter = "objectClass=group"
group_member_attr = "memberUid"
paging_size = 0
enumeration_timeout = 600
primary_groups = false
gid_number_attr = ""
"#;

    #[test]
    fn test_config_parse_servers() {
        let config = ResolverConfig::new()
            .apply_toml(EXAMPLE_CONFIG)
            .expect("Failed to parse");

        assert_eq!(config.db_path, "");
        assert_eq!(config.cache_timeout, 30);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.servers.len(), 2);

        let s01 = &config.servers[0];
        assert_eq!(s01.prefix, "s01");
        assert_eq!(s01.group_member_attr, Some(MemberAttr::Member));
        assert_eq!(
            s01.group_member_attr.map(|a| a.addressing()),
            Some(MemberAddressing::Dn)
        );
        assert!(s01.nested_groups);
        assert_eq!(s01.user_display_name, "displayname");
        assert!(s01.validate().is_ok());
        assert!(s01.groups_enabled());

        let corp = &config.servers[1];
        assert_eq!(corp.prefix, "corp");
        assert_eq!(
            corp.group_member_attr.map(|a| a.addressing()),
            Some(MemberAddressing::Uid)
        );
        assert_eq!(corp.paging_size, 0);
        assert_eq!(corp.enumeration_timeout(), Duration::from_secs(600));
        assert_eq!(s01.enumeration_timeout, DEFAULT_ENUMERATION_TIMEOUT);
        assert!(s01.primary_groups);
        assert_eq!(s01.gid_number_attr, "gidnumber");
        assert!(!corp.primary_groups);
        assert!(corp.gid_number_attr.is_empty());
        assert_eq!(corp.login_filter, DEFAULT_LOGIN_FILTER);
    }

    #[test]
    fn test_config_invalid() {
        assert!(matches!(
            ResolverConfig::new().apply_toml("[[server]]\nbase_users = []\n"),
            Err(ConfigError::Missing("uri"))
        ));

        assert!(matches!(
            ResolverConfig::new()
                .apply_toml("[[server]]\nuri = \"ldap://a\"\ngroup_member_attr = \"owner\"\n"),
            Err(ConfigError::Invalid("group_member_attr"))
        ));

        assert!(matches!(
            ResolverConfig::new().apply_toml(
                "[[server]]\nprefix = \"a\"\nuri = \"ldap://a\"\n[[server]]\nprefix = \"a\"\nuri = \"ldap://b\"\n"
            ),
            Err(ConfigError::Invalid("prefix"))
        ));

        assert!(matches!(
            ResolverConfig::new().apply_toml("this is not = = toml"),
            Err(ConfigError::Parse)
        ));

        // Parses, but can't be used to build a backend.
        let config = ResolverConfig::new()
            .apply_toml("[[server]]\nuri = \"ldap://a\"\n")
            .expect("Failed to parse");
        assert!(matches!(
            config.servers[0].validate(),
            Err(ConfigError::Missing("base_users"))
        ));
        assert!(!config.servers[0].groups_enabled());
    }

    #[test]
    fn test_config_optional_file() {
        let config = ResolverConfig::new()
            .read_options_from_optional_config("/this/path/does/not/exist.toml")
            .expect("Missing file must not be an error");
        assert!(config.servers.is_empty());
        assert_eq!(config.db_path, DEFAULT_DB_PATH);

        let mut file = tempfile::NamedTempFile::new().expect("Failed to create tempfile");
        file.write_all(EXAMPLE_CONFIG.as_bytes())
            .expect("Failed to write config");

        let config = ResolverConfig::new()
            .read_options_from_optional_config(file.path())
            .expect("Failed to parse");
        assert_eq!(config.servers.len(), 2);
    }
}
