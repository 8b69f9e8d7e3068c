use std::sync::Arc;

use crate::db::{MappingError, MappingKind, MappingStore};
use crate::directory::{combine_and, dn_in_base, escape_filter_part, normalize_dn, DirectoryClient};
use crate::ldap_config::ServerConfig;

#[derive(Debug)]
pub enum ResolutionError {
    /// No such object exists in the directory or the mapping table.
    NotFound,
    /// The dn is not beneath any of the configured bases.
    OutsideBase,
    /// The entry has no usable display name.
    NoName,
    /// Both candidate names are already taken by other entries.
    NameConflict,
    /// The directory could not be queried.
    Unavailable,
    Store(MappingError),
}

impl From<MappingError> for ResolutionError {
    fn from(err: MappingError) -> Self {
        ResolutionError::Store(err)
    }
}

/// Reduce a directory provided name to the set of characters permitted in a
/// local name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
        .collect()
}

/// The values of every rdn after the first, joined by `.`.
/// `uid=alice,ou=people,dc=example,dc=com` gives `people.example.com`.
fn dn_suffix(dn: &str) -> String {
    split_rdns(dn)
        .into_iter()
        .skip(1)
        .filter_map(|rdn| rdn.split_once('=').map(|(_, v)| v.trim().to_string()))
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, c) in dn.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            parts.push(&dn[start..idx]);
            start = idx + 1;
        }
    }
    parts.push(&dn[start..]);
    parts
}

/// Translates between directory names and stable local names for one backend.
pub struct NameMapper {
    store: Arc<dyn MappingStore>,
    client: Arc<DirectoryClient>,
    config: Arc<ServerConfig>,
    user_bases: Vec<String>,
    group_bases: Vec<String>,
}

impl NameMapper {
    pub fn new(
        store: Arc<dyn MappingStore>,
        client: Arc<DirectoryClient>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let normalize = |bases: &[String]| {
            bases
                .iter()
                .map(|b| normalize_dn(b))
                .filter(|b| !b.is_empty())
                .collect()
        };
        NameMapper {
            user_bases: normalize(&config.base_users),
            group_bases: normalize(&config.base_groups),
            store,
            client,
            config,
        }
    }

    fn bases(&self, kind: MappingKind) -> &[String] {
        match kind {
            MappingKind::User => &self.user_bases,
            MappingKind::Group => &self.group_bases,
        }
    }

    fn display_attr(&self, kind: MappingKind) -> &str {
        match kind {
            MappingKind::User => &self.config.user_display_name,
            MappingKind::Group => &self.config.group_display_name,
        }
    }

    /// Whether a normalised dn lies beneath one of the bases configured for `kind`.
    pub fn in_base(&self, dn: &str, kind: MappingKind) -> bool {
        self.bases(kind).iter().any(|base| dn_in_base(dn, base))
    }

    fn sanitize(&self, name: &str) -> String {
        if self.config.ignore_naming_rules {
            name.to_string()
        } else {
            sanitize_name(name)
        }
    }

    /// Resolve a dn to its local name, assigning one if this is the first time
    /// the entry has been seen. An existing mapping always wins, so a local name
    /// never changes once assigned.
    #[instrument(level = "debug", skip(self, hint))]
    pub async fn dn_to_local_name(
        &self,
        dn: &str,
        kind: MappingKind,
        hint: Option<&str>,
    ) -> Result<String, ResolutionError> {
        let dn = normalize_dn(dn);
        if !self.in_base(&dn, kind) {
            trace!(%dn, "dn outside of configured bases");
            return Err(ResolutionError::OutsideBase);
        }

        if let Some(name) = self.store.find_by_dn(kind, &dn).await? {
            return Ok(name);
        }

        let candidate = match hint.filter(|h| !h.is_empty()) {
            Some(h) => h.to_string(),
            None => {
                let values = self
                    .client
                    .read_attribute(&dn, self.display_attr(kind))
                    .await;
                match values.and_then(|v| v.into_iter().find(|s| !s.is_empty())) {
                    Some(v) => v,
                    None if !self.client.is_online().await => {
                        return Err(ResolutionError::Unavailable)
                    }
                    None => {
                        info!(%dn, "no or empty name for entry");
                        return Err(ResolutionError::NoName);
                    }
                }
            }
        };

        let name = self.sanitize(&candidate);
        if name.is_empty() {
            info!(%dn, %candidate, "name is empty after sanitising");
            return Err(ResolutionError::NoName);
        }

        if self.store.insert_if_absent(kind, &dn, &name).await? {
            debug!(%dn, %name, %kind, "mapped");
            return Ok(name);
        }

        // A concurrent resolution may have mapped this dn in the meantime.
        if let Some(existing) = self.store.find_by_dn(kind, &dn).await? {
            return Ok(existing);
        }

        let suffix = dn_suffix(&dn);
        if !suffix.is_empty() {
            let alt = self.sanitize(&format!("{}@{}", candidate, suffix));
            if !alt.is_empty() && alt != name && self.store.insert_if_absent(kind, &dn, &alt).await? {
                debug!(%dn, name = %alt, %kind, "mapped with disambiguated name");
                return Ok(alt);
            }
            if let Some(existing) = self.store.find_by_dn(kind, &dn).await? {
                return Ok(existing);
            }
        }

        warn!(%dn, %name, %kind, "unable to assign a unique local name, skipping");
        Err(ResolutionError::NameConflict)
    }

    /// Reverse lookup. Users whose mapping has not been created yet are searched
    /// for by display name, and mapped if found.
    #[instrument(level = "debug", skip(self))]
    pub async fn local_name_to_dn(
        &self,
        name: &str,
        kind: MappingKind,
    ) -> Result<String, ResolutionError> {
        if let Some(dn) = self.store.find_by_name(kind, name).await? {
            // Other backends share the store, so the mapping must belong to us.
            if self.in_base(&dn, kind) {
                return Ok(dn);
            }
            return Err(ResolutionError::OutsideBase);
        }

        if kind == MappingKind::Group {
            return Err(ResolutionError::NotFound);
        }

        let display_attr = self.display_attr(kind);
        let assertion = format!("{}={}", display_attr, escape_filter_part(name, false));
        let filter = combine_and(&[self.config.user_filter.as_str(), assertion.as_str()]);
        let found = self
            .client
            .search_bases(&self.config.base_users, &filter, Some(&[display_attr]), Some(1), 0)
            .await;
        let entry = match found.into_iter().next() {
            Some(e) => e,
            None if !self.client.is_online().await => return Err(ResolutionError::Unavailable),
            None => return Err(ResolutionError::NotFound),
        };

        match self
            .dn_to_local_name(&entry.dn, kind, entry.first(display_attr))
            .await
        {
            Ok(mapped) if mapped == name => Ok(entry.dn),
            // The entry is already known under a different local name.
            Ok(_) => Err(ResolutionError::NotFound),
            Err(err) => Err(err),
        }
    }

    pub fn store(&self) -> &Arc<dyn MappingStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::directory::memory::MemoryDirectory;
    use crate::directory::DirectoryEntry;

    fn person(dn: &str, display: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            dn,
            vec![
                ("objectClass", vec!["inetOrgPerson".to_string()]),
                ("displayName", vec![display.to_string()]),
            ],
        )
    }

    async fn setup() -> (MemoryDirectory, NameMapper) {
        let mut config = ServerConfig::new("s01", "memory://");
        config.base_users = vec!["dc=example,dc=com".to_string()];
        config.base_groups = vec!["ou=groups,dc=example,dc=com".to_string()];
        config.user_filter = "objectClass=inetOrgPerson".to_string();
        let config = Arc::new(config);

        let dir = MemoryDirectory::new();
        let client = Arc::new(DirectoryClient::new(Box::new(dir.clone()), &config));
        let store = Arc::new(Db::open("").await.expect("failed to open db"));
        (dir, NameMapper::new(store, client, config))
    }

    #[test]
    fn test_sanitize_and_suffix() {
        assert_eq!(sanitize_name("Alice Liddell"), "Alice_Liddell");
        assert_eq!(sanitize_name("bob(ops)!é"), "bobops");
        assert_eq!(sanitize_name("a.b-c@d"), "a.b-c@d");
        assert_eq!(
            dn_suffix("uid=alice,ou=people,dc=example,dc=com"),
            "people.example.com"
        );
        assert_eq!(dn_suffix("cn=a\\,b,dc=com"), "com");
        assert_eq!(dn_suffix("cn=root"), "");
    }

    #[tokio::test]
    async fn test_mapping_stable_after_rename() {
        sketching::test_init();
        let (dir, mapper) = setup().await;
        let dn = "uid=alice,ou=people,dc=example,dc=com";
        dir.add_entry(person(dn, "Alice")).await;

        let name = mapper
            .dn_to_local_name(dn, MappingKind::User, None)
            .await
            .expect("failed to map");
        assert_eq!(name, "Alice");

        dir.add_entry(person(dn, "Alicia")).await;
        let again = mapper
            .dn_to_local_name("UID=Alice, ou=People,dc=example,dc=com", MappingKind::User, None)
            .await
            .expect("failed to map");
        assert_eq!(again, "Alice");

        assert_eq!(
            mapper
                .local_name_to_dn("Alice", MappingKind::User)
                .await
                .expect("failed to reverse"),
            dn
        );
    }

    #[tokio::test]
    async fn test_mapping_conflict_disambiguates() {
        sketching::test_init();
        let (dir, mapper) = setup().await;
        let d1 = "uid=jsmith,ou=people,dc=example,dc=com";
        let d2 = "uid=jsmith,ou=contractors,dc=example,dc=com";
        let d3 = "uid=jsmith2,ou=contractors,dc=example,dc=com";
        dir.add_entry(person(d1, "John Smith")).await;
        dir.add_entry(person(d2, "John Smith")).await;
        dir.add_entry(person(d3, "John Smith")).await;

        let n1 = mapper
            .dn_to_local_name(d1, MappingKind::User, None)
            .await
            .expect("failed to map d1");
        let n2 = mapper
            .dn_to_local_name(d2, MappingKind::User, None)
            .await
            .expect("failed to map d2");
        assert_eq!(n1, "John_Smith");
        assert_eq!(n2, "John_Smith@contractors.example.com");

        // Both candidates are taken now.
        assert!(matches!(
            mapper.dn_to_local_name(d3, MappingKind::User, None).await,
            Err(ResolutionError::NameConflict)
        ));
    }

    #[tokio::test]
    async fn test_mapping_rejects_outside_base_and_nameless() {
        sketching::test_init();
        let (dir, mapper) = setup().await;
        assert!(matches!(
            mapper
                .dn_to_local_name("uid=x,dc=other,dc=org", MappingKind::User, Some("x"))
                .await,
            Err(ResolutionError::OutsideBase)
        ));
        assert!(matches!(
            mapper
                .dn_to_local_name("cn=x,ou=people,dc=example,dc=com", MappingKind::Group, Some("x"))
                .await,
            Err(ResolutionError::OutsideBase)
        ));

        dir.add_entry(DirectoryEntry::new(
            "uid=noname,ou=people,dc=example,dc=com",
            vec![("objectClass", vec!["inetOrgPerson".to_string()])],
        ))
        .await;
        assert!(matches!(
            mapper
                .dn_to_local_name("uid=noname,ou=people,dc=example,dc=com", MappingKind::User, None)
                .await,
            Err(ResolutionError::NoName)
        ));

        dir.set_online(false).await;
        assert!(matches!(
            mapper
                .dn_to_local_name("uid=gone,ou=people,dc=example,dc=com", MappingKind::User, None)
                .await,
            Err(ResolutionError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_reverse_lookup_creates_mapping() {
        sketching::test_init();
        let (dir, mapper) = setup().await;
        let dn = "uid=carol,ou=people,dc=example,dc=com";
        dir.add_entry(person(dn, "carol")).await;

        assert!(mapper
            .store()
            .find_by_name(MappingKind::User, "carol")
            .await
            .expect("store failed")
            .is_none());
        assert_eq!(
            mapper
                .local_name_to_dn("carol", MappingKind::User)
                .await
                .expect("failed to find"),
            dn
        );
        assert_eq!(
            mapper
                .store()
                .find_by_dn(MappingKind::User, dn)
                .await
                .expect("store failed")
                .as_deref(),
            Some("carol")
        );
        assert!(matches!(
            mapper.local_name_to_dn("nobody", MappingKind::User).await,
            Err(ResolutionError::NotFound)
        ));
        assert!(matches!(
            mapper.local_name_to_dn("carol", MappingKind::Group).await,
            Err(ResolutionError::NotFound)
        ));
    }
}
