//! Group resolution against one configured directory server.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashSet;
use serde::Serialize;

use super::interface::{DirectoryBackend, GroupActions};
use crate::cache::{BackendCache, CacheStore};
use crate::constants::{LOGIN_FILTER_PLACEHOLDER, MAX_GROUP_ENUMERATION, MEMBER_FILTER_BYTE_LIMIT};
use crate::db::{MappingKind, MappingStore};
use crate::directory::ldap::LdapConnector;
use crate::directory::{
    combine_and, combine_or, escape_filter_part, normalize_dn, search_filter_part,
    DirectoryClient, DirectoryConnector, DirectoryEntry,
};
use crate::ldap_config::{ConfigError, MemberAddressing, MemberAttr, ServerConfig};
use crate::mapper::NameMapper;
use crate::utils::{natural_sort_dedup, window};

/// The filter part of an ldap url such as
/// `ldap:///ou=people,dc=example,dc=com??sub?(objectClass=person)`.
fn member_url_filter(url: &str) -> Option<&str> {
    url.find('(').map(|pos| &url[pos..])
}

/// The domain a normalised dn belongs to, starting at its first `dc` component.
fn domain_dn(dn: &str) -> Option<&str> {
    if dn.starts_with("dc=") {
        return Some(dn);
    }
    dn.find(",dc=").map(|pos| &dn[pos + 1..])
}

pub struct LdapBackend {
    config: Arc<ServerConfig>,
    client: Arc<DirectoryClient>,
    mapper: NameMapper,
    cache: BackendCache,
}

impl LdapBackend {
    /// Build a backend speaking LDAP to the configured server.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn MappingStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        let connector = Box::new(LdapConnector::new(&config));
        LdapBackend::with_connector(config, connector, store, cache)
    }

    pub fn with_connector(
        config: ServerConfig,
        connector: Box<dyn DirectoryConnector>,
        store: Arc<dyn MappingStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !config.groups_enabled() {
            info!(prefix = %config.prefix, "group filter or member attribute unset, group support disabled");
        }
        let config = Arc::new(config);
        let client = Arc::new(DirectoryClient::new(connector, &config));
        let mapper = NameMapper::new(store, client.clone(), config.clone());
        let cache = BackendCache::new(&config.prefix, cache);
        Ok(LdapBackend {
            config,
            client,
            mapper,
            cache,
        })
    }

    pub fn client(&self) -> &DirectoryClient {
        &self.client
    }

    pub fn mapper(&self) -> &NameMapper {
        &self.mapper
    }

    /// The membership attribute, when group support is enabled.
    fn member_attr(&self) -> Option<MemberAttr> {
        if self.config.groups_enabled() {
            self.config.group_member_attr
        } else {
            None
        }
    }

    /// Results are only memoised while the directory is reachable, so an outage
    /// is never remembered as an empty answer.
    async fn remember<T: Serialize + Sync>(&self, key: &str, value: &T) {
        if self.client.is_online().await {
            self.cache.set(key, value).await;
        }
    }

    async fn group_dn(&self, gid: &str) -> Option<String> {
        self.mapper
            .local_name_to_dn(gid, MappingKind::Group)
            .await
            .map_err(|err| trace!(%gid, ?err, "group not resolvable"))
            .ok()
    }

    async fn user_dn(&self, uid: &str) -> Option<String> {
        self.mapper
            .local_name_to_dn(uid, MappingKind::User)
            .await
            .map_err(|err| trace!(%uid, ?err, "user not resolvable"))
            .ok()
    }

    /// Read `dn` as a group, if it is one of ours.
    async fn read_group(&self, dn: &str, attrs: &[&str]) -> Option<DirectoryEntry> {
        if !self.mapper.in_base(dn, MappingKind::Group) {
            return None;
        }
        self.client
            .read_entry(dn, &self.config.group_filter, Some(attrs))
            .await
    }

    fn login_filter(&self, login: &str) -> String {
        self.config
            .login_filter
            .replace(LOGIN_FILTER_PLACEHOLDER, &escape_filter_part(login, false))
    }

    /// Users answering to `login`. At most two are fetched, enough to tell an
    /// ambiguous login apart.
    async fn find_login(&self, login: &str) -> Vec<DirectoryEntry> {
        let display = self.config.user_display_name.as_str();
        let login_filter = self.login_filter(login);
        let filter = combine_and(&[self.config.user_filter.as_str(), login_filter.as_str()]);
        self.client
            .search_bases(&self.config.base_users, &filter, Some(&[display]), Some(2), 0)
            .await
    }

    /// Find the user entries for a set of raw login identifiers. The lookups are
    /// combined into as few searches as the filter size allows.
    async fn resolve_uids(&self, uids: &[String], extra_filter: &str) -> Vec<DirectoryEntry> {
        let display = self.config.user_display_name.as_str();
        let mut found = Vec::new();
        let mut batch: Vec<String> = Vec::new();
        let mut batch_len = 0;

        for (idx, uid) in uids.iter().enumerate() {
            let part = self.login_filter(uid);
            batch_len += part.len();
            batch.push(part);
            if batch_len < MEMBER_FILTER_BYTE_LIMIT && idx + 1 < uids.len() {
                continue;
            }
            let parts: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();
            let or = combine_or(&parts);
            let filter = combine_and(&[self.config.user_filter.as_str(), extra_filter, or.as_str()]);
            found.extend(
                self.client
                    .search_bases(&self.config.base_users, &filter, Some(&[display]), None, 0)
                    .await,
            );
            batch.clear();
            batch_len = 0;
        }
        found
    }

    /// Flattened members of the group, always as dns. Raw identifier members are
    /// translated through the login filter.
    async fn member_dns(&self, gid: &str, group_dn: &str) -> Vec<String> {
        let key = format!("inGroup-members:{}", gid);
        if let Some(members) = self.cache.get::<Vec<String>>(&key).await {
            return members;
        }

        let members = self.flatten_members(group_dn).await;
        let mut dns: Vec<String> = match self.member_attr().map(|a| a.addressing()) {
            Some(MemberAddressing::Uid) => self
                .resolve_uids(&members, "")
                .await
                .into_iter()
                .map(|e| e.dn)
                .collect(),
            _ => members,
        };
        dns.sort();
        dns.dedup();
        self.remember(&key, &dns).await;
        dns
    }

    async fn dynamic_members(&self, group: &DirectoryEntry, url_attr: &str) -> Vec<String> {
        let Some(url) = group.first(url_attr) else {
            return Vec::new();
        };
        let Some(filter) = member_url_filter(url) else {
            debug!(group = %group.dn, "no search filter found on member url");
            return Vec::new();
        };
        self.client
            .search_bases(&self.config.base_users, filter, Some(&["dn"]), None, 0)
            .await
            .into_iter()
            .map(|e| e.dn)
            .collect()
    }

    /// Groups, as entries, whose membership attribute holds `value`.
    async fn groups_by_member(&self, attr: MemberAttr, value: &str) -> Vec<DirectoryEntry> {
        let assertion = format!("{}={}", attr.attr_name(), escape_filter_part(value, false));
        let filter = combine_and(&[self.config.group_filter.as_str(), assertion.as_str()]);
        self.client
            .search_bases(
                &self.config.base_groups,
                &filter,
                Some(&[self.config.group_display_name.as_str()]),
                None,
                0,
            )
            .await
    }

    /// Groups the user belongs to as found through its `memberOf` attribute.
    async fn groups_from_member_of(&self, user_dn: &str) -> Vec<DirectoryEntry> {
        let display = self.config.group_display_name.as_str();
        let mut visited: HashSet<String> = HashSet::new();
        let mut groups = Vec::new();
        let mut work: VecDeque<String> = self
            .client
            .read_attribute(user_dn, "memberof")
            .await
            .unwrap_or_default()
            .into();

        while let Some(dn) = work.pop_front() {
            if !visited.insert(dn.clone()) {
                continue;
            }
            let Some(group) = self.read_group(&dn, &[display, "memberof"]).await else {
                continue;
            };
            if self.config.nested_groups {
                work.extend(group.get("memberof").unwrap_or(&[]).iter().cloned());
            }
            groups.push(group);
        }
        groups
    }

    async fn dynamic_groups_for_user(&self, user_dn: &str, url_attr: &str) -> Vec<DirectoryEntry> {
        let presence = format!("{}=*", url_attr);
        let filter = combine_and(&[self.config.group_filter.as_str(), presence.as_str()]);
        let candidates = self
            .client
            .search_bases(
                &self.config.base_groups,
                &filter,
                Some(&[self.config.group_display_name.as_str(), url_attr]),
                None,
                0,
            )
            .await;

        let mut matched = Vec::new();
        for group in candidates {
            let Some(url_filter) = group.first(url_attr).and_then(member_url_filter) else {
                continue;
            };
            if self
                .client
                .read_entry(user_dn, url_filter, Some(&["dn"]))
                .await
                .is_some()
            {
                matched.push(group);
            }
        }
        matched
    }

    /// Group entries the user belongs to without being listed as a member: its
    /// Active Directory primary group and the posix group of its gid number.
    async fn implicit_groups(&self, user_dn: &str) -> Vec<DirectoryEntry> {
        let gid_attr = self.config.gid_number_attr.as_str();
        let mut attrs = Vec::new();
        if self.config.primary_groups {
            attrs.push("primarygroupid");
        }
        if !gid_attr.is_empty() {
            attrs.push(gid_attr);
        }
        if attrs.is_empty() {
            return Vec::new();
        }
        let Some(user) = self
            .client
            .read_entry(user_dn, "objectClass=*", Some(attrs.as_slice()))
            .await
        else {
            return Vec::new();
        };

        let mut groups = Vec::new();
        if let Some(rid) = user.first("primarygroupid") {
            groups.extend(self.primary_group(user_dn, rid).await);
        }
        if let Some(gid) = user.first(gid_attr) {
            let assertion = format!("{}={}", gid_attr, escape_filter_part(gid, false));
            let filter = combine_and(&[
                self.config.group_filter.as_str(),
                "objectClass=posixGroup",
                assertion.as_str(),
            ]);
            groups.extend(
                self.client
                    .search_bases(
                        &self.config.base_groups,
                        &filter,
                        Some(&[self.config.group_display_name.as_str()]),
                        Some(1),
                        0,
                    )
                    .await,
            );
        }
        groups
    }

    /// The group whose security identifier is the domain's followed by `rid`.
    async fn primary_group(&self, user_dn: &str, rid: &str) -> Option<DirectoryEntry> {
        let domain = domain_dn(user_dn)?;
        let key = format!("getSID-{}", domain);
        let domain_sid = match self.cache.get::<String>(&key).await {
            Some(sid) => sid,
            None => {
                let sid = self
                    .client
                    .read_attribute(domain, "objectsid")
                    .await?
                    .into_iter()
                    .next()?;
                self.remember(&key, &sid).await;
                sid
            }
        };
        let sid = format!("{}-{}", domain_sid, rid);
        let assertion = format!("objectsid={}", escape_filter_part(&sid, false));
        let filter = combine_and(&[self.config.group_filter.as_str(), assertion.as_str()]);
        self.client
            .search_bases(
                &self.config.base_groups,
                &filter,
                Some(&[self.config.group_display_name.as_str()]),
                Some(1),
                0,
            )
            .await
            .into_iter()
            .next()
    }

    /// Users that have the group as primary group or carry its gid number,
    /// restricted by `search_part`.
    async fn implicit_members(&self, group_dn: &str, search_part: &str) -> Vec<DirectoryEntry> {
        let gid_attr = self.config.gid_number_attr.as_str();
        let mut attrs = Vec::new();
        if self.config.primary_groups {
            attrs.push("primarygrouptoken");
        }
        if !gid_attr.is_empty() {
            attrs.push(gid_attr);
        }
        if attrs.is_empty() {
            return Vec::new();
        }
        let Some(group) = self.read_group(group_dn, &attrs).await else {
            return Vec::new();
        };

        let mut assertions = Vec::new();
        if let Some(token) = group.first("primarygrouptoken") {
            assertions.push(format!("primarygroupid={}", escape_filter_part(token, false)));
        }
        if let Some(gid) = group.first(gid_attr) {
            assertions.push(format!("{}={}", gid_attr, escape_filter_part(gid, false)));
        }
        if assertions.is_empty() {
            return Vec::new();
        }

        let parts: Vec<&str> = assertions.iter().map(|s| s.as_str()).collect();
        let any = combine_or(&parts);
        let filter = combine_and(&[self.config.user_filter.as_str(), search_part, any.as_str()]);
        self.client
            .search_bases(
                &self.config.base_users,
                &filter,
                Some(&[self.config.user_display_name.as_str()]),
                None,
                0,
            )
            .await
    }

    async fn map_groups(&self, groups: Vec<DirectoryEntry>) -> Vec<String> {
        let display = self.config.group_display_name.as_str();
        let mut names = Vec::with_capacity(groups.len());
        for group in groups {
            match self
                .mapper
                .dn_to_local_name(&group.dn, MappingKind::Group, group.first(display))
                .await
            {
                Ok(name) => names.push(name),
                Err(err) => debug!(dn = %group.dn, ?err, "skipping unmappable group"),
            }
        }
        names
    }

    /// All members of a group that are users matching `search`, as local names.
    async fn group_users(&self, gid: &str, search: &str) -> Vec<String> {
        let key = format!("usersInGroup-{}-{}", gid, search);
        if let Some(users) = self.cache.get::<Vec<String>>(&key).await {
            return users;
        }
        let Some(attr) = self.member_attr() else {
            return Vec::new();
        };
        let Some(group_dn) = self.group_dn(gid).await else {
            return Vec::new();
        };

        let display = self.config.user_display_name.as_str();
        let search_part = if search.is_empty() {
            String::new()
        } else {
            search_filter_part(search, &self.config.user_search_attributes, display)
        };
        let members = self.flatten_members(&group_dn).await;

        let mut entries: Vec<DirectoryEntry> = match attr.addressing() {
            MemberAddressing::Uid => self.resolve_uids(&members, &search_part).await,
            MemberAddressing::Dn => {
                let filter = combine_and(&[self.config.user_filter.as_str(), search_part.as_str()]);
                let mut entries = Vec::with_capacity(members.len());
                for member in &members {
                    if let Some(entry) = self.client.read_entry(member, &filter, Some(&[display])).await {
                        entries.push(entry);
                    }
                }
                entries
            }
        };
        entries.extend(self.implicit_members(&group_dn, &search_part).await);

        let mut users = Vec::with_capacity(entries.len());
        for entry in entries {
            match self
                .mapper
                .dn_to_local_name(&entry.dn, MappingKind::User, entry.first(display))
                .await
            {
                Ok(name) => users.push(name),
                Err(err) => debug!(dn = %entry.dn, ?err, "skipping unmappable member"),
            }
        }
        let users = natural_sort_dedup(users);
        self.remember(&key, &users).await;
        users
    }
}

#[async_trait]
impl DirectoryBackend for LdapBackend {
    fn prefix(&self) -> &str {
        &self.config.prefix
    }

    #[instrument(level = "debug", skip(self))]
    async fn is_user_in_group(&self, uid: &str, gid: &str) -> bool {
        if self.member_attr().is_none() {
            return false;
        }
        let key = format!("inGroup:{}:{}", uid, gid);
        if let Some(result) = self.cache.get::<bool>(&key).await {
            return result;
        }

        let Some(user_dn) = self.user_dn(uid).await else {
            return false;
        };
        let Some(group_dn) = self.group_dn(gid).await else {
            return false;
        };

        let implicit = self
            .implicit_groups(&user_dn)
            .await
            .iter()
            .any(|g| g.dn == group_dn);
        let result = implicit
            || self
                .member_dns(gid, &group_dn)
                .await
                .iter()
                .any(|dn| *dn == user_dn);
        self.remember(&key, &result).await;
        result
    }

    #[instrument(level = "debug", skip(self))]
    async fn flatten_members(&self, group_dn: &str) -> Vec<String> {
        let Some(attr) = self.member_attr() else {
            return Vec::new();
        };
        let group_dn = normalize_dn(group_dn);
        let key = format!("groupMembers:{}", group_dn);
        if let Some(members) = self.cache.get::<Vec<String>>(&key).await {
            return members;
        }

        let url_attr = self.config.dynamic_group_member_url.as_deref();
        let mut read_attrs = vec![attr.attr_name()];
        read_attrs.extend(url_attr);

        let Some(root) = self.read_group(&group_dn, &read_attrs).await else {
            return Vec::new();
        };

        let expand = self.config.nested_groups && attr.addressing() == MemberAddressing::Dn;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(group_dn.clone());
        let mut members: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut work: Vec<DirectoryEntry> = vec![root];

        while let Some(group) = work.pop() {
            let values = group.get(attr.attr_name()).unwrap_or(&[]).to_vec();
            for value in values {
                if expand {
                    if visited.contains(&value) {
                        // Already expanded in this traversal.
                        continue;
                    }
                    if let Some(nested) = self.read_group(&value, &read_attrs).await {
                        visited.insert(value);
                        work.push(nested);
                        continue;
                    }
                }
                if seen.insert(value.clone()) {
                    members.push(value);
                }
            }

            if let Some(url_attr) = url_attr {
                for dn in self.dynamic_members(&group, url_attr).await {
                    if seen.insert(dn.clone()) {
                        members.push(dn);
                    }
                }
            }
        }

        members.sort();
        self.remember(&key, &members).await;
        members
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_groups_for_user(&self, uid: &str) -> Vec<String> {
        let Some(attr) = self.member_attr() else {
            return Vec::new();
        };
        let key = format!("getUserGroups:{}", uid);
        if let Some(groups) = self.cache.get::<Vec<String>>(&key).await {
            return groups;
        }
        let Some(user_dn) = self.user_dn(uid).await else {
            return Vec::new();
        };

        let mut groups: Vec<DirectoryEntry> = self.implicit_groups(&user_dn).await;
        if self.config.use_member_of && attr.addressing() == MemberAddressing::Dn {
            groups.extend(self.groups_from_member_of(&user_dn).await);
        } else {
            let start = match attr.addressing() {
                MemberAddressing::Dn => Some(user_dn.clone()),
                MemberAddressing::Uid => self
                    .client
                    .read_attribute(&user_dn, "uid")
                    .await
                    .and_then(|v| v.into_iter().next()),
            };
            let mut visited: HashSet<String> = HashSet::new();
            let mut work: Vec<String> = start.into_iter().collect();
            while let Some(value) = work.pop() {
                if !visited.insert(value.clone()) {
                    continue;
                }
                for group in self.groups_by_member(attr, &value).await {
                    if self.config.nested_groups && attr.addressing() == MemberAddressing::Dn {
                        work.push(group.dn.clone());
                    }
                    if !groups.iter().any(|g| g.dn == group.dn) {
                        groups.push(group);
                    }
                }
            }
        }

        if let Some(url_attr) = self.config.dynamic_group_member_url.as_deref() {
            groups.extend(self.dynamic_groups_for_user(&user_dn, url_attr).await);
        }

        let names = natural_sort_dedup(self.map_groups(groups).await);
        self.remember(&key, &names).await;
        names
    }

    #[instrument(level = "debug", skip(self))]
    async fn users_in_group(
        &self,
        gid: &str,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<String> {
        if self.member_attr().is_none() {
            return Vec::new();
        }
        let limit_key = limit.map(|l| l.to_string()).unwrap_or_else(|| "-1".to_string());
        let key = format!("usersInGroup-{}-{}-{}-{}", gid, search, limit_key, offset);
        if let Some(users) = self.cache.get::<Vec<String>>(&key).await {
            return users;
        }

        let users = window(self.group_users(gid, search).await, limit, offset);
        self.remember(&key, &users).await;
        users
    }

    #[instrument(level = "debug", skip(self))]
    async fn count_users_in_group(&self, gid: &str, search: &str) -> usize {
        if self.member_attr().is_none() {
            return 0;
        }
        let key = format!("countUsersInGroup-{}-{}", gid, search);
        if let Some(count) = self.cache.get::<usize>(&key).await {
            return count;
        }
        let count = self.group_users(gid, search).await.len();
        self.remember(&key, &count).await;
        count
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_groups(&self, search: &str, limit: Option<usize>, offset: usize) -> Vec<String> {
        if self.member_attr().is_none() {
            return Vec::new();
        }
        let limit_key = limit.map(|l| l.to_string()).unwrap_or_else(|| "-1".to_string());
        let key = format!("getGroups-{}-{}-{}", search, limit_key, offset);
        if let Some(groups) = self.cache.get::<Vec<String>>(&key).await {
            return groups;
        }

        let display = self.config.group_display_name.as_str();
        let presence = format!("{}=*", display);
        let search_part = if search.is_empty() {
            String::new()
        } else {
            search_filter_part(search, &self.config.group_search_attributes, display)
        };
        let filter = combine_and(&[
            self.config.group_filter.as_str(),
            presence.as_str(),
            search_part.as_str(),
        ]);

        // With paging the client walks the result page by page and stops at the
        // size limit, otherwise it is a single bounded query.
        let wanted = limit
            .map(|l| l.saturating_add(offset))
            .unwrap_or(MAX_GROUP_ENUMERATION)
            .min(MAX_GROUP_ENUMERATION);
        let mut fetch = wanted;
        let names = loop {
            trace!(fetch, paged = self.client.supports_paging(), "enumerating groups");
            let entries = self
                .client
                .search_bases(&self.config.base_groups, &filter, Some(&[display]), Some(fetch), 0)
                .await;
            let exhausted = entries.len() < fetch;
            let names = self.map_groups(entries).await;
            // Unmappable entries leave the window short, fetch past them.
            let missing = wanted.saturating_sub(names.len());
            if exhausted || missing == 0 || fetch >= MAX_GROUP_ENUMERATION {
                break names;
            }
            fetch = fetch.saturating_add(missing).min(MAX_GROUP_ENUMERATION);
        };

        let groups = window(names, limit, offset);
        self.remember(&key, &groups).await;
        groups
    }

    #[instrument(level = "debug", skip(self))]
    async fn group_exists(&self, gid: &str) -> bool {
        if self.member_attr().is_none() {
            return false;
        }
        let key = format!("groupExists{}", gid);
        if let Some(exists) = self.cache.get::<bool>(&key).await {
            return exists;
        }
        let Some(group_dn) = self.group_dn(gid).await else {
            return false;
        };
        // A mapping can outlive its entry, only a successful read proves existence.
        let exists = self
            .client
            .read_attribute(&group_dn, "objectclass")
            .await
            .is_some();
        self.remember(&key, &exists).await;
        exists
    }

    #[instrument(level = "debug", skip(self))]
    async fn group_display_name(&self, gid: &str) -> Option<String> {
        self.member_attr()?;
        let key = format!("groupDisplayName-{}", gid);
        if let Some(name) = self.cache.get::<String>(&key).await {
            return Some(name);
        }
        let group_dn = self.group_dn(gid).await?;
        let name = self
            .client
            .read_attribute(&group_dn, &self.config.group_display_name)
            .await?
            .into_iter()
            .next()?;
        self.remember(&key, &name).await;
        Some(name)
    }

    #[instrument(level = "debug", skip(self))]
    async fn user_exists(&self, uid: &str) -> bool {
        let key = format!("userExists{}", uid);
        if let Some(exists) = self.cache.get::<bool>(&key).await {
            return exists;
        }
        let Some(user_dn) = self.user_dn(uid).await else {
            return false;
        };
        let exists = self
            .client
            .read_entry(&user_dn, &self.config.user_filter, Some(&["objectclass"]))
            .await
            .is_some();
        self.remember(&key, &exists).await;
        exists
    }

    #[instrument(level = "debug", skip(self))]
    async fn login_exists(&self, login: &str) -> bool {
        self.find_login(login).await.len() == 1
    }

    #[instrument(level = "debug", skip_all, fields(login = %login))]
    async fn check_password(&self, login: &str, password: &str) -> Option<String> {
        if password.is_empty() {
            return None;
        }
        let display = self.config.user_display_name.as_str();
        let mut found = self.find_login(login).await;
        if found.len() != 1 {
            debug!(matches = found.len(), "login did not identify exactly one user");
            return None;
        }
        let entry = found.pop()?;

        if !self.client.bind_as(&entry.dn, password).await {
            info!(dn = %entry.dn, "credential check failed");
            return None;
        }
        self.mapper
            .dn_to_local_name(&entry.dn, MappingKind::User, entry.first(display))
            .await
            .map_err(|err| warn!(dn = %entry.dn, ?err, "authenticated user has no local name"))
            .ok()
    }

    fn implements_actions(&self, actions: GroupActions) -> bool {
        (GroupActions::COUNT_USERS | GroupActions::GROUP_DETAILS).contains(actions)
    }

    async fn test_connection(&self) -> bool {
        self.client.test_connection().await
    }

    async fn unbind(&self) {
        self.client.unbind().await;
    }
}
