//! Dispatch of queries across several configured directory servers.
//!
//! Owner lookups are sent to the backend last seen answering for the subject,
//! falling back to trying every backend in configuration order. Enumerations
//! are merged across all backends.

use std::sync::Arc;

use crate::backend::{DirectoryBackend, GroupActions, LdapBackend, Lookup, LookupOutcome, Subject};
use crate::cache::{BackendCache, CacheStore};
use crate::db::MappingStore;
use crate::ldap_config::{ConfigError, ResolverConfig};
use crate::utils::{natural_sort_dedup, window};

const AFFINITY_PREFIX: &str = "proxy:";

fn affinity_key(subject: &Subject<'_>) -> String {
    match subject {
        Subject::Group(gid) => format!("groupAffinity:{}", gid),
        Subject::User(uid) => format!("userAffinity:{}", uid),
        Subject::Login(login) => format!("loginAffinity:{}", login),
    }
}

pub struct GroupProxy {
    backends: Vec<Arc<dyn DirectoryBackend>>,
    cache: BackendCache,
}

impl GroupProxy {
    pub fn new(backends: Vec<Arc<dyn DirectoryBackend>>, cache: Arc<dyn CacheStore>) -> Self {
        GroupProxy {
            backends,
            cache: BackendCache::new(AFFINITY_PREFIX, cache),
        }
    }

    /// One [LdapBackend] per configured server, sharing the mapping store and
    /// the cache.
    pub fn from_config(
        config: &ResolverConfig,
        store: Arc<dyn MappingStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ConfigError> {
        if config.servers.is_empty() {
            return Err(ConfigError::Missing("server"));
        }
        let backends = config
            .servers
            .iter()
            .map(|server| {
                LdapBackend::new(server.clone(), store.clone(), cache.clone())
                    .map(|b| Arc::new(b) as Arc<dyn DirectoryBackend>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupProxy::new(backends, cache))
    }

    pub fn backends(&self) -> &[Arc<dyn DirectoryBackend>] {
        &self.backends
    }

    async fn affine_backend(&self, subject: &Subject<'_>) -> Option<&Arc<dyn DirectoryBackend>> {
        let prefix = self.cache.get::<String>(&affinity_key(subject)).await?;
        if prefix.is_empty() {
            return None;
        }
        self.backends.iter().find(|b| b.prefix() == prefix)
    }

    async fn set_affinity(&self, subject: &Subject<'_>, prefix: &str) {
        self.cache.set(&affinity_key(subject), &prefix).await;
    }

    /// Ask every backend in order, returning the first found result and
    /// remembering which backend gave it.
    pub async fn walk_all(&self, lookup: &Lookup) -> LookupOutcome {
        let subject = lookup.subject();
        for backend in &self.backends {
            let outcome = backend.lookup(lookup).await;
            if outcome.is_found() {
                trace!(prefix = %backend.prefix(), ?subject, "affinity recorded");
                self.set_affinity(&subject, backend.prefix()).await;
                return outcome;
            }
        }
        lookup.empty()
    }

    /// Ask the affine backend, if any. An empty answer from it stands unless
    /// the subject has disappeared from that backend, in which case the
    /// affinity is dropped and every backend is asked.
    pub async fn call_affine_first(&self, lookup: &Lookup) -> LookupOutcome {
        let subject = lookup.subject();
        let Some(backend) = self.affine_backend(&subject).await else {
            return self.walk_all(lookup).await;
        };

        let outcome = backend.lookup(lookup).await;
        if outcome.is_found() {
            return outcome;
        }
        if backend.subject_exists(&subject).await {
            return outcome;
        }

        debug!(prefix = %backend.prefix(), ?subject, "subject gone from affine backend");
        self.set_affinity(&subject, "").await;
        self.walk_all(lookup).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn in_group(&self, uid: &str, gid: &str) -> bool {
        let lookup = Lookup::InGroup {
            uid: uid.to_string(),
            gid: gid.to_string(),
        };
        self.call_affine_first(&lookup).await.is_found()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn group_exists(&self, gid: &str) -> bool {
        let lookup = Lookup::GroupExists {
            gid: gid.to_string(),
        };
        self.call_affine_first(&lookup).await.is_found()
    }

    pub async fn count_users_in_group(&self, gid: &str, search: &str) -> usize {
        let lookup = Lookup::CountUsersInGroup {
            gid: gid.to_string(),
            search: search.to_string(),
        };
        match self.call_affine_first(&lookup).await {
            LookupOutcome::Count(count) => count,
            _ => 0,
        }
    }

    pub async fn group_display_name(&self, gid: &str) -> Option<String> {
        let lookup = Lookup::GroupDisplayName {
            gid: gid.to_string(),
        };
        match self.call_affine_first(&lookup).await {
            LookupOutcome::Name(name) => name,
            _ => None,
        }
    }

    pub async fn user_exists(&self, uid: &str) -> bool {
        let lookup = Lookup::UserExists {
            uid: uid.to_string(),
        };
        self.call_affine_first(&lookup).await.is_found()
    }

    #[instrument(level = "debug", skip_all, fields(login = %login))]
    pub async fn check_password(&self, login: &str, password: &str) -> Option<String> {
        let lookup = Lookup::CheckPassword {
            login: login.to_string(),
            password: password.to_string(),
        };
        match self.call_affine_first(&lookup).await {
            LookupOutcome::Name(name) => name,
            _ => None,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_user_groups(&self, uid: &str) -> Vec<String> {
        let mut groups = Vec::new();
        for backend in &self.backends {
            groups.extend(backend.list_groups_for_user(uid).await);
        }
        natural_sort_dedup(groups)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn users_in_group(
        &self,
        gid: &str,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<String> {
        let mut users = Vec::new();
        for backend in &self.backends {
            users.extend(backend.users_in_group(gid, search, None, 0).await);
        }
        window(natural_sort_dedup(users), limit, offset)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_groups(&self, search: &str, limit: Option<usize>, offset: usize) -> Vec<String> {
        let mut groups = Vec::new();
        for backend in &self.backends {
            groups.extend(backend.list_groups(search, None, 0).await);
        }
        window(natural_sort_dedup(groups), limit, offset)
    }

    pub fn implements_actions(&self, actions: GroupActions) -> bool {
        self.backends
            .first()
            .map(|b| b.implements_actions(actions))
            .unwrap_or(false)
    }

    pub async fn unbind(&self) {
        for backend in &self.backends {
            backend.unbind().await;
        }
    }
}
