//! A directory held entirely in memory, for exercising the resolver without a
//! server.
//!
//! Filters are parsed with `ldap3_proto` and evaluated against the stored
//! entries case-insensitively. Paged searches are accounted page by page and
//! an artificial per-page latency can be injected.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use ldap3_proto::proto::{LdapFilter, LdapSubstringFilter};
use tokio::sync::RwLock;
use tokio::time;

use super::{
    dn_in_base, normalize_dn, DirectoryConnection, DirectoryConnector, DirectoryEntry,
    DirectoryError, SearchRequest, SearchScope, DN_VALUED_ATTRS,
};

struct MemoryState {
    entries: RwLock<BTreeMap<String, DirectoryEntry>>,
    passwords: RwLock<HashMap<String, String>>,
    online: AtomicBool,
    paging: AtomicBool,
    latency_ms: AtomicU64,
    searches: AtomicUsize,
    pages: AtomicUsize,
    binds: AtomicUsize,
    last_size_limit: std::sync::Mutex<Option<usize>>,
}

/// Cloning yields a handle to the same directory.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<MemoryState>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        MemoryDirectory::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        MemoryDirectory {
            inner: Arc::new(MemoryState {
                entries: RwLock::new(BTreeMap::new()),
                passwords: RwLock::new(HashMap::new()),
                online: AtomicBool::new(true),
                paging: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                searches: AtomicUsize::new(0),
                pages: AtomicUsize::new(0),
                binds: AtomicUsize::new(0),
                last_size_limit: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn with_paging(self, paging: bool) -> Self {
        self.inner.paging.store(paging, Ordering::Relaxed);
        self
    }

    pub async fn add_entry(&self, entry: DirectoryEntry) {
        self.inner
            .entries
            .write()
            .await
            .insert(entry.dn.clone(), entry);
    }

    pub async fn remove_entry(&self, dn: &str) -> bool {
        self.inner
            .entries
            .write()
            .await
            .remove(&normalize_dn(dn))
            .is_some()
    }

    pub async fn set_password(&self, dn: &str, password: &str) {
        self.inner
            .passwords
            .write()
            .await
            .insert(normalize_dn(dn), password.to_string());
    }

    pub async fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Delay every result page, and every credential check, by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of searches served so far.
    pub fn search_count(&self) -> usize {
        self.inner.searches.load(Ordering::SeqCst)
    }

    /// Number of result pages sent so far. A search without paging is one page.
    pub fn page_count(&self) -> usize {
        self.inner.pages.load(Ordering::SeqCst)
    }

    /// Number of credential checks attempted so far.
    pub fn bind_count(&self) -> usize {
        self.inner.binds.load(Ordering::SeqCst)
    }

    /// The size limit carried by the most recent search.
    pub fn last_size_limit(&self) -> Option<usize> {
        self.inner
            .last_size_limit
            .lock()
            .map(|limit| *limit)
            .unwrap_or(None)
    }

    fn online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency_ms.load(Ordering::SeqCst))
    }

    /// Wait out the latency of one page, failing like a real session would
    /// when it exceeds the operation timeout.
    async fn send_page(&self, timeout: Duration) -> Result<(), DirectoryError> {
        let latency = self.latency();
        if latency > timeout {
            time::sleep(timeout).await;
            return Err(DirectoryError::Timeout);
        }
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
        self.inner.pages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DirectoryConnector for MemoryDirectory {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        if !self.online() {
            return Err(DirectoryError::Connection);
        }
        Ok(Box::new(MemoryConnection { dir: self.clone() }))
    }

    async fn check_bind(&self, dn: &str, password: &str) -> Result<bool, DirectoryError> {
        if !self.online() {
            return Err(DirectoryError::Connection);
        }
        self.inner.binds.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency();
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
        let passwords = self.inner.passwords.read().await;
        Ok(passwords
            .get(&normalize_dn(dn))
            .map(|p| p == password)
            .unwrap_or(false))
    }

    fn supports_paging(&self) -> bool {
        self.inner.paging.load(Ordering::Relaxed)
    }
}

struct MemoryConnection {
    dir: MemoryDirectory,
}

#[async_trait]
impl DirectoryConnection for MemoryConnection {
    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        if !self.dir.online() {
            return Err(DirectoryError::Connection);
        }
        self.dir.inner.searches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.dir.inner.last_size_limit.lock() {
            *last = request.size_limit;
        }

        let filter = parse_filter(&request.filter)?;
        let base = normalize_dn(&request.base);
        let attrs = request.attrs.as_deref();

        let found: Vec<DirectoryEntry> = {
            let entries = self.dir.inner.entries.read().await;
            match request.scope {
                SearchScope::Base => {
                    let entry = entries.get(&base).ok_or(DirectoryError::NoSuchObject)?;
                    if matches(&filter, entry) {
                        vec![entry.project(attrs)]
                    } else {
                        Vec::new()
                    }
                }
                SearchScope::Subtree => entries
                    .values()
                    .filter(|e| dn_in_base(&e.dn, &base))
                    .filter(|e| matches(&filter, e))
                    .take(request.size_limit.unwrap_or(usize::MAX))
                    .map(|e| e.project(attrs))
                    .collect(),
            }
        };

        let pages = if request.page_size > 0 && request.scope == SearchScope::Subtree {
            found.len().div_ceil(request.page_size).max(1)
        } else {
            1
        };
        for _ in 0..pages {
            self.dir.send_page(request.timeout).await?;
        }
        Ok(found)
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// Parse a filter string. A bare `attr=value` without parentheses is accepted,
/// as are the empty `(&)` and `(|)` forms.
fn parse_filter(input: &str) -> Result<LdapFilter, DirectoryError> {
    let input = input.trim();
    match input {
        "(&)" => return Ok(LdapFilter::And(Vec::new())),
        "(|)" => return Ok(LdapFilter::Or(Vec::new())),
        _ => {}
    }
    let wrapped;
    let input = if input.starts_with('(') {
        input
    } else {
        wrapped = format!("({})", input);
        wrapped.as_str()
    };
    ldap3_proto::parse_ldap_filter_str(input)
        .map_err(|e| DirectoryError::Protocol(format!("invalid filter {:?}: {}", input, e)))
}

fn matches(filter: &LdapFilter, entry: &DirectoryEntry) -> bool {
    match filter {
        LdapFilter::And(items) => items.iter().all(|f| matches(f, entry)),
        LdapFilter::Or(items) => items.iter().any(|f| matches(f, entry)),
        LdapFilter::Not(inner) => !matches(inner, entry),
        LdapFilter::Present(attr) => {
            attr.eq_ignore_ascii_case("objectclass") || entry.get(attr).is_some()
        }
        LdapFilter::Equality(attr, value) | LdapFilter::Approx(attr, value) => {
            let wanted = canonical(attr, &unescape(value));
            values(entry, attr).any(|v| canonical(attr, v) == wanted)
        }
        LdapFilter::GreaterOrEqual(attr, value) => {
            let value = unescape(value);
            values(entry, attr).any(|v| compare(v, &value) != CmpOrdering::Less)
        }
        LdapFilter::LessOrEqual(attr, value) => {
            let value = unescape(value);
            values(entry, attr).any(|v| compare(v, &value) != CmpOrdering::Greater)
        }
        LdapFilter::Substring(attr, sub) => {
            values(entry, attr).any(|v| substring_match(&v.to_lowercase(), sub))
        }
        LdapFilter::Extensible(_) => false,
    }
}

fn values<'a>(entry: &'a DirectoryEntry, attr: &str) -> impl Iterator<Item = &'a String> + 'a {
    entry.get(attr).unwrap_or(&[]).iter()
}

fn canonical(attr: &str, value: &str) -> String {
    if DN_VALUED_ATTRS.contains(&attr.to_lowercase().as_str()) {
        normalize_dn(value)
    } else {
        value.to_lowercase()
    }
}

fn compare(a: &str, b: &str) -> CmpOrdering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

fn substring_match(value: &str, sub: &LdapSubstringFilter) -> bool {
    let mut rest = value;
    if let Some(initial) = &sub.initial {
        match rest.strip_prefix(unescape(initial).to_lowercase().as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in &sub.any {
        let part = unescape(part).to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match &sub.final_ {
        Some(last) => rest.ends_with(unescape(last).to_lowercase().as_str()),
        None => true,
    }
}

/// Decode `\xx` hex escapes from an assertion value. A backslash before any
/// other character keeps that character literally.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'\\' {
            out.push(bytes[idx]);
            idx += 1;
            continue;
        }
        let hex = bytes
            .get(idx + 1..idx + 3)
            .and_then(|pair| std::str::from_utf8(pair).ok())
            .and_then(|pair| u8::from_str_radix(pair, 16).ok());
        match hex {
            Some(byte) => {
                out.push(byte);
                idx += 3;
            }
            None => {
                out.extend(bytes.get(idx + 1).copied());
                idx += 2;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::escape_filter_part;

    fn person() -> DirectoryEntry {
        DirectoryEntry::new(
            "uid=alice,ou=people,dc=example,dc=com",
            vec![
                ("objectClass", vec!["top".to_string(), "inetOrgPerson".to_string()]),
                ("uid", vec!["alice".to_string()]),
                ("displayName", vec!["Alice Liddell".to_string()]),
                ("uidNumber", vec!["1000".to_string()]),
                ("memberOf", vec!["cn=Engineers, ou=groups,dc=example,dc=com".to_string()]),
            ],
        )
    }

    fn check(filter: &str, entry: &DirectoryEntry) -> bool {
        let parsed = parse_filter(filter).expect("Failed to parse filter");
        matches(&parsed, entry)
    }

    fn request(base: &str, filter: &str) -> SearchRequest {
        SearchRequest {
            base: base.to_string(),
            scope: SearchScope::Subtree,
            filter: filter.to_string(),
            attrs: None,
            size_limit: None,
            page_size: 0,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_filter_equality_and_presence() {
        let e = person();
        assert!(check("uid=alice", &e));
        assert!(check("(UID=ALICE)", &e));
        assert!(check("(objectclass=inetorgperson)", &e));
        assert!(check("(displayName=*)", &e));
        assert!(!check("(mail=*)", &e));
        // Generated assertions escape the separators of a dn value.
        let member_of = format!(
            "(memberof={})",
            escape_filter_part("cn=engineers,ou=groups,dc=example,dc=com", false)
        );
        assert!(check(&member_of, &e));
        let display = format!("(displayname={})", escape_filter_part("alice liddell", false));
        assert!(check(&display, &e));
    }

    #[test]
    fn test_filter_boolean() {
        let e = person();
        assert!(check("(&(objectClass=inetOrgPerson)(|(uid=bob)(uid=alice)))", &e));
        assert!(!check("(&(objectClass=inetOrgPerson)(!(uid=alice)))", &e));
        assert!(check("(&)", &e));
        assert!(!check("(|)", &e));
    }

    #[test]
    fn test_filter_substring_and_ordering() {
        let e = person();
        assert!(check("(displayName=ali*)", &e));
        assert!(check("(displayName=*lid*)", &e));
        assert!(check("(displayName=a*e*ll)", &e));
        assert!(!check("(displayName=bob*)", &e));
        assert!(check("(uidNumber>=999)", &e));
        assert!(!check("(uidNumber<=999)", &e));
    }

    #[test]
    fn test_filter_escapes() {
        let e = DirectoryEntry::new("cn=x,dc=com", vec![("cn", vec!["a*(b)".to_string()])]);
        assert!(check("(cn=a\\2a\\28b\\29)", &e));
        assert!(!check("(cn=a\\2ab)", &e));
        assert!(check(&format!("(cn={})", escape_filter_part("a*(b)", false)), &e));
        assert_eq!(unescape("x\\5cy\\3dz"), "x\\y=z");
    }

    #[test]
    fn test_filter_invalid() {
        assert!(parse_filter("(uid=alice").is_err());
        assert!(parse_filter("(&(uid=a)").is_err());
        assert!(parse_filter("(=a)").is_err());
        assert!(parse_filter("(uid=a))").is_err());
    }

    #[tokio::test]
    async fn test_memory_search_scope_and_projection() {
        let dir = MemoryDirectory::new();
        dir.add_entry(DirectoryEntry::new(
            "uid=alice,ou=people,dc=example,dc=com",
            vec![
                ("uid", vec!["alice".to_string()]),
                ("mail", vec!["alice@example.com".to_string()]),
            ],
        ))
        .await;
        dir.add_entry(DirectoryEntry::new(
            "cn=admins,ou=groups,dc=example,dc=com",
            vec![("cn", vec!["admins".to_string()])],
        ))
        .await;

        let mut conn = dir.connect().await.expect("Failed to connect");
        let request = SearchRequest {
            attrs: Some(vec!["uid".to_string()]),
            ..request("ou=People,dc=example,dc=com", "(objectClass=*)")
        };
        let found = conn.search(&request).await.expect("Search failed");
        assert_eq!(found.len(), 1);
        assert!(found[0].get("mail").is_none());
        assert_eq!(found[0].first("uid"), Some("alice"));

        let request = SearchRequest {
            base: "cn=missing,ou=groups,dc=example,dc=com".to_string(),
            scope: SearchScope::Base,
            ..request
        };
        assert!(matches!(
            conn.search(&request).await,
            Err(DirectoryError::NoSuchObject)
        ));
        assert_eq!(dir.search_count(), 2);

        assert!(dir.remove_entry("uid=alice,ou=people,dc=example,dc=com").await);
        dir.set_online(false).await;
        assert!(dir.connect().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_paging_and_latency() {
        let dir = MemoryDirectory::new();
        for idx in 0..5 {
            dir.add_entry(DirectoryEntry::new(
                &format!("uid=u{},ou=people,dc=example,dc=com", idx),
                vec![("uid", vec![format!("u{}", idx)])],
            ))
            .await;
        }
        let mut conn = dir.connect().await.expect("Failed to connect");

        let paged = SearchRequest {
            page_size: 2,
            ..request("ou=people,dc=example,dc=com", "(uid=*)")
        };
        assert_eq!(conn.search(&paged).await.expect("Search failed").len(), 5);
        assert_eq!(dir.page_count(), 3);

        let limited = SearchRequest {
            size_limit: Some(2),
            ..paged.clone()
        };
        assert_eq!(conn.search(&limited).await.expect("Search failed").len(), 2);
        assert_eq!(dir.page_count(), 4);
        assert_eq!(dir.last_size_limit(), Some(2));

        // Each page is within the operation timeout, the whole search is not.
        dir.set_latency(Duration::from_secs(1));
        let started = time::Instant::now();
        assert_eq!(conn.search(&paged).await.expect("Search failed").len(), 5);
        assert!(started.elapsed() >= Duration::from_secs(3));

        dir.set_latency(Duration::from_secs(3));
        assert!(matches!(
            conn.search(&paged).await,
            Err(DirectoryError::Timeout)
        ));
    }
}
