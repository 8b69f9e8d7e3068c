//! Access to a single configured directory server.
//!
//! The [DirectoryClient] owns the connection lifecycle of one server and exposes
//! a fail-soft query surface: a server that can't be reached, doesn't answer in
//! time or rejects a query yields an empty result rather than an error. Whether
//! the server is reachable at all is reported separately by
//! [DirectoryClient::is_online].

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time;

use crate::ldap_config::ServerConfig;

pub mod ldap;
pub mod memory;

/// Attributes whose values are distinguished names, and so are normalised the
/// same way entry names are.
const DN_VALUED_ATTRS: [&str; 4] = ["dn", "member", "uniquemember", "memberof"];

#[derive(Debug)]
pub enum DirectoryError {
    /// The server could not be reached, or the session was lost.
    Connection,
    /// The server refused the configured credentials.
    Bind,
    /// The operation did not complete within the configured timeout.
    Timeout,
    /// The server rejected the request.
    Protocol(String),
    /// The base of the search does not exist.
    NoSuchObject,
}

impl DirectoryError {
    /// Whether the underlying session should be considered lost.
    fn is_transport(&self) -> bool {
        matches!(
            self,
            DirectoryError::Connection | DirectoryError::Bind | DirectoryError::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    Subtree,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    /// Lowercased attribute names to return. `None` requests the full entry.
    pub attrs: Option<Vec<String>>,
    /// Stop once this many entries have been received.
    pub size_limit: Option<usize>,
    /// Page size for the paged results control. Zero disables paging.
    pub page_size: usize,
    /// Limit on each single exchange with the server. For a paged search this
    /// applies to every page, not to the whole search.
    pub timeout: Duration,
}

impl SearchRequest {
    pub fn is_paged(&self) -> bool {
        self.page_size > 0 && self.scope == SearchScope::Subtree
    }
}

/// An entry as returned from the directory. Its name and the values of the
/// dn-valued attributes are normalised, attribute names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new<I, K>(dn: &str, attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<String>)>,
        K: AsRef<str>,
    {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, values) in attrs {
            let name = name.as_ref().to_lowercase();
            let values = if DN_VALUED_ATTRS.contains(&name.as_str()) {
                values.iter().map(|v| normalize_dn(v)).collect()
            } else {
                values
            };
            map.entry(name).or_default().extend(values);
        }
        DirectoryEntry {
            dn: normalize_dn(dn),
            attrs: map,
        }
    }

    /// Values of an attribute, matched case-insensitively. Attributes without
    /// values are treated as absent.
    pub fn get(&self, attr: &str) -> Option<&[String]> {
        let attr = attr.to_lowercase();
        if attr == "dn" {
            return Some(std::slice::from_ref(&self.dn));
        }
        self.attrs
            .get(&attr)
            .filter(|v| !v.is_empty())
            .map(|v| v.as_slice())
    }

    pub fn first(&self, attr: &str) -> Option<&str> {
        self.get(attr)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// Restrict the entry to the requested attributes.
    pub(crate) fn project(&self, attrs: Option<&[String]>) -> DirectoryEntry {
        match attrs {
            None => self.clone(),
            Some(wanted) => DirectoryEntry {
                dn: self.dn.clone(),
                attrs: self
                    .attrs
                    .iter()
                    .filter(|(k, _)| wanted.iter().any(|w| w.eq_ignore_ascii_case(k)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        }
    }
}

/// Establishes sessions to a directory server.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Open a session and bind it with the configured service credentials.
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, DirectoryError>;

    /// Check a credential pair on a throwaway session.
    async fn check_bind(&self, dn: &str, password: &str) -> Result<bool, DirectoryError>;

    fn supports_paging(&self) -> bool;
}

#[async_trait]
pub trait DirectoryConnection: Send {
    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn unbind(&mut self) -> Result<(), DirectoryError>;
}

enum ConnState {
    Disconnected,
    Online(Box<dyn DirectoryConnection>),
    OfflineNextCheck(SystemTime),
}

pub struct DirectoryClient {
    prefix: String,
    connector: Box<dyn DirectoryConnector>,
    state: Mutex<ConnState>,
    timeout: Duration,
    enumeration_timeout: Duration,
    offline_check: Duration,
    paging_size: usize,
}

impl DirectoryClient {
    pub fn new(connector: Box<dyn DirectoryConnector>, config: &ServerConfig) -> Self {
        let paging_size = if connector.supports_paging() {
            config.paging_size
        } else {
            0
        };
        DirectoryClient {
            prefix: config.prefix.clone(),
            connector,
            state: Mutex::new(ConnState::Disconnected),
            timeout: config.conn_timeout(),
            enumeration_timeout: config.enumeration_timeout(),
            offline_check: config.offline_check(),
            paging_size,
        }
    }

    pub fn supports_paging(&self) -> bool {
        self.paging_size > 0
    }

    pub async fn is_online(&self) -> bool {
        matches!(*self.state.lock().await, ConnState::Online(_))
    }

    /// Attempt to reach the server now, ignoring any pending offline window.
    pub async fn test_connection(&self) -> bool {
        let mut state = self.state.lock().await;
        if let ConnState::OfflineNextCheck(_) = *state {
            *state = ConnState::Disconnected;
        }
        self.ensure_connected(&mut state).await.is_ok()
    }

    pub async fn unbind(&self) {
        let mut state = self.state.lock().await;
        if let ConnState::Online(conn) = &mut *state {
            match time::timeout(self.timeout, conn.unbind()).await {
                Ok(Ok(())) => debug!(prefix = %self.prefix, "unbound from directory"),
                Ok(Err(err)) => debug!(prefix = %self.prefix, ?err, "unbind failed"),
                Err(_) => debug!(prefix = %self.prefix, "unbind timed out"),
            }
        }
        *state = ConnState::Disconnected;
    }

    fn set_offline(&self, state: &mut ConnState) {
        let next = SystemTime::now() + self.offline_check;
        *state = ConnState::OfflineNextCheck(next);
    }

    async fn ensure_connected(&self, state: &mut ConnState) -> Result<(), DirectoryError> {
        match state {
            ConnState::Online(_) => return Ok(()),
            ConnState::OfflineNextCheck(next) if SystemTime::now() < *next => {
                trace!(prefix = %self.prefix, "directory is offline, not retrying yet");
                return Err(DirectoryError::Connection);
            }
            _ => {}
        }

        match time::timeout(self.timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => {
                debug!(prefix = %self.prefix, "directory connection established");
                *state = ConnState::Online(conn);
                Ok(())
            }
            Ok(Err(err)) => {
                error!(prefix = %self.prefix, ?err, "unable to connect to directory");
                self.set_offline(state);
                Err(err)
            }
            Err(_) => {
                error!(prefix = %self.prefix, "timed out connecting to directory");
                self.set_offline(state);
                Err(DirectoryError::Timeout)
            }
        }
    }

    async fn execute(&self, request: &SearchRequest) -> Vec<DirectoryEntry> {
        let mut state = self.state.lock().await;
        if self.ensure_connected(&mut state).await.is_err() {
            return Vec::new();
        }
        let ConnState::Online(conn) = &mut *state else {
            return Vec::new();
        };

        // A paged search is bounded per page by the request timeout, and as a
        // whole by the larger enumeration budget.
        let paged = request.is_paged();
        let budget = if paged {
            self.enumeration_timeout.max(self.timeout)
        } else {
            self.timeout
        };
        let result = time::timeout(budget, conn.search(request)).await;
        match result {
            Ok(Ok(entries)) => entries,
            Ok(Err(DirectoryError::NoSuchObject)) => {
                trace!(base = %request.base, "search base does not exist");
                Vec::new()
            }
            Ok(Err(err)) => {
                warn!(prefix = %self.prefix, base = %request.base, filter = %request.filter, ?err, "directory search failed");
                if err.is_transport() {
                    self.set_offline(&mut state);
                }
                Vec::new()
            }
            Err(_) if paged => {
                // Every page arrived in time, the server is slow rather than gone.
                // The session is dropped mid-search and reopened on next use.
                warn!(prefix = %self.prefix, base = %request.base, ?budget, "paged search exceeded the enumeration budget");
                *state = ConnState::Disconnected;
                Vec::new()
            }
            Err(_) => {
                warn!(prefix = %self.prefix, base = %request.base, "directory search timed out");
                self.set_offline(&mut state);
                Vec::new()
            }
        }
    }

    /// Subtree search under `base`. `None` attributes returns full entries.
    #[instrument(level = "debug", skip(self, attrs))]
    pub async fn search(
        &self,
        base: &str,
        filter: &str,
        attrs: Option<&[&str]>,
    ) -> Vec<DirectoryEntry> {
        self.search_window(base, filter, attrs, None).await
    }

    async fn search_window(
        &self,
        base: &str,
        filter: &str,
        attrs: Option<&[&str]>,
        size_limit: Option<usize>,
    ) -> Vec<DirectoryEntry> {
        let request = SearchRequest {
            base: base.to_string(),
            scope: SearchScope::Subtree,
            filter: filter.to_string(),
            attrs: attrs.map(|a| a.iter().map(|s| s.to_lowercase()).collect()),
            size_limit,
            page_size: self.paging_size,
            timeout: self.timeout,
        };
        self.execute(&request).await
    }

    /// Search every base in turn, then apply the window to the concatenated
    /// result.
    pub async fn search_bases(
        &self,
        bases: &[String],
        filter: &str,
        attrs: Option<&[&str]>,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<DirectoryEntry> {
        let wanted = limit.map(|l| l.saturating_add(offset));
        let mut entries: Vec<DirectoryEntry> = Vec::new();
        for base in bases.iter().filter(|b| !b.trim().is_empty()) {
            let remaining = wanted.map(|w| w.saturating_sub(entries.len()));
            if remaining == Some(0) {
                break;
            }
            let found = self.search_window(base, filter, attrs, remaining).await;
            for entry in found {
                if !entries.iter().any(|e| e.dn == entry.dn) {
                    entries.push(entry);
                }
            }
        }

        let window = entries.into_iter().skip(offset);
        match limit {
            Some(l) => window.take(l).collect(),
            None => window.collect(),
        }
    }

    /// Base-scope read of `dn`, returned only when it matches `filter`.
    pub async fn read_entry(
        &self,
        dn: &str,
        filter: &str,
        attrs: Option<&[&str]>,
    ) -> Option<DirectoryEntry> {
        let request = SearchRequest {
            base: dn.to_string(),
            scope: SearchScope::Base,
            filter: combine_and(&[filter]),
            attrs: attrs.map(|a| a.iter().map(|s| s.to_lowercase()).collect()),
            size_limit: Some(1),
            page_size: 0,
            timeout: self.timeout,
        };
        self.execute(&request).await.into_iter().next()
    }

    pub async fn read_attribute(&self, dn: &str, attr: &str) -> Option<Vec<String>> {
        self.read_attribute_filtered(dn, attr, "objectClass=*").await
    }

    pub async fn read_attribute_filtered(
        &self,
        dn: &str,
        attr: &str,
        filter: &str,
    ) -> Option<Vec<String>> {
        let entry = self.read_entry(dn, filter, Some(&[attr])).await?;
        entry.get(attr).map(|values| values.to_vec())
    }

    /// Validate a credential pair without disturbing the service session.
    pub async fn bind_as(&self, dn: &str, password: &str) -> bool {
        if dn.is_empty() || password.is_empty() {
            // An empty password is an unauthenticated bind, which most servers accept.
            debug!("refusing credential check with empty dn or password");
            return false;
        }
        match time::timeout(self.timeout, self.connector.check_bind(dn, password)).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(err)) => {
                warn!(prefix = %self.prefix, ?err, "credential check failed");
                false
            }
            Err(_) => {
                warn!(prefix = %self.prefix, "credential check timed out");
                false
            }
        }
    }
}

/// Canonical form of a distinguished name for comparison and cache keys.
/// Whitespace following an unescaped comma is dropped and the result lowercased.
pub fn normalize_dn(dn: &str) -> String {
    let mut out = String::with_capacity(dn.len());
    let mut escaped = false;
    let mut skip_ws = false;
    for c in dn.trim().chars() {
        if skip_ws && c.is_whitespace() {
            continue;
        }
        skip_ws = false;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            skip_ws = true;
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Whether `dn` is `base` or lies beneath it. Both must be normalised.
pub fn dn_in_base(dn: &str, base: &str) -> bool {
    if base.is_empty() {
        return false;
    }
    dn == base
        || dn
            .strip_suffix(base)
            .map(|head| head.ends_with(','))
            .unwrap_or(false)
}

fn combine(filters: &[&str], operator: char) -> String {
    let mut combined = String::from("(");
    combined.push(operator);
    for part in filters.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        if part.starts_with('(') {
            combined.push_str(part);
        } else {
            combined.push('(');
            combined.push_str(part);
            combined.push(')');
        }
    }
    combined.push(')');
    combined
}

pub fn combine_and(filters: &[&str]) -> String {
    combine(filters, '&')
}

pub fn combine_or(filters: &[&str]) -> String {
    combine(filters, '|')
}

/// Escape user input for use inside a filter assertion. A leading `*` may be
/// kept to allow a suffix match.
///
/// Besides the RFC 4515 specials, whitespace, quotes and the operator
/// characters are hex escaped too, so a dn or a name with spaces is a single
/// bare assertion value.
pub fn escape_filter_part(input: &str, allow_leading_asterisk: bool) -> String {
    match input.strip_prefix('*') {
        Some(rest) if allow_leading_asterisk => format!("*{}", escape_value(rest)),
        _ => escape_value(input),
    }
}

fn escape_value(input: &str) -> String {
    let escaped = ::ldap3::ldap_escape(input);
    let mut out = String::with_capacity(escaped.len());
    for c in escaped.chars() {
        match c {
            '=' | '~' | '<' | '>' | '!' | '&' | '|' | '"' | ' ' | '\t' | '\n' => {
                out.push_str(&format!("\\{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out
}

/// Build the filter fragment matching `search` as a prefix of the given
/// attributes, falling back to `fallback_attr` when none are configured.
/// A multi-word search against several attributes requires every word to
/// match at least one attribute.
pub fn search_filter_part(search: &str, attrs: &[String], fallback_attr: &str) -> String {
    let search = search.trim();
    let term = |word: &str| {
        if word.is_empty() {
            "*".to_string()
        } else {
            format!("{}*", escape_filter_part(word, true))
        }
    };

    if attrs.len() >= 2 && search.contains(' ') {
        let words: Vec<String> = search
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(|word| {
                let t = term(word);
                let parts: Vec<String> = attrs.iter().map(|a| format!("{}={}", a, t)).collect();
                combine_or(&parts.iter().map(|s| s.as_str()).collect::<Vec<_>>())
            })
            .collect();
        return combine_and(&words.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    let t = term(search);
    if attrs.is_empty() {
        if fallback_attr.is_empty() {
            return String::new();
        }
        return format!("{}={}", fallback_attr, t);
    }
    let parts: Vec<String> = attrs.iter().map(|a| format!("{}={}", a, t)).collect();
    combine_or(&parts.iter().map(|s| s.as_str()).collect::<Vec<_>>())
}
