//! LDAPv3 transport over the `ldap3` crate.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::adapters::PagedResults;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchOptions};

use super::{DirectoryConnection, DirectoryConnector, DirectoryEntry, DirectoryError, SearchRequest, SearchScope};
use crate::ldap_config::ServerConfig;

const RC_SUCCESS: u32 = 0;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;

impl From<LdapError> for DirectoryError {
    fn from(err: LdapError) -> Self {
        match err {
            LdapError::LdapResult { result } if result.rc == RC_NO_SUCH_OBJECT => {
                DirectoryError::NoSuchObject
            }
            LdapError::LdapResult { result } if result.rc == RC_INVALID_CREDENTIALS => {
                DirectoryError::Bind
            }
            LdapError::LdapResult { result } => {
                DirectoryError::Protocol(format!("rc={} {}", result.rc, result.text))
            }
            LdapError::Timeout { .. } => DirectoryError::Timeout,
            LdapError::FilterParsing => DirectoryError::Protocol("invalid filter".to_string()),
            other => {
                debug!(err = ?other, "ldap transport error");
                DirectoryError::Connection
            }
        }
    }
}

pub struct LdapConnector {
    uri: String,
    starttls: bool,
    timeout: Duration,
    bind_dn: String,
    bind_password: String,
}

impl LdapConnector {
    pub fn new(config: &ServerConfig) -> Self {
        LdapConnector {
            uri: config.uri.clone(),
            starttls: config.starttls,
            timeout: config.conn_timeout(),
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone(),
        }
    }

    fn settings(&self) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.starttls)
    }

    async fn open(&self) -> Result<Ldap, DirectoryError> {
        let (conn, ldap) = LdapConnAsync::with_settings(self.settings(), &self.uri).await?;
        ldap3::drive!(conn);
        Ok(ldap)
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        let mut ldap = self.open().await?;

        // Both empty is an anonymous session, which needs no bind at all.
        if !(self.bind_dn.is_empty() && self.bind_password.is_empty()) {
            ldap.simple_bind(&self.bind_dn, &self.bind_password)
                .await?
                .success()?;
        }

        Ok(Box::new(LdapConnection { ldap }))
    }

    async fn check_bind(&self, dn: &str, password: &str) -> Result<bool, DirectoryError> {
        let mut ldap = self.open().await?;
        let result = ldap.with_timeout(self.timeout).simple_bind(dn, password).await?;
        let _ = ldap.unbind().await;
        match result.rc {
            RC_SUCCESS => Ok(true),
            RC_INVALID_CREDENTIALS => Ok(false),
            rc => Err(DirectoryError::Protocol(format!("bind rc={} {}", rc, result.text))),
        }
    }

    fn supports_paging(&self) -> bool {
        true
    }
}

pub struct LdapConnection {
    ldap: Ldap,
}

impl LdapConnection {
    fn options(request: &SearchRequest) -> SearchOptions {
        let options = SearchOptions::new();
        match request.size_limit {
            Some(limit) => options.sizelimit(i32::try_from(limit).unwrap_or(i32::MAX)),
            None => options,
        }
    }

    fn check_rc(rc: u32, text: &str) -> Result<(), DirectoryError> {
        match rc {
            RC_SUCCESS | RC_SIZE_LIMIT_EXCEEDED => Ok(()),
            RC_NO_SUCH_OBJECT => Err(DirectoryError::NoSuchObject),
            rc => Err(DirectoryError::Protocol(format!("rc={} {}", rc, text))),
        }
    }
}

/// Textual form of a binary security identifier, `S-1-5-21-...`.
fn sid_to_string(sid: &[u8]) -> Option<String> {
    let revision = *sid.first()?;
    let count = usize::from(*sid.get(1)?);
    if sid.len() != 8 + 4 * count {
        return None;
    }
    let authority = sid[2..8]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let mut out = format!("S-{}-{}", revision, authority);
    for sub in sid[8..].chunks_exact(4) {
        let sub = u32::from_le_bytes([sub[0], sub[1], sub[2], sub[3]]);
        out.push_str(&format!("-{}", sub));
    }
    Some(out)
}

/// Binary values are dropped, except security identifiers which are kept in
/// their textual form.
fn convert(entry: SearchEntry) -> DirectoryEntry {
    let SearchEntry {
        dn,
        attrs,
        bin_attrs,
    } = entry;
    let sids = bin_attrs
        .into_iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("objectsid"))
        .map(|(name, values)| {
            let values: Vec<String> = values.iter().filter_map(|v| sid_to_string(v)).collect();
            (name, values)
        });
    DirectoryEntry::new(&dn, attrs.into_iter().chain(sids))
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let scope = match request.scope {
            SearchScope::Base => Scope::Base,
            SearchScope::Subtree => Scope::Subtree,
        };
        let attrs: Vec<String> = request
            .attrs
            .clone()
            .unwrap_or_else(|| vec!["*".to_string()]);

        if !request.is_paged() {
            let result = self
                .ldap
                .with_timeout(request.timeout)
                .with_search_options(Self::options(request))
                .search(&request.base, scope, &request.filter, attrs)
                .await?;
            let (entries, res) = (result.0, result.1);
            Self::check_rc(res.rc, &res.text)?;
            return Ok(entries
                .into_iter()
                .map(SearchEntry::construct)
                .map(convert)
                .collect());
        }

        let adapter: PagedResults<String, Vec<String>> = PagedResults::new(
            i32::try_from(request.page_size).unwrap_or(i32::MAX),
        );
        // The operation timeout carries over to every page the adapter requests.
        let mut stream = self
            .ldap
            .with_timeout(request.timeout)
            .with_search_options(Self::options(request))
            .streaming_search_with(adapter, &request.base, scope, &request.filter, attrs)
            .await?;

        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await? {
            entries.push(convert(SearchEntry::construct(entry)));
        }
        let res = stream.finish().await;
        trace!(count = entries.len(), rc = res.rc, "paged search complete");
        Self::check_rc(res.rc, &res.text)?;
        Ok(entries)
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.ldap.unbind().await.map_err(DirectoryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_to_string() {
        let sid = [
            0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x15, 0x00, 0x00, 0x00, 0xa6, 0x81,
            0xe5, 0x0e, 0x4d, 0x6c, 0x6c, 0x2b, 0xca, 0x32, 0x05, 0x5f,
        ];
        assert_eq!(
            sid_to_string(&sid).as_deref(),
            Some("S-1-5-21-249921958-728525901-1594176202")
        );
        assert!(sid_to_string(&sid[..20]).is_none());
        assert!(sid_to_string(&[]).is_none());
    }

    #[test]
    fn test_convert_keeps_text_sids() {
        let mut attrs = std::collections::HashMap::new();
        attrs.insert("cn".to_string(), vec!["Domain Users".to_string()]);
        let mut bin_attrs = std::collections::HashMap::new();
        bin_attrs.insert(
            "objectSid".to_string(),
            vec![vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00]],
        );
        bin_attrs.insert("jpegPhoto".to_string(), vec![vec![0xff, 0xd8]]);
        let entry = convert(SearchEntry {
            dn: "CN=Domain Users,CN=Users,DC=corp,DC=example".to_string(),
            attrs,
            bin_attrs,
        });
        assert_eq!(entry.dn, "cn=domain users,cn=users,dc=corp,dc=example");
        assert_eq!(entry.first("objectsid"), Some("S-1-5-18"));
        assert!(entry.get("jpegphoto").is_none());
    }
}
