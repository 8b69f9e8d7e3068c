//! Per server resolution of users and groups.

pub mod interface;
pub mod ldap;

pub use self::interface::{DirectoryBackend, GroupActions, Lookup, LookupOutcome, Subject};
pub use self::ldap::LdapBackend;
