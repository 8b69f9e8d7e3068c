use async_trait::async_trait;
use bitflags::bitflags;

bitflags! {
    /// Group management capabilities a backend can offer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupActions: u32 {
        const CREATE_GROUP = 0x0000_0001;
        const DELETE_GROUP = 0x0000_0010;
        const ADD_TO_GROUP = 0x0000_0100;
        const REMOVE_FROM_GROUP = 0x0000_1000;
        const COUNT_USERS = 0x0010_0000;
        const GROUP_DETAILS = 0x0100_0000;
    }
}

/// A query that has exactly one owning backend. The proxy remembers which
/// backend answered it so the next query for the same subject goes there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    InGroup { uid: String, gid: String },
    GroupExists { gid: String },
    CountUsersInGroup { gid: String, search: String },
    GroupDisplayName { gid: String },
    UserExists { uid: String },
    CheckPassword { login: String, password: String },
}

/// What a [Lookup] is about, which names the affinity record it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject<'a> {
    Group(&'a str),
    /// A local user name.
    User(&'a str),
    /// A login name, as matched by the login filter. It is not a local name.
    Login(&'a str),
}

impl Lookup {
    pub fn subject(&self) -> Subject<'_> {
        match self {
            Lookup::InGroup { gid, .. }
            | Lookup::GroupExists { gid }
            | Lookup::CountUsersInGroup { gid, .. }
            | Lookup::GroupDisplayName { gid } => Subject::Group(gid),
            Lookup::UserExists { uid } => Subject::User(uid),
            Lookup::CheckPassword { login, .. } => Subject::Login(login),
        }
    }

    /// The result reported when no backend owns the subject.
    pub fn empty(&self) -> LookupOutcome {
        match self {
            Lookup::InGroup { .. } | Lookup::GroupExists { .. } | Lookup::UserExists { .. } => {
                LookupOutcome::Bool(false)
            }
            Lookup::CountUsersInGroup { .. } => LookupOutcome::Count(0),
            Lookup::GroupDisplayName { .. } | Lookup::CheckPassword { .. } => {
                LookupOutcome::Name(None)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Bool(bool),
    Count(usize),
    Name(Option<String>),
}

impl LookupOutcome {
    pub fn is_found(&self) -> bool {
        match self {
            LookupOutcome::Bool(b) => *b,
            LookupOutcome::Count(c) => *c > 0,
            LookupOutcome::Name(n) => n.is_some(),
        }
    }
}

/// A configured directory server answering user and group queries in terms of
/// local names. Unavailability of the directory is never an error here: every
/// operation degrades to its empty value.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// The configuration prefix identifying this backend.
    fn prefix(&self) -> &str;

    async fn is_user_in_group(&self, uid: &str, gid: &str) -> bool;

    /// The transitive closure of a group's members, as normalised dns. Nested
    /// groups are expanded but never included themselves.
    async fn flatten_members(&self, group_dn: &str) -> Vec<String>;

    async fn list_groups_for_user(&self, uid: &str) -> Vec<String>;

    async fn users_in_group(
        &self,
        gid: &str,
        search: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<String>;

    async fn count_users_in_group(&self, gid: &str, search: &str) -> usize;

    async fn list_groups(&self, search: &str, limit: Option<usize>, offset: usize) -> Vec<String>;

    async fn group_exists(&self, gid: &str) -> bool;

    async fn group_display_name(&self, gid: &str) -> Option<String>;

    async fn user_exists(&self, uid: &str) -> bool;

    /// Whether exactly one user answers to this login. No credentials are
    /// checked.
    async fn login_exists(&self, login: &str) -> bool;

    /// Check a login against the directory, returning the local user name.
    async fn check_password(&self, login: &str, password: &str) -> Option<String>;

    fn implements_actions(&self, actions: GroupActions) -> bool;

    /// Whether the directory can be reached right now.
    async fn test_connection(&self) -> bool;

    async fn unbind(&self);

    /// Evaluate an owner lookup.
    async fn lookup(&self, lookup: &Lookup) -> LookupOutcome {
        match lookup {
            Lookup::InGroup { uid, gid } => {
                LookupOutcome::Bool(self.is_user_in_group(uid, gid).await)
            }
            Lookup::GroupExists { gid } => LookupOutcome::Bool(self.group_exists(gid).await),
            Lookup::CountUsersInGroup { gid, search } => {
                LookupOutcome::Count(self.count_users_in_group(gid, search).await)
            }
            Lookup::GroupDisplayName { gid } => {
                LookupOutcome::Name(self.group_display_name(gid).await)
            }
            Lookup::UserExists { uid } => LookupOutcome::Bool(self.user_exists(uid).await),
            Lookup::CheckPassword { login, password } => {
                LookupOutcome::Name(self.check_password(login, password).await)
            }
        }
    }

    /// Whether the subject of a lookup still exists on this backend.
    async fn subject_exists(&self, subject: &Subject<'_>) -> bool {
        match subject {
            Subject::Group(gid) => self.group_exists(gid).await,
            Subject::User(uid) => self.user_exists(uid).await,
            Subject::Login(login) => self.login_exists(login).await,
        }
    }
}
