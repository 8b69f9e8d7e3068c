use clap::Subcommand;

#[derive(Debug, clap::Args)]
pub struct CommonOpt {
    #[clap(short, long)]
    pub debug: bool,
    /// Path to the resolver configuration.
    #[clap(short, long, env = "LDAP_RESOLVER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

#[derive(Debug, Subcommand)]
#[clap(about = "LDAP Group Resolver Utility")]
pub enum LdapResolverOpt {
    /// Check whether a user is a member of a group, including nested membership.
    InGroup {
        #[clap(flatten)]
        copt: CommonOpt,
        #[clap(short = 'D', long = "name")]
        uid: String,
        #[clap(short, long)]
        group: String,
    },
    /// List the groups a user belongs to.
    UserGroups {
        #[clap(flatten)]
        copt: CommonOpt,
        #[clap(short = 'D', long = "name")]
        uid: String,
    },
    /// List the users of a group.
    GroupMembers {
        #[clap(flatten)]
        copt: CommonOpt,
        group: String,
        #[clap(short, long, default_value = "")]
        search: String,
        #[clap(short, long)]
        limit: Option<usize>,
        #[clap(short, long, default_value_t = 0)]
        offset: usize,
    },
    /// List the groups known to the configured servers.
    Groups {
        #[clap(flatten)]
        copt: CommonOpt,
        #[clap(short, long, default_value = "")]
        search: String,
        #[clap(short, long)]
        limit: Option<usize>,
        #[clap(short, long, default_value_t = 0)]
        offset: usize,
    },
    /// Test a login and password against the configured servers. This binds as
    /// the user on a separate connection.
    CheckPassword {
        #[clap(flatten)]
        copt: CommonOpt,
        #[clap(short = 'D', long = "name")]
        login: String,
    },
    /// Show whether each configured server can be reached.
    Status {
        #[clap(flatten)]
        copt: CommonOpt,
    },
    /// Erase the stored dn to local name mappings. Local names will be assigned
    /// afresh on the next lookups, and may differ from the ones in use now.
    MappingClear {
        #[clap(flatten)]
        copt: CommonOpt,
        #[clap(long)]
        really: bool,
    },
}

impl LdapResolverOpt {
    pub fn copt(&self) -> &CommonOpt {
        match self {
            LdapResolverOpt::InGroup { copt, .. }
            | LdapResolverOpt::UserGroups { copt, .. }
            | LdapResolverOpt::GroupMembers { copt, .. }
            | LdapResolverOpt::Groups { copt, .. }
            | LdapResolverOpt::CheckPassword { copt, .. }
            | LdapResolverOpt::Status { copt }
            | LdapResolverOpt::MappingClear { copt, .. } => copt,
        }
    }
}

#[derive(Debug, clap::Parser)]
#[clap(about = "LDAP Group Resolver Utility")]
pub struct LdapResolverParser {
    #[clap(subcommand)]
    pub commands: LdapResolverOpt,
}
