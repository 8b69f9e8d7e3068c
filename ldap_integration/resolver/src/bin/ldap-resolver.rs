#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ldap_resolver::cache::MemoryCache;
use ldap_resolver::constants::DEFAULT_CONFIG_PATH;
use ldap_resolver::db::{Db, MappingKind, MappingStore};
use ldap_resolver::ldap_config::ResolverConfig;
use ldap_resolver::proxy::GroupProxy;
use sketching::LogLevel;

include!("../opt/tool.rs");

fn load_config(copt: &CommonOpt) -> Option<ResolverConfig> {
    match ResolverConfig::new().read_options_from_optional_config(&copt.config) {
        Ok(cfg) => {
            debug!("{}", cfg);
            Some(cfg)
        }
        Err(e) => {
            error!("Failed to parse {:?} -> {:?}", copt.config, e);
            None
        }
    }
}

async fn build_proxy(cfg: &ResolverConfig) -> Option<GroupProxy> {
    let db = match Db::open(&cfg.db_path).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open mapping db {} -> {:?}", cfg.db_path, e);
            return None;
        }
    };
    let cache = Arc::new(MemoryCache::new(
        cfg.cache_size,
        Duration::from_secs(cfg.cache_timeout),
    ));
    match GroupProxy::from_config(cfg, Arc::new(db), cache) {
        Ok(proxy) => Some(proxy),
        Err(e) => {
            error!("Invalid server configuration -> {:?}", e);
            None
        }
    }
}

fn print_names(names: &[String]) {
    if names.is_empty() {
        println!("none");
    }
    for name in names {
        println!("{}", name);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opt = LdapResolverParser::parse();

    let level = if opt.commands.copt().debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    if let Err(e) = sketching::start_logging(level) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let Some(cfg) = load_config(opt.commands.copt()) else {
        return ExitCode::FAILURE;
    };

    if let LdapResolverOpt::MappingClear { copt: _, really } = &opt.commands {
        debug!("Starting mapping clear tool ...");
        if !really {
            error!("Are you sure you want to proceed? If so use --really");
            return ExitCode::SUCCESS;
        }
        let db = match Db::open(&cfg.db_path).await {
            Ok(db) => db,
            Err(e) => {
                error!("Failed to open mapping db {} -> {:?}", cfg.db_path, e);
                return ExitCode::FAILURE;
            }
        };
        for kind in [MappingKind::User, MappingKind::Group] {
            match db.clear(kind).await {
                Ok(count) => info!("removed {} {} mappings", count, kind),
                Err(e) => {
                    error!("Failed to clear {} mappings -> {:?}", kind, e);
                    return ExitCode::FAILURE;
                }
            }
        }
        return ExitCode::SUCCESS;
    }

    let Some(proxy) = build_proxy(&cfg).await else {
        return ExitCode::FAILURE;
    };

    let code = match opt.commands {
        LdapResolverOpt::InGroup { copt: _, uid, group } => {
            if proxy.in_group(&uid, &group).await {
                println!("{} is a member of {}", uid, group);
                ExitCode::SUCCESS
            } else {
                println!("{} is not a member of {}", uid, group);
                ExitCode::FAILURE
            }
        }
        LdapResolverOpt::UserGroups { copt: _, uid } => {
            print_names(&proxy.get_user_groups(&uid).await);
            ExitCode::SUCCESS
        }
        LdapResolverOpt::GroupMembers {
            copt: _,
            group,
            search,
            limit,
            offset,
        } => {
            if !proxy.group_exists(&group).await {
                error!("group {} not found", group);
                ExitCode::FAILURE
            } else {
                print_names(&proxy.users_in_group(&group, &search, limit, offset).await);
                ExitCode::SUCCESS
            }
        }
        LdapResolverOpt::Groups {
            copt: _,
            search,
            limit,
            offset,
        } => {
            print_names(&proxy.get_groups(&search, limit, offset).await);
            ExitCode::SUCCESS
        }
        LdapResolverOpt::CheckPassword { copt: _, login } => {
            let password = match rpassword::prompt_password("Enter password: ") {
                Ok(p) => p,
                Err(e) => {
                    error!("Problem getting input password: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match proxy.check_password(&login, &password).await {
                Some(name) => {
                    println!("auth success! local name: {}", name);
                    ExitCode::SUCCESS
                }
                None => {
                    println!("auth failed!");
                    ExitCode::FAILURE
                }
            }
        }
        LdapResolverOpt::Status { copt: _ } => {
            let mut all_online = true;
            for backend in proxy.backends() {
                if backend.test_connection().await {
                    println!("{}: online", backend.prefix());
                } else {
                    all_online = false;
                    println!("{}: offline", backend.prefix());
                }
            }
            if all_online {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        LdapResolverOpt::MappingClear { .. } => ExitCode::SUCCESS,
    };

    proxy.unbind().await;
    code
}
