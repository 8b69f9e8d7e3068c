use std::sync::Arc;
use std::time::Duration;

use ldap_resolver::backend::{DirectoryBackend, LdapBackend};
use ldap_resolver::cache::{CacheStore, MemoryCache, NoCache};
use ldap_resolver::db::{Db, MappingStore};
use ldap_resolver::directory::memory::MemoryDirectory;
use ldap_resolver::directory::DirectoryEntry;
use ldap_resolver::ldap_config::{MemberAttr, ServerConfig};
use ldap_resolver::proxy::GroupProxy;
use serde_json::Value;

fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> DirectoryEntry {
    DirectoryEntry::new(
        dn,
        attrs
            .iter()
            .map(|(k, v)| (*k, v.iter().map(|s| s.to_string()).collect::<Vec<_>>())),
    )
}

fn server_config(prefix: &str, suffix: &str) -> ServerConfig {
    let mut config = ServerConfig::new(prefix, "memory://");
    config.base_users = vec![format!("ou=people,{}", suffix)];
    config.base_groups = vec![format!("ou=groups,{}", suffix)];
    config.user_filter = "objectClass=inetOrgPerson".to_string();
    config.group_filter = "objectClass=groupOfNames".to_string();
    config.group_member_attr = Some(MemberAttr::Member);
    config.nested_groups = true;
    config.user_display_name = "uid".to_string();
    config
}

fn backend(
    dir: &MemoryDirectory,
    config: ServerConfig,
    store: Arc<dyn MappingStore>,
    cache: Arc<dyn CacheStore>,
) -> Arc<dyn DirectoryBackend> {
    Arc::new(
        LdapBackend::with_connector(config, Box::new(dir.clone()), store, cache)
            .expect("Invalid server configuration"),
    )
}

async fn add_person(dir: &MemoryDirectory, uid: &str, suffix: &str) -> String {
    let dn = format!("uid={},ou=people,{}", uid, suffix);
    dir.add_entry(entry(
        &dn,
        &[("objectClass", &["inetOrgPerson"]), ("uid", &[uid])],
    ))
    .await;
    dn
}

async fn add_group(dir: &MemoryDirectory, dn: &str, cn: &str, members: &[&str]) {
    dir.add_entry(entry(
        dn,
        &[
            ("objectClass", &["groupOfNames"]),
            ("cn", &[cn]),
            ("member", members),
        ],
    ))
    .await;
}

/// Engineers holds alice directly and bob through Backend.
async fn engineers_directory() -> MemoryDirectory {
    let dir = MemoryDirectory::new();
    let suffix = "dc=example,dc=com";
    let alice = add_person(&dir, "alice", suffix).await;
    let bob = add_person(&dir, "bob", suffix).await;
    add_person(&dir, "carol", suffix).await;
    add_group(
        &dir,
        "cn=Backend,ou=groups,dc=example,dc=com",
        "Backend",
        &[bob.as_str()],
    )
    .await;
    add_group(
        &dir,
        "cn=Engineers,ou=groups,dc=example,dc=com",
        "Engineers",
        &[alice.as_str(), "cn=Backend,ou=groups,dc=example,dc=com"],
    )
    .await;
    dir
}

async fn single_proxy(dir: &MemoryDirectory) -> (GroupProxy, Arc<dyn DirectoryBackend>) {
    let store = Arc::new(Db::open("").await.expect("Failed to open db"));
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(1024, Duration::ZERO));
    let b = backend(dir, server_config("s01", "dc=example,dc=com"), store, cache.clone());
    (GroupProxy::new(vec![b.clone()], cache), b)
}

#[tokio::test]
async fn test_engineers_scenario() {
    sketching::test_init();
    let dir = engineers_directory().await;
    let (proxy, b) = single_proxy(&dir).await;

    // Local group names are assigned as groups are enumerated.
    assert_eq!(proxy.get_groups("", None, 0).await, vec!["Backend", "Engineers"]);

    assert_eq!(
        b.flatten_members("cn=Engineers,ou=groups,dc=example,dc=com").await,
        vec![
            "uid=alice,ou=people,dc=example,dc=com".to_string(),
            "uid=bob,ou=people,dc=example,dc=com".to_string(),
        ]
    );
    assert!(proxy.in_group("bob", "Engineers").await);
    assert!(proxy.in_group("alice", "Engineers").await);
    assert!(!proxy.in_group("carol", "Engineers").await);
    assert!(!proxy.in_group("alice", "Backend").await);

    assert_eq!(
        proxy.users_in_group("Engineers", "", None, 0).await,
        vec!["alice", "bob"]
    );
    assert_eq!(proxy.count_users_in_group("Engineers", "").await, 2);
    assert_eq!(proxy.count_users_in_group("Engineers", "bo").await, 1);
    assert_eq!(
        proxy.get_user_groups("bob").await,
        vec!["Backend", "Engineers"]
    );
    assert_eq!(proxy.get_user_groups("alice").await, vec!["Engineers"]);
    assert_eq!(
        proxy.group_display_name("Engineers").await.as_deref(),
        Some("Engineers")
    );
    assert!(proxy.group_exists("Backend").await);
    assert!(proxy.user_exists("carol").await);
    assert!(!proxy.user_exists("mallory").await);
    proxy.unbind().await;
}

#[tokio::test]
async fn test_cycle_is_flattened_once() {
    sketching::test_init();
    let dir = MemoryDirectory::new();
    let suffix = "dc=example,dc=com";
    let alice = add_person(&dir, "alice", suffix).await;
    let bob = add_person(&dir, "bob", suffix).await;
    add_group(
        &dir,
        "cn=g1,ou=groups,dc=example,dc=com",
        "g1",
        &[alice.as_str(), "cn=g2,ou=groups,dc=example,dc=com"],
    )
    .await;
    add_group(
        &dir,
        "cn=g2,ou=groups,dc=example,dc=com",
        "g2",
        &[bob.as_str(), "cn=g1,ou=groups,dc=example,dc=com"],
    )
    .await;
    let (proxy, b) = single_proxy(&dir).await;

    let members = b.flatten_members("cn=g2,ou=groups,dc=example,dc=com").await;
    assert_eq!(members, vec![alice.clone(), bob.clone()]);

    proxy.get_groups("", None, 0).await;
    assert_eq!(proxy.get_user_groups("alice").await, vec!["g1", "g2"]);
    assert_eq!(proxy.users_in_group("g1", "", None, 0).await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_group_names_are_unique() {
    sketching::test_init();
    let dir = MemoryDirectory::new();
    let alice = add_person(&dir, "alice", "dc=example,dc=com").await;
    add_group(
        &dir,
        "cn=staff,ou=berlin,ou=groups,dc=example,dc=com",
        "Staff",
        &[alice.as_str()],
    )
    .await;
    add_group(
        &dir,
        "cn=staff,ou=paris,ou=groups,dc=example,dc=com",
        "Staff",
        &[alice.as_str()],
    )
    .await;
    let (proxy, _) = single_proxy(&dir).await;

    let groups = proxy.get_groups("", None, 0).await;
    assert_eq!(groups, vec!["Staff", "Staff@paris.groups.example.com"]);

    // A renamed group keeps the name it was first given.
    add_group(
        &dir,
        "cn=staff,ou=berlin,ou=groups,dc=example,dc=com",
        "Personnel",
        &[alice.as_str()],
    )
    .await;
    assert_eq!(proxy.get_user_groups("alice").await, groups);
}

#[tokio::test]
async fn test_membership_fails_closed() {
    sketching::test_init();
    let dir = engineers_directory().await;
    let (proxy, b) = single_proxy(&dir).await;
    proxy.get_groups("", None, 0).await;

    assert!(!proxy.in_group("nobody", "Engineers").await);
    assert!(!proxy.in_group("alice", "Nonexistent").await);

    // A fresh backend on the same directory has nothing cached.
    let store = Arc::new(Db::open("").await.expect("Failed to open db"));
    let cold = backend(
        &dir,
        server_config("s02", "dc=example,dc=com"),
        store,
        Arc::new(NoCache),
    );
    assert_eq!(cold.list_groups("", None, 0).await, vec!["Backend", "Engineers"]);

    dir.set_online(false).await;
    assert!(!cold.is_user_in_group("alice", "Engineers").await);
    assert!(cold.list_groups_for_user("alice").await.is_empty());
    assert!(cold.users_in_group("Engineers", "", None, 0).await.is_empty());
    assert!(!cold.test_connection().await);

    assert!(!proxy.in_group("bob", "Engineers").await);
    assert!(!b.test_connection().await);
}

#[tokio::test]
async fn test_affinity_and_deletion_fallback() {
    sketching::test_init();
    let store: Arc<dyn MappingStore> = Arc::new(Db::open("").await.expect("Failed to open db"));

    // Only dir1 holds the group, but dir2 is asked first.
    let dir1 = engineers_directory().await;
    let dir2 = MemoryDirectory::new();
    add_person(&dir2, "dave", "dc=example,dc=org").await;

    let b1 = backend(
        &dir1,
        server_config("s01", "dc=example,dc=com"),
        store.clone(),
        Arc::new(NoCache),
    );
    let b2 = backend(
        &dir2,
        server_config("s02", "dc=example,dc=org"),
        store,
        Arc::new(NoCache),
    );
    let proxy_cache = Arc::new(MemoryCache::new(64, Duration::ZERO));
    let proxy = GroupProxy::new(vec![b2, b1], proxy_cache.clone());

    proxy.get_groups("", None, 0).await;
    assert!(proxy.in_group("alice", "Engineers").await);
    assert_eq!(
        proxy_cache.get("proxy:groupAffinity:Engineers").await,
        Some(Value::from("s01"))
    );

    let before = dir2.search_count();
    assert!(proxy.in_group("bob", "Engineers").await);
    assert!(!proxy.in_group("carol", "Engineers").await);
    assert_eq!(proxy.count_users_in_group("Engineers", "").await, 2);
    assert_eq!(dir2.search_count(), before);

    assert!(dir1.remove_entry("cn=Engineers,ou=groups,dc=example,dc=com").await);
    assert!(!proxy.in_group("alice", "Engineers").await);
    assert_eq!(
        proxy_cache.get("proxy:groupAffinity:Engineers").await,
        Some(Value::from(""))
    );
    assert!(!proxy.group_exists("Engineers").await);
}

#[tokio::test]
async fn test_users_in_group_pages() {
    sketching::test_init();
    let dir = MemoryDirectory::new();
    let mut members = Vec::new();
    for uid in ["user10", "user2", "user1", "user3", "user21"] {
        members.push(add_person(&dir, uid, "dc=example,dc=com").await);
    }
    let members: Vec<&str> = members.iter().map(|s| s.as_str()).collect();
    add_group(&dir, "cn=all,ou=groups,dc=example,dc=com", "all", &members).await;
    let (proxy, _) = single_proxy(&dir).await;
    proxy.get_groups("", None, 0).await;

    let full = proxy.users_in_group("all", "", None, 0).await;
    assert_eq!(full, vec!["user1", "user2", "user3", "user10", "user21"]);

    let first = proxy.users_in_group("all", "", Some(2), 0).await;
    let second = proxy.users_in_group("all", "", Some(2), 2).await;
    let third = proxy.users_in_group("all", "", Some(2), 4).await;
    assert_eq!(first, full[0..2]);
    assert_eq!(second, full[2..4]);
    assert_eq!(third, full[4..]);
    assert!(proxy.users_in_group("all", "", Some(2), 6).await.is_empty());
}

#[tokio::test]
async fn test_group_listing_without_paging() {
    sketching::test_init();
    let dir = MemoryDirectory::new().with_paging(false);
    for idx in 0..12 {
        let cn = format!("team{}", idx);
        add_group(
            &dir,
            &format!("cn={},ou=groups,dc=example,dc=com", cn),
            &cn,
            &[],
        )
        .await;
    }
    let (proxy, b) = single_proxy(&dir).await;

    let page = b.list_groups("team1", Some(2), 1).await;
    assert_eq!(page, vec!["team10", "team11"]);
    assert_eq!(proxy.get_groups("", Some(3), 0).await, vec!["team0", "team1", "team2"]);
    assert_eq!(proxy.get_groups("", None, 10).await, vec!["team10", "team11"]);
}

#[tokio::test]
async fn test_check_password_through_proxy() {
    sketching::test_init();
    let dir = engineers_directory().await;
    dir.set_password("uid=alice,ou=people,dc=example,dc=com", "hunter2")
        .await;
    let (proxy, _) = single_proxy(&dir).await;

    assert_eq!(
        proxy.check_password("alice", "hunter2").await.as_deref(),
        Some("alice")
    );
    assert!(proxy.check_password("alice", "hunter3").await.is_none());
    assert!(proxy.check_password("bob", "hunter2").await.is_none());
}

#[tokio::test]
async fn test_wrong_password_costs_one_bind() {
    sketching::test_init();
    let dir1 = MemoryDirectory::new();
    dir1.add_entry(entry(
        "uid=alice,ou=people,dc=example,dc=com",
        &[
            ("objectClass", &["inetOrgPerson"]),
            ("uid", &["alice"]),
            ("displayName", &["Alice Liddell"]),
        ],
    ))
    .await;
    dir1.set_password("uid=alice,ou=people,dc=example,dc=com", "hunter2")
        .await;
    let dir2 = MemoryDirectory::new();
    let other = add_person(&dir2, "alice", "dc=example,dc=org").await;
    dir2.set_password(&other, "swordfish").await;

    let store = Arc::new(Db::open("").await.expect("Failed to open db"));
    let mut c1 = server_config("s01", "dc=example,dc=com");
    c1.user_display_name = "displayname".to_string();
    let b1 = backend(&dir1, c1, store.clone(), Arc::new(NoCache));
    let b2 = backend(
        &dir2,
        server_config("s02", "dc=example,dc=org"),
        store,
        Arc::new(NoCache),
    );
    let proxy_cache = Arc::new(MemoryCache::new(64, Duration::ZERO));
    let proxy = GroupProxy::new(vec![b1, b2], proxy_cache.clone());

    assert_eq!(
        proxy.check_password("alice", "hunter2").await.as_deref(),
        Some("Alice_Liddell")
    );
    assert_eq!(dir1.bind_count(), 1);
    assert_eq!(
        proxy_cache.get("proxy:loginAffinity:alice").await,
        Some(Value::from("s01"))
    );

    // The affine backend still knows the login, so nothing else is tried.
    assert!(proxy.check_password("alice", "hunter3").await.is_none());
    assert_eq!(dir1.bind_count(), 2);
    assert_eq!(dir2.bind_count(), 0);

    // Once the login is gone from the affine backend the others are asked.
    assert!(dir1.remove_entry("uid=alice,ou=people,dc=example,dc=com").await);
    assert_eq!(
        proxy.check_password("alice", "swordfish").await.as_deref(),
        Some("alice")
    );
    assert_eq!(dir1.bind_count(), 2);
    assert_eq!(dir2.bind_count(), 1);
    assert_eq!(
        proxy_cache.get("proxy:loginAffinity:alice").await,
        Some(Value::from("s02"))
    );
}
