//! Service registry
//!
//! Holds the current mapping of service name to backend addresses (with a
//! per-service round-robin cursor), the per-service ACL table, the
//! user-script table, permission-level defaults, and config toggles fed by
//! the discovery collaborator.
//!
//! The whole content is replaced as a unit by `apply_snapshot`; there is no
//! incremental merge. Lookups are linear scans under a shared lock, a
//! snapshot replace takes the exclusive lock.

use crate::auth::Identity;
use crate::permission::Permission;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Snapshot ingestion failure. The prior registry content stays intact.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// A backend service and its round-robin cursor.
///
/// Clones share the cursor, so address selection through any clone handed out
/// by a lookup advances the same per-service counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(skip)]
    cursor: Arc<AtomicUsize>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            name: name.into(),
            addresses,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// An entry without a name or without addresses does not exist as far as
    /// lookups are concerned.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() || self.name.is_empty()
    }

    /// Next backend address in cursor order.
    ///
    /// The read-then-advance is one atomic step, so two concurrent callers
    /// never observe the same pre-advance cursor. The modulo keeps the index
    /// valid even if the address count shrank since the last call. Lookups
    /// never return an entry without addresses.
    pub fn select_address(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.addresses.len();
        &self.addresses[index]
    }
}

/// Per-service authorization policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclEntry {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub min_permission: Permission,
    #[serde(default)]
    pub allowed_ids: Vec<String>,
    #[serde(default)]
    pub blocked_ids: Vec<String>,
    /// Unix seconds of the last update, carried from the snapshot.
    #[serde(default)]
    pub last_updated: i64,
}

impl AclEntry {
    pub fn is_empty(&self) -> bool {
        self.service.is_empty()
    }

    /// Authorization decision for one identity.
    ///
    /// The block list short-circuits everything else, then the allow list,
    /// then the minimum-permission containment rule. An identity on both
    /// lists is denied.
    pub fn allows(&self, identity: &Identity) -> bool {
        if self.blocked_ids.iter().any(|id| *id == identity.id) {
            return false;
        }

        if self.allowed_ids.iter().any(|id| *id == identity.id) {
            return true;
        }

        identity.permission.contains(self.min_permission)
    }
}

/// A named permission-level default, exposed on the configuration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLevel {
    pub role: String,
    pub permission: Permission,
}

/// A key/value toggle fed through the discovery snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    #[serde(default)]
    pub val: serde_json::Value,
}

/// The full registry content. Replaced as a unit on each snapshot update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub user_scripts: Vec<ServiceEntry>,
    #[serde(default)]
    pub acl_entries: Vec<AclEntry>,
    #[serde(default)]
    pub user_levels: Vec<UserLevel>,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
}

/// Lock-guarded registry shared across request workers.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Snapshot>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a service by name. Entries without addresses are treated as
    /// non-existent.
    pub fn lookup(&self, name: &str) -> Option<ServiceEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .services
            .iter()
            .find(|srv| !srv.is_empty() && srv.name == name)
            .cloned()
    }

    /// Find a user script by name.
    pub fn user_script(&self, name: &str) -> Option<ServiceEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .user_scripts
            .iter()
            .find(|srv| !srv.is_empty() && srv.name == name)
            .cloned()
    }

    /// ACL entry for a service. Absence is meaningful: the service is open to
    /// everyone.
    pub fn acl_for(&self, service: &str) -> Option<AclEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .acl_entries
            .iter()
            .find(|entry| !entry.is_empty() && entry.service == service)
            .cloned()
    }

    /// String value of a snapshot config toggle, if present.
    pub fn lookup_config(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        inner.config.iter().find(|entry| entry.key == key).map(|entry| {
            match &entry.val {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        })
    }

    /// Replace the entire registry content atomically.
    ///
    /// Malformed input fails without touching existing state; the parse
    /// happens before the exclusive lock is taken.
    pub fn apply_snapshot(&self, data: &[u8]) -> Result<(), SnapshotError> {
        let snapshot: Snapshot = serde_json::from_slice(data)?;
        *self.inner.write().unwrap() = snapshot;
        Ok(())
    }

    /// Permission-level defaults plus the effective ACL table: services
    /// without an explicit entry are listed with an open entry.
    pub fn acl_overview(&self) -> (Vec<UserLevel>, Vec<AclEntry>) {
        let inner = self.inner.read().unwrap();
        let mut entries = inner.acl_entries.clone();

        for srv in &inner.services {
            if srv.is_empty() {
                continue;
            }
            if !entries.iter().any(|entry| entry.service == srv.name) {
                entries.push(AclEntry {
                    service: srv.name.clone(),
                    ..AclEntry::default()
                });
            }
        }

        (inner.user_levels.clone(), entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn identity(id: &str, permission: Permission) -> Identity {
        Identity {
            id: id.to_string(),
            permission,
        }
    }

    fn registry_with(snapshot: Snapshot) -> Registry {
        let registry = Registry::new();
        let data = serde_json::to_vec(&snapshot).unwrap();
        registry.apply_snapshot(&data).unwrap();
        registry
    }

    #[test]
    fn test_round_robin_visits_each_address_once_then_wraps() {
        let entry = ServiceEntry::new(
            "logs",
            vec!["10.0.0.1:80".into(), "10.0.0.2:80".into(), "10.0.0.3:80".into()],
        );

        assert_eq!(entry.select_address(), "10.0.0.1:80");
        assert_eq!(entry.select_address(), "10.0.0.2:80");
        assert_eq!(entry.select_address(), "10.0.0.3:80");
        assert_eq!(entry.select_address(), "10.0.0.1:80");
    }

    #[test]
    fn test_round_robin_two_addresses() {
        let entry = ServiceEntry::new("billing", vec!["10.0.0.1:80".into(), "10.0.0.2:80".into()]);

        assert_eq!(entry.select_address(), "10.0.0.1:80");
        assert_eq!(entry.select_address(), "10.0.0.2:80");
        assert_eq!(entry.select_address(), "10.0.0.1:80");
    }

    #[test]
    fn test_lookup_clones_share_one_cursor() {
        let registry = registry_with(Snapshot {
            services: vec![ServiceEntry::new(
                "billing",
                vec!["a:80".into(), "b:80".into()],
            )],
            ..Snapshot::default()
        });

        let first = registry.lookup("billing").unwrap();
        let second = registry.lookup("billing").unwrap();
        assert_eq!(first.select_address(), "a:80");
        assert_eq!(second.select_address(), "b:80");
        assert_eq!(first.select_address(), "a:80");
    }

    #[test]
    fn test_concurrent_selection_never_loses_an_update() {
        let entry = ServiceEntry::new("burst", vec!["a:80".into(), "b:80".into()]);
        let entry = Arc::new(entry);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let entry = Arc::clone(&entry);
            handles.push(thread::spawn(move || {
                let mut a = 0usize;
                for _ in 0..250 {
                    if entry.select_address() == "a:80" {
                        a += 1;
                    }
                }
                a
            }));
        }

        let a_total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 1000 atomic advances over two addresses split exactly in half.
        assert_eq!(a_total, 500);
    }

    #[test]
    fn test_lookup_skips_empty_entries() {
        let registry = registry_with(Snapshot {
            services: vec![
                ServiceEntry::new("no-addresses", vec![]),
                ServiceEntry::new("", vec!["a:80".into()]),
                ServiceEntry::new("live", vec!["b:80".into()]),
            ],
            ..Snapshot::default()
        });

        assert!(registry.lookup("no-addresses").is_none());
        assert!(registry.lookup("").is_none());
        assert!(registry.lookup("live").is_some());
    }

    #[test]
    fn test_block_list_beats_allow_list() {
        let entry = AclEntry {
            service: "billing".into(),
            allowed_ids: vec!["u1".into()],
            blocked_ids: vec!["u1".into()],
            ..AclEntry::default()
        };

        assert!(!entry.allows(&identity("u1", Permission::ADM)));
    }

    #[test]
    fn test_allow_list_bypasses_minimum_permission() {
        let entry = AclEntry {
            service: "billing".into(),
            min_permission: Permission::ADM,
            allowed_ids: vec!["u1".into()],
            ..AclEntry::default()
        };

        assert!(entry.allows(&identity("u1", Permission::UNVERIFIED)));
        assert!(!entry.allows(&identity("u2", Permission::USR)));
    }

    #[test]
    fn test_minimum_permission_requires_containment() {
        let entry = AclEntry {
            service: "billing".into(),
            min_permission: Permission::DEV,
            ..AclEntry::default()
        };

        assert!(!entry.allows(&identity("u1", Permission::USR)));
        assert!(entry.allows(&identity("u2", Permission::DEV)));
        assert!(entry.allows(&identity("u3", Permission::ADM)));
    }

    #[test]
    fn test_no_acl_entry_means_open_access() {
        let registry = registry_with(Snapshot {
            services: vec![ServiceEntry::new("open", vec!["a:80".into()])],
            ..Snapshot::default()
        });

        assert!(registry.acl_for("open").is_none());
    }

    #[test]
    fn test_failed_snapshot_leaves_state_untouched() {
        let registry = registry_with(Snapshot {
            services: vec![ServiceEntry::new("stable", vec!["a:80".into()])],
            acl_entries: vec![AclEntry {
                service: "stable".into(),
                min_permission: Permission::USR,
                ..AclEntry::default()
            }],
            ..Snapshot::default()
        });

        let err = registry.apply_snapshot(b"{ not json").unwrap_err();
        assert!(matches!(err, SnapshotError::Invalid(_)));

        let entry = registry.lookup("stable").expect("prior services intact");
        assert_eq!(entry.addresses, vec!["a:80".to_string()]);
        let acl = registry.acl_for("stable").expect("prior ACL intact");
        assert_eq!(acl.min_permission, Permission::USR);
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let registry = registry_with(Snapshot {
            services: vec![ServiceEntry::new("old", vec!["a:80".into()])],
            ..Snapshot::default()
        });

        registry
            .apply_snapshot(br#"{"services":[{"name":"new","addresses":["b:80"]}]}"#)
            .unwrap();

        assert!(registry.lookup("old").is_none());
        assert!(registry.lookup("new").is_some());
    }

    #[test]
    fn test_lookup_config_values() {
        let registry = registry_with(Snapshot {
            config: vec![
                ConfigEntry {
                    key: "require_jwt".into(),
                    val: serde_json::json!("true"),
                },
                ConfigEntry {
                    key: "max_retries".into(),
                    val: serde_json::json!(3),
                },
            ],
            ..Snapshot::default()
        });

        assert_eq!(registry.lookup_config("require_jwt").as_deref(), Some("true"));
        assert_eq!(registry.lookup_config("max_retries").as_deref(), Some("3"));
        assert_eq!(registry.lookup_config("absent"), None);
    }

    #[test]
    fn test_acl_overview_adds_open_entries_for_uncovered_services() {
        let registry = registry_with(Snapshot {
            services: vec![
                ServiceEntry::new("covered", vec!["a:80".into()]),
                ServiceEntry::new("uncovered", vec!["b:80".into()]),
            ],
            acl_entries: vec![AclEntry {
                service: "covered".into(),
                min_permission: Permission::USR,
                ..AclEntry::default()
            }],
            user_levels: vec![UserLevel {
                role: "usr".into(),
                permission: Permission::USR,
            }],
            ..Snapshot::default()
        });

        let (levels, entries) = registry.acl_overview();
        assert_eq!(levels.len(), 1);
        assert_eq!(entries.len(), 2);
        let open = entries.iter().find(|e| e.service == "uncovered").unwrap();
        assert_eq!(open.min_permission, Permission::UNVERIFIED);
    }
}
