//! Role-based access control
//!
//! A persisted `user -> set-of-roles` table backing `has_role` checks. The
//! table is consulted at two points in the pipeline: before automatic
//! integration (`system` must hold `integrator`) and before human-triggered
//! activation of a staged artifact (the requester must hold `integrator`).
//!
//! Bootstrap invariant: on first load the distinguished `system` principal
//! is created with the `integrator` and `expert` roles. They may still be
//! revoked at runtime for testing or lockdown.

use crate::error::Result;
use crate::store::KeyedStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// The distinguished principal automated operations run as
pub const SYSTEM_USER: &str = "system";
/// Role required to integrate or activate staged artifacts
pub const ROLE_INTEGRATOR: &str = "integrator";
/// Role required to export audit trails
pub const ROLE_EXPERT: &str = "expert";

type RoleTable = BTreeMap<String, BTreeSet<String>>;
type CredentialTable = BTreeMap<String, String>;

/// Password hashing seam. Only hashes are ever persisted; implementations
/// must use a vetted password-hashing algorithm, not a bare fast hash.
pub trait CredentialHasher: Send + Sync {
    /// Hash a plaintext password for storage
    fn hash(&self, password: &str) -> String;
    /// Verify a plaintext password against a stored hash
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Persistent role-assignment table
#[derive(Debug)]
pub struct AccessControl {
    store: KeyedStore,
    path: PathBuf,
    credentials_path: PathBuf,
    users: Mutex<RoleTable>,
    credentials: Mutex<CredentialTable>,
}

impl AccessControl {
    /// Open (or create) the role table at `path`, enforcing the bootstrap
    /// invariant for the `system` principal.
    pub fn open(store: KeyedStore, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut users: RoleTable = store.read(&path)?.unwrap_or_default();

        if !users.contains_key(SYSTEM_USER) {
            users.insert(
                SYSTEM_USER.to_string(),
                [ROLE_INTEGRATOR.to_string(), ROLE_EXPERT.to_string()]
                    .into_iter()
                    .collect(),
            );
            store.write(&path, &users)?;
        }

        let credentials_path = path.with_file_name("credentials.json");
        let credentials: CredentialTable = store.read(&credentials_path)?.unwrap_or_default();

        Ok(Self {
            store,
            path,
            credentials_path,
            users: Mutex::new(users),
            credentials: Mutex::new(credentials),
        })
    }

    /// Replace a user's role set
    pub fn add_user(&self, user: &str, roles: &[&str]) {
        let mut users = self.users.lock().expect("role table poisoned");
        users.insert(
            user.to_string(),
            roles.iter().map(|r| r.to_string()).collect(),
        );
        self.persist(&users);
    }

    /// Grant a role to a user, creating the user if needed
    pub fn grant_role(&self, user: &str, role: &str) {
        let mut users = self.users.lock().expect("role table poisoned");
        let inserted = users
            .entry(user.to_string())
            .or_default()
            .insert(role.to_string());
        if inserted {
            self.persist(&users);
        }
    }

    /// Revoke a role from a user
    pub fn revoke_role(&self, user: &str, role: &str) {
        let mut users = self.users.lock().expect("role table poisoned");
        let removed = users.get_mut(user).map(|r| r.remove(role)).unwrap_or(false);
        if removed {
            self.persist(&users);
        }
    }

    /// Check whether a user holds a role
    pub fn has_role(&self, user: &str, role: &str) -> bool {
        let users = self.users.lock().expect("role table poisoned");
        users.get(user).map(|r| r.contains(role)).unwrap_or(false)
    }

    /// List a user's roles (empty when unknown)
    pub fn roles_of(&self, user: &str) -> Vec<String> {
        let users = self.users.lock().expect("role table poisoned");
        users
            .get(user)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Set (or replace) a user's credential. Only the hash produced by
    /// `hasher` touches disk.
    pub fn set_credential(&self, hasher: &dyn CredentialHasher, user: &str, password: &str) {
        let mut credentials = self.credentials.lock().expect("credential table poisoned");
        credentials.insert(user.to_string(), hasher.hash(password));
        if let Err(e) = self.store.write(&self.credentials_path, &*credentials) {
            warn!(path = %self.credentials_path.display(), error = %e, "failed to persist credentials");
        }
    }

    /// Verify a password against the stored hash. Unknown users fail.
    pub fn verify_credential(
        &self,
        hasher: &dyn CredentialHasher,
        user: &str,
        password: &str,
    ) -> bool {
        let credentials = self.credentials.lock().expect("credential table poisoned");
        credentials
            .get(user)
            .map(|stored| hasher.verify(password, stored))
            .unwrap_or(false)
    }

    /// Persist immediately on every mutation. A persistence failure keeps
    /// the in-memory table authoritative for this process and is logged,
    /// not raised; role checks stay consistent with the last mutation.
    fn persist(&self, users: &RoleTable) {
        if let Err(e) = self.store.write(&self.path, users) {
            warn!(path = %self.path.display(), error = %e, "failed to persist role table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &std::path::Path) -> AccessControl {
        AccessControl::open(KeyedStore::new(), dir.join("access_control.json")).unwrap()
    }

    #[test]
    fn test_system_bootstrap_roles() {
        let dir = tempfile::tempdir().unwrap();
        let ac = open_in(dir.path());
        assert!(ac.has_role(SYSTEM_USER, ROLE_INTEGRATOR));
        assert!(ac.has_role(SYSTEM_USER, ROLE_EXPERT));
    }

    #[test]
    fn test_grant_and_revoke_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ac = open_in(dir.path());

        assert!(!ac.has_role("alice", ROLE_INTEGRATOR));
        ac.grant_role("alice", ROLE_INTEGRATOR);
        assert!(ac.has_role("alice", ROLE_INTEGRATOR));

        ac.revoke_role("alice", ROLE_INTEGRATOR);
        assert!(!ac.has_role("alice", ROLE_INTEGRATOR));
    }

    #[test]
    fn test_system_roles_revocable_at_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let ac = open_in(dir.path());
        ac.revoke_role(SYSTEM_USER, ROLE_INTEGRATOR);
        assert!(!ac.has_role(SYSTEM_USER, ROLE_INTEGRATOR));
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ac = open_in(dir.path());
            ac.add_user("bob", &[ROLE_EXPERT]);
        }
        let reopened = open_in(dir.path());
        assert!(reopened.has_role("bob", ROLE_EXPERT));
        assert!(!reopened.has_role("bob", ROLE_INTEGRATOR));
        // bootstrap user still present
        assert!(reopened.has_role(SYSTEM_USER, ROLE_EXPERT));
    }

    /// Reversed-string "hash", good enough to exercise the seam
    struct StubHasher;
    impl CredentialHasher for StubHasher {
        fn hash(&self, password: &str) -> String {
            password.chars().rev().collect()
        }
        fn verify(&self, password: &str, hash: &str) -> bool {
            self.hash(password) == hash
        }
    }

    #[test]
    fn test_credentials_store_hashes_only() {
        let dir = tempfile::tempdir().unwrap();
        let ac = open_in(dir.path());
        ac.set_credential(&StubHasher, "alice", "hunter2");

        assert!(ac.verify_credential(&StubHasher, "alice", "hunter2"));
        assert!(!ac.verify_credential(&StubHasher, "alice", "wrong"));
        assert!(!ac.verify_credential(&StubHasher, "nobody", "hunter2"));

        let raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(raw.contains("2retnuh"));
    }

    #[test]
    fn test_credentials_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ac = open_in(dir.path());
            ac.set_credential(&StubHasher, "bob", "s3cret");
        }
        let reopened = open_in(dir.path());
        assert!(reopened.verify_credential(&StubHasher, "bob", "s3cret"));
    }
}
