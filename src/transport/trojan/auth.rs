//! Trojan user table
//!
//! Users are keyed by the hex SHA-224 digest of their password — the same
//! 56-byte token the wire protocol carries. Each user tracks transferred
//! bytes and the set of source IPs currently using the credential, capped
//! at a fixed limit.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha224};

/// Length of the hex-encoded SHA-224 password digest.
pub const HASH_LEN: usize = 56;

/// Concurrent source addresses allowed per credential.
const IP_LIMIT: usize = 8;

pub fn sha224_hex(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// A single credential with its usage accounting.
pub struct User {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
    ips: Mutex<HashSet<IpAddr>>,
}

impl User {
    fn new(password: &str) -> Self {
        Self {
            hash: sha224_hex(password),
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            ips: Mutex::new(HashSet::new()),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn add_traffic(&self, sent: u64, recv: u64) {
        if sent > 0 {
            self.sent.fetch_add(sent, Ordering::Relaxed);
        }
        if recv > 0 {
            self.recv.fetch_add(recv, Ordering::Relaxed);
        }
    }

    pub fn traffic(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }

    /// Register a source IP. Fails when the credential is already in use
    /// from the limit of distinct addresses.
    pub fn add_ip(&self, ip: IpAddr) -> bool {
        let mut ips = self.ips.lock();
        if ips.contains(&ip) {
            return true;
        }
        if ips.len() >= IP_LIMIT {
            return false;
        }
        ips.insert(ip);
        true
    }

    pub fn del_ip(&self, ip: IpAddr) {
        self.ips.lock().remove(&ip);
    }
}

/// Password-digest lookup table shared by the server's accept path.
pub struct Authenticator {
    users: HashMap<String, Arc<User>>,
}

impl Authenticator {
    pub fn new<S: AsRef<str>>(passwords: &[S]) -> Self {
        let users = passwords
            .iter()
            .map(|p| {
                let user = Arc::new(User::new(p.as_ref()));
                (user.hash.clone(), user)
            })
            .collect();
        Self { users }
    }

    /// Validate a wire hash and bind the source IP to the user.
    pub fn auth_user(&self, hash: &str, ip: IpAddr) -> Option<Arc<User>> {
        let user = self.users.get(hash)?;
        if !user.add_ip(ip) {
            return None;
        }
        Some(user.clone())
    }

    pub fn get_user(&self, hash: &str) -> Option<Arc<User>> {
        self.users.get(hash).cloned()
    }
}
