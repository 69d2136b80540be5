pub mod config;
pub mod db;
pub mod elector;
pub mod error;
pub mod filecache;
pub mod filepaths;
pub mod gateway;
pub mod indexlist;
pub mod jobfeed;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod objstore;
pub mod quant;
pub mod quantfile;
pub mod scan;
pub mod sessions;
pub mod wire;

use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase-alphanumeric id suffix, used for job ids and connect tokens.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_CHARS[rng.gen_range(0..ID_CHARS.len())] as char)
        .collect()
}

/// Seconds since the Unix epoch.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_has_requested_length_and_charset() {
        for len in [1, 16, 32] {
            let id = random_id(len);
            assert_eq!(id.len(), len);
            assert!(id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn random_id_is_not_constant() {
        let a = random_id(16);
        let b = random_id(16);
        assert_ne!(a, b);
    }
}
