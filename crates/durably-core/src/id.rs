//! Lexicographically-sortable identifiers.
//!
//! Ids are a fixed-width millisecond timestamp followed by a random suffix,
//! so that `ORDER BY id` and `ORDER BY createdAt` agree without an extra
//! index, and ids minted slightly apart from each other still compare in
//! creation order.

use chrono::Utc;
use rand::Rng;

const RANDOM_HEX_LEN: usize = 16;

pub fn new_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    format!("{:013}_{}", millis, random_hex(RANDOM_HEX_LEN))
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b, "expected {a} < {b}");
    }

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
