//! Cheap change-detection fingerprints of project snapshots.
//!
//! A fingerprint summarizes the *shape* of a snapshot: the size of each collection, the active
//! sprint and the update marker of the project record. It is meant for external consumers, e.g.
//! to answer conditional requests, and is neither collision resistant nor used by the cache
//! itself.

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// The facts a fingerprint is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape<'a> {
    pub members: usize,
    pub backlog: usize,
    pub sprints: usize,
    pub tasks: usize,
    pub active_sprint_id: Option<&'a str>,
    /// Update marker of the project record, in epoch milliseconds.
    pub updated_at: Option<i64>,
}

impl Shape<'_> {
    /// The canonical string the fingerprint hashes, e.g. `3|12|2|40|s1|1700000000000`.
    ///
    /// Absent values are written as `-`.
    pub fn canonical(&self) -> String {
        let updated_at = match self.updated_at {
            Some(updated_at) => updated_at.to_string(),
            None => "-".to_owned(),
        };
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.members,
            self.backlog,
            self.sprints,
            self.tasks,
            self.active_sprint_id.unwrap_or("-"),
            updated_at,
        )
    }

    /// Computes the fingerprint of this shape.
    pub fn fingerprint(&self) -> String {
        let hash = rolling_hash(&self.canonical());
        to_base36(hash.unsigned_abs())
    }
}

/// The classic `h = 31 * h + c` string hash over UTF-16 code units, wrapping at 32 bits.
pub fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_owned();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(char::from(BASE36_DIGITS[(value % 36) as usize]));
        value /= 36;
    }
    digits.iter().rev().collect()
}
