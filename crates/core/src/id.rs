//! Identifiers for persisted records.

use std::sync::Mutex;
use ulid::{Generator, Ulid};

static GENERATOR: Mutex<Option<Generator>> = Mutex::new(None);

/// Generate a fresh record id.
///
/// Ids are ULIDs rendered as strings. Ids generated by one process are
/// strictly increasing, so they sort in creation order.
pub fn new_record_id() -> String {
    let mut guard = GENERATOR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let generator = guard.get_or_insert_with(Generator::new);
    generator
        .generate()
        .unwrap_or_else(|_| Ulid::new())
        .to_string()
}
