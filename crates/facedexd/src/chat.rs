//! Keyword answers about the registration log.
//!
//! Rules are checked in a fixed order because one message can hit several:
//! "how many … registered", then "last", then "when", then "list".

use facedex_core::Identity;

pub const NO_REGISTRATIONS: &str = "No registrations yet.";
pub const PERSON_NOT_FOUND: &str = "Person not found.";
pub const NOT_UNDERSTOOD: &str = "Sorry, I didn't understand that.";

/// Answer `message` from a snapshot of the registry.
pub fn answer(message: &str, entries: &[Identity]) -> String {
    if entries.is_empty() {
        return NO_REGISTRATIONS.to_string();
    }

    let q = message.to_lowercase();

    if q.contains("how many") && q.contains("registered") {
        return format!("There are {} registered people.", entries.len());
    }

    if q.contains("last") {
        let last = most_recent(entries);
        return format!(
            "Last registered: {} at {}",
            last.name,
            last.last_registered().to_rfc3339()
        );
    }

    if q.contains("when") {
        return match entries.iter().find(|e| q.contains(&e.name.to_lowercase())) {
            Some(e) => format!("{} registered at {}", e.name, e.last_registered().to_rfc3339()),
            None => PERSON_NOT_FOUND.to_string(),
        };
    }

    if q.contains("list") || q.contains("show all") {
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        return format!("Registered: {}", names.join(", "));
    }

    NOT_UNDERSTOOD.to_string()
}

/// Latest registration activity; the earliest entry wins a tie.
fn most_recent(entries: &[Identity]) -> &Identity {
    entries[1..].iter().fold(&entries[0], |best, e| {
        if e.last_registered() > best.last_registered() {
            e
        } else {
            best
        }
    })
}
