//! Shared helpers: log sanitizing for remote-provided strings and lock recovery.

use std::env;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Environment switch raising the log snippet cap.
pub const DIAGNOSTIC_ENV: &str = "TELEPATHY_RS_DIAGNOSTIC";

const SNIPPET_CAP: usize = 160;
const DIAGNOSTIC_SNIPPET_CAP: usize = 512;

/// Whether `TELEPATHY_RS_DIAGNOSTIC` asks for longer log snippets.
pub fn diagnostic_mode() -> bool {
    env::var(DIAGNOSTIC_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    ["1", "true", "yes", "on"]
        .iter()
        .any(|accepted| value.eq_ignore_ascii_case(accepted))
}

/// Snippet cap in characters for the current mode.
pub fn log_limit() -> usize {
    if diagnostic_mode() {
        DIAGNOSTIC_SNIPPET_CAP
    } else {
        SNIPPET_CAP
    }
}

/// Flattens line breaks and cuts `value` to `max_chars`, marking cuts with `...`.
pub fn sanitize_log_value(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let flattened: String = value
        .chars()
        .take(max_chars)
        .map(|ch| if matches!(ch, '\n' | '\r') { ' ' } else { ch })
        .collect();
    let cut = value.chars().nth(max_chars).is_some();
    let flattened = flattened.trim();
    if cut {
        format!("{flattened}...")
    } else {
        flattened.to_owned()
    }
}

/// Bus-provided text made safe for a single log line.
pub fn log_snippet(value: &str) -> String {
    sanitize_log_value(value, log_limit())
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_values_are_flattened_and_cut() {
        assert_eq!(sanitize_log_value("ab\ncd\rEF", 5), "ab cd...");
        assert_eq!(sanitize_log_value("exact", 5), "exact");
        assert_eq!(sanitize_log_value(" pad ", 10), "pad");
        assert_eq!(sanitize_log_value("anything", 0), "");
    }

    #[test]
    fn truthy_switch_values() {
        for value in ["1", "TRUE", " yes ", "On"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "off", "", "nope"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn poisoned_lock_is_still_usable() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let cloned = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock();
            panic!("poison the lock");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
