//! Environment-variable configuration switches

use tracing::{info, warn};

/// Parse a boolean switch from the environment.
///
/// Unset or empty means `false`; `1`, `true`, `yes` and `y` mean `true`
/// (case-insensitive); anything else is reported and treated as `false`.
pub fn bool_env(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => false,
        Ok(value) => {
            let lowered = value.to_lowercase();
            let result = matches!(lowered.as_str(), "1" | "true" | "yes" | "y");
            if !result && lowered != "0" && lowered != "false" && lowered != "no" && lowered != "n" {
                warn!("Unknown value for {}: {}", name, value);
            } else {
                info!("{} is set to {}", name, result);
            }
            result
        }
        Err(_) => false,
    }
}

/// Parse a comma-separated list from the environment.
///
/// Returns `None` if the variable is unset or empty.
pub fn list_env(name: &str) -> Option<Vec<String>> {
    let value = std::env::var(name).ok()?;
    if value.is_empty() {
        return None;
    }
    info!("{} is set to {}", name, value);
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

/// Parse an enumerated choice from the environment.
///
/// Returns the value associated with the first matching option name, or
/// `None` when unset. Unrecognised values are reported and ignored.
pub fn choice_env<T: Copy>(name: &str, options: &[(&str, T)]) -> Option<T> {
    let value = std::env::var(name).ok()?;
    for (option, result) in options {
        if value.eq_ignore_ascii_case(option) {
            info!("{} is set to {}", name, option);
            return Some(*result);
        }
    }
    warn!("Unknown value for {}: {}", name, value);
    None
}

/// Parse a count from the environment, falling back to `default`.
pub fn count_env(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(value) => match value.parse::<usize>() {
            Ok(count) => {
                info!("{} is set to {}", name, count);
                count
            }
            Err(_) => {
                warn!("Unknown value for {}: {}", name, value);
                default
            }
        },
        Err(_) => default,
    }
}
