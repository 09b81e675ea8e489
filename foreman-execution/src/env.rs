//! Process environment marker for spawned workers

/// Variable set on every worker process the parent spawns
pub const CHILD_ENV_VAR: &str = "FOREMAN_CHILD";

/// Whether the current process was spawned as a worker
pub fn is_child_process() -> bool {
    std::env::var(CHILD_ENV_VAR)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
