//! Stable exit codes for patchgate CLI commands.

/// Command ran; its JSON result may still report `ok: false`.
pub const OK: i32 = 0;
/// Invalid arguments, configuration, missing records or other raised errors.
pub const INVALID: i32 = 1;
/// With `--fail-on-error`: the command ran but its result reports `ok: false`
/// (or `applied: false` for verdicts).
pub const STAGE_FAILED: i32 = 2;
