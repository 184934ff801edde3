/// Fallback generate endpoint when neither flags nor environment provide one
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434/api/generate";

/// Fallback model name
pub const DEFAULT_MODEL: &str = "deepseek-r1:32b";

/// One animation frame at 60 Hz
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 16;

/// Upper bound for a single NDJSON frame
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Reasoning wrapper emitted by reasoning models
pub const REASONING_OPEN_TAG: &str = "<think>";
pub const REASONING_CLOSE_TAG: &str = "</think>";

pub const CODE_FENCE: &str = "```";

/// Boxed construct markers
pub const BOXED_OPEN: &str = "\\boxed{";
pub const BOXED_EMPTY: &str = "\\boxed{}";
pub const BOXED_EMPTY_PLACEHOLDER: &str = "\\boxed{\\ }";

/// Escaped math operators and their glyphs
pub const MATH_SUBSTITUTIONS: &[(&str, &str)] = &[
    ("\\times", "×"),
    ("\\div", "÷"),
    ("\\pm", "±"),
    ("\\cdot", "·"),
    ("\\leq", "≤"),
    ("\\geq", "≥"),
];

/// Prefix put in front of a partial message when its stream fails
pub const INTERRUPTION_MARKER: &str = "⚠️ Generation interrupted. Current progress:\n";

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
