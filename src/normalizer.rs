use crate::constants::{
    BOXED_EMPTY, BOXED_EMPTY_PLACEHOLDER, BOXED_OPEN, CODE_FENCE, MATH_SUBSTITUTIONS,
    REASONING_CLOSE_TAG, REASONING_OPEN_TAG,
};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REASONING_TAG_REGEX: Regex = Regex::new(&format!(
        "{}|{}",
        regex::escape(REASONING_OPEN_TAG),
        regex::escape(REASONING_CLOSE_TAG)
    ))
    .expect("Invalid reasoning tag regex");
    static ref MATH_TOKEN_REGEX: Regex = Regex::new(
        &MATH_SUBSTITUTIONS
            .iter()
            .map(|(token, _)| regex::escape(token))
            .collect::<Vec<_>>()
            .join("|")
    )
    .expect("Invalid math token regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerConfig {
    pub normalize_math: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            normalize_math: true,
        }
    }
}

/// Per-fragment text normalization for a single message.
///
/// Only the code-fence parity bit survives between fragments, so the result
/// of normalizing fragments one by one is what gets rendered incrementally.
#[derive(Debug, Clone, Default)]
pub struct ContentNormalizer {
    config: NormalizerConfig,
    in_code_block: bool,
}

impl ContentNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            in_code_block: false,
        }
    }

    pub fn config(&self) -> NormalizerConfig {
        self.config
    }

    /// Whether text after the last normalized fragment sits inside a code fence.
    pub fn in_code_block(&self) -> bool {
        self.in_code_block
    }

    pub fn normalize(&mut self, raw: &str) -> String {
        let stripped = strip_reasoning_tags(raw);

        let mut out = String::with_capacity(stripped.len());
        for (i, segment) in stripped.split(CODE_FENCE).enumerate() {
            if i > 0 {
                out.push_str(CODE_FENCE);
                self.in_code_block = !self.in_code_block;
            }
            if self.config.normalize_math && !self.in_code_block {
                out.push_str(&substitute_math(segment));
            } else {
                out.push_str(segment);
            }
        }

        if out == BOXED_EMPTY {
            return BOXED_EMPTY_PLACEHOLDER.to_string();
        }
        out
    }
}

/// Removes the reasoning wrapper tags, keeping whatever they wrap.
pub fn strip_reasoning_tags(text: &str) -> String {
    REASONING_TAG_REGEX.replace_all(text, "").into_owned()
}

/// Replaces bounded math escapes with their glyphs.
///
/// A token counts only when it is not itself escaped (no backslash before it)
/// and is not the prefix of a longer command (no alphanumeric after it).
pub fn substitute_math(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in MATH_TOKEN_REGEX.find_iter(text) {
        let escaped = text[..m.start()].ends_with('\\');
        let continues = text[m.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric());
        if escaped || continues {
            continue;
        }
        let glyph = MATH_SUBSTITUTIONS
            .iter()
            .find(|(token, _)| *token == m.as_str())
            .map(|(_, glyph)| *glyph);
        if let Some(glyph) = glyph {
            out.push_str(&text[last..m.start()]);
            out.push_str(glyph);
            last = m.end();
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Closing braces needed to close every `\boxed{` still open in `content`.
///
/// Code fences are skipped and escaped characters (`\{`, `\}`) never count.
/// Returns 0 for balanced input.
pub fn closing_deficit(content: &str) -> usize {
    let bytes = content.as_bytes();
    let fence = CODE_FENCE.as_bytes();
    let boxed = BOXED_OPEN.as_bytes();

    let mut open_at: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut in_code = false;
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];
        if rest.starts_with(fence) {
            in_code = !in_code;
            i += fence.len();
            continue;
        }
        if in_code {
            i += 1;
            continue;
        }
        if rest.starts_with(boxed) {
            depth += 1;
            open_at.push(depth);
            i += boxed.len();
            continue;
        }
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' if depth > 0 => {
                if open_at.last() == Some(&depth) {
                    open_at.pop();
                }
                depth -= 1;
            }
            _ => {}
        }
        i += 1;
    }

    match open_at.first() {
        Some(&outermost) => depth + 1 - outermost,
        None => 0,
    }
}

/// Appends the missing closers. Applying it twice changes nothing the second time.
pub fn balance_boxed(content: &str) -> String {
    let deficit = closing_deficit(content);
    let mut out = String::with_capacity(content.len() + deficit);
    out.push_str(content);
    out.extend(std::iter::repeat('}').take(deficit));
    out
}
