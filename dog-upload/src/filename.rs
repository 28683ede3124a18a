//! Cross-platform filename normalization.
//!
//! [`FilenameProcessor::process_safely`] turns any input into a name that can
//! be written on Windows, macOS, Linux and served from a web URL path, while
//! keeping the extension. Running it on its own output is a no-op.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::FilenameConfig;

/// Windows device names that cannot be used as a file stem
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Characters rejected by at least one target filesystem
const WINDOWS_FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];

/// Characters that force percent-encoding in a URL path segment
const WEB_UNSAFE: &[char] = &['#', '%', '&', '{', '}', '^', '[', ']', '`', '+', ';', '=', '@', '$', ','];

/// Something the processor changed, reported alongside the new name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilenameWarning {
    EmptyName,
    UnicodeFolded { count: usize },
    UnsafeCharacters { count: usize },
    EmojiReplaced { count: usize },
    ReservedName { name: String },
    Truncated { original_bytes: usize },
    ExtensionTruncated,
    Trimmed,
}

/// Per-platform verdict for a filename, for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCompatibility {
    pub windows: bool,
    pub macos: bool,
    pub linux: bool,
    pub web: bool,
    pub issues: Vec<String>,
}

impl PlatformCompatibility {
    pub fn is_universal(&self) -> bool {
        self.windows && self.macos && self.linux && self.web
    }
}

/// Outcome of [`FilenameProcessor::process_safely`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFilename {
    pub original: String,
    pub processed_name: String,
    pub has_changes: bool,
    pub truncated: bool,
    pub warnings: Vec<FilenameWarning>,
    pub compatibility: PlatformCompatibility,
}

impl ProcessedFilename {
    /// Extension of the processed name, without the dot
    pub fn extension(&self) -> Option<&str> {
        split_extension(&self.processed_name).1
    }
}

/// How [`FilenameProcessor::generate_unique_filename`] resolves a collision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// `name(1).ext`, `name(2).ext`, ...
    Increment,
    /// `name_20240101T120000123.ext`
    Timestamp,
    /// `name_1a2b3c4d.ext`
    Hash,
}

struct Pass {
    name: String,
    truncated: bool,
    warnings: Vec<FilenameWarning>,
}

/// Normalizes filenames and resolves batch collisions
#[derive(Debug, Clone, Default)]
pub struct FilenameProcessor {
    config: FilenameConfig,
}

impl FilenameProcessor {
    pub fn new(config: FilenameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilenameConfig {
        &self.config
    }

    /// Normalize `name` into a cross-platform-safe filename
    pub fn process_safely(&self, name: &str) -> ProcessedFilename {
        let mut pass = self.normalize_once(name);

        // Dropping an empty extension can expose a new one; settle on a fixed point
        for _ in 0..4 {
            let next = self.normalize_once(&pass.name);
            if next.name == pass.name {
                break;
            }
            pass.name = next.name;
            pass.truncated |= next.truncated;
            pass.warnings.extend(next.warnings);
        }

        let compatibility = self.check_platform_compatibility(&pass.name);
        ProcessedFilename {
            original: name.to_string(),
            has_changes: pass.name != name,
            processed_name: pass.name,
            truncated: pass.truncated,
            warnings: pass.warnings,
            compatibility,
        }
    }

    fn normalize_once(&self, name: &str) -> Pass {
        let config = &self.config;
        let mut warnings = Vec::new();
        let mut truncated = false;

        let (raw_stem, raw_ext) = split_extension(name);
        let mut stem = raw_stem.to_string();
        let mut ext = raw_ext.map(str::to_string);

        if stem.trim_matches(is_trimmable).is_empty() {
            warnings.push(FilenameWarning::EmptyName);
            stem = self.placeholder();
        }

        if !config.unicode_support {
            let mut folded = 0;
            stem = fold_to_ascii(&stem, &mut folded);
            ext = ext.map(|e| fold_to_ascii(&e, &mut folded));
            if folded > 0 {
                warnings.push(FilenameWarning::UnicodeFolded { count: folded });
            }
        }

        let mut emoji = 0;
        let mut unsafe_chars = 0;
        stem = self.substitute(&stem, &mut unsafe_chars, &mut emoji);
        ext = ext.map(|e| self.substitute(&e, &mut unsafe_chars, &mut emoji));
        if unsafe_chars > 0 {
            warnings.push(FilenameWarning::UnsafeCharacters { count: unsafe_chars });
        }
        if emoji > 0 {
            warnings.push(FilenameWarning::EmojiReplaced { count: emoji });
        }

        if let Some(e) = ext.as_mut() {
            if e.len() > config.max_extension_length {
                truncate_to_bytes(e, config.max_extension_length);
                warnings.push(FilenameWarning::ExtensionTruncated);
                truncated = true;
            }
        }

        let mut trimmed = false;
        stem = trim_part(stem, &mut trimmed);
        ext = ext
            .map(|e| trim_part(e, &mut trimmed))
            .filter(|e| !e.is_empty());

        if is_reserved(&stem) {
            warnings.push(FilenameWarning::ReservedName { name: stem.clone() });
            stem.push_str(&config.reserved_suffix);
        }

        let ext_budget = ext.as_ref().map(|e| e.len() + 1).unwrap_or(0);
        let stem_budget = config.max_length.saturating_sub(ext_budget).max(1);
        if stem.len() > stem_budget {
            warnings.push(FilenameWarning::Truncated {
                original_bytes: stem.len() + ext_budget,
            });
            truncate_to_bytes(&mut stem, stem_budget);
            truncated = true;
            stem = trim_part(stem, &mut trimmed);
        }

        if trimmed {
            warnings.push(FilenameWarning::Trimmed);
        }

        if stem.is_empty() {
            warnings.push(FilenameWarning::EmptyName);
            stem = self.placeholder();
        }

        let name = match ext {
            Some(e) => format!("{}.{}", stem, e),
            None => stem,
        };
        Pass {
            name,
            truncated,
            warnings,
        }
    }

    /// Report which platforms accept `name` as-is and why the others do not
    pub fn check_platform_compatibility(&self, name: &str) -> PlatformCompatibility {
        let mut issues = Vec::new();
        let (stem, _) = split_extension(name);

        let has_control = name.chars().any(|c| c.is_control());
        let windows_chars: Vec<char> = name.chars().filter(|c| WINDOWS_FORBIDDEN.contains(c)).collect();
        let reserved = is_reserved(stem);
        let trailing = name.ends_with(' ') || name.ends_with('.');
        let too_long_bytes = name.len() > self.config.max_length;
        let too_long_utf16 = name.encode_utf16().count() > self.config.max_length;

        if name.is_empty() {
            issues.push("name is empty".to_string());
        }
        if has_control {
            issues.push("contains control characters".to_string());
        }
        if !windows_chars.is_empty() {
            issues.push(format!("contains characters forbidden on Windows: {:?}", windows_chars));
        }
        if reserved {
            issues.push(format!("'{}' is a reserved device name on Windows", stem));
        }
        if trailing {
            issues.push("ends with a space or dot".to_string());
        }
        if too_long_bytes {
            issues.push(format!("longer than {} bytes", self.config.max_length));
        }

        let windows = !name.is_empty() && !has_control && windows_chars.is_empty() && !reserved && !trailing && !too_long_utf16;
        let macos = !name.is_empty() && !name.contains(['/', ':', '\0']) && !too_long_bytes;
        let linux = !name.is_empty() && !name.contains(['/', '\0']) && !too_long_bytes;

        let needs_encoding = name.chars().any(|c| !c.is_ascii() || c == ' ' || WEB_UNSAFE.contains(&c));
        if needs_encoding {
            issues.push("requires percent-encoding in URLs".to_string());
        }
        let web = linux && !has_control && windows_chars.is_empty() && !needs_encoding;

        PlatformCompatibility {
            windows,
            macos,
            linux,
            web,
            issues,
        }
    }

    /// Derive a name from `base` that is not present in `existing`
    pub fn generate_unique_filename(
        &self,
        base: &str,
        existing: &HashSet<String>,
        policy: CollisionPolicy,
    ) -> String {
        if !existing.contains(base) {
            return base.to_string();
        }

        let (stem, ext) = split_extension(base);
        let join = |candidate_stem: String| match ext {
            Some(e) => format!("{}.{}", candidate_stem, e),
            None => candidate_stem,
        };

        match policy {
            CollisionPolicy::Increment => (1u64..)
                .map(|n| join(format!("{}({})", stem, n)))
                .find(|candidate| !existing.contains(candidate))
                .unwrap_or_else(|| base.to_string()),
            CollisionPolicy::Timestamp => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f").to_string();
                let first = join(format!("{}_{}", stem, stamp));
                if !existing.contains(&first) {
                    return first;
                }
                (1u64..)
                    .map(|n| join(format!("{}_{}_{}", stem, stamp, n)))
                    .find(|candidate| !existing.contains(candidate))
                    .unwrap_or(first)
            }
            CollisionPolicy::Hash => (0u64..)
                .map(|salt| {
                    let mut hasher = Sha256::new();
                    hasher.update(base.as_bytes());
                    hasher.update(salt.to_le_bytes());
                    let digest = hex::encode(hasher.finalize());
                    join(format!("{}_{}", stem, &digest[..8]))
                })
                .find(|candidate| !existing.contains(candidate))
                .unwrap_or_else(|| base.to_string()),
        }
    }

    /// Give every name in a batch a distinct value, in order
    pub fn deduplicate_batch<S: AsRef<str>>(&self, names: &[S], policy: CollisionPolicy) -> Vec<String> {
        let mut taken = HashSet::with_capacity(names.len());
        names
            .iter()
            .map(|name| {
                let unique = self.generate_unique_filename(name.as_ref(), &taken, policy);
                taken.insert(unique.clone());
                unique
            })
            .collect()
    }

    fn placeholder(&self) -> String {
        format!(
            "{}_{}",
            self.config.placeholder_prefix,
            Utc::now().format("%Y%m%d%H%M%S")
        )
    }

    fn substitute(&self, part: &str, unsafe_chars: &mut usize, emoji: &mut usize) -> String {
        part.chars()
            .filter_map(|c| {
                if self.config.replace_emoji && is_emoji(c) {
                    *emoji += 1;
                    // Joiners and selectors only glue pictographs together
                    return if c == '\u{200D}' || c == '\u{FE0F}' { None } else { Some('_') };
                }
                if let Some(safe) = self.safe_equivalent(c) {
                    *unsafe_chars += 1;
                    return Some(safe);
                }
                Some(c)
            })
            .collect()
    }

    fn safe_equivalent(&self, c: char) -> Option<char> {
        let full_width = match c {
            '<' => '\u{FF1C}',
            '>' => '\u{FF1E}',
            ':' => '\u{FF1A}',
            '"' => '\u{FF02}',
            '|' => '\u{FF5C}',
            '?' => '\u{FF1F}',
            '*' => '\u{FF0A}',
            '/' => '\u{FF0F}',
            '\\' => '\u{FF3C}',
            c if c.is_control() => return Some('_'),
            _ => return None,
        };
        // Full-width forms are non-ASCII, so ASCII-only output gets underscores
        Some(if self.config.unicode_support { full_width } else { '_' })
    }
}

/// Split at the last dot; a leading dot belongs to the extension
pub(crate) fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

fn is_trimmable(c: char) -> bool {
    c == ' ' || c == '.'
}

fn trim_part(part: String, trimmed: &mut bool) -> String {
    let result = part.trim_matches(is_trimmable);
    if result.len() != part.len() {
        *trimmed = true;
        result.to_string()
    } else {
        part
    }
}

pub(crate) fn is_reserved(stem: &str) -> bool {
    let upper = stem.trim_end_matches(is_trimmable).to_ascii_uppercase();
    RESERVED_NAMES.contains(&upper.as_str())
}

fn truncate_to_bytes(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut cut = max;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0x1F1E6..=0x1F1FF | 0xFE0F | 0x200D
    )
}

fn fold_to_ascii(value: &str, folded: &mut usize) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        *folded += 1;
        match fold_char(c) {
            Some(ascii) => out.push_str(ascii),
            None => out.push('_'),
        }
    }
    out
}

fn fold_char(c: char) -> Option<&'static str> {
    let folded = match c {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'Æ' => "AE",
        'æ' => "ae",
        'Ç' | 'Ć' | 'Č' => "C",
        'ç' | 'ć' | 'č' => "c",
        'Ď' | 'Đ' => "D",
        'ď' | 'đ' => "d",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'Ğ' => "G",
        'ğ' => "g",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'İ' => "I",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => "i",
        'Ł' => "L",
        'ł' => "l",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ñ' | 'ń' | 'ň' => "n",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Œ' => "OE",
        'œ' => "oe",
        'Ř' => "R",
        'ř' => "r",
        'Ś' | 'Š' | 'Ş' => "S",
        'ś' | 'š' | 'ş' => "s",
        'ß' => "ss",
        'Ť' | 'Ţ' => "T",
        'ť' | 'ţ' => "t",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' => "U",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'Ý' | 'Ÿ' => "Y",
        'ý' | 'ÿ' => "y",
        'Ź' | 'Ż' | 'Ž' => "Z",
        'ź' | 'ż' | 'ž' => "z",
        '\u{2018}' | '\u{2019}' => "'",
        '\u{201C}' | '\u{201D}' => "_",
        '\u{2013}' | '\u{2014}' => "-",
        '\u{3000}' => " ",
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> FilenameProcessor {
        FilenameProcessor::default()
    }

    #[test]
    fn safe_name_is_untouched() {
        let result = processor().process_safely("holiday-photo_01.jpg");
        assert!(!result.has_changes);
        assert!(result.warnings.is_empty());
        assert_eq!(result.processed_name, "holiday-photo_01.jpg");
    }

    #[test]
    fn unsafe_punctuation_becomes_full_width() {
        let result = processor().process_safely("what?<draft>|v2*.txt");
        assert_eq!(result.processed_name, "what？＜draft＞｜v2＊.txt");
        assert!(result.has_changes);
        assert!(result
            .warnings
            .contains(&FilenameWarning::UnsafeCharacters { count: 5 }));
    }

    #[test]
    fn control_bytes_are_replaced() {
        let result = processor().process_safely("line\u{0}break\u{1F}.md");
        assert_eq!(result.processed_name, "line_break_.md");
    }

    #[test]
    fn emoji_and_cjk_with_unicode_enabled() {
        let result = processor().process_safely("Coser展馆🔗TG (17).mp4");
        assert!(result.has_changes);
        assert_eq!(result.processed_name, "Coser展馆_TG (17).mp4");
        assert_eq!(result.extension(), Some("mp4"));
        assert!(result.processed_name.len() <= 255);
    }

    #[test]
    fn reserved_device_names_get_suffix() {
        let result = processor().process_safely("con.txt");
        assert_eq!(result.processed_name, "con_file.txt");
        let result = processor().process_safely("LPT9");
        assert_eq!(result.processed_name, "LPT9_file");
        assert!(!processor().process_safely("CONSOLE.txt").has_changes);
    }

    #[test]
    fn long_names_keep_extension() {
        let long = format!("{}.mkv", "a".repeat(400));
        let result = processor().process_safely(&long);
        assert!(result.truncated);
        assert_eq!(result.processed_name.len(), 255);
        assert!(result.processed_name.ends_with(".mkv"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = format!("{}.png", "展".repeat(200));
        let result = processor().process_safely(&long);
        assert!(result.processed_name.len() <= 255);
        assert!(result.processed_name.ends_with(".png"));
    }

    #[test]
    fn trims_spaces_and_dots() {
        let result = processor().process_safely("  report. .pdf ");
        assert_eq!(result.processed_name, "report.pdf");
        assert!(result.warnings.contains(&FilenameWarning::Trimmed));
    }

    #[test]
    fn empty_names_get_placeholder() {
        let result = processor().process_safely("");
        assert!(result.processed_name.starts_with("unnamed_"));
        let result = processor().process_safely(" . ");
        assert!(result.processed_name.starts_with("unnamed_"));
        let result = processor().process_safely(".env");
        assert!(result.processed_name.starts_with("unnamed_"));
        assert!(result.processed_name.ends_with(".env"));
    }

    #[test]
    fn ascii_folding_when_unicode_disabled() {
        let ascii = FilenameProcessor::new(FilenameConfig::default().ascii_only());
        let result = ascii.process_safely("Crème brûlée: ÆØÅ 展.jpg");
        assert_eq!(result.processed_name, "Creme brulee_ AEOA _.jpg");
        assert!(result.processed_name.is_ascii());
        assert!(!ascii.process_safely(&result.processed_name).has_changes);
    }

    #[test]
    fn compatibility_report() {
        let p = processor();
        let report = p.check_platform_compatibility("notes.txt");
        assert!(report.is_universal());
        assert!(report.issues.is_empty());

        let report = p.check_platform_compatibility("a:b.txt");
        assert!(!report.windows);
        assert!(!report.macos);
        assert!(report.linux);

        let report = p.check_platform_compatibility("NUL.txt");
        assert!(!report.windows);
        assert!(report.linux);

        let report = p.check_platform_compatibility("my song.mp3");
        assert!(report.windows);
        assert!(!report.web);
    }

    #[test]
    fn increment_policy() {
        let p = processor();
        let existing: HashSet<String> = ["cat.png", "cat(1).png"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            p.generate_unique_filename("cat.png", &existing, CollisionPolicy::Increment),
            "cat(2).png"
        );
        assert_eq!(
            p.generate_unique_filename("dog.png", &existing, CollisionPolicy::Increment),
            "dog.png"
        );
    }

    #[test]
    fn timestamp_and_hash_policies_avoid_collisions() {
        let p = processor();
        let existing: HashSet<String> = ["cat.png".to_string()].into_iter().collect();
        for policy in [CollisionPolicy::Timestamp, CollisionPolicy::Hash] {
            let name = p.generate_unique_filename("cat.png", &existing, policy);
            assert!(!existing.contains(&name));
            assert!(name.starts_with("cat_"));
            assert!(name.ends_with(".png"));
        }
    }

    #[test]
    fn batch_deduplication() {
        let names = ["a.txt", "a.txt", "a(1).txt", "a.txt", "b"];
        let unique = processor().deduplicate_batch(&names, CollisionPolicy::Increment);
        let set: HashSet<&String> = unique.iter().collect();
        assert_eq!(set.len(), names.len());
        assert_eq!(unique[0], "a.txt");
        assert_eq!(unique[1], "a(1).txt");
    }
}
