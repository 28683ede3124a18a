use chrono::{DateTime, Datelike, Utc};

use crate::FileId;

/// Strategy for generating storage keys
pub trait StorageKeyStrategy: Send + Sync {
    /// Key for a newly uploaded object
    fn object_key(&self, input: &KeyInput<'_>) -> String;
}

/// What a key may be derived from
#[derive(Debug, Clone)]
pub struct KeyInput<'a> {
    pub caller_id: &'a str,
    pub file_id: &'a FileId,
    pub processed_name: &'a str,
    pub target_context_id: Option<&'a str>,
    pub uploaded_at: DateTime<Utc>,
}

/// Default layout: `[context/]caller/yyyy/mm/file_id/name`
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyStrategy;

impl StorageKeyStrategy for DefaultKeyStrategy {
    fn object_key(&self, input: &KeyInput<'_>) -> String {
        let caller = path_segment(input.caller_id);
        let dt = input.uploaded_at;
        let key = format!(
            "{}/{:04}/{:02}/{}/{}",
            caller,
            dt.year(),
            dt.month(),
            input.file_id,
            input.processed_name
        );

        match input.target_context_id {
            Some(context) if !context.trim().is_empty() => format!("{}/{}", path_segment(context), key),
            _ => key,
        }
    }
}

/// Keep caller-supplied ids from adding or escaping path levels
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" => "anonymous".to_string(),
        "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input<'a>(file_id: &'a FileId, context: Option<&'a str>) -> KeyInput<'a> {
        KeyInput {
            caller_id: "user-42",
            file_id,
            processed_name: "clip.mp4",
            target_context_id: context,
            uploaded_at: Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn default_layout() {
        let id = FileId::from_string("f1".to_string());
        assert_eq!(DefaultKeyStrategy.object_key(&input(&id, None)), "user-42/2026/03/f1/clip.mp4");
        assert_eq!(
            DefaultKeyStrategy.object_key(&input(&id, Some("post-7"))),
            "post-7/user-42/2026/03/f1/clip.mp4"
        );
    }

    #[test]
    fn hostile_ids_stay_in_one_segment() {
        let id = FileId::from_string("f1".to_string());
        let mut hostile = input(&id, Some("../etc"));
        hostile.caller_id = "a/b";
        assert_eq!(DefaultKeyStrategy.object_key(&hostile), ".._etc/a_b/2026/03/f1/clip.mp4");
    }
}
