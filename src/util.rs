use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// True when `value` names exactly one directory entry: no separators, not `.`/`..`.
pub fn is_single_path_component(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed != value {
        return false;
    }
    if value == "." || value == ".." {
        return false;
    }
    !value.contains(['/', '\\', '\0'])
}
