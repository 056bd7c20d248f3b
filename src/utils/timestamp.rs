//! 时间戳解析
//!
//! 存储中的时间戳可能来自不同版本的写入方：RFC 3339 字符串、无时区字符串、
//! 秒 / 毫秒级数字，或 `{seconds, nanoseconds}` 对象。这里提供一个"全函数"：
//! 任何输入都不会报错，无法解析时返回排序最靠后的哨兵值。
//!
//! 解析顺序：
//!
//! | 顺序 | 输入形态 | 说明 |
//! |------|----------|------|
//! | 1 | RFC 3339 字符串 | `2026-10-18T09:30:00Z` |
//! | 2 | 无时区字符串 | 按 UTC 处理 |
//! | 3 | 数字 / 数字字符串 | `>= 1e11` 视为毫秒，否则为秒 |
//! | 4 | `{seconds, nanoseconds}` 对象 | 兼容 `_seconds` 写法 |
//! | 5 | 其他 | 哨兵值，`ok = false` |

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// 无法解析时使用的哨兵值（按"最近活动"降序排序时排在最后）
pub const SENTINEL: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// 大于该值的数字按毫秒处理
const MILLIS_THRESHOLD: f64 = 1e11;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// 解析任意 JSON 值为时间戳
///
/// # 返回
/// `(时间, 是否解析成功)`；失败时时间为 [`SENTINEL`]
pub fn parse_timestamp(value: &Value) -> (DateTime<Utc>, bool) {
    match try_parse(value) {
        Some(ts) => (ts, true),
        None => (SENTINEL, false),
    }
}

/// [`parse_timestamp`] 的 Option 版本
pub fn parse_timestamp_opt(value: &Value) -> Option<DateTime<Utc>> {
    try_parse(value)
}

/// 记录级别的时间戳兜底顺序：`timestamp` 字段 → `createdAt` 字段 → 存储层创建时间
pub fn best_record_timestamp(
    doc: &Map<String, Value>,
    stored_created_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    doc.get("timestamp")
        .and_then(try_parse)
        .or_else(|| doc.get("createdAt").and_then(try_parse))
        .or(stored_created_at)
}

fn try_parse(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s.trim()),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::Object(map) => parse_object(map),
        _ => None,
    }
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

fn parse_object(map: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let seconds = map
        .get("seconds")
        .or_else(|| map.get("_seconds"))
        .and_then(Value::as_i64)?;
    let nanos = map
        .get("nanoseconds")
        .or_else(|| map.get("_nanoseconds"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let nanos = u32::try_from(nanos).ok().filter(|n| *n < 1_000_000_000)?;
    DateTime::from_timestamp(seconds, nanos)
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = if raw >= MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1000.0
    };
    if millis > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_rfc3339() {
        let (ts, ok) = parse_timestamp(&json!("2026-10-18T09:30:00Z"));
        assert!(ok);
        assert_eq!(ts, expected());

        let (ts, ok) = parse_timestamp(&json!("2026-10-18T11:30:00+02:00"));
        assert!(ok);
        assert_eq!(ts, expected());
    }

    #[test]
    fn test_parse_naive_strings_as_utc() {
        assert_eq!(parse_timestamp(&json!("2026-10-18 09:30:00")), (expected(), true));
        assert_eq!(parse_timestamp(&json!("2026-10-18T09:30:00")), (expected(), true));
    }

    #[test]
    fn test_parse_epoch_seconds_and_millis() {
        let secs = expected().timestamp();
        assert_eq!(parse_timestamp(&json!(secs)), (expected(), true));
        assert_eq!(parse_timestamp(&json!(secs * 1000)), (expected(), true));
        assert_eq!(parse_timestamp(&json!(secs.to_string())), (expected(), true));
    }

    #[test]
    fn test_parse_seconds_object() {
        let secs = expected().timestamp();
        assert_eq!(
            parse_timestamp(&json!({"seconds": secs, "nanoseconds": 0})),
            (expected(), true)
        );
        assert_eq!(
            parse_timestamp(&json!({"_seconds": secs})),
            (expected(), true)
        );
    }

    #[test]
    fn test_garbage_falls_back_to_sentinel() {
        for value in [
            json!(null),
            json!(""),
            json!("yesterday"),
            json!(true),
            json!([1, 2]),
            json!({"foo": 1}),
            json!(-5),
            json!({"seconds": 1, "nanoseconds": 5_000_000_000u64}),
        ] {
            assert_eq!(parse_timestamp(&value), (SENTINEL, false), "{value}");
        }
    }

    #[test]
    fn test_best_record_timestamp_ordering() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let doc = json!({"timestamp": "2026-10-18T09:30:00Z", "createdAt": "2026-01-02T00:00:00Z"});
        let doc = doc.as_object().unwrap();
        assert_eq!(best_record_timestamp(doc, Some(created)), Some(expected()));

        let doc = json!({"timestamp": "garbage", "createdAt": "2026-10-18T09:30:00Z"});
        let doc = doc.as_object().unwrap();
        assert_eq!(best_record_timestamp(doc, Some(created)), Some(expected()));

        let doc = json!({"timestamp": "garbage"});
        let doc = doc.as_object().unwrap();
        assert_eq!(best_record_timestamp(doc, Some(created)), Some(created));
        assert_eq!(best_record_timestamp(doc, None), None);
    }
}
