//! Folding upstream Set-Cookie responses back into a served cookie.
//!
//! An origin response may re-issue any number of cookie fields. Expired
//! fields get unset, fresh fields get applied, with two guards: fields that
//! carry a service's session identity are never unset by expiry alone, and a
//! re-issued protected value that is implausibly short is rejected as a
//! truncated copy rather than allowed to clobber a healthy credential.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Protected fields per service with their minimum plausible length.
///
/// A refresh shorter than the floor is treated as corrupted; expiry alone
/// never unsets these.
const PROTECTED_FIELDS: &[(&str, &[(&str, usize)])] = &[
    (
        "instagram",
        &[("sessionid", 20), ("csrftoken", 10), ("mid", 10)],
    ),
    ("instagram_bearer", &[("token", 20)]),
];

/// One field parsed out of a Set-Cookie header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedField {
    pub name: String,
    pub value: String,
    /// Absolute expiry, from either `Expires` or `Max-Age`.
    pub expires: Option<DateTime<Utc>>,
}

/// The outcome of merging Set-Cookie values for one service.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Fields to remove from the cookie.
    pub unset: Vec<String>,
    /// Fields to apply to the cookie.
    pub set: Vec<(String, String)>,
}

/// Looks up the length floor for a protected field of a service.
pub(crate) fn protected_floor(service: &str, field: &str) -> Option<usize> {
    protected_fields(service)
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, floor)| *floor)
}

/// All protected fields of a service with their floors.
pub(crate) fn protected_fields(service: &str) -> &'static [(&'static str, usize)] {
    PROTECTED_FIELDS
        .iter()
        .find(|(s, _)| *s == service)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

/// Parses a single Set-Cookie header value.
///
/// The first `k=v` pair is the field; remaining `;`-separated segments are
/// attributes, of which only `Expires` and `Max-Age` matter here. Returns
/// None for values with no field pair.
pub fn parse_set_cookie(value: &str) -> Option<RefreshedField> {
    let mut segments = value.split(';');

    let (name, field_value) = segments.next()?.trim().split_once('=')?;
    if name.is_empty() {
        return None;
    }

    let mut expires = None;
    for segment in segments {
        let segment = segment.trim();
        let (attr, attr_value) = match segment.split_once('=') {
            Some((a, v)) => (a.trim(), v.trim()),
            None => continue,
        };

        if attr.eq_ignore_ascii_case("expires") {
            if let Ok(when) = DateTime::parse_from_rfc2822(attr_value) {
                expires = Some(when.with_timezone(&Utc));
            }
        } else if attr.eq_ignore_ascii_case("max-age") {
            if let Ok(seconds) = attr_value.parse::<i64>() {
                expires = Some(Utc::now() + Duration::seconds(seconds));
            }
        }
    }

    Some(RefreshedField {
        name: name.to_string(),
        value: field_value.to_string(),
        expires,
    })
}

/// Merges Set-Cookie header values into unset/set operations for a service.
///
/// Expired fields are collected for unsetting unless protected; protected
/// fields whose fresh value is under the length floor are dropped entirely.
pub fn merge_refreshed_fields(service: &str, set_cookie_values: &[String]) -> RefreshOutcome {
    merge_refreshed_fields_at(service, set_cookie_values, Utc::now())
}

fn merge_refreshed_fields_at(
    service: &str,
    set_cookie_values: &[String],
    now: DateTime<Utc>,
) -> RefreshOutcome {
    let mut outcome = RefreshOutcome::default();

    for value in set_cookie_values {
        let Some(field) = parse_set_cookie(value) else {
            continue;
        };

        let floor = protected_floor(service, &field.name);

        if field.expires.is_some_and(|when| when <= now) {
            if floor.is_none() {
                outcome.unset.push(field.name);
            }
            // Protected fields survive expiry; the origin re-issues them.
            continue;
        }

        if let Some(floor) = floor {
            if field.value.len() < floor {
                debug!(
                    service,
                    field = %field.name,
                    length = field.value.len(),
                    "rejecting implausibly short protected cookie field"
                );
                continue;
            }
        }

        outcome.set.push((field.name, field.value));
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_field() {
        let field = parse_set_cookie("sessionid=abc123; Path=/; HttpOnly").unwrap();
        assert_eq!(field.name, "sessionid");
        assert_eq!(field.value, "abc123");
        assert!(field.expires.is_none());
    }

    #[test]
    fn test_parse_expires_attribute() {
        let field =
            parse_set_cookie("mid=xyz; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Path=/").unwrap();
        let when = field.expires.unwrap();
        assert_eq!(when.format("%Y-%m-%d").to_string(), "2015-10-21");
    }

    #[test]
    fn test_parse_max_age_attribute() {
        let field = parse_set_cookie("mid=xyz; Max-Age=3600").unwrap();
        let when = field.expires.unwrap();
        assert!(when > Utc::now());
    }

    #[test]
    fn test_parse_rejects_attribute_only_value() {
        assert!(parse_set_cookie("; Path=/").is_none());
    }

    #[test]
    fn test_expired_unprotected_field_is_unset() {
        let outcome = merge_refreshed_fields(
            "instagram",
            &["dpr=1.5; Expires=Wed, 21 Oct 2015 07:28:00 GMT".to_string()],
        );
        assert_eq!(outcome.unset, vec!["dpr".to_string()]);
        assert!(outcome.set.is_empty());
    }

    #[test]
    fn test_expired_protected_field_survives() {
        let outcome = merge_refreshed_fields(
            "instagram",
            &["sessionid=whatever-long-value-here; Expires=Wed, 21 Oct 2015 07:28:00 GMT"
                .to_string()],
        );
        assert!(outcome.unset.is_empty());
        assert!(outcome.set.is_empty());
    }

    #[test]
    fn test_short_protected_refresh_is_rejected() {
        let outcome =
            merge_refreshed_fields("instagram", &["sessionid=short; Path=/".to_string()]);
        assert!(outcome.set.is_empty());
        assert!(outcome.unset.is_empty());
    }

    #[test]
    fn test_mixed_refresh_keeps_other_fields_untouched() {
        // Expired unprotected field unset, short protected rejected, the
        // rest applied.
        let values = vec![
            "dpr=2; Expires=Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
            "sessionid=tiny".to_string(),
            "ig_did=AABBCCDD-1122".to_string(),
        ];
        let outcome = merge_refreshed_fields("instagram", &values);
        assert_eq!(outcome.unset, vec!["dpr".to_string()]);
        assert_eq!(
            outcome.set,
            vec![("ig_did".to_string(), "AABBCCDD-1122".to_string())]
        );
    }

    #[test]
    fn test_unprotected_service_has_no_floor() {
        let outcome = merge_refreshed_fields("reddit", &["token=x".to_string()]);
        assert_eq!(outcome.set, vec![("token".to_string(), "x".to_string())]);
    }
}
