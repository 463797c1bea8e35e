//! Handle remaining-quota headers.
//!
//! Upstreams report one header per quota category, sharing a common prefix,
//! e.g. `x-ms-ratelimit-remaining-subscription-reads: 11999`. The part after
//! the prefix names the category, the value is the remaining request count.

use http::HeaderMap;

/// Header prefix used by Azure Resource Manager
pub const DEFAULT_HEADER_PREFIX: &str = "x-ms-ratelimit-remaining-";

/// Iterate over all well-formed `(category, remaining)` pairs in `headers`.
///
/// `prefix` is matched ASCII case-insensitively. Headers whose value is not a
/// non-negative integer are skipped, as are headers consisting of the bare
/// prefix. Only the first value of a repeated header is considered.
pub(crate) fn remaining_quotas<'a>(
    headers: &'a HeaderMap,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a str, u64)> + 'a {
    headers.keys().filter_map(move |name| {
        let category = strip_prefix_ignore_case(name.as_str(), prefix)?;
        if category.is_empty() {
            return None;
        }
        let value = parse_header_value(headers.get(name)?)?;
        Some((category, value))
    })
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &name[prefix.len()..])
}

fn parse_header_value(value: &http::HeaderValue) -> Option<u64> {
    value.to_str().ok()?.trim().parse::<u64>().ok()
}
