/// Check whether a request's target authority is blocked.
///
/// The block-list is a single substring: any authority (`host:port`) that
/// contains it is refused. An empty or unset block-list blocks nothing.
///
/// # Arguments
/// * `avoid` - Optional configured block-list substring
/// * `authority` - The request's target authority to check
pub fn host_is_blocked(avoid: Option<&str>, authority: &str) -> bool {
    match avoid {
        Some(avoid) if !avoid.is_empty() => authority.contains(avoid),
        _ => false,
    }
}
