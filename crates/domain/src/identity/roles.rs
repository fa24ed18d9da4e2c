use std::collections::BTreeSet;

/// Compute the role set forwarded upstream for a token-authenticated caller.
///
/// Rules, applied in order:
/// 1. Only roles that are both granted and configured survive.
/// 2. A configured default role fills an otherwise empty set.
/// 3. A configured admin role, when present, collapses the set to itself.
///
/// The result is ordered (BTreeSet), so the comma-joined header value is
/// deterministic.
pub fn effective_roles<'a>(
    granted: &BTreeSet<String>,
    configured: impl IntoIterator<Item = &'a str>,
    default_role: Option<&str>,
    admin_role: Option<&str>,
) -> BTreeSet<String> {
    let mut roles: BTreeSet<String> = configured
        .into_iter()
        .filter(|name| granted.contains(*name))
        .map(str::to_string)
        .collect();

    if roles.is_empty()
        && let Some(default) = default_role
        && !default.is_empty()
    {
        roles.insert(default.to_string());
    }

    if let Some(admin) = admin_role
        && !admin.is_empty()
        && roles.contains(admin)
    {
        roles.retain(|role| role.as_str() == admin);
    }

    roles
}
