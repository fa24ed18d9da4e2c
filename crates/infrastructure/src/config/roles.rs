//! Backend-role flag parsing.
//!
//! Each `--auth-backend-role` value has the shape `name={json-SAR}`, e.g.
//! `admin={"namespace":"default","verb":"get","resource":"pods/log"}`.

use std::collections::BTreeMap;

use domain::identity::entity::SarTemplate;

/// Parse one raw flag value into `(name, template)`.
pub fn parse_backend_role(raw: &str) -> Result<(String, SarTemplate), String> {
    let Some((name, json)) = raw.split_once('=') else {
        return Err(format!("auth-backend-role {raw:?} should be name=SAR"));
    };
    if name.is_empty() {
        return Err(format!("auth-backend-role {raw:?} has an empty name"));
    }
    let sar: SarTemplate = serde_json::from_str(json)
        .map_err(|e| format!("unable to parse backend role {raw:?}: {e}"))?;
    Ok((name.to_string(), sar))
}

/// Parse all raw flag values, rejecting duplicate names. Collects every
/// failure into `errors` instead of stopping at the first one.
pub fn parse_backend_roles(
    raw_roles: &[String],
    errors: &mut Vec<String>,
) -> BTreeMap<String, SarTemplate> {
    let mut roles = BTreeMap::new();
    for raw in raw_roles {
        match parse_backend_role(raw) {
            Ok((name, sar)) => {
                if roles.contains_key(&name) {
                    errors.push(format!("backend role with the name {name:?} already exists"));
                    continue;
                }
                roles.insert(name, sar);
            }
            Err(message) => errors.push(message),
        }
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_template() {
        let (name, sar) = parse_backend_role(
            r#"admin={"namespace":"default","verb":"get","resource":"pods/log"}"#,
        )
        .unwrap();
        assert_eq!(name, "admin");
        assert_eq!(sar.namespace, "default");
        assert_eq!(sar.verb, "get");
        assert_eq!(sar.resource, "pods/log");
    }

    #[test]
    fn value_with_equals_in_json_still_parses() {
        // split_once keeps everything after the first '=' as the JSON body.
        let (name, sar) =
            parse_backend_role(r#"ops={"verb":"get","resource":"/metrics?filter=a=b"}"#).unwrap();
        assert_eq!(name, "ops");
        assert_eq!(sar.resource, "/metrics?filter=a=b");
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(parse_backend_role("admin").is_err());
    }

    #[test]
    fn bad_json_is_rejected() {
        assert!(parse_backend_role("admin={not-json}").is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(parse_backend_role(r#"={"verb":"get"}"#).is_err());
    }

    #[test]
    fn duplicate_names_collect_an_error() {
        let raw = vec![
            r#"admin={"verb":"get","resource":"pods"}"#.to_string(),
            r#"admin={"verb":"get","resource":"pods"}"#.to_string(),
        ];
        let mut errors = Vec::new();
        let roles = parse_backend_roles(&raw, &mut errors);
        assert_eq!(roles.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("already exists"));
    }

    #[test]
    fn all_failures_are_collected() {
        let raw = vec!["nope".to_string(), "also={bad".to_string()];
        let mut errors = Vec::new();
        let roles = parse_backend_roles(&raw, &mut errors);
        assert!(roles.is_empty());
        assert_eq!(errors.len(), 2);
    }
}
