/// Expand Windows-style environment references (`%VAR%`).
///
/// Single left-to-right pass: expanded values are not rescanned, so a value
/// that itself contains `%NAME%` cannot recurse. Unknown variables and
/// unbalanced `%` are left as written.
pub fn parse_windows_env_vars(path: &str) -> String {
    if !path.contains('%') {
        return path.to_string();
    }

    let mut result = String::with_capacity(path.len());
    let mut rest = path;

    while let Some(start) = rest.find('%') {
        result.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find('%') {
            Some(end) => {
                let var_name = &after[..end];
                match lookup(var_name) {
                    Some(value) => {
                        result.push_str(&value);
                        rest = &after[end + 1..];
                    }
                    None => {
                        // Keep the opening '%' and retry from the closing one
                        result.push('%');
                        result.push_str(var_name);
                        rest = &after[end..];
                    }
                }
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

fn lookup(var_name: &str) -> Option<String> {
    if var_name.is_empty() || var_name.contains(&['\\', '/', ' '][..]) {
        return None;
    }
    std::env::var(var_name).ok()
}

/// True when `text` still contains an unexpanded `%VAR%` reference.
pub fn has_unexpanded_vars(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 && !after[..end].contains(&['\\', '/', ' '][..]) => return true,
            Some(end) => rest = &after[end..],
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_parse_windows_env_vars_basic() {
        env::set_var("AGENT_ENV_TESTVAR", "testvalue");
        assert_eq!(parse_windows_env_vars("%AGENT_ENV_TESTVAR%"), "testvalue");
        assert_eq!(
            parse_windows_env_vars("C:\\%AGENT_ENV_TESTVAR%\\Logs"),
            "C:\\testvalue\\Logs"
        );
        env::remove_var("AGENT_ENV_TESTVAR");
    }

    #[test]
    fn test_parse_windows_env_vars_multiple() {
        env::set_var("AGENT_ENV_VAR1", "value1");
        env::set_var("AGENT_ENV_VAR2", "value2");
        assert_eq!(
            parse_windows_env_vars("%AGENT_ENV_VAR1%\\%AGENT_ENV_VAR2%\\file.txt"),
            "value1\\value2\\file.txt"
        );
        env::remove_var("AGENT_ENV_VAR1");
        env::remove_var("AGENT_ENV_VAR2");
    }

    #[test]
    fn test_nonexistent_and_malformed_left_alone() {
        assert_eq!(
            parse_windows_env_vars("%AGENT_ENV_MISSING%\\file.txt"),
            "%AGENT_ENV_MISSING%\\file.txt"
        );
        assert_eq!(parse_windows_env_vars("%INCOMPLETE"), "%INCOMPLETE");
        assert_eq!(parse_windows_env_vars("%%"), "%%");
        assert_eq!(parse_windows_env_vars("%"), "%");
        assert_eq!(parse_windows_env_vars("100% done"), "100% done");
    }

    #[test]
    fn test_expanded_values_are_not_rescanned() {
        env::set_var("AGENT_ENV_SELF", "%AGENT_ENV_SELF%");
        assert_eq!(parse_windows_env_vars("%AGENT_ENV_SELF%\\x"), "%AGENT_ENV_SELF%\\x");
        env::remove_var("AGENT_ENV_SELF");
    }

    #[test]
    fn test_has_unexpanded_vars() {
        assert!(has_unexpanded_vars("%NOPE%\\x"));
        assert!(!has_unexpanded_vars("C:\\Windows\\Logs"));
        assert!(!has_unexpanded_vars("50% of 100%"));
    }
}
