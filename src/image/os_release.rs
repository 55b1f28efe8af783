//! `/etc/os-release` parsing

use std::collections::BTreeMap;

/// Location of the os-release file inside an instance
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Parse os-release content into key/value pairs
///
/// Blank lines and comments are skipped, values lose one level of single or
/// double quotes.
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ubuntu() {
        let content = r#"NAME="Ubuntu"
VERSION="20.04.6 LTS (Focal Fossa)"
ID=ubuntu
ID_LIKE=debian
PRETTY_NAME="Ubuntu 20.04.6 LTS"
VERSION_ID="20.04"
# comment
VERSION_CODENAME=focal
"#;
        let release = parse_os_release(content);
        assert_eq!(release["NAME"], "Ubuntu");
        assert_eq!(release["ID"], "ubuntu");
        assert_eq!(release["VERSION_ID"], "20.04");
        assert_eq!(release["VERSION_CODENAME"], "focal");
        assert!(!release.contains_key("# comment"));
    }

    #[test]
    fn test_parse_single_quotes_and_garbage() {
        let release = parse_os_release("ID='debian'\nnot a pair\n\nVERSION_ID=12\n");
        assert_eq!(release.len(), 2);
        assert_eq!(release["ID"], "debian");
        assert_eq!(release["VERSION_ID"], "12");
    }
}
