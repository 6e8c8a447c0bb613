// Kernel argument parsing. Arguments are space-separated `key` or
// `key=value` tokens with no quoting; values run to the next space.

use super::bootinfo;

/// Looks up `name` in a command line.
///
/// Returns `None` if the argument is absent, `Some("")` if present with no
/// value, and the value text otherwise.
pub fn find_arg<'a>(cmdline: &'a str, name: &str) -> Option<&'a str> {
    for token in cmdline.split(' ') {
        if token.is_empty() {
            continue;
        }
        if token == name {
            return Some("");
        }
        if let Some(rest) = token.strip_prefix(name) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value);
            }
        }
    }
    None
}

/// Looks up a kernel argument by name in the boot command line.
pub fn read_arg(name: &str) -> Option<&'static str> {
    find_arg(bootinfo::boot_info().args, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_arg() {
        let cmdline = "loglevel=7 quiet root=hd0 net";
        assert_eq!(find_arg(cmdline, "loglevel"), Some("7"));
        assert_eq!(find_arg(cmdline, "quiet"), Some(""));
        assert_eq!(find_arg(cmdline, "root"), Some("hd0"));
        assert_eq!(find_arg(cmdline, "net"), Some(""));
        assert_eq!(find_arg(cmdline, "missing"), None);
        // Prefix of another key must not match
        assert_eq!(find_arg(cmdline, "log"), None);
        assert_eq!(find_arg(cmdline, "roo"), None);
    }

    #[test]
    fn test_find_arg_value_stops_at_space() {
        assert_eq!(find_arg("a=b c=d", "a"), Some("b"));
        assert_eq!(find_arg("a=b c=d", "c"), Some("d"));
    }
}
