//! Path helpers for resolving worker-relative paths.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Expands a leading `~` or `~/` to `home`.
///
/// When `home` is unknown the path is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str, home: Option<&Utf8Path>) -> Utf8PathBuf {
    if let Some(dir) = home {
        if path == "~" {
            return dir.to_owned();
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return dir.join(rest);
        }
    }
    Utf8PathBuf::from(path)
}

/// Removes `.` components and folds `..` into its parent, without touching
/// the filesystem. `..` at the root stays at the root.
#[must_use]
pub fn normalise(path: &Utf8Path) -> Utf8PathBuf {
    let mut normalised = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_str()),
        }
    }
    if normalised.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        normalised
    }
}

/// Resolves `path` against `base`, expanding `~` to `home` first.
#[must_use]
pub fn resolve(base: &Utf8Path, path: &str, home: Option<&Utf8Path>) -> Utf8PathBuf {
    normalise(&base.join(expand_tilde(path, home)))
}

/// Expands `~/` using the controlling process's `HOME`.
///
/// If `HOME` is not set the input is returned unchanged.
#[must_use]
pub fn expand_local_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/srv/build", "src", "/srv/build/src")]
    #[case("/srv/build", ".", "/srv/build")]
    #[case("/srv/build", "..", "/srv")]
    #[case("/srv/build", "../../..", "/")]
    #[case("/srv/build", "./a/./b/../c", "/srv/build/a/c")]
    #[case("/srv/build", "/etc/hosts", "/etc/hosts")]
    #[case("/srv/build", "~/cache", "/home/ci/cache")]
    #[case("/srv/build", "~", "/home/ci")]
    fn resolves_against_base(#[case] base: &str, #[case] path: &str, #[case] expected: &str) {
        let home = Utf8PathBuf::from("/home/ci");
        assert_eq!(
            resolve(Utf8Path::new(base), path, Some(&home)),
            Utf8PathBuf::from(expected)
        );
    }

    #[test]
    fn leaves_tilde_without_home() {
        assert_eq!(expand_tilde("~/x", None), Utf8PathBuf::from("~/x"));
    }

    #[test]
    fn local_tilde_leaves_absolute_paths() {
        assert_eq!(expand_local_tilde("/absolute/path"), "/absolute/path");
    }
}
