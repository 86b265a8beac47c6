/// `utils/fs.rs` — lexical path containment checks
///
/// The sandbox only loads script files from whitelisted directories. The
/// checks here are purely lexical: paths are absolutized and normalized
/// without touching the filesystem, so `scripts/../secrets` can never pass
/// as being under `scripts/`.
use std::path::{Component, Path, PathBuf};

/// Absolutize `path` (against the current directory when relative) and
/// normalize it lexically: `.` components are dropped and `..` folds onto
/// the preceding component. Symlinks are not resolved.
pub fn absolute_normalized(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    lexically_normal(&absolute)
}

/// True when `path` is inside `root` (or equals it), component-wise.
/// An empty `root` never contains anything.
pub fn starts_with(path: &Path, root: &Path) -> bool {
    if root.as_os_str().is_empty() {
        return false;
    }
    let root = absolute_normalized(root);
    let path = absolute_normalized(path);
    path.starts_with(&root)
}

/// True when `path` is inside any of `roots`. False for an empty list.
pub fn starts_with_any<I, P>(path: &Path, roots: I) -> bool
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    roots
        .into_iter()
        .any(|root| starts_with(path, root.as_ref()))
}

fn lexically_normal(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normal.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match normal.components().next_back() {
                Some(Component::Normal(_)) => {
                    normal.pop();
                }
                // `..` at the root stays at the root.
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                // A relative prefix of `..`s cannot fold any further.
                _ => normal.push(component.as_os_str()),
            },
            Component::Normal(part) => normal.push(part),
        }
    }
    normal
}
