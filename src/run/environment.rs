//! Child environment construction.

use std::collections::BTreeMap;
use std::path::Path;

/// Merge a parent environment with run overrides.
///
/// Parent entries come first, overrides replace them key by key, and
/// `apps_dir` (when given) is prepended to the resulting `PATH`.
pub fn merge_environment<I, K, V>(
    parent: I,
    overrides: &BTreeMap<String, String>,
    apps_dir: Option<&Path>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env: BTreeMap<String, String> = parent
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    if let Some(apps_dir) = apps_dir {
        let apps_dir = apps_dir.to_string_lossy();
        let path = match env.get("PATH") {
            Some(existing) if !existing.is_empty() => format!("{apps_dir}:{existing}"),
            _ => apps_dir.into_owned(),
        };
        env.insert("PATH".to_string(), path);
    }

    env
}
