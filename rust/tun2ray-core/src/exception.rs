use std::collections::HashSet;

/// Applications whose traffic bypasses the proxy engine.
///
/// Built once at engine start and read-only afterwards. Identities are
/// compared by lower-cased file name with any `.exe` suffix removed, so
/// `C:\Program Files\App\app1.EXE`, `/usr/bin/app1` and `app1` all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSet {
    apps: HashSet<String>,
}

impl ExceptionSet {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let apps = apps
            .into_iter()
            .map(|a| normalize(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();
        Self { apps }
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn contains(&self, identity: &str) -> bool {
        !self.apps.is_empty() && self.apps.contains(&normalize(identity))
    }
}

fn normalize(identity: &str) -> String {
    let base = identity
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match base.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => base,
    }
}
