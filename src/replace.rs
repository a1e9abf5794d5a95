//! Replacement assets.
//!
//! A directory of templated HTML/text files served on intercepted
//! replacement paths (certificate warnings, override confirmations).
//! Placeholders are written `%name%`.  Missing assets fall back to built-in
//! minimal templates so the warning path never fails for want of a file.

use camino::Utf8Path;
use tracing::debug;

const BUILTIN_SSL_WARNING: &str = "<html><body>\
<h1>Certificate problem</h1>\
<p>The certificate presented by <b>%target%</b> failed verification.</p>\
<p><a href=\"%override%\">Proceed anyway</a></p>\
</body></html>";

const BUILTIN_SSL_OVERRIDE_DONE: &str = "<html><body>\
<h1>Exception recorded</h1>\
<p>Connections to <b>%target%</b> are temporarily allowed. Reload the page.</p>\
</body></html>";

//----------- Replacements -----------------------------------------------------

/// The loaded replacement asset set.
#[derive(Clone, Debug, Default)]
pub struct Replacements {
    assets: foldhash::HashMap<String, String>,
}

impl Replacements {
    /// Load every regular file of the directory, keyed by file stem.
    ///
    /// An absent directory yields the built-in set.
    pub fn load(dir: &Utf8Path) -> Self {
        let mut assets: foldhash::HashMap<String, String> = Default::default();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    debug!("replacements: loaded '{stem}'");
                    assets.insert(stem.to_string(), contents);
                }
            }
        }
        Self { assets }
    }

    fn template(&self, name: &str) -> &str {
        if let Some(asset) = self.assets.get(name) {
            return asset;
        }
        match name {
            "ssl_warning" => BUILTIN_SSL_WARNING,
            "ssl_override_done" => BUILTIN_SSL_OVERRIDE_DONE,
            _ => "",
        }
    }

    /// Render an asset, substituting `%name%` placeholders.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> String {
        let mut out = self.template(name).to_string();
        for (key, value) in vars {
            out = out.replace(&format!("%{key}%"), value);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_templates_substitute_placeholders() {
        let replacements = Replacements::default();
        let page = replacements.render(
            "ssl_warning",
            &[("target", "bank.example"), ("override", "/override")],
        );
        assert!(page.contains("bank.example"));
        assert!(page.contains("/override"));
    }

    #[test]
    fn directory_assets_win_over_builtins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ssl_warning.html"), "custom %target%").unwrap();

        let replacements =
            Replacements::load(Utf8Path::from_path(dir.path()).unwrap());
        assert_eq!(
            replacements.render("ssl_warning", &[("target", "x")]),
            "custom x"
        );
    }
}
