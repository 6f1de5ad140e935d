//! Root-directory resolution (§10.4): CLI flags, then `IMPORT_WIZARD_*`
//! env vars, then `config.toml` under the import wizard home, then
//! defaults under that home. Modeled on the teacher's `cli::config`
//! (`casparian_home`, `ensure_casparian_home`, hand-rolled `config.toml`
//! scanning rather than pulling in a TOML crate for six key-value pairs).

use iw_diagnostics::logging::import_wizard_home;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One directory per jail root (§6.1), resolved to an absolute path before
/// `iw_fs::Jail::new` ever sees them.
pub struct RootConfig {
    pub inbox: PathBuf,
    pub stage: PathBuf,
    pub jobs: PathBuf,
    pub outbox: PathBuf,
    pub config: PathBuf,
    pub wizards: PathBuf,
}

/// CLI-supplied overrides; `None` falls through to env, then config file,
/// then the default under `import_wizard_home()`.
#[derive(Default)]
pub struct RootOverrides {
    pub inbox: Option<PathBuf>,
    pub stage: Option<PathBuf>,
    pub jobs: Option<PathBuf>,
    pub outbox: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub wizards: Option<PathBuf>,
}

pub fn config_file_path() -> PathBuf {
    import_wizard_home().join("config.toml")
}

/// Hand-rolled `[roots]` table scan: `inbox = "..."` style lines. Mirrors
/// the teacher's `default_db_backend`'s manual section/key scan rather
/// than introducing a TOML parser for six strings.
fn read_config_file_roots() -> BTreeMap<String, String> {
    let path = config_file_path();
    let mut out = BTreeMap::new();
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return out;
    };
    let mut in_roots_section = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_roots_section = trimmed == "[roots]";
            continue;
        }
        if !in_roots_section {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim().trim_matches('"').to_string();
            if !value.is_empty() {
                out.insert(key, value);
            }
        }
    }
    out
}

fn resolve_one(name: &str, cli: Option<PathBuf>, file: &BTreeMap<String, String>, default_dir: &str) -> PathBuf {
    if let Some(p) = cli {
        return p;
    }
    let env_key = format!("IMPORT_WIZARD_{}_ROOT", name.to_uppercase());
    if let Ok(p) = std::env::var(&env_key) {
        return PathBuf::from(p);
    }
    if let Some(p) = file.get(name) {
        return PathBuf::from(p);
    }
    import_wizard_home().join(default_dir)
}

/// Resolve all six roots, in priority order CLI > env > `config.toml` >
/// default (§10.4). Does not create directories; callers create them via
/// `ensure_dirs`.
pub fn resolve_roots(overrides: RootOverrides) -> RootConfig {
    let file = read_config_file_roots();
    RootConfig {
        inbox: resolve_one("inbox", overrides.inbox, &file, "inbox"),
        stage: resolve_one("stage", overrides.stage, &file, "stage"),
        jobs: resolve_one("jobs", overrides.jobs, &file, "jobs"),
        outbox: resolve_one("outbox", overrides.outbox, &file, "outbox"),
        config: resolve_one("config", overrides.config, &file, "config"),
        wizards: resolve_one("wizards", overrides.wizards, &file, "wizards"),
    }
}

impl RootConfig {
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.inbox, &self.stage, &self.jobs, &self.outbox, &self.config, &self.wizards] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// The directory the patches-root lock guards: the jobs root, since
    /// the queue state, processed registry, and job records all live
    /// under the Wizards/Jobs roots this process alone writes to.
    pub fn patches_root(&self) -> PathBuf {
        import_wizard_home()
    }
}
