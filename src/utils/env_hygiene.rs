/// Environment hygiene for game processes
///
/// A game inherits a sanitized copy of the launcher environment plus the
/// variables describing its launch. Loader-hijack variables never pass through.
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

/// Variables that let a child redirect the dynamic loader.
const LOADER_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_BIND_NOW",
    "LD_DEBUG",
    "LD_PROFILE",
    "LD_USE_LOAD_BIAS",
    "LD_DYNAMIC_WEAK",
];

/// Launcher variables a game must not see.
const LAUNCHER_PREFIX: &str = "GAMEBOX_";

#[derive(Debug, Clone)]
pub struct EnvPolicy {
    pub sanitize_ld_vars: bool,
    pub set_deterministic_path: bool,
    pub set_deterministic_locale: bool,
    /// Keep the rest of the launcher environment (DISPLAY, XDG_*, ...).
    pub inherit_remaining: bool,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            sanitize_ld_vars: true,
            set_deterministic_path: true,
            set_deterministic_locale: false,
            inherit_remaining: true,
        }
    }
}

pub struct EnvHygiene {
    policy: EnvPolicy,
}

impl EnvHygiene {
    pub fn new(policy: EnvPolicy) -> Self {
        EnvHygiene { policy }
    }

    /// Build the environment for a game whose scratch home is `home`.
    /// `extra` entries are applied last and win over inherited values.
    pub fn game_environment(
        &self,
        home: &Path,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env_map = BTreeMap::new();

        if self.policy.inherit_remaining {
            for (key, value) in env::vars() {
                if key.starts_with(LAUNCHER_PREFIX) {
                    continue;
                }
                env_map.insert(key, value);
            }
        }

        if self.policy.sanitize_ld_vars {
            for var in LOADER_VARS {
                if env_map.remove(*var).is_some() {
                    log::debug!("Removed loader variable {} from game environment", var);
                }
            }
        }

        if self.policy.set_deterministic_path {
            env_map.insert(
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            );
        }
        if self.policy.set_deterministic_locale {
            env_map.insert("LANG".to_string(), "C.UTF-8".to_string());
            env_map.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
        }

        let home = home.display().to_string();
        env_map.insert("HOME".to_string(), home.clone());
        env_map.insert("TMPDIR".to_string(), home);

        for (key, value) in extra {
            env_map.insert(key.clone(), value.clone());
        }
        env_map
    }
}

/// Normalise a parameter name into an environment variable suffix.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
