/// Per-game launch configuration
///
/// A configuration owns the game's execution context (a child of the games
/// context) and its isolated loader. Dropping it unregisters the context
/// and deletes everything the loader materialized.
use crate::config::settings::{AppletSettings, ArchiveLimits, LauncherConfig};
use crate::config::types::{GameToken, LauncherError, Result};
use crate::game::model::{GameDetail, GameSize, GameStyle};
use crate::loader::{HostRuntimeDir, IsolatedLoader, NoTrustedLookup, TrustedLookup};
use crate::sandbox::broker::RequestBroker;
use crate::sandbox::context::{ExecutionContext, GamesContext, Origin};
use crate::sandbox::policy::PolicyGate;
use crate::sandbox::unit::SpawnRequest;
use crate::utils::env_hygiene::{env_key, EnvHygiene, EnvPolicy};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// Style-specific launch data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleVariant {
    /// Embedded game driven through init/start/stop/destroy events.
    AppletStyle { size: GameSize },
    /// Self-contained program; its main unit is the whole lifecycle.
    StandaloneStyle,
}

impl StyleVariant {
    pub fn style(&self) -> GameStyle {
        match self {
            StyleVariant::AppletStyle { .. } => GameStyle::Applet,
            StyleVariant::StandaloneStyle => GameStyle::Standalone,
        }
    }
}

pub struct GameConfiguration {
    detail: GameDetail,
    variant: StyleVariant,
    context: Arc<ExecutionContext>,
    loader: IsolatedLoader,
    games: Arc<GamesContext>,
    gate: Arc<PolicyGate>,
    env: Arc<EnvHygiene>,
}

impl std::fmt::Debug for GameConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameConfiguration")
            .field("name", &self.name())
            .field("token", &self.token())
            .field("variant", &self.variant)
            .finish()
    }
}

impl GameConfiguration {
    pub fn token(&self) -> GameToken {
        self.context.token()
    }

    pub fn name(&self) -> &str {
        self.detail.name()
    }

    pub fn detail(&self) -> &GameDetail {
        &self.detail
    }

    pub fn variant(&self) -> StyleVariant {
        self.variant
    }

    pub fn style(&self) -> GameStyle {
        self.variant.style()
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn loader(&self) -> &IsolatedLoader {
        &self.loader
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.context.origin()
    }

    pub fn document_base(&self) -> &Url {
        self.detail.document_base.uri()
    }

    /// Directory of the document base.
    pub fn code_base(&self) -> Url {
        self.document_base()
            .join("./")
            .unwrap_or_else(|_| self.document_base().clone())
    }

    pub fn broker(&self) -> RequestBroker {
        RequestBroker::new(self.gate.clone(), self.token())
    }

    /// Launch variables describing this game.
    pub fn launch_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("GAMEBOX_STYLE".to_string(), self.style().to_string());
        vars.insert("GAMEBOX_GAME".to_string(), self.name().to_string());
        vars.insert(
            "GAMEBOX_DOCUMENT_BASE".to_string(),
            self.document_base().to_string(),
        );
        vars.insert("GAMEBOX_CODE_BASE".to_string(), self.code_base().to_string());
        if let StyleVariant::AppletStyle { size } = self.variant {
            vars.insert("GAMEBOX_WIDTH".to_string(), size.width.to_string());
            vars.insert("GAMEBOX_HEIGHT".to_string(), size.height.to_string());
        }
        for (name, value) in &self.detail.parameters {
            vars.insert(format!("GAMEBOX_PARAM_{}", env_key(name)), value.clone());
        }
        vars
    }

    pub fn environment(&self, home: &Path) -> BTreeMap<String, String> {
        self.env.game_environment(home, &self.launch_variables())
    }

    /// Materialize the entry point and a private home, and describe the
    /// main unit.
    pub fn launch_request(&self) -> Result<SpawnRequest> {
        let program = self.loader.materialize_executable(&self.detail.entry)?;
        let home = self.loader.scratch_home()?;
        Ok(SpawnRequest {
            label: format!("{} main", self.name()),
            program,
            args: Vec::new(),
            env: self.environment(&home),
            cwd: home,
            nice: 0,
        })
    }

    /// Download and decode the archive without launching anything.
    pub fn prefetch(&self) -> Result<usize> {
        self.loader.preload()
    }
}

impl Drop for GameConfiguration {
    fn drop(&mut self) {
        self.games.unregister(self.token());
        self.loader.release();
        debug!("Configuration for {} released", self.detail.name());
    }
}

/// Builds configurations bound to the launcher's shared services.
pub struct ConfigurationFactory {
    games: Arc<GamesContext>,
    gate: Arc<PolicyGate>,
    trusted: Arc<dyn TrustedLookup>,
    host_namespace: String,
    archive_limits: ArchiveLimits,
    applet: AppletSettings,
    env: Arc<EnvHygiene>,
}

impl ConfigurationFactory {
    pub fn new(gate: Arc<PolicyGate>, settings: &LauncherConfig) -> Self {
        let trusted: Arc<dyn TrustedLookup> = match &settings.trusted_runtime_dir {
            Some(dir) => Arc::new(HostRuntimeDir::new(dir)),
            None => Arc::new(NoTrustedLookup),
        };
        Self {
            games: gate.games().clone(),
            gate,
            trusted,
            host_namespace: settings.host_namespace.clone(),
            archive_limits: settings.archive,
            applet: settings.applet.clone(),
            env: Arc::new(EnvHygiene::new(EnvPolicy::default())),
        }
    }

    pub fn with_trusted_lookup(mut self, trusted: Arc<dyn TrustedLookup>) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn games(&self) -> &Arc<GamesContext> {
        &self.games
    }

    pub fn gate(&self) -> &Arc<PolicyGate> {
        &self.gate
    }

    pub fn build(&self, detail: &GameDetail) -> Result<Arc<GameConfiguration>> {
        let variant = match detail.style() {
            GameStyle::Applet => StyleVariant::AppletStyle {
                size: self.applet_size(detail)?,
            },
            GameStyle::Standalone => StyleVariant::StandaloneStyle,
        };

        let origin = Origin::from_url(detail.document_base.uri());
        let context = self.games.create_context(detail.name(), origin);
        let loader = IsolatedLoader::new(
            detail.archive.clone(),
            self.host_namespace.clone(),
            self.trusted.clone(),
        )
        .with_limits(self.archive_limits);
        info!(
            "Configured {} as {} ({})",
            detail.name(),
            variant.style(),
            context.token()
        );

        Ok(Arc::new(GameConfiguration {
            detail: detail.clone(),
            variant,
            context,
            loader,
            games: self.games.clone(),
            gate: self.gate.clone(),
            env: self.env.clone(),
        }))
    }

    fn applet_size(&self, detail: &GameDetail) -> Result<GameSize> {
        let size = detail.size.unwrap_or(GameSize {
            width: self.applet.default_width,
            height: self.applet.default_height,
        });
        if size.width > self.applet.max_width || size.height > self.applet.max_height {
            return Err(LauncherError::Config(format!(
                "{} requests {}x{}, maximum is {}x{}",
                detail.name(),
                size.width,
                size.height,
                self.applet.max_width,
                self.applet.max_height
            )));
        }
        Ok(size)
    }
}
