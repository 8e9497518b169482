/// Policy gate for privileged game requests
///
/// Every privileged operation a game asks the host for passes through one
/// `PolicyGate`, which is handed to each game's request broker rather than
/// installed as a process-wide hook. Requests carry an explicit [`Caller`],
/// so attribution is a registry lookup.
use crate::config::types::{GameFault, GameToken, SandboxDenied, SecurityMode};
use crate::observability::audit::events;
use crate::sandbox::context::{Caller, ExecutionContext, GamesContext};
use crate::sandbox::resolve::HostResolver;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, RwLock};

/// What an exit request actually is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRequest {
    /// A real attempt to end the host process.
    Terminate { status: i32 },
    /// Registration of exit-on-close behaviour for a window.
    CloseHandlerRegistration,
}

/// Invoked with the offending game when an exit is denied.
pub type ViolationHandler = Box<dyn Fn(GameToken) + Send + Sync>;

pub struct PolicyGate {
    games: Arc<GamesContext>,
    mode: SecurityMode,
    resolver: Arc<dyn HostResolver>,
    exit_open: AtomicBool,
    on_violation: RwLock<Option<ViolationHandler>>,
    debug_warning: Once,
}

impl std::fmt::Debug for PolicyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGate")
            .field("mode", &self.mode)
            .field("exit_open", &self.exit_permitted())
            .finish()
    }
}

impl PolicyGate {
    pub fn new(
        games: Arc<GamesContext>,
        mode: SecurityMode,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            games,
            mode,
            resolver,
            exit_open: AtomicBool::new(false),
            on_violation: RwLock::new(None),
            debug_warning: Once::new(),
        }
    }

    pub fn games(&self) -> &Arc<GamesContext> {
        &self.games
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn set_violation_handler(&self, handler: ViolationHandler) {
        *self.on_violation.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Open the exit path for the launcher's own shutdown.
    pub fn open_exit_gate(&self) {
        if !self.exit_open.swap(true, Ordering::SeqCst) {
            events::exit_allowed("launcher shutdown");
        }
    }

    pub fn exit_permitted(&self) -> bool {
        self.exit_open.load(Ordering::SeqCst)
    }

    /// Context owning `token`, if the game is still registered.
    pub fn attribute(&self, token: GameToken) -> Option<Arc<ExecutionContext>> {
        self.games.attribute(token)
    }

    /// Decide an exit request.
    ///
    /// Only close-handler registrations and requests made after the
    /// shutdown path opened the gate pass. Anything else is recorded on the
    /// caller's context and the offending game is stopped.
    pub fn check_exit(
        &self,
        caller: Option<&Caller>,
        request: ExitRequest,
    ) -> Result<(), SandboxDenied> {
        if self.exit_permitted() {
            return Ok(());
        }

        let status = match request {
            ExitRequest::CloseHandlerRegistration => {
                debug!("Exit-on-close registration allowed");
                return Ok(());
            }
            ExitRequest::Terminate { status } => status,
        };

        let denial = SandboxDenied::Exit { status };
        let Some(caller) = caller else {
            warn!("Exit with status {} denied outside any game", status);
            return Err(denial);
        };

        match self.attribute(caller.token) {
            Some(context) => {
                context.record_fault(GameFault::Denied {
                    unit: caller.unit.clone(),
                    denial: denial.clone(),
                });
                events::exit_denied(context.correlation(), status);
            }
            None => warn!("Exit request from unregistered {}", caller.token),
        }

        if let Some(handler) = self
            .on_violation
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            handler(caller.token);
        }
        Err(denial)
    }

    /// Decide an outbound connection.
    ///
    /// Allowed only toward the caller's declared origin, matching either by
    /// name or by any shared resolved address.
    pub fn check_connect(&self, caller: &Caller, host: &str, port: u16) -> Result<(), SandboxDenied> {
        let Some(context) = self.attribute(caller.token) else {
            events::connect_decision(None, host, port, false);
            return Err(SandboxDenied::UnknownGame {
                token: caller.token,
            });
        };

        if self.mode == SecurityMode::Debug {
            self.debug_warning.call_once(|| {
                warn!("Security mode is debug: connection restrictions are disabled")
            });
            events::connect_decision(Some(context.correlation()), host, port, true);
            return Ok(());
        }

        let allowed = self.matches_origin(&context, host, port);
        events::connect_decision(Some(context.correlation()), host, port, allowed);
        if self.mode == SecurityMode::Developer {
            info!(
                "{}: connection to {}:{} {}",
                caller.token,
                host,
                port,
                if allowed { "allowed" } else { "denied" }
            );
        }

        if allowed {
            return Ok(());
        }
        let denial = SandboxDenied::Connect {
            host: host.to_string(),
            port,
        };
        context.record_fault(GameFault::Denied {
            unit: caller.unit.clone(),
            denial: denial.clone(),
        });
        Err(denial)
    }

    fn matches_origin(&self, context: &ExecutionContext, host: &str, port: u16) -> bool {
        let Some(origin) = context.origin() else {
            return false;
        };
        if origin.port != port {
            return false;
        }
        if origin.host.eq_ignore_ascii_case(host) {
            return true;
        }
        let declared = self.resolver.resolve(&origin.host);
        if declared.is_empty() {
            return false;
        }
        self.resolver
            .resolve(host)
            .iter()
            .any(|ip| declared.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::context::Origin;
    use crate::sandbox::resolve::StaticResolver;
    use std::net::IpAddr;
    use std::sync::Mutex;

    fn gate(mode: SecurityMode) -> (PolicyGate, Arc<ExecutionContext>) {
        let games = Arc::new(GamesContext::new());
        let context = games.create_context(
            "g",
            Some(Origin {
                host: "games.example.org".to_string(),
                port: 80,
            }),
        );
        let a: IpAddr = "192.0.2.10".parse().unwrap();
        let b: IpAddr = "192.0.2.11".parse().unwrap();
        let resolver = StaticResolver::new()
            .with_host("games.example.org", &[a, b])
            .with_host("mirror.example.org", &[b])
            .with_host("evil.example.net", &["198.51.100.1".parse().unwrap()]);
        (PolicyGate::new(games, mode, Arc::new(resolver)), context)
    }

    #[test]
    fn test_connect_to_origin_by_name_or_address() {
        let (gate, ctx) = gate(SecurityMode::Public);
        let caller = Caller::new(ctx.token(), "main");
        assert!(gate.check_connect(&caller, "GAMES.example.org", 80).is_ok());
        assert!(gate.check_connect(&caller, "192.0.2.11", 80).is_ok());
        assert!(gate.check_connect(&caller, "mirror.example.org", 80).is_ok());
        assert!(ctx.faults().is_empty());

        assert!(gate.check_connect(&caller, "games.example.org", 8080).is_err());
        assert_eq!(
            gate.check_connect(&caller, "evil.example.net", 80),
            Err(SandboxDenied::Connect {
                host: "evil.example.net".to_string(),
                port: 80
            })
        );
        assert_eq!(ctx.faults().len(), 2);
    }

    #[test]
    fn test_debug_mode_allows_any_connection() {
        let (gate, ctx) = gate(SecurityMode::Debug);
        let caller = Caller::new(ctx.token(), "main");
        assert!(gate.check_connect(&caller, "evil.example.net", 443).is_ok());
    }

    #[test]
    fn test_unknown_token_denied() {
        let (gate, _ctx) = gate(SecurityMode::Debug);
        let caller = Caller::new(GameToken(999), "main");
        assert!(matches!(
            gate.check_connect(&caller, "games.example.org", 80),
            Err(SandboxDenied::UnknownGame { .. })
        ));
    }

    #[test]
    fn test_exit_denied_stops_offending_game() {
        let (gate, ctx) = gate(SecurityMode::Public);
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let sink = stopped.clone();
        gate.set_violation_handler(Box::new(move |token| sink.lock().unwrap().push(token)));

        let caller = Caller::new(ctx.token(), "main");
        assert_eq!(
            gate.check_exit(Some(&caller), ExitRequest::Terminate { status: 0 }),
            Err(SandboxDenied::Exit { status: 0 })
        );
        assert_eq!(*stopped.lock().unwrap(), vec![ctx.token()]);
        assert!(matches!(ctx.faults()[0], GameFault::Denied { .. }));

        assert!(gate
            .check_exit(Some(&caller), ExitRequest::CloseHandlerRegistration)
            .is_ok());
        assert_eq!(stopped.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_path_opens_exit() {
        let (gate, _ctx) = gate(SecurityMode::Public);
        assert!(gate
            .check_exit(None, ExitRequest::Terminate { status: 0 })
            .is_err());
        gate.open_exit_gate();
        assert!(gate
            .check_exit(None, ExitRequest::Terminate { status: 0 })
            .is_ok());
    }
}
