/// Line protocol for privileged game requests
///
/// A game asks the host for privileged operations by writing lines that
/// start with `host:` on its stdout. Each request gets exactly one reply
/// line on stdin: `host:ok` or `host:denied <reason>`.
use crate::config::types::GameToken;
use crate::sandbox::context::Caller;
use crate::sandbox::policy::{ExitRequest, PolicyGate};
use log::debug;
use std::sync::Arc;

pub const REQUEST_PREFIX: &str = "host:";
pub const REPLY_OK: &str = "host:ok";

/// A parsed privileged request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    Exit { status: i32 },
    ExitOnClose,
    Connect { host: String, port: u16 },
}

impl HostRequest {
    /// `None` for ordinary output, `Some(Err)` for a malformed request.
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let body = line.strip_prefix(REQUEST_PREFIX)?;
        let mut parts = body.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let parsed = match (verb, args.as_slice()) {
            ("exit", [status]) => status
                .parse()
                .map(|status| HostRequest::Exit { status })
                .map_err(|_| format!("bad exit status {}", status)),
            ("exit-on-close", []) => Ok(HostRequest::ExitOnClose),
            ("connect", [host, port]) => port
                .parse()
                .map(|port| HostRequest::Connect {
                    host: host.to_string(),
                    port,
                })
                .map_err(|_| format!("bad port {}", port)),
            _ => Err(format!("unknown request {}", body.trim())),
        };
        Some(parsed)
    }
}

pub fn denied_reply(reason: &str) -> String {
    format!("host:denied {}", reason)
}

/// Answers requests from one game on behalf of the policy gate.
#[derive(Clone)]
pub struct RequestBroker {
    gate: Arc<PolicyGate>,
    token: GameToken,
}

impl RequestBroker {
    pub fn new(gate: Arc<PolicyGate>, token: GameToken) -> Self {
        Self { gate, token }
    }

    pub fn token(&self) -> GameToken {
        self.token
    }

    /// Handle one stdout line from `unit`. Returns the reply to send, or
    /// `None` when the line is not a request.
    pub fn handle_line(&self, unit: &str, line: &str) -> Option<String> {
        let request = match HostRequest::parse(line)? {
            Ok(request) => request,
            Err(reason) => return Some(denied_reply(&reason)),
        };
        debug!("{} unit {} requests {:?}", self.token, unit, request);

        let caller = Caller::new(self.token, unit);
        let decision = match request {
            HostRequest::Exit { status } => self
                .gate
                .check_exit(Some(&caller), ExitRequest::Terminate { status }),
            HostRequest::ExitOnClose => self
                .gate
                .check_exit(Some(&caller), ExitRequest::CloseHandlerRegistration),
            HostRequest::Connect { host, port } => self.gate.check_connect(&caller, &host, port),
        };

        Some(match decision {
            Ok(()) => REPLY_OK.to_string(),
            Err(denial) => denied_reply(&denial.to_string()),
        })
    }
}
