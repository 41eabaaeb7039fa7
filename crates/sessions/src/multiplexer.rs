//! Remote tmux integration.
//!
//! Before a shell starts the resolver decides whether to skip tmux, create
//! an app-managed tmux session, attach to an existing one, or ask the user.
//! The decision is rendered into a script that is typed into the shell once
//! its channel is open. Only app-managed sessions are killed on close.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::MultiplexerConfig;
use crate::model::{ServerId, SessionId};

/// Printed by the probe when tmux is on the PATH.
const PRESENT_MARKER: &str = "__VIVY_TMUX_PRESENT__";

/// Printed by the probe when tmux is missing.
const MISSING_MARKER: &str = "__VIVY_TMUX_MISSING__";

/// Who created the remote tmux session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Created by us; killed when the session closes.
    Managed,
    /// Pre-existing; left alone.
    External,
}

/// What to do about tmux for one shell start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexerDecision {
    Skip,
    CreateManaged { name: String },
    AttachExisting(String),
    /// Existing sessions the user may want; needs a [`MultiplexerChoice`].
    Prompt { candidates: Vec<String> },
}

/// The user's answer to a [`MultiplexerDecision::Prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexerChoice {
    CreateNew,
    Attach(String),
    Skip,
}

/// Per-session tmux binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerAttachment {
    pub name: String,
    pub ownership: Ownership,
    /// Typed into the shell once it is open.
    pub pending_command: Option<String>,
}

/// Parsed output of [`probe_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub installed: bool,
    pub sessions: Vec<String>,
}

/// Remote command reporting tmux presence and its session names.
pub fn probe_command() -> String {
    format!(
        "if command -v tmux >/dev/null 2>&1; then echo {PRESENT_MARKER}; \
         tmux list-sessions -F '#{{session_name}}' 2>/dev/null; \
         else echo {MISSING_MARKER}; fi"
    )
}

/// Lists session names on a server already known to have tmux.
pub fn list_command() -> String {
    format!("echo {PRESENT_MARKER}; tmux list-sessions -F '#{{session_name}}' 2>/dev/null")
}

/// Parses probe output. `None` if neither marker is present.
pub fn parse_probe(stdout: &str) -> Option<ProbeResult> {
    let mut lines = stdout.lines().map(str::trim).skip_while(|line| {
        *line != PRESENT_MARKER && *line != MISSING_MARKER
    });
    match lines.next()? {
        MISSING_MARKER => Some(ProbeResult::default()),
        _ => Some(ProbeResult {
            installed: true,
            sessions: lines
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }),
    }
}

/// Single-quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remote command that kills the tmux session `name`.
pub fn kill_command(name: &str) -> String {
    format!("tmux kill-session -t {} 2>/dev/null || true", shell_quote(name))
}

const INSTALL_SCRIPT: &str = "command -v tmux >/dev/null 2>&1 || { \
    if command -v apt-get >/dev/null 2>&1; then sudo -n apt-get install -y tmux; \
    elif command -v dnf >/dev/null 2>&1; then sudo -n dnf install -y tmux; \
    elif command -v yum >/dev/null 2>&1; then sudo -n yum install -y tmux; \
    elif command -v apk >/dev/null 2>&1; then sudo -n apk add tmux; \
    elif command -v brew >/dev/null 2>&1; then brew install tmux; \
    fi; }";

/// Decides tmux usage and remembers which servers have it installed.
#[derive(Debug)]
pub struct MultiplexerResolver {
    prefix: String,
    auto_install: bool,
    installed: HashMap<ServerId, bool>,
}

impl MultiplexerResolver {
    pub fn new(prefix: impl Into<String>, auto_install: bool) -> Self {
        Self {
            prefix: prefix.into(),
            auto_install,
            installed: HashMap::new(),
        }
    }

    pub fn from_config(config: &MultiplexerConfig) -> Self {
        Self::new(config.session_prefix.clone(), config.auto_install)
    }

    /// Name of the app-managed tmux session for `session`.
    pub fn managed_name(&self, session: SessionId) -> String {
        let simple = session.simple().to_string();
        format!("{}-{}", self.prefix, &simple[..8])
    }

    /// Cached tmux presence for a server, if probed.
    pub fn cached_presence(&self, server: &str) -> Option<bool> {
        self.installed.get(server).copied()
    }

    /// Remote command to run before a shell start, if any.
    ///
    /// Presence is probed once per server. Once it is cached, a server with
    /// tmux only has its sessions listed and one without is not asked again.
    pub fn probe_for(&self, enabled: bool, server: &str) -> Option<String> {
        if !enabled {
            return None;
        }
        match self.cached_presence(server) {
            None => Some(probe_command()),
            Some(true) => Some(list_command()),
            Some(false) => None,
        }
    }

    pub fn record_probe(&mut self, server: &str, probe: &ProbeResult) {
        self.installed.insert(server.to_string(), probe.installed);
    }

    pub fn forget(&mut self, server: &str) {
        self.installed.remove(server);
    }

    fn ownership_of(&self, session: SessionId, name: &str) -> Ownership {
        if name == self.managed_name(session) {
            Ownership::Managed
        } else {
            Ownership::External
        }
    }

    /// Chooses what to do for a shell start.
    ///
    /// `remembered` is the tmux session this logical session used before,
    /// if any. Sessions carrying our prefix belong to other tabs and never
    /// make the choice ambiguous.
    pub fn decide(
        &self,
        enabled: bool,
        server: &str,
        session: SessionId,
        remembered: Option<&str>,
        probe: Option<&ProbeResult>,
    ) -> MultiplexerDecision {
        if !enabled {
            return MultiplexerDecision::Skip;
        }
        let own = remembered
            .map(str::to_string)
            .unwrap_or_else(|| self.managed_name(session));

        let installed = probe
            .map(|p| p.installed)
            .or_else(|| self.cached_presence(server));
        let Some(probe) = probe.filter(|p| p.installed) else {
            return match installed {
                Some(false) if self.auto_install => MultiplexerDecision::CreateManaged { name: own },
                _ => MultiplexerDecision::Skip,
            };
        };

        if probe.sessions.iter().any(|name| *name == own) {
            return MultiplexerDecision::AttachExisting(own);
        }

        let managed_prefix = format!("{}-", self.prefix);
        let candidates: Vec<String> = probe
            .sessions
            .iter()
            .filter(|name| !name.starts_with(&managed_prefix))
            .cloned()
            .collect();
        if candidates.is_empty() {
            MultiplexerDecision::CreateManaged { name: own }
        } else {
            MultiplexerDecision::Prompt { candidates }
        }
    }

    /// Turns the user's answer to a prompt into a decision.
    pub fn resolve_choice(&self, session: SessionId, choice: MultiplexerChoice) -> MultiplexerDecision {
        match choice {
            MultiplexerChoice::CreateNew => MultiplexerDecision::CreateManaged {
                name: self.managed_name(session),
            },
            MultiplexerChoice::Attach(name) => MultiplexerDecision::AttachExisting(name),
            MultiplexerChoice::Skip => MultiplexerDecision::Skip,
        }
    }

    /// Literal remote script for a decision. `installed` false prepends
    /// the install step.
    pub fn script(&self, decision: &MultiplexerDecision, installed: bool) -> Option<String> {
        let command = match decision {
            MultiplexerDecision::Skip | MultiplexerDecision::Prompt { .. } => return None,
            MultiplexerDecision::CreateManaged { name } => {
                format!("tmux new-session -A -s {}", shell_quote(name))
            }
            MultiplexerDecision::AttachExisting(name) => {
                format!("tmux attach-session -t {}", shell_quote(name))
            }
        };
        if installed {
            Some(command)
        } else {
            Some(format!("{INSTALL_SCRIPT} && {command}"))
        }
    }

    /// Attachment for a decision, with its script queued.
    pub fn attachment(
        &self,
        session: SessionId,
        decision: &MultiplexerDecision,
        installed: bool,
    ) -> Option<MultiplexerAttachment> {
        let name = match decision {
            MultiplexerDecision::CreateManaged { name } => name.clone(),
            MultiplexerDecision::AttachExisting(name) => name.clone(),
            MultiplexerDecision::Skip | MultiplexerDecision::Prompt { .. } => return None,
        };
        Some(MultiplexerAttachment {
            ownership: self.ownership_of(session, &name),
            pending_command: self.script(decision, installed),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const SERVER: &str = "alice@example.com:22";

    fn resolver() -> MultiplexerResolver {
        MultiplexerResolver::new("vivy", false)
    }

    fn probe(sessions: &[&str]) -> ProbeResult {
        ProbeResult {
            installed: true,
            sessions: sessions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_probe() {
        let out = format!("Welcome!\n{PRESENT_MARKER}\nwork\nvivy-1234abcd\n\n");
        assert_eq!(parse_probe(&out), Some(probe(&["work", "vivy-1234abcd"])));

        let out = format!("{MISSING_MARKER}\n");
        assert_eq!(parse_probe(&out), Some(ProbeResult::default()));

        assert_eq!(parse_probe("bash: syntax error"), None);
    }

    #[test]
    fn test_probe_command_lists_session_names() {
        let command = probe_command();
        assert!(command.contains(PRESENT_MARKER));
        assert!(command.contains("#{session_name}"));
    }

    #[test]
    fn test_managed_name() {
        let session = Uuid::new_v4();
        let name = resolver().managed_name(session);
        assert!(name.starts_with("vivy-"));
        assert_eq!(name.len(), "vivy-".len() + 8);
        assert_eq!(name, resolver().managed_name(session));
    }

    #[test]
    fn test_disabled_skips() {
        let decision = resolver().decide(false, SERVER, Uuid::new_v4(), None, Some(&probe(&[])));
        assert_eq!(decision, MultiplexerDecision::Skip);
    }

    #[test]
    fn test_no_sessions_creates_managed() {
        let r = resolver();
        let session = Uuid::new_v4();
        let decision = r.decide(true, SERVER, session, None, Some(&probe(&[])));
        assert_eq!(
            decision,
            MultiplexerDecision::CreateManaged {
                name: r.managed_name(session)
            }
        );
    }

    #[test]
    fn test_own_session_is_reattached() {
        let r = resolver();
        let session = Uuid::new_v4();
        let own = r.managed_name(session);
        let decision = r.decide(true, SERVER, session, None, Some(&probe(&["work", &own])));
        assert_eq!(decision, MultiplexerDecision::AttachExisting(own.clone()));

        let attachment = r.attachment(session, &decision, true).unwrap();
        assert_eq!(attachment.ownership, Ownership::Managed);
    }

    #[test]
    fn test_foreign_sessions_prompt() {
        let r = resolver();
        let decision = r.decide(
            true,
            SERVER,
            Uuid::new_v4(),
            None,
            Some(&probe(&["work", "vivy-deadbeef"])),
        );
        assert_eq!(
            decision,
            MultiplexerDecision::Prompt {
                candidates: vec!["work".to_string()]
            }
        );
        assert!(r.script(&decision, true).is_none());
    }

    #[test]
    fn test_other_tabs_sessions_do_not_prompt() {
        let r = resolver();
        let decision = r.decide(true, SERVER, Uuid::new_v4(), None, Some(&probe(&["vivy-deadbeef"])));
        assert!(matches!(decision, MultiplexerDecision::CreateManaged { .. }));
    }

    #[test]
    fn test_remembered_name_is_preferred() {
        let r = resolver();
        let decision = r.decide(true, SERVER, Uuid::new_v4(), Some("work"), Some(&probe(&["work"])));
        assert_eq!(decision, MultiplexerDecision::AttachExisting("work".to_string()));
    }

    #[test]
    fn test_missing_binary() {
        let mut r = resolver();
        r.record_probe(SERVER, &ProbeResult::default());
        assert_eq!(r.cached_presence(SERVER), Some(false));
        assert_eq!(r.probe_for(true, SERVER), None);
        assert_eq!(
            r.decide(true, SERVER, Uuid::new_v4(), None, None),
            MultiplexerDecision::Skip
        );

        let mut installing = MultiplexerResolver::new("vivy", true);
        assert_eq!(installing.probe_for(true, SERVER), Some(probe_command()));
        let session = Uuid::new_v4();
        let decision = installing.decide(true, SERVER, session, None, Some(&ProbeResult::default()));
        assert!(matches!(decision, MultiplexerDecision::CreateManaged { .. }));

        installing.record_probe(SERVER, &ProbeResult::default());
        assert_eq!(installing.probe_for(true, SERVER), None);
        let decision = installing.decide(true, SERVER, session, None, None);
        assert!(matches!(decision, MultiplexerDecision::CreateManaged { .. }));
        let script = installing.script(&decision, false).unwrap();
        assert!(script.contains("apt-get install -y tmux"));
        assert!(script.ends_with(&format!("tmux new-session -A -s '{}'", installing.managed_name(session))));
    }

    #[test]
    fn test_unprobed_server_skips() {
        let r = resolver();
        assert_eq!(r.probe_for(true, SERVER), Some(probe_command()));
        assert_eq!(
            r.decide(true, SERVER, Uuid::new_v4(), None, None),
            MultiplexerDecision::Skip
        );
        assert_eq!(r.probe_for(false, SERVER), None);
    }

    #[test]
    fn test_presence_is_probed_once() {
        let mut r = resolver();
        r.record_probe(SERVER, &probe(&["work"]));
        let command = r.probe_for(true, SERVER).unwrap();
        assert_eq!(command, list_command());
        assert!(!command.contains("command -v"));

        let listed = parse_probe(&format!("{PRESENT_MARKER}\nwork\n")).unwrap();
        assert_eq!(listed, probe(&["work"]));
    }

    #[test]
    fn test_resolve_choice() {
        let r = resolver();
        let session = Uuid::new_v4();
        assert_eq!(
            r.resolve_choice(session, MultiplexerChoice::Attach("work".into())),
            MultiplexerDecision::AttachExisting("work".into())
        );
        assert_eq!(
            r.resolve_choice(session, MultiplexerChoice::Skip),
            MultiplexerDecision::Skip
        );

        let decision = r.resolve_choice(session, MultiplexerChoice::CreateNew);
        let attachment = r.attachment(session, &decision, true).unwrap();
        assert_eq!(attachment.ownership, Ownership::Managed);
        assert_eq!(attachment.name, r.managed_name(session));
    }

    #[test]
    fn test_attach_external_script_and_ownership() {
        let r = resolver();
        let session = Uuid::new_v4();
        let decision = MultiplexerDecision::AttachExisting("it's mine".to_string());
        let attachment = r.attachment(session, &decision, true).unwrap();
        assert_eq!(attachment.ownership, Ownership::External);
        assert_eq!(
            attachment.pending_command.as_deref(),
            Some(r"tmux attach-session -t 'it'\''s mine'")
        );
        assert!(r.attachment(session, &MultiplexerDecision::Skip, true).is_none());
    }

    #[test]
    fn test_kill_command_quotes_name() {
        assert_eq!(
            kill_command("vivy-1234abcd"),
            "tmux kill-session -t 'vivy-1234abcd' 2>/dev/null || true"
        );
    }

    #[test]
    fn test_forget_clears_cache() {
        let mut r = resolver();
        r.record_probe(SERVER, &probe(&[]));
        assert_eq!(r.cached_presence(SERVER), Some(true));
        r.forget(SERVER);
        assert_eq!(r.cached_presence(SERVER), None);
    }
}
