//! Scripted stand-ins for remote hosts, shared by unit and integration tests.
//!
//! [`FakeRemote`] answers the scripts the deployer sends with canned output
//! and keeps just enough state (crontab, written files, running instances) to
//! check idempotence across runs. [`ScriptedConnector`] hands out one
//! `FakeRemote` per host and decides which credentials each host accepts.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;

use crate::core::types::AuthPath;
use crate::error::DeployError;
use crate::io::connect::{Connection, Connector, Prober, resolve_auth};
use crate::io::lifecycle::{START_TAG, STOP_TAG};
use crate::io::remote::{ExecOutput, MirrorRequest, Remote, SshTarget};
use crate::io::scheduler::{READ_TABLE, WRITE_TABLE};

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    inputs: Vec<(String, String)>,
    mirrors: Vec<MirrorRequest>,
    mirror_failure: Option<ExecOutput>,
    rules: Vec<(String, VecDeque<ExecOutput>)>,
    crontab: Option<String>,
    crontab_writes: usize,
    crontab_rejection: Option<String>,
    allowlist: Option<String>,
    authorized: BTreeSet<String>,
    running: BTreeMap<String, usize>,
    max_running: BTreeMap<String, usize>,
    lifecycle: Vec<&'static str>,
}

/// In-memory host. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    destination: String,
    state: Rc<RefCell<FakeState>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::with_destination("fake.lan")
    }

    pub fn with_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            state: Rc::new(RefCell::new(FakeState::default())),
        }
    }

    /// Answer scripts containing `pattern` with `output` (checked before defaults).
    pub fn respond(&self, pattern: &str, output: ExecOutput) {
        self.respond_sequence(pattern, vec![output]);
    }

    /// Answer successive matching scripts in order; the last answer repeats.
    pub fn respond_sequence(&self, pattern: &str, outputs: Vec<ExecOutput>) {
        self.state
            .borrow_mut()
            .rules
            .push((pattern.to_string(), outputs.into()));
    }

    pub fn fail_mirror(&self, code: i32, stderr: &str) {
        self.state.borrow_mut().mirror_failure = Some(ExecOutput::failed(code, stderr));
    }

    pub fn set_crontab(&self, table: &str) {
        self.state.borrow_mut().crontab = Some(table.to_string());
    }

    pub fn reject_crontab_write(&self, stderr: &str) {
        self.state.borrow_mut().crontab_rejection = Some(stderr.to_string());
    }

    pub fn set_allowlist(&self, contents: &str) {
        self.state.borrow_mut().allowlist = Some(contents.to_string());
    }

    /// Scripts run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.state.borrow().calls.iter().any(|c| c.contains(needle))
    }

    pub fn mirrors(&self) -> Vec<MirrorRequest> {
        self.state.borrow().mirrors.clone()
    }

    /// Stdin of the latest script containing `needle`.
    pub fn last_input_for(&self, needle: &str) -> Option<String> {
        self.state
            .borrow()
            .inputs
            .iter()
            .rev()
            .find(|(script, _)| script.contains(needle))
            .map(|(_, input)| input.clone())
    }

    /// Latest contents written to a profile's secret file.
    pub fn secret_file(&self, profile: &str, file_name: &str) -> Option<String> {
        self.last_input_for(&format!("'agentdata/{profile}/secrets/{file_name}'"))
    }

    pub fn crontab(&self) -> Option<String> {
        self.state.borrow().crontab.clone()
    }

    pub fn crontab_writes(&self) -> usize {
        self.state.borrow().crontab_writes
    }

    /// `"stop"`/`"start"` in the order the scripts ran.
    pub fn lifecycle_events(&self) -> Vec<&'static str> {
        self.state.borrow().lifecycle.clone()
    }

    pub fn running_instances(&self, profile: &str) -> usize {
        self.state.borrow().running.get(profile).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous instances ever seen.
    pub fn max_running_instances(&self, profile: &str) -> usize {
        self.state
            .borrow()
            .max_running
            .get(profile)
            .copied()
            .unwrap_or(0)
    }

    fn answer(&self, script: &str, input: Option<&str>) -> ExecOutput {
        let mut state = self.state.borrow_mut();
        state.calls.push(script.to_string());
        if let Some(input) = input {
            state.inputs.push((script.to_string(), input.to_string()));
        }

        if let Some((_, outputs)) = state
            .rules
            .iter_mut()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
        {
            let output = if outputs.len() > 1 {
                outputs.pop_front()
            } else {
                outputs.front().cloned()
            };
            if let Some(output) = output {
                return output;
            }
        }

        if script == READ_TABLE {
            return match &state.crontab {
                Some(table) => ExecOutput::ok(table.clone()),
                None => ExecOutput::failed(1, "no crontab for deploy"),
            };
        }
        if script == WRITE_TABLE {
            if let Some(stderr) = &state.crontab_rejection {
                return ExecOutput::failed(1, stderr.clone());
            }
            state.crontab = input.map(str::to_string);
            state.crontab_writes += 1;
            return ExecOutput::ok("");
        }
        if script.contains(STOP_TAG) {
            state.lifecycle.push("stop");
            let profile = between(script, "systemctl --user stop agentfleet-", ".service");
            let previous = state.running.insert(profile, 0).unwrap_or(0);
            return ExecOutput::ok(if previous == 0 {
                "not-running\n"
            } else {
                "terminated\n"
            });
        }
        if script.contains(START_TAG) {
            state.lifecycle.push("start");
            let profile = between(script, "'--profile' '", "'");
            let running = state.running.entry(profile.clone()).or_insert(0);
            *running += 1;
            let now = *running;
            let max = state.max_running.entry(profile).or_insert(0);
            *max = (*max).max(now);
            return ExecOutput::ok("started\n");
        }
        if script.contains("grep -qxF") {
            return if state.authorized.insert(script.to_string()) {
                ExecOutput::ok("added\n")
            } else {
                ExecOutput::ok("present\n")
            };
        }
        if script.contains("telegram_allowlist_chat_ids.txt") {
            return ExecOutput::ok(state.allowlist.clone().unwrap_or_default());
        }
        if script.contains("sys.version_info") {
            return ExecOutput::ok("3.12\n");
        }
        if script == "id -un" {
            return ExecOutput::ok("deploy\n");
        }
        ExecOutput::ok("")
    }
}

fn between(haystack: &str, start: &str, end: &str) -> String {
    haystack
        .split_once(start)
        .and_then(|(_, rest)| rest.split_once(end))
        .map(|(value, _)| value.to_string())
        .unwrap_or_default()
}

impl Remote for FakeRemote {
    fn destination(&self) -> String {
        self.destination.clone()
    }

    fn exec(&self, script: &str) -> Result<ExecOutput> {
        Ok(self.answer(script, None))
    }

    fn exec_with_input(&self, script: &str, input: &[u8]) -> Result<ExecOutput> {
        let input = String::from_utf8_lossy(input).into_owned();
        Ok(self.answer(script, Some(&input)))
    }

    fn mirror(&self, request: &MirrorRequest) -> Result<ExecOutput> {
        let mut state = self.state.borrow_mut();
        state.mirrors.push(request.clone());
        Ok(state
            .mirror_failure
            .clone()
            .unwrap_or_else(|| ExecOutput::ok("")))
    }
}

/// Connector over [`FakeRemote`]s, keyed by host.
///
/// Every host accepts the deploy key unless told otherwise; unreachable
/// hosts reject every credential.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    remotes: RefCell<BTreeMap<String, FakeRemote>>,
    rejects_key: BTreeSet<String>,
    unreachable: BTreeSet<String>,
    connections: RefCell<Vec<(String, AuthPath)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `host` does not trust the deploy key but accepts the ambient identity.
    pub fn rejecting_key(mut self, host: &str) -> Self {
        self.rejects_key.insert(host.to_string());
        self
    }

    /// `host` fails every probe.
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    /// The host's fake, created on first use.
    pub fn remote(&self, host: &str) -> FakeRemote {
        self.remotes
            .borrow_mut()
            .entry(host.to_string())
            .or_insert_with(|| FakeRemote::with_destination(host))
            .clone()
    }

    /// Successful connections as (host, auth path).
    pub fn connections(&self) -> Vec<(String, AuthPath)> {
        self.connections.borrow().clone()
    }
}

impl Prober for ScriptedConnector {
    fn probe(&self, target: &SshTarget, auth: &AuthPath) -> Result<bool> {
        if self.unreachable.contains(&target.host) {
            return Ok(false);
        }
        Ok(match auth {
            AuthPath::DeployKey(_) => !self.rejects_key.contains(&target.host),
            AuthPath::Ambient => true,
        })
    }
}

impl Connector for ScriptedConnector {
    type Session = FakeRemote;

    fn connect(
        &self,
        target: &SshTarget,
        deploy_key: Option<&Path>,
    ) -> Result<Connection<FakeRemote>, DeployError> {
        let auth = resolve_auth(self, target, deploy_key)?;
        self.connections
            .borrow_mut()
            .push((target.host.clone(), auth.clone()));
        Ok(Connection {
            auth,
            session: self.remote(&target.host),
        })
    }
}
