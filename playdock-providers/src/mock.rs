//! In-memory backends used by local runs and tests.
//!
//! State advances on reads: every `describe_instance` counts as one tick for the instance, so a
//! `pending` instance becomes `running` after `pending_polls` describes, `shutting-down` becomes
//! `terminated` after `shutdown_polls`, and a terminated instance can optionally disappear.

use crate::inventory::{
    AttachedVolume, CommandInvocation, InstanceDescription, InvocationStatus, LaunchRequest,
    LaunchedInstance,
};
use crate::{CommandAgent, ComputeBackend, ParameterStore, ProviderError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct MockInstance {
    state: String,
    ticks: u32,
    public_ip: Option<String>,
    private_ip: Option<String>,
    volumes: Vec<AttachedVolume>,
    tags: HashMap<String, String>,
    purged: bool,
}

#[derive(Default)]
struct ComputeState {
    instances: HashMap<String, MockInstance>,
    next_ip: u8,
    run_calls: u32,
    terminate_calls: u32,
    detach_calls: u32,
    images: Vec<(String, String)>,
    fail_next_run: Option<ProviderError>,
    fail_detach: bool,
    transient_describe_failures: u32,
}

pub struct MockCompute {
    pending_polls: u32,
    stopping_polls: u32,
    shutdown_polls: u32,
    purge_terminated: bool,
    state: Mutex<ComputeState>,
}

impl Default for MockCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompute {
    pub fn new() -> Self {
        Self {
            pending_polls: 1,
            stopping_polls: 1,
            shutdown_polls: 1,
            purge_terminated: false,
            state: Mutex::new(ComputeState {
                next_ip: 10,
                ..Default::default()
            }),
        }
    }

    pub fn with_pending_polls(mut self, n: u32) -> Self {
        self.pending_polls = n;
        self
    }

    pub fn with_shutdown_polls(mut self, n: u32) -> Self {
        self.shutdown_polls = n;
        self
    }

    /// Terminated instances disappear (describe -> not found) once they reach `terminated`.
    pub fn with_purge_terminated(mut self, purge: bool) -> Self {
        self.purge_terminated = purge;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ComputeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an instance in an arbitrary provider state.
    pub fn insert_instance(&self, instance_id: &str, state: &str) {
        let mut s = self.lock();
        s.instances.insert(
            instance_id.to_string(),
            MockInstance {
                state: state.to_string(),
                ticks: 0,
                public_ip: Some("203.0.113.7".to_string()),
                private_ip: Some("10.0.0.7".to_string()),
                volumes: default_volumes(instance_id),
                tags: HashMap::new(),
                purged: false,
            },
        );
    }

    pub fn state_of(&self, instance_id: &str) -> Option<String> {
        self.lock()
            .instances
            .get(instance_id)
            .filter(|i| !i.purged)
            .map(|i| i.state.clone())
    }

    pub fn tags_of(&self, instance_id: &str) -> HashMap<String, String> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn fail_next_run(&self, err: ProviderError) {
        self.lock().fail_next_run = Some(err);
    }

    pub fn fail_detach(&self, fail: bool) {
        self.lock().fail_detach = fail;
    }

    /// Next `n` describes fail with a throttling error.
    pub fn fail_describes(&self, n: u32) {
        self.lock().transient_describe_failures = n;
    }

    pub fn run_calls(&self) -> u32 {
        self.lock().run_calls
    }

    pub fn terminate_calls(&self) -> u32 {
        self.lock().terminate_calls
    }

    pub fn detach_calls(&self) -> u32 {
        self.lock().detach_calls
    }

    pub fn images(&self) -> Vec<(String, String)> {
        self.lock().images.clone()
    }

    fn advance(&self, inst: &mut MockInstance) {
        inst.ticks += 1;
        let (next, after) = match inst.state.as_str() {
            "pending" => ("running", self.pending_polls),
            "stopping" => ("stopped", self.stopping_polls),
            "shutting-down" => ("terminated", self.shutdown_polls),
            _ => return,
        };
        if inst.ticks >= after {
            inst.state = next.to_string();
            inst.ticks = 0;
            if next == "terminated" && self.purge_terminated {
                inst.purged = true;
            }
        }
    }
}

fn default_volumes(instance_id: &str) -> Vec<AttachedVolume> {
    vec![
        AttachedVolume {
            volume_id: format!("vol-root-{}", instance_id),
            device_name: "/dev/sda1".to_string(),
            is_root: true,
        },
        AttachedVolume {
            volume_id: format!("vol-data-{}", instance_id),
            device_name: "xvdf".to_string(),
            is_root: false,
        },
    ]
}

#[async_trait]
impl ComputeBackend for MockCompute {
    fn instance_arn(&self, instance_id: &str) -> String {
        format!("arn:mock:compute:local:000000000000:instance/{}", instance_id)
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance, ProviderError> {
        let mut s = self.lock();
        s.run_calls += 1;
        if let Some(err) = s.fail_next_run.take() {
            return Err(err);
        }
        let instance_id = format!("i-{}", &uuid::Uuid::new_v4().simple().to_string()[..17]);
        s.next_ip = s.next_ip.wrapping_add(1);
        let octet = s.next_ip;
        let inst = MockInstance {
            state: "pending".to_string(),
            ticks: 0,
            public_ip: Some(format!("198.51.100.{}", octet)),
            private_ip: Some(format!("10.0.1.{}", octet)),
            volumes: default_volumes(&instance_id),
            tags: request.tags.iter().cloned().collect(),
            purged: false,
        };
        s.instances.insert(instance_id.clone(), inst);
        Ok(LaunchedInstance {
            instance_id,
            state: "pending".to_string(),
            public_ip: None,
            private_ip: Some(format!("10.0.1.{}", octet)),
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription, ProviderError> {
        let mut s = self.lock();
        if s.transient_describe_failures > 0 {
            s.transient_describe_failures -= 1;
            return Err(ProviderError::Throttled("Rate exceeded".to_string()));
        }
        let Some(mut inst) = s.instances.get(instance_id).cloned() else {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        };
        if inst.purged {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        }
        let desc = InstanceDescription {
            instance_id: instance_id.to_string(),
            state: inst.state.clone(),
            instance_type: Some("mock.large".to_string()),
            public_ip: inst.public_ip.clone(),
            private_ip: inst.private_ip.clone(),
            volumes: inst.volumes.clone(),
            tags: inst.tags.clone(),
        };
        self.advance(&mut inst);
        s.instances.insert(instance_id.to_string(), inst);
        Ok(desc)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<String, ProviderError> {
        let mut s = self.lock();
        s.terminate_calls += 1;
        match s.instances.get_mut(instance_id) {
            Some(inst) if !inst.purged => {
                if inst.state != "terminated" {
                    inst.state = "shutting-down".to_string();
                    inst.ticks = 0;
                }
                Ok(inst.state.clone())
            }
            _ => Err(ProviderError::InstanceNotFound(instance_id.to_string())),
        }
    }

    async fn create_tags(&self, instance_id: &str, tags: &[(String, String)]) -> Result<(), ProviderError> {
        let mut s = self.lock();
        let Some(inst) = s.instances.get_mut(instance_id) else {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        };
        for (k, v) in tags {
            inst.tags.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<(), ProviderError> {
        let mut s = self.lock();
        s.detach_calls += 1;
        if s.fail_detach {
            return Err(ProviderError::Other(format!(
                "volume {} is busy and cannot be detached",
                volume_id
            )));
        }
        let Some(inst) = s.instances.get_mut(instance_id) else {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        };
        inst.volumes.retain(|v| v.volume_id != volume_id);
        Ok(())
    }

    async fn create_image(&self, instance_id: &str, name: &str, _no_reboot: bool) -> Result<String, ProviderError> {
        let mut s = self.lock();
        if !s.instances.contains_key(instance_id) {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        }
        let image_id = format!("ami-{}", &uuid::Uuid::new_v4().simple().to_string()[..17]);
        s.images.push((image_id.clone(), name.to_string()));
        Ok(image_id)
    }
}

#[derive(Clone, Debug)]
struct MockInvocation {
    instance_id: String,
    script: String,
    polls: u32,
}

#[derive(Default)]
struct AgentState {
    invocations: HashMap<String, MockInvocation>,
    sent: Vec<(String, String)>,
}

/// Command agent whose invocations are invisible for `invisible_polls` reads and complete after
/// `polls_to_complete` visible reads. Scripts matching a failing pattern end as `Failed`;
/// scripts matching a hanging pattern never leave `InProgress`.
pub struct MockCommandAgent {
    invisible_polls: u32,
    polls_to_complete: u32,
    failing_patterns: Mutex<Vec<String>>,
    hanging_patterns: Mutex<Vec<String>>,
    state: Mutex<AgentState>,
}

impl Default for MockCommandAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommandAgent {
    pub fn new() -> Self {
        Self {
            invisible_polls: 1,
            polls_to_complete: 1,
            failing_patterns: Mutex::new(Vec::new()),
            hanging_patterns: Mutex::new(Vec::new()),
            state: Mutex::new(AgentState::default()),
        }
    }

    pub fn with_invisible_polls(mut self, n: u32) -> Self {
        self.invisible_polls = n;
        self
    }

    pub fn with_polls_to_complete(mut self, n: u32) -> Self {
        self.polls_to_complete = n;
        self
    }

    pub fn fail_scripts_containing(&self, pattern: &str) {
        lock(&self.failing_patterns).push(pattern.to_string());
    }

    pub fn hang_scripts_containing(&self, pattern: &str) {
        lock(&self.hanging_patterns).push(pattern.to_string());
    }

    /// (instance_id, script) for every command sent, in order.
    pub fn sent_scripts(&self) -> Vec<(String, String)> {
        lock(&self.state).sent.clone()
    }

    fn matches(patterns: &Mutex<Vec<String>>, script: &str) -> bool {
        lock(patterns).iter().any(|p| script.contains(p.as_str()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl CommandAgent for MockCommandAgent {
    async fn send_command(
        &self,
        instance_id: &str,
        script_lines: &[String],
        _comment: Option<&str>,
    ) -> Result<String, ProviderError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let script = script_lines.join("\n");
        let mut s = lock(&self.state);
        s.sent.push((instance_id.to_string(), script.clone()));
        s.invocations.insert(
            command_id.clone(),
            MockInvocation {
                instance_id: instance_id.to_string(),
                script,
                polls: 0,
            },
        );
        Ok(command_id)
    }

    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation, ProviderError> {
        let not_visible = || ProviderError::InvocationDoesNotExist {
            command_id: command_id.to_string(),
            instance_id: instance_id.to_string(),
        };
        let mut s = lock(&self.state);
        let Some(inv) = s.invocations.get_mut(command_id) else {
            return Err(not_visible());
        };
        if inv.instance_id != instance_id {
            return Err(not_visible());
        }
        inv.polls += 1;
        if inv.polls <= self.invisible_polls {
            return Err(not_visible());
        }
        let visible_polls = inv.polls - self.invisible_polls;
        let script = inv.script.clone();

        let (status, stdout, stderr) = if Self::matches(&self.hanging_patterns, &script) {
            (InvocationStatus::InProgress, String::new(), String::new())
        } else if visible_polls < self.polls_to_complete {
            (InvocationStatus::InProgress, String::new(), String::new())
        } else if Self::matches(&self.failing_patterns, &script) {
            (
                InvocationStatus::Failed,
                String::new(),
                "script exited with code 1".to_string(),
            )
        } else {
            (InvocationStatus::Success, "ok".to_string(), String::new())
        };

        Ok(CommandInvocation {
            command_id: command_id.to_string(),
            instance_id: instance_id.to_string(),
            status,
            stdout,
            stderr,
        })
    }
}

#[derive(Default)]
pub struct MockParameterStore {
    values: Mutex<HashMap<String, String>>,
}

impl MockParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(self, name: &str, value: &str) -> Self {
        lock(&self.values).insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ParameterStore for MockParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<String, ProviderError> {
        lock(&self.values)
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::ParameterNotFound(name.to_string()))
    }
}
