// Shared harness: in-memory registry + mock backends with millisecond timings.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use playdock_common::status::DeploymentStatus;
use playdock_orchestrator::engine::ExecutionDescription;
use playdock_orchestrator::provider_manager::Backends;
use playdock_orchestrator::registry::{MemoryRegistry, RegistryStore};
use playdock_orchestrator::{LifecycleService, Settings, Timings};
use playdock_providers::mock::{MockCommandAgent, MockCompute, MockParameterStore};

pub const IMAGE_PARAMETER: &str = "/playdock/gaming-instance/image-id";

pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub compute: Arc<MockCompute>,
    pub agent: Arc<MockCommandAgent>,
    pub settings: Settings,
    pub service: LifecycleService,
}

pub fn fast_settings() -> Settings {
    Settings {
        timings: Timings {
            instance_poll_interval: Duration::from_millis(1),
            instance_max_wait: Duration::from_secs(2),
            command_poll_interval: Duration::from_millis(1),
            command_timeout: Duration::from_secs(2),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            execution_timeout: Some(Duration::from_secs(30)),
        },
        ..Settings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(MockCompute::new(), MockCommandAgent::new(), fast_settings(), true)
}

pub fn harness_with(
    compute: MockCompute,
    agent: MockCommandAgent,
    settings: Settings,
    with_image_parameter: bool,
) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let compute = Arc::new(compute);
    let agent = Arc::new(agent);
    let mut parameters = MockParameterStore::new();
    if with_image_parameter {
        parameters = parameters.with_parameter(IMAGE_PARAMETER, "ami-0123456789abcdef0");
    }
    let backends = Backends {
        compute: compute.clone(),
        commands: agent.clone(),
        parameters: Arc::new(parameters),
    };
    let store: Arc<dyn RegistryStore> = registry.clone();
    let service = LifecycleService::assemble(&settings, store, backends);
    Harness {
        registry,
        compute,
        agent,
        settings,
        service,
    }
}

/// Poll the user's status until terminal (fails the test after 10s).
pub async fn wait_for_status(h: &Harness, user_id: &str) -> DeploymentStatus {
    h.service
        .wait_for_terminal_status(
            user_id,
            Duration::from_millis(2),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await
        .expect("workflow did not reach a terminal status")
}

pub async fn wait_for_execution(h: &Harness, execution_id: &str) -> ExecutionDescription {
    for _ in 0..5000 {
        let d = h
            .service
            .orchestrator()
            .describe_execution(execution_id)
            .await
            .expect("execution exists");
        if d.status.is_terminal() {
            return d;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("execution {execution_id} did not finish");
}
