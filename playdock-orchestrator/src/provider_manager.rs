use std::sync::Arc;

use playdock_providers::{CommandAgent, ComputeBackend, ParameterStore};

use crate::settings::Settings;

/// Backend seams the lifecycle core talks to.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub commands: Arc<dyn CommandAgent>,
    pub parameters: Arc<dyn ParameterStore>,
}

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_backends(provider_name: &str, settings: &Settings) -> Option<Backends> {
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use playdock_providers::mock::{MockCommandAgent, MockCompute, MockParameterStore};
                // The mock image parameter lets a local run deploy without IMAGE_ID.
                let parameters = MockParameterStore::new()
                    .with_parameter(&settings.image_parameter_name, "ami-playdock-local");
                Some(Backends {
                    compute: Arc::new(MockCompute::new()),
                    commands: Arc::new(MockCommandAgent::new()),
                    parameters: Arc::new(parameters),
                })
            }
            // Add other providers here
            _ => {
                let _ = settings;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_has_no_backends() {
        assert!(ProviderManager::get_backends("nope", &Settings::default()).is_none());
    }

    #[cfg(feature = "provider-mock")]
    #[tokio::test]
    async fn mock_provider_resolves_image_parameter() {
        let settings = Settings::default();
        let b = ProviderManager::get_backends(" Mock ", &settings).unwrap();
        let image = b
            .parameters
            .get_parameter(&settings.image_parameter_name)
            .await
            .unwrap();
        assert_eq!(image, "ami-playdock-local");
    }
}
