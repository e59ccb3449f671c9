use std::env;
use std::fs;
use std::time::Duration;

/// Polling/wait knobs. Kept separate so tests can run the whole lifecycle in milliseconds.
#[derive(Clone, Debug)]
pub struct Timings {
    pub instance_poll_interval: Duration,
    pub instance_max_wait: Duration,
    pub command_poll_interval: Duration,
    pub command_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub execution_timeout: Option<Duration>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            instance_poll_interval: Duration::from_secs(5),
            instance_max_wait: Duration::from_secs(300),
            command_poll_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(900),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(5),
            execution_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub provider: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub listen_port: u16,

    pub instance_type: String,
    /// Explicit image id; when empty the image is resolved from `image_parameter_name`.
    pub image_id: Option<String>,
    pub image_parameter_name: String,
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub key_pair_name: Option<String>,
    pub product_tag: String,

    pub streaming_port: u16,
    pub session_admin_user: String,
    pub remote_desktop_bin: String,
    pub cert_dir: String,
    pub acme_client_url: String,
    pub acme_email: Option<String>,

    pub timings: Timings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            database_url: None,
            redis_url: None,
            listen_port: 8003,
            instance_type: "g4dn.xlarge".to_string(),
            image_id: None,
            image_parameter_name: "/playdock/gaming-instance/image-id".to_string(),
            subnet_id: None,
            security_group_id: None,
            key_pair_name: None,
            product_tag: "playdock".to_string(),
            streaming_port: 8443,
            session_admin_user: "Administrator".to_string(),
            remote_desktop_bin: r"C:\Program Files\NICE\DCV\Server\bin\dcv.exe".to_string(),
            cert_dir: r"C:\Windows\System32\config\systemprofile\AppData\Local\NICE\dcv".to_string(),
            acme_client_url:
                "https://github.com/win-acme/win-acme/releases/download/v2.2.9.1701/win-acme.v2.2.9.1701.x64.pluggable.zip"
                    .to_string(),
            acme_email: None,
            timings: Timings::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Prefer `<KEY>_FILE` for secrets (Docker/K8s friendly), fallback to the env var itself.
fn env_secret(key: &str) -> Option<String> {
    let from_file = env_opt(&format!("{}_FILE", key))
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    from_file.or_else(|| env_opt(key))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        let td = Timings::default();
        let timings = Timings {
            instance_poll_interval: Duration::from_secs(env_parse("INSTANCE_POLL_SECONDS", 5)),
            instance_max_wait: Duration::from_secs(env_parse("INSTANCE_WAIT_SECONDS", 300)),
            command_poll_interval: Duration::from_secs(env_parse("COMMAND_POLL_SECONDS", 5)),
            command_timeout: Duration::from_secs(env_parse("COMMAND_TIMEOUT_SECONDS", 900)),
            retry_attempts: env_parse("DESCRIBE_RETRY_ATTEMPTS", td.retry_attempts),
            execution_timeout: match env_parse::<u64>("EXECUTION_TIMEOUT_SECONDS", 3600) {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
            ..td
        };

        Self {
            provider: env_opt("PROVIDER").unwrap_or(d.provider),
            database_url: env_secret("DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            listen_port: env_parse("ORCHESTRATOR_PORT", d.listen_port),
            instance_type: env_opt("INSTANCE_TYPE").unwrap_or(d.instance_type),
            image_id: env_opt("IMAGE_ID"),
            image_parameter_name: env_opt("IMAGE_PARAMETER_NAME").unwrap_or(d.image_parameter_name),
            subnet_id: env_opt("SUBNET_ID"),
            security_group_id: env_opt("SECURITY_GROUP_ID"),
            key_pair_name: env_opt("KEY_PAIR_NAME"),
            product_tag: env_opt("PRODUCT_TAG").unwrap_or(d.product_tag),
            streaming_port: env_parse("STREAMING_PORT", d.streaming_port),
            session_admin_user: env_opt("SESSION_ADMIN_USER").unwrap_or(d.session_admin_user),
            remote_desktop_bin: env_opt("REMOTE_DESKTOP_BIN").unwrap_or(d.remote_desktop_bin),
            cert_dir: env_opt("REMOTE_DESKTOP_CERT_DIR").unwrap_or(d.cert_dir),
            acme_client_url: env_opt("ACME_CLIENT_URL").unwrap_or(d.acme_client_url),
            acme_email: env_opt("ACME_EMAIL"),
            timings,
        }
    }
}
