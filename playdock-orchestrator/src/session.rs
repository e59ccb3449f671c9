//! Session Controller: remote-desktop server install, session lifecycle, TLS and credentials.
//!
//! Every shell step goes through the Remote Command Executor. Scripts target the Windows
//! gaming image (PowerShell) with a DCV-style server binary.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::commands::RemoteCommandExecutor;
use crate::error::{LifecycleError, Result};
use crate::provisioning::InstanceProvisioningManager;
use crate::settings::Settings;

pub const TAG_REMOTE_DESKTOP_CONFIGURED: &str = "RemoteDesktopConfigured";

const SERVER_INSTALLER_URL: &str =
    "https://d1uj6qtbmh3dt5.cloudfront.net/nice-dcv-server-x64-Release.msi";
const SERVER_SERVICE: &str = "dcvserver";
const ACME_DIR: &str = r"C:\playdock\win-acme";
const ACME_PEM_DIR: &str = r"C:\playdock\certs";

const PASSWORD_LEN: usize = 20;
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!#%*+-=?@^_";

pub fn session_name(user_id: &str) -> String {
    format!("user-{}-session", user_id)
}

/// `203.0.113.7` -> `203-0-113-7.nip.io`
pub fn nip_io_domain(ip: &str) -> String {
    format!("{}.nip.io", ip.trim().replace('.', "-"))
}

pub fn streaming_link(host: &str, port: u16, session_id: &str) -> String {
    format!("https://{}:{}/#{}", host, port, session_id)
}

/// Random password with at least one character of each class, free of quotes and whitespace.
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let mut chars: Vec<u8> = classes
        .iter()
        .filter_map(|set| set.choose(&mut rng).copied())
        .collect();
    let all: Vec<u8> = classes.concat();
    while chars.len() < PASSWORD_LEN {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

/// PowerShell single-quoted literal.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConfigureOutcome {
    pub password_set: bool,
    pub ssl_configured: bool,
    pub domain: Option<String>,
    pub errors: Vec<String>,
}

impl ConfigureOutcome {
    pub fn success(&self) -> bool {
        self.password_set && self.ssl_configured
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StopSessionResult {
    pub stopped_successfully: bool,
    pub message: String,
}

pub struct SessionController {
    provisioning: Arc<InstanceProvisioningManager>,
    commands: Arc<RemoteCommandExecutor>,
    streaming_port: u16,
    admin_user: String,
    server_bin: String,
    cert_dir: String,
    acme_client_url: String,
    acme_email: Option<String>,
}

impl SessionController {
    pub fn new(
        provisioning: Arc<InstanceProvisioningManager>,
        commands: Arc<RemoteCommandExecutor>,
        settings: &Settings,
    ) -> Self {
        Self {
            provisioning,
            commands,
            streaming_port: settings.streaming_port,
            admin_user: settings.session_admin_user.clone(),
            server_bin: settings.remote_desktop_bin.clone(),
            cert_dir: settings.cert_dir.clone(),
            acme_client_url: settings.acme_client_url.clone(),
            acme_email: settings.acme_email.clone(),
        }
    }

    pub fn admin_user(&self) -> &str {
        &self.admin_user
    }

    pub fn streaming_port(&self) -> u16 {
        self.streaming_port
    }

    fn install_script(&self) -> Vec<String> {
        vec![
            "$ErrorActionPreference = 'Stop'".to_string(),
            format!(
                "Invoke-WebRequest -Uri {} -OutFile \"$env:TEMP\\rd-server.msi\" -UseBasicParsing",
                ps_quote(SERVER_INSTALLER_URL)
            ),
            "Start-Process msiexec.exe -Wait -ArgumentList '/i', \"$env:TEMP\\rd-server.msi\", 'ADDLOCAL=ALL', '/quiet', '/norestart'".to_string(),
            "$conn = 'Microsoft.PowerShell.Core\\Registry::HKEY_USERS\\S-1-5-18\\Software\\GSettings\\com\\nicesoftware\\dcv\\connectivity'".to_string(),
            "New-Item -Path $conn -Force | Out-Null".to_string(),
            format!(
                "New-ItemProperty -Path $conn -Name web-port -Value {} -PropertyType DWORD -Force | Out-Null",
                self.streaming_port
            ),
            format!(
                "New-NetFirewallRule -DisplayName 'playdock-streaming' -Direction Inbound -Protocol TCP -LocalPort {} -Action Allow | Out-Null",
                self.streaming_port
            ),
            format!("Restart-Service -Name {}", SERVER_SERVICE),
        ]
    }

    fn create_session_script(&self, session_id: &str) -> Vec<String> {
        let bin = ps_quote(&self.server_bin);
        vec![
            "$ErrorActionPreference = 'Stop'".to_string(),
            format!("$existing = & {} list-sessions | Out-String", bin),
            format!(
                "if ($existing -notmatch {}) {{ & {} create-session --type=console --owner {} {} }}",
                ps_quote(session_id),
                bin,
                ps_quote(&self.admin_user),
                ps_quote(session_id)
            ),
        ]
    }

    fn close_sessions_script(&self) -> Vec<String> {
        let bin = ps_quote(&self.server_bin);
        vec![
            format!(
                "& {} list-sessions | ForEach-Object {{ if ($_ -match \"Session: '([^']+)'\") {{ & {} close-session $Matches[1] }} }}",
                bin, bin
            ),
        ]
    }

    /// Install the server on first use, then create the user's named session.
    pub async fn ensure_session_ready(
        &self,
        instance_id: &str,
        user_id: &str,
    ) -> Result<SessionEndpoint> {
        let details = self.provisioning.get_instance_details(instance_id).await?;

        if details.tag(TAG_REMOTE_DESKTOP_CONFIGURED) == Some("true") {
            info!(instance_id, "[session] remote desktop server already configured");
        } else {
            info!(instance_id, "[session] installing remote desktop server");
            self.commands
                .run_and_wait(instance_id, &self.install_script(), Some("install remote desktop server"))
                .await?;
            self.provisioning
                .tag_instance(instance_id, TAG_REMOTE_DESKTOP_CONFIGURED, "true")
                .await?;
        }

        let session_id = session_name(user_id);
        self.commands
            .run_and_wait(
                instance_id,
                &self.create_session_script(&session_id),
                Some("create session"),
            )
            .await?;

        let host = details
            .public_ip
            .clone()
            .or_else(|| details.private_ip.clone())
            .ok_or_else(|| LifecycleError::NoPublicAddress(instance_id.to_string()))?;
        let endpoint = streaming_link(&host, self.streaming_port, &session_id);
        info!(instance_id, user_id, endpoint = %endpoint, "[session] session ready");

        Ok(SessionEndpoint {
            session_id,
            host,
            port: self.streaming_port,
            username: self.admin_user.clone(),
            endpoint,
        })
    }

    fn tls_steps(&self, domain: &str) -> Vec<(&'static str, Vec<String>)> {
        let wacs = format!("{}\\wacs.exe", ACME_DIR);
        let email = self
            .acme_email
            .as_deref()
            .map(|e| format!(" --emailaddress {}", ps_quote(e)))
            .unwrap_or_default();
        vec![
            (
                "disable browser security prompts",
                vec![
                    "$admin = 'HKLM:\\SOFTWARE\\Microsoft\\Active Setup\\Installed Components\\{A509B1A7-37EF-4b3f-8CFC-4F3A74704073}'".to_string(),
                    "$user = 'HKLM:\\SOFTWARE\\Microsoft\\Active Setup\\Installed Components\\{A509B1A8-37EF-4b3f-8CFC-4F3A74704073}'".to_string(),
                    "Set-ItemProperty -Path $admin -Name IsInstalled -Value 0".to_string(),
                    "Set-ItemProperty -Path $user -Name IsInstalled -Value 0".to_string(),
                ],
            ),
            (
                "fetch certificate client",
                vec![
                    "$ErrorActionPreference = 'Stop'".to_string(),
                    format!("New-Item -ItemType Directory -Force -Path {} | Out-Null", ps_quote(ACME_DIR)),
                    format!(
                        "Invoke-WebRequest -Uri {} -OutFile \"$env:TEMP\\win-acme.zip\" -UseBasicParsing",
                        ps_quote(&self.acme_client_url)
                    ),
                    format!(
                        "Expand-Archive -Path \"$env:TEMP\\win-acme.zip\" -DestinationPath {} -Force",
                        ps_quote(ACME_DIR)
                    ),
                ],
            ),
            (
                "request certificate",
                vec![
                    "$ErrorActionPreference = 'Stop'".to_string(),
                    "New-NetFirewallRule -DisplayName 'playdock-acme-http' -Direction Inbound -Protocol TCP -LocalPort 80 -Action Allow | Out-Null".to_string(),
                    format!("New-Item -ItemType Directory -Force -Path {} | Out-Null", ps_quote(ACME_PEM_DIR)),
                    format!(
                        "& {} --source manual --host {} --validation selfhosting --store pemfiles --pemfilespath {} --accepttos{}",
                        ps_quote(&wacs),
                        ps_quote(domain),
                        ps_quote(ACME_PEM_DIR),
                        email
                    ),
                    "if ($LASTEXITCODE -ne 0) { exit $LASTEXITCODE }".to_string(),
                ],
            ),
            (
                "install certificate",
                vec![
                    "$ErrorActionPreference = 'Stop'".to_string(),
                    format!(
                        "Copy-Item -Force {} {}",
                        ps_quote(&format!("{}\\{}-chain.pem", ACME_PEM_DIR, domain)),
                        ps_quote(&format!("{}\\dcv.pem", self.cert_dir))
                    ),
                    format!(
                        "Copy-Item -Force {} {}",
                        ps_quote(&format!("{}\\{}-key.pem", ACME_PEM_DIR, domain)),
                        ps_quote(&format!("{}\\dcv.key", self.cert_dir))
                    ),
                ],
            ),
            (
                "restart server",
                vec![format!("Restart-Service -Name {}", SERVER_SERVICE)],
            ),
        ]
    }

    /// Set the admin password and provision a certificate for the nip.io domain of `ip`.
    /// Never fails: partial progress is reported in the outcome.
    pub async fn configure_tls_and_password(
        &self,
        instance_id: &str,
        ip: &str,
        password: &str,
    ) -> ConfigureOutcome {
        let mut outcome = ConfigureOutcome::default();

        let set_password = vec![
            "$ErrorActionPreference = 'Stop'".to_string(),
            format!("$pw = ConvertTo-SecureString {} -AsPlainText -Force", ps_quote(password)),
            format!("Set-LocalUser -Name {} -Password $pw", ps_quote(&self.admin_user)),
        ];
        match self
            .commands
            .run_and_wait(instance_id, &set_password, Some("set admin password"))
            .await
        {
            Ok(_) => outcome.password_set = true,
            Err(e) => {
                warn!(instance_id, "[session] setting password failed: {}", e);
                outcome.errors.push(format!("password: {}", e));
            }
        }

        let domain = nip_io_domain(ip);
        let mut ssl_ok = true;
        for (label, script) in self.tls_steps(&domain) {
            if let Err(e) = self
                .commands
                .run_and_wait(instance_id, &script, Some(label))
                .await
            {
                warn!(instance_id, step = label, "[session] TLS step failed: {}", e);
                outcome.errors.push(format!("{}: {}", label, e));
                ssl_ok = false;
                break;
            }
        }
        outcome.ssl_configured = ssl_ok;
        if ssl_ok {
            outcome.domain = Some(domain);
        }

        info!(
            instance_id,
            password_set = outcome.password_set,
            ssl_configured = outcome.ssl_configured,
            "[session] configuration finished"
        );
        outcome
    }

    /// Best-effort close of every open session on the instance. Never returns an error.
    pub async fn stop_session(&self, instance_id: &str) -> StopSessionResult {
        match self
            .commands
            .run_and_wait(instance_id, &self.close_sessions_script(), Some("close sessions"))
            .await
        {
            Ok(_) => StopSessionResult {
                stopped_successfully: true,
                message: "sessions closed".to_string(),
            },
            Err(e) => {
                warn!(instance_id, "[session] stopping sessions failed: {}", e);
                StopSessionResult {
                    stopped_successfully: false,
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Timings;
    use playdock_providers::mock::{MockCommandAgent, MockCompute};
    use std::time::Duration;

    struct Rig {
        compute: Arc<MockCompute>,
        agent: Arc<MockCommandAgent>,
        controller: SessionController,
    }

    fn rig() -> Rig {
        let settings = Settings {
            timings: Timings {
                instance_poll_interval: Duration::from_millis(1),
                command_poll_interval: Duration::from_millis(1),
                command_timeout: Duration::from_millis(200),
                retry_base_delay: Duration::from_millis(1),
                retry_max_delay: Duration::from_millis(2),
                ..Timings::default()
            },
            ..Settings::default()
        };
        let compute = Arc::new(MockCompute::new());
        let agent = Arc::new(MockCommandAgent::new());
        let provisioning = Arc::new(InstanceProvisioningManager::new(compute.clone(), &settings));
        let commands = Arc::new(RemoteCommandExecutor::new(agent.clone(), &settings.timings));
        Rig {
            controller: SessionController::new(provisioning, commands, &settings),
            compute,
            agent,
        }
    }

    #[test]
    fn domain_and_link_derivation() {
        assert_eq!(nip_io_domain("203.0.113.7"), "203-0-113-7.nip.io");
        assert_eq!(
            streaming_link("203-0-113-7.nip.io", 8443, &session_name("u1")),
            "https://203-0-113-7.nip.io:8443/#user-u1-session"
        );
    }

    #[test]
    fn passwords_cover_every_class() {
        for _ in 0..50 {
            let pw = generate_password();
            assert_eq!(pw.len(), PASSWORD_LEN);
            assert!(pw.bytes().any(|b| LOWER.contains(&b)));
            assert!(pw.bytes().any(|b| UPPER.contains(&b)));
            assert!(pw.bytes().any(|b| DIGITS.contains(&b)));
            assert!(pw.bytes().any(|b| SYMBOLS.contains(&b)));
            assert!(!pw.contains('\'') && !pw.contains(' '));
        }
        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(ps_quote("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn install_runs_once_per_instance() {
        let r = rig();
        r.compute.insert_instance("i-1", "running");

        let ep = r.controller.ensure_session_ready("i-1", "u1").await.unwrap();
        assert_eq!(ep.session_id, "user-u1-session");
        assert_eq!(ep.endpoint, "https://203.0.113.7:8443/#user-u1-session");
        assert_eq!(ep.username, "Administrator");
        assert_eq!(
            r.compute.tags_of("i-1").get(TAG_REMOTE_DESKTOP_CONFIGURED).map(String::as_str),
            Some("true")
        );
        assert_eq!(r.agent.sent_scripts().len(), 2);

        r.controller.ensure_session_ready("i-1", "u1").await.unwrap();
        let scripts = r.agent.sent_scripts();
        assert_eq!(scripts.len(), 3);
        assert!(scripts[2].1.contains("create-session"));
    }

    #[tokio::test]
    async fn failed_install_does_not_mark_instance() {
        let r = rig();
        r.compute.insert_instance("i-1", "running");
        r.agent.fail_scripts_containing("msiexec");
        let err = r.controller.ensure_session_ready("i-1", "u1").await.unwrap_err();
        assert_eq!(err.code(), "CommandFailed");
        assert!(r.compute.tags_of("i-1").get(TAG_REMOTE_DESKTOP_CONFIGURED).is_none());
    }

    #[tokio::test]
    async fn partial_tls_failure_is_reported() {
        let r = rig();
        r.agent.fail_scripts_containing("wacs.exe");
        let outcome = r
            .controller
            .configure_tls_and_password("i-1", "203.0.113.7", "Secr3t!pass")
            .await;
        assert!(outcome.password_set);
        assert!(!outcome.ssl_configured);
        assert!(!outcome.success());
        assert!(outcome.domain.is_none());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("request certificate"));
        // Steps after the failing one are skipped.
        assert!(!r.agent.sent_scripts().iter().any(|(_, s)| s.contains("dcv.pem")));
    }

    #[tokio::test]
    async fn full_configuration_succeeds() {
        let r = rig();
        let outcome = r
            .controller
            .configure_tls_and_password("i-1", "203.0.113.7", "Secr3t!pass")
            .await;
        assert!(outcome.success());
        assert_eq!(outcome.domain.as_deref(), Some("203-0-113-7.nip.io"));
        assert_eq!(r.agent.sent_scripts().len(), 6);
    }

    #[tokio::test]
    async fn stop_session_never_errors() {
        let r = rig();
        r.agent.fail_scripts_containing("close-session");
        let res = r.controller.stop_session("i-1").await;
        assert!(!res.stopped_successfully);
        assert!(!res.message.is_empty());

        let r = rig();
        assert!(r.controller.stop_session("i-1").await.stopped_successfully);
    }
}
