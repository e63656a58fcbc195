//! Public ingress for an environment.
//!
//! [`TunnelProvisioner`] abstracts how an instance gets a public URL.
//! [`QuickTunnelProvisioner`] is the zero-config strategy: the tunnel process
//! on the instance is assigned a random hostname under a public suffix and
//! prints it to its log, which we poll and parse.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;
use crate::bootstrap::{BootstrapRunner, BootstrapStep, StepCommand};
use crate::error::{Error, Result};

/// A provisioned public endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub tunnel_id: String,
    pub url: String,
}

/// Strategy for exposing an instance publicly.
#[async_trait]
pub trait TunnelProvisioner: Send + Sync {
    /// Bootstrap step that launches the tunnel process on the instance.
    fn start_step(&self) -> StepCommand;

    /// Waits for the launched tunnel to report its endpoint.
    async fn provision(&self, instance_id: &str) -> Result<TunnelEndpoint>;

    /// Releases provider-side state for an endpoint.
    async fn release(&self, _endpoint: &TunnelEndpoint) -> Result<()> {
        Ok(())
    }
}

const START_SCRIPT: &str = r#"PORT="$1"; LOG="$2"
pkill -f 'cloudflared tunnel --no-autoupdate --url' || true
mkdir -p "$(dirname "$LOG")"
: > "$LOG"
nohup cloudflared tunnel --no-autoupdate --url "http://localhost:$PORT" > "$LOG" 2>&1 &
echo "tunnel process started""#;

/// Anonymous tunnel with a randomly assigned hostname.
pub struct QuickTunnelProvisioner {
    runner: BootstrapRunner,
    log_path: String,
    app_port: u16,
    url_pattern: Regex,
    timeout: Duration,
    poll_initial: Duration,
    poll_max: Duration,
}

impl QuickTunnelProvisioner {
    /// Builds a provisioner matching hostnames under `public_suffix`.
    pub fn new(
        runner: BootstrapRunner,
        log_path: impl Into<String>,
        app_port: u16,
        public_suffix: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let url_pattern = url_pattern(public_suffix)?;
        Ok(Self {
            runner,
            log_path: log_path.into(),
            app_port,
            url_pattern,
            timeout,
            poll_initial: Duration::from_secs(1),
            poll_max: Duration::from_secs(5),
        })
    }

    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }

    async fn read_log(&self, instance_id: &str) -> Result<String> {
        let output = self
            .runner
            .run(
                instance_id,
                "tail -c 65536",
                &[self.log_path.clone()],
                Duration::from_secs(20),
            )
            .await?;
        Ok(output.stdout)
    }
}

/// Regex for `https://<label>.<suffix>`.
pub fn url_pattern(public_suffix: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"https://([a-zA-Z0-9-]+)\.{}",
        regex::escape(public_suffix.trim_start_matches('.'))
    ))
    .map_err(|e| Error::Config(format!("invalid tunnel suffix '{}': {}", public_suffix, e)))
}

/// First tunnel hostname in `text`, skipping the provider's own API host.
pub fn extract_endpoint(pattern: &Regex, text: &str) -> Option<TunnelEndpoint> {
    pattern.captures_iter(text).find_map(|caps| {
        let label = caps.get(1)?.as_str();
        if label == "api" {
            return None;
        }
        Some(TunnelEndpoint {
            tunnel_id: label.to_string(),
            url: caps.get(0)?.as_str().to_string(),
        })
    })
}

#[async_trait]
impl TunnelProvisioner for QuickTunnelProvisioner {
    fn start_step(&self) -> StepCommand {
        StepCommand::script(
            BootstrapStep::StartTunnel,
            START_SCRIPT,
            vec![self.app_port.to_string(), self.log_path.clone()],
        )
    }

    async fn provision(&self, instance_id: &str) -> Result<TunnelEndpoint> {
        let poll = async {
            let mut backoff = ExponentialBackoff::new(self.poll_initial, self.poll_max);
            loop {
                match self.read_log(instance_id).await {
                    Ok(log) => {
                        if let Some(endpoint) = extract_endpoint(&self.url_pattern, &log) {
                            return endpoint;
                        }
                        tracing::debug!(instance_id, "tunnel hostname not reported yet");
                    }
                    Err(e) => tracing::debug!(instance_id, error = %e, "tunnel log read failed"),
                }
                backoff.wait().await;
            }
        };

        match tokio::time::timeout(self.timeout, poll).await {
            Ok(endpoint) => {
                tracing::info!(instance_id, url = %endpoint.url, "tunnel ready");
                Ok(endpoint)
            }
            Err(_) => {
                tracing::error!(instance_id, timeout_secs = self.timeout.as_secs(), "tunnel hostname never appeared");
                Err(Error::TunnelTimeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::CommandOutput;
    use crate::testing::FakeCommandChannel;
    use std::sync::Arc;

    const LOG: &str = "2026-02-04T10:00:00Z INF Requesting new quick Tunnel on trycloudflare.com...
2026-02-04T10:00:02Z INF +--------------------------------------------------------------------------------------------+
2026-02-04T10:00:02Z INF |  Your quick Tunnel has been created! Visit it at (it may take some time to be reachable):  |
2026-02-04T10:00:02Z INF |  https://brave-otter-lamp-sunset.trycloudflare.com                                         |
2026-02-04T10:00:02Z INF +--------------------------------------------------------------------------------------------+";

    fn provisioner(channel: &Arc<FakeCommandChannel>, timeout: Duration) -> QuickTunnelProvisioner {
        let runner = BootstrapRunner::new(channel.clone())
            .with_poll_interval(Duration::from_millis(1), Duration::from_millis(2));
        QuickTunnelProvisioner::new(runner, "/var/log/cloudflared.log", 80, "trycloudflare.com", timeout)
            .unwrap()
            .with_poll_interval(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn extracts_hostname_from_tunnel_output() {
        let pattern = url_pattern("trycloudflare.com").unwrap();
        let endpoint = extract_endpoint(&pattern, LOG).unwrap();
        assert_eq!(endpoint.url, "https://brave-otter-lamp-sunset.trycloudflare.com");
        assert_eq!(endpoint.tunnel_id, "brave-otter-lamp-sunset");
    }

    #[test]
    fn ignores_other_domains_and_api_host() {
        let pattern = url_pattern("trycloudflare.com").unwrap();
        assert!(extract_endpoint(&pattern, "https://evil.example.com").is_none());
        assert!(extract_endpoint(&pattern, "https://api.trycloudflare.com/tunnel").is_none());
    }

    #[test]
    fn suffix_dots_are_literal() {
        let pattern = url_pattern("trycloudflare.com").unwrap();
        assert!(extract_endpoint(&pattern, "https://abc.trycloudflareXcom").is_none());
    }

    #[test]
    fn start_step_passes_port_and_log() {
        let channel = Arc::new(FakeCommandChannel::new());
        let step = provisioner(&channel, Duration::from_secs(1)).start_step();
        assert_eq!(step.step, BootstrapStep::StartTunnel);
        assert_eq!(step.args, vec!["80".to_string(), "/var/log/cloudflared.log".to_string()]);
    }

    #[tokio::test]
    async fn provision_waits_for_hostname() {
        let channel = Arc::new(FakeCommandChannel::new());
        channel.respond_after(
            "cloudflared.log",
            2,
            CommandOutput {
                exit_code: 0,
                stdout: LOG.into(),
                stderr: String::new(),
            },
        );

        let endpoint = provisioner(&channel, Duration::from_secs(5))
            .provision("i-1")
            .await
            .unwrap();
        assert_eq!(endpoint.tunnel_id, "brave-otter-lamp-sunset");
        assert!(channel.scripts_for("i-1").len() >= 3);
    }

    #[tokio::test]
    async fn provision_times_out_without_hostname() {
        let channel = Arc::new(FakeCommandChannel::new());
        let err = provisioner(&channel, Duration::from_millis(40))
            .provision("i-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelTimeout(_)));
    }
}
