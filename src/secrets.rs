//! Per-repository secret injection and redaction.
//!
//! A repository's Secrets Manifest maps environment-variable names to a
//! literal value or to a reference into Secrets Manager or Parameter Store:
//!
//! ```json
//! {
//!   "API_KEY": { "type": "direct", "value": "key123" },
//!   "DB_PASSWORD": { "type": "secretsmanager", "reference": "acme/widgets/db" },
//!   "STRIPE_KEY": { "type": "ssm", "reference": "/acme/stripe" }
//! }
//! ```
//!
//! The manifest is read and resolved on the target instance, under the
//! instance's own profile, inside the `inject_secrets` bootstrap step, and
//! the values go straight into the app's `.env`. The command document
//! carries only the manifest id, and the step prints only variable names
//! and warnings, so no value reaches the orchestrator, the command history
//! or the build logs.
//!
//! Resolution is best effort: an entry that cannot be resolved becomes a
//! [`SecretResolutionWarning`] and the variable is left out.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aws::{classify_stderr, AwsCliError};
use crate::bootstrap::{BootstrapStep, StepCommand, StepReport};

/// Runs on the instance as `inject_secrets <app_dir> <manifest_id>`.
///
/// Prints one tab-separated line per manifest entry:
/// `injected NAME KIND` or `omitted NAME KIND REFERENCE REASON`, plus
/// `manifest missing` when the repository has no manifest.
const INJECT_SECRETS_SCRIPT: &str = r##"APP_DIR="$1"; MANIFEST_ID="$2"
umask 077
ENV_FILE="$APP_DIR/.env"
PARTIAL="$ENV_FILE.partial"
ERR="$(mktemp)"
trap 'rm -f "$ERR" "$PARTIAL"' EXIT
: > "$PARTIAL"

reason() { tr '\t\n' '  ' < "$ERR" | cut -c1-300; }
omit() { printf 'omitted\t%s\t%s\t%s\t%s\n' "$1" "$2" "$3" "$4"; }
field() {
  printf '%s' "$MANIFEST" | jq -r --arg n "$1" --arg f "$2" \
    '.[$n] | if type == "object" then (.[$f] // "") else "" end'
}
escape() {
  printf '%s' "$1" | sed -e 's/\\/\\\\/g' -e 's/"/\\"/g' -e 's/\$/$$/g' \
    | sed -e ':a;N;$!ba;s/\n/\\n/g'
}
lookup() {
  case "$1" in
    direct) field "$2" value ;;
    secretsmanager) aws secretsmanager get-secret-value --secret-id "$3" --query SecretString --output text ;;
    ssm) aws ssm get-parameter --name "$3" --with-decryption --query Parameter.Value --output text ;;
    *) echo "unknown entry type '$1'" >&2; return 1 ;;
  esac
}

if MANIFEST="$(aws secretsmanager get-secret-value --secret-id "$MANIFEST_ID" --query SecretString --output text 2>"$ERR")"; then
  if NAMES="$(printf '%s' "$MANIFEST" | jq -r 'if type == "object" then keys[] else error("manifest must be a JSON object") end' 2>"$ERR")"; then
    while IFS= read -r NAME; do
      [ -n "$NAME" ] || continue
      KIND="$(field "$NAME" type)"
      REF="$(field "$NAME" reference)"
      if ! [[ "$NAME" =~ ^[A-Za-z_][A-Za-z0-9_]*$ ]]; then
        omit "$NAME" "$KIND" "$REF" "not a valid environment variable name"
      elif VALUE="$(lookup "$KIND" "$NAME" "$REF" 2>"$ERR")"; then
        printf '%s="%s"\n' "$NAME" "$(escape "$VALUE")" >> "$PARTIAL"
        printf 'injected\t%s\t%s\n' "$NAME" "$KIND"
      else
        omit "$NAME" "$KIND" "$REF" "$(reason)"
      fi
    done <<< "$NAMES"
  else
    omit '*' manifest "$MANIFEST_ID" "invalid secrets manifest: $(reason)"
  fi
elif grep -q ResourceNotFoundException "$ERR"; then
  printf 'manifest\tmissing\n'
else
  omit '*' manifest "$MANIFEST_ID" "$(reason)"
fi
mv "$PARTIAL" "$ENV_FILE"
echo "wrote $(grep -c '=' "$ENV_FILE" || true) variables""##;

/// A manifest entry that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResolutionWarning {
    pub name: String,
    pub kind: String,
    pub reference: Option<String>,
    pub reason: String,
}

impl fmt::Display for SecretResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Some(reference) => write!(
                f,
                "{} ({} '{}') omitted: {}",
                self.name, self.kind, reference, self.reason
            ),
            None => write!(f, "{} ({}) omitted: {}", self.name, self.kind, self.reason),
        }
    }
}

/// What the instance reported back from `inject_secrets`: names only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretsReport {
    /// Variables written to the env file.
    pub injected: Vec<String>,
    pub warnings: Vec<SecretResolutionWarning>,
    /// The repository has no manifest.
    pub manifest_missing: bool,
}

impl SecretsReport {
    /// Parses the step's stdout. Unrecognized lines are ignored.
    pub fn parse(stdout: &str) -> Self {
        let mut report = Self::default();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
            match fields.as_slice() {
                ["injected", name, ..] => report.injected.push(name.to_string()),
                ["omitted", name, kind, reference, reason @ ..] => {
                    report.warnings.push(SecretResolutionWarning {
                        name: name.to_string(),
                        kind: kind.to_string(),
                        reference: Some(reference.to_string()).filter(|r| !r.is_empty()),
                        reason: describe_failure(&reason.join(" ")),
                    })
                }
                ["manifest", "missing"] => report.manifest_missing = true,
                _ => {}
            }
        }
        report
    }
}

fn describe_failure(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "lookup failed".to_string();
    }
    match classify_stderr(raw) {
        AwsCliError::NotFound(_) => "secret not found".to_string(),
        AwsCliError::Transient(message) | AwsCliError::Fatal(message) => message,
    }
}

/// Builds the on-instance injection step and reads back its report.
#[derive(Debug, Clone)]
pub struct SecretsResolver {
    prefix: String,
}

impl SecretsResolver {
    /// `prefix` is the secret-store path under which manifests live.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Secret id of a repository's manifest, e.g. `ephemeral-env/repos/acme/widgets`.
    pub fn manifest_id(&self, repo: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), repo)
    }

    /// Step that resolves `repo`'s manifest on the instance into
    /// `<app_dir>/.env`.
    pub fn inject_step(&self, app_dir: &str, repo: &str) -> StepCommand {
        StepCommand::script(
            BootstrapStep::InjectSecrets,
            INJECT_SECRETS_SCRIPT,
            vec![app_dir.to_string(), self.manifest_id(repo)],
        )
    }

    /// Extracts the injection report from a finished plan.
    pub fn report(&self, repo: &str, steps: &[StepReport]) -> SecretsReport {
        let Some(step) = steps.iter().find(|s| s.step == BootstrapStep::InjectSecrets) else {
            return SecretsReport::default();
        };
        let report = SecretsReport::parse(&step.stdout);

        if report.manifest_missing {
            tracing::debug!(repo, "no secrets manifest");
        }
        for warning in &report.warnings {
            tracing::warn!(repo, warning = %warning, "secret resolution warning");
        }
        tracing::info!(
            repo,
            injected = report.injected.len(),
            omitted = report.warnings.len(),
            "injected secrets"
        );
        report
    }
}

/// Masks known secret values in text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// (name, value), longest value first so overlapping values mask fully.
    patterns: Vec<(String, String)>,
}

impl Redactor {
    /// Registers `value` to be replaced with `[REDACTED:<name>]`.
    pub fn add(&mut self, name: &str, value: &str) {
        if value.is_empty() || self.patterns.iter().any(|(_, v)| v == value) {
            return;
        }
        self.patterns.push((name.to_string(), value.to_string()));
        self.patterns.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.add(name, value);
        self
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (name, value) in &self.patterns {
            result = result.replace(value.as_str(), &format!("[REDACTED:{}]", name));
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inject_report(stdout: &str) -> StepReport {
        StepReport {
            step: BootstrapStep::InjectSecrets,
            elapsed: Duration::from_millis(5),
            stdout: stdout.to_string(),
        }
    }

    #[test]
    fn parses_injected_and_omitted_entries() {
        let report = SecretsReport::parse(
            "injected\tAPI_KEY\tdirect\n\
             omitted\tDB_PASSWORD\tsecretsmanager\tacme/widgets/db\tAn error occurred (ResourceNotFoundException) when calling the GetSecretValue operation\n\
             wrote 1 variables\n",
        );
        assert_eq!(report.injected, vec!["API_KEY".to_string()]);
        assert_eq!(report.warnings.len(), 1);
        let warning = &report.warnings[0];
        assert_eq!(warning.name, "DB_PASSWORD");
        assert_eq!(warning.reference.as_deref(), Some("acme/widgets/db"));
        assert_eq!(warning.reason, "secret not found");
        assert_eq!(
            warning.to_string(),
            "DB_PASSWORD (secretsmanager 'acme/widgets/db') omitted: secret not found"
        );
        assert!(!report.manifest_missing);
    }

    #[test]
    fn invalid_name_warning_has_no_reference() {
        let report = SecretsReport::parse("omitted\tBAD-NAME\tdirect\t\tnot a valid environment variable name\n");
        assert_eq!(report.warnings[0].reference, None);
        assert_eq!(report.warnings[0].reason, "not a valid environment variable name");
    }

    #[test]
    fn empty_reason_gets_a_default() {
        let report = SecretsReport::parse("omitted\tSTRIPE_KEY\tssm\t/acme/stripe\t\n");
        assert_eq!(report.warnings[0].reason, "lookup failed");
    }

    #[test]
    fn missing_manifest_is_not_a_warning() {
        let report = SecretsReport::parse("manifest\tmissing\nwrote 0 variables\n");
        assert!(report.manifest_missing);
        assert!(report.injected.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn inject_step_carries_only_the_manifest_id() {
        let resolver = SecretsResolver::new("ephemeral-env/repos/");
        let step = resolver.inject_step("/app/repo", "acme/widgets");

        assert_eq!(step.step, BootstrapStep::InjectSecrets);
        assert_eq!(
            step.args,
            vec!["/app/repo".to_string(), "ephemeral-env/repos/acme/widgets".to_string()]
        );
        assert!(step.command.contains("get-secret-value --secret-id \"$MANIFEST_ID\""));
        assert!(step.command.contains("umask 077"));
    }

    #[test]
    fn report_reads_the_inject_step_only() {
        let resolver = SecretsResolver::new("ephemeral-env/repos");
        let steps = vec![
            StepReport {
                step: BootstrapStep::Clone,
                elapsed: Duration::from_millis(5),
                stdout: "injected\tNOT_A_SECRET\tdirect\n".into(),
            },
            inject_report("injected\tAPI_KEY\tdirect\n"),
        ];

        let report = resolver.report("acme/widgets", &steps);
        assert_eq!(report.injected, vec!["API_KEY".to_string()]);

        let none = resolver.report("acme/widgets", &steps[..1]);
        assert_eq!(none, SecretsReport::default());
    }

    #[test]
    fn redacts_multiple_secrets() {
        let redactor = Redactor::default()
            .with("API_KEY", "key123")
            .with("DB_PASSWORD", "pass456");

        let redacted = redactor.redact("Connecting with key123 and password pass456");
        assert_eq!(
            redacted,
            "Connecting with [REDACTED:API_KEY] and password [REDACTED:DB_PASSWORD]"
        );
    }

    #[test]
    fn redacts_longest_value_first() {
        let redactor = Redactor::default().with("SHORT", "abc").with("LONG", "abcdef");
        assert_eq!(redactor.redact("abcdef abc"), "[REDACTED:LONG] [REDACTED:SHORT]");
    }

    #[test]
    fn redactor_ignores_empty_values() {
        let redactor = Redactor::default().with("EMPTY", "");
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("unchanged"), "unchanged");
    }
}
