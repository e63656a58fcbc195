//! EC2-backed compute provider driven through the `aws` CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::aws::AwsCli;

use super::{ComputeError, ComputeProvider, InstanceInfo, InstanceState, LaunchSpec, TAG_MANAGED_BY};

/// Launches instances from a fixed launch template into a fixed subnet.
pub struct AwsComputeProvider {
    cli: AwsCli,
    launch_template_id: String,
    subnet_ids: Vec<String>,
    security_group_id: String,
    managed_by: String,
}

impl AwsComputeProvider {
    pub fn new(
        cli: AwsCli,
        launch_template_id: impl Into<String>,
        subnet_ids: Vec<String>,
        security_group_id: impl Into<String>,
        managed_by: impl Into<String>,
    ) -> Self {
        Self {
            cli,
            launch_template_id: launch_template_id.into(),
            subnet_ids,
            security_group_id: security_group_id.into(),
            managed_by: managed_by.into(),
        }
    }

    fn run_instances_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let tags: Vec<Value> = spec
            .tags
            .iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect();
        let tag_spec = json!([{ "ResourceType": "instance", "Tags": tags }]);
        let subnet = self.subnet_ids.first().cloned().unwrap_or_default();
        let nic = json!([{
            "DeviceIndex": 0,
            "SubnetId": subnet,
            "AssociatePublicIpAddress": true,
            "Groups": [self.security_group_id],
        }]);

        let mut args = vec![
            "ec2".to_string(),
            "run-instances".to_string(),
            "--launch-template".to_string(),
            format!("LaunchTemplateId={},Version=$Latest", self.launch_template_id),
            "--count".to_string(),
            "1".to_string(),
            "--network-interfaces".to_string(),
            nic.to_string(),
            "--tag-specifications".to_string(),
            tag_spec.to_string(),
        ];
        if let Some(arn) = &spec.instance_profile_arn {
            args.push("--iam-instance-profile".to_string());
            args.push(format!("Arn={}", arn));
        }
        args
    }
}

/// Flattens a `describe-instances` response into instance snapshots.
pub(crate) fn parse_instances(doc: &Value) -> Vec<InstanceInfo> {
    let mut out = Vec::new();
    let reservations = doc["Reservations"].as_array().cloned().unwrap_or_default();
    for reservation in reservations {
        for instance in reservation["Instances"].as_array().cloned().unwrap_or_default() {
            let Some(instance_id) = instance["InstanceId"].as_str() else {
                continue;
            };
            let Some(state) = instance["State"]["Name"].as_str().and_then(InstanceState::parse)
            else {
                continue;
            };
            let tags: BTreeMap<String, String> = instance["Tags"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| {
                            Some((t["Key"].as_str()?.to_string(), t["Value"].as_str()?.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            out.push(InstanceInfo {
                instance_id: instance_id.to_string(),
                state,
                tags,
            });
        }
    }
    out
}

#[async_trait]
impl ComputeProvider for AwsComputeProvider {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<String, ComputeError> {
        let doc = self.cli.json(self.run_instances_args(spec)).await?;
        doc["Instances"][0]["InstanceId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ComputeError::Fatal("run-instances returned no instance id".into()))
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), ComputeError> {
        self.cli
            .json(["ec2", "start-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), ComputeError> {
        self.cli
            .json(["ec2", "stop-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ComputeError> {
        self.cli
            .json(["ec2", "terminate-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, ComputeError> {
        match self
            .cli
            .json(["ec2", "describe-instances", "--instance-ids", instance_id])
            .await
        {
            Ok(doc) => Ok(parse_instances(&doc).into_iter().next()),
            Err(crate::aws::AwsCliError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_command_agent_ready(&self, instance_id: &str) -> Result<bool, ComputeError> {
        let filter = format!("Key=InstanceIds,Values={}", instance_id);
        let doc = self
            .cli
            .json(["ssm", "describe-instance-information", "--filters", filter.as_str()])
            .await?;
        Ok(doc["InstanceInformationList"]
            .as_array()
            .map_or(false, |list| {
                list.iter()
                    .any(|info| info["PingStatus"].as_str().map_or(true, |s| s == "Online"))
            }))
    }

    async fn list_managed_instances(&self) -> Result<Vec<InstanceInfo>, ComputeError> {
        let tag_filter = format!("Name=tag:{},Values={}", TAG_MANAGED_BY, self.managed_by);
        let doc = self
            .cli
            .json([
                "ec2",
                "describe-instances",
                "--filters",
                tag_filter.as_str(),
                "Name=instance-state-name,Values=pending,running,stopping,stopped",
            ])
            .await?;
        Ok(parse_instances(&doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{TAG_PR_NUMBER, TAG_REPOSITORY};
    use crate::environment::EnvironmentKey;

    #[test]
    fn parses_describe_instances_output() {
        let doc = json!({
            "Reservations": [{
                "Instances": [{
                    "InstanceId": "i-0abc",
                    "State": { "Name": "running" },
                    "Tags": [
                        { "Key": "Repository", "Value": "acme/widgets" },
                        { "Key": "PRNumber", "Value": "42" }
                    ]
                }, {
                    "InstanceId": "i-0def",
                    "State": { "Name": "shutting-down" }
                }]
            }]
        });

        let instances = parse_instances(&doc);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert_eq!(instances[0].tags[TAG_REPOSITORY], "acme/widgets");
        assert_eq!(instances[0].tags[TAG_PR_NUMBER], "42");
        assert_eq!(instances[1].state, InstanceState::ShuttingDown);
        assert!(instances[1].environment_key().is_none());
    }

    #[test]
    fn skips_instances_with_unknown_state() {
        let doc = json!({
            "Reservations": [{ "Instances": [{ "InstanceId": "i-1", "State": { "Name": "hibernating" } }] }]
        });
        assert!(parse_instances(&doc).is_empty());
    }

    #[test]
    fn run_instances_args_include_tags_and_profile() {
        let provider = AwsComputeProvider::new(
            AwsCli::new(),
            "lt-123",
            vec!["subnet-a".into(), "subnet-b".into()],
            "sg-1",
            "ephemeral-env",
        );
        let spec = LaunchSpec::for_environment(
            &EnvironmentKey::new("acme/widgets", 42),
            "feature-x",
            "ephemeral",
            "ephemeral-env",
        )
        .with_instance_profile(Some("arn:aws:iam::1:instance-profile/widgets".into()));

        let args = provider.run_instances_args(&spec);
        assert!(args.contains(&"LaunchTemplateId=lt-123,Version=$Latest".to_string()));
        assert!(args.iter().any(|a| a.contains("\"SubnetId\":\"subnet-a\"")));
        assert!(args.iter().any(|a| a.contains("\"Value\":\"acme/widgets\"")));
        assert_eq!(
            args.last().unwrap(),
            "Arn=arn:aws:iam::1:instance-profile/widgets"
        );
    }
}
