//! Replica set bring-up.

use crate::client::{AdminClient, HostPort, ReplSetConfig, ReplSetMember};
use crate::plan::{NodeRole, ReplicaGroup};
use crate::retry::{Attempt, RetryPolicy};
use crate::{Error, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What configuring a group did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigureOutcome {
    /// `replSetInitiate` was issued and the set converged.
    Initiated,
    /// The set already had the requested membership; nothing was sent.
    AlreadyConverged,
}

/// Initiates replica sets and waits for them to converge.
#[derive(Clone, Copy)]
pub struct ReplicaSetConfigurator<'a> {
    admin: &'a dyn AdminClient,
    policy: RetryPolicy,
}

/// Replica set config a group should end up with.
pub fn desired_config(group: &ReplicaGroup<'_>) -> ReplSetConfig {
    let members = group
        .members
        .iter()
        .zip(0u32..)
        .map(|(node, id)| ReplSetMember {
            id,
            host: node.host_port().to_string(),
            arbiter_only: node.role == NodeRole::Arbiter,
        })
        .collect();

    ReplSetConfig {
        name: group.name.to_string(),
        members,
        configsvr: group.configsvr,
    }
}

fn converged(group: &ReplicaGroup<'_>, config: &ReplSetConfig) -> bool {
    config.member_count() == group.member_count() && config.arbiter_count() == group.arbiter_count()
}

fn describe(config: &ReplSetConfig) -> String {
    format!(
        "{} members, {} arbiters",
        config.member_count(),
        config.arbiter_count()
    )
}

impl<'a> ReplicaSetConfigurator<'a> {
    pub fn new(admin: &'a dyn AdminClient, policy: RetryPolicy) -> Self {
        Self { admin, policy }
    }

    /// Brings one group to its requested membership.
    ///
    /// Reads the current config first, so running this against a set that
    /// is already up sends nothing.
    pub async fn configure(&self, group: ReplicaGroup<'_>) -> Result<ConfigureOutcome> {
        let seed = seed(&group)?;
        let desired = desired_config(&group);

        let current = self.read_config(&group, &seed).await?;
        match current {
            Some(config) if converged(&group, &config) => {
                info!(replica_set = group.name, "replica set already converged");
                return Ok(ConfigureOutcome::AlreadyConverged);
            }
            Some(config) => {
                debug!(
                    replica_set = group.name,
                    current = %describe(&config),
                    "replica set initiated with different membership, waiting"
                );
            }
            None => {
                info!(
                    replica_set = group.name,
                    seed = %seed,
                    members = group.member_count(),
                    arbiters = group.arbiter_count(),
                    "initiating replica set"
                );
                self.admin.replset_initiate(&seed, &desired).await?;
            }
        }

        self.await_convergence(&group, &seed).await?;
        info!(replica_set = group.name, "replica set converged");
        Ok(ConfigureOutcome::Initiated)
    }

    /// Configures independent groups concurrently.
    pub async fn configure_all(
        &self,
        groups: Vec<ReplicaGroup<'_>>,
    ) -> Result<Vec<(String, ConfigureOutcome)>> {
        try_join_all(groups.into_iter().map(move |group| async move {
            let outcome = self.configure(group).await?;
            Ok::<_, Error>((group.name.to_string(), outcome))
        }))
        .await
    }

    /// First read of the config. The member is reachable over TCP by now,
    /// but the shell can still race its startup, so unreachability retries.
    async fn read_config(
        &self,
        group: &ReplicaGroup<'_>,
        seed: &HostPort,
    ) -> Result<Option<ReplSetConfig>> {
        let admin = self.admin;
        self.policy
            .poll(move |_| async move {
                match admin.replset_get_config(seed).await {
                    Ok(config) => Attempt::Done(Ok(config)),
                    Err(e @ crate::ClientError::Unreachable { .. }) => Attempt::Retry(e.to_string()),
                    Err(e) => Attempt::Done(Err(e)),
                }
            })
            .await
            .map_err(|exhausted| Error::ReplicaSetConvergenceTimeout {
                set: group.name.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last,
            })?
            .map_err(Error::from)
    }

    async fn await_convergence(&self, group: &ReplicaGroup<'_>, seed: &HostPort) -> Result<()> {
        let admin = self.admin;
        self.policy
            .poll(move |_| async move {
                match admin.replset_get_config(seed).await {
                    Ok(Some(config)) if converged(group, &config) => Attempt::Done(()),
                    Ok(Some(config)) => Attempt::Retry(describe(&config)),
                    Ok(None) => Attempt::Retry("not initiated yet".to_string()),
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            })
            .await
            .map_err(|exhausted| Error::ReplicaSetConvergenceTimeout {
                set: group.name.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last,
            })
    }
}

/// The first data-bearing member seeds every admin command.
fn seed(group: &ReplicaGroup<'_>) -> Result<HostPort> {
    group
        .members
        .iter()
        .find(|node| node.role != NodeRole::Arbiter)
        .map(|node| node.host_port())
        .ok_or_else(|| Error::ReplicaSetConvergenceTimeout {
            set: group.name.to_string(),
            attempts: 0,
            last: "no data-bearing member to seed from".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientError;
    use crate::plan::{LocalFiles, build_plan};
    use crate::topology::TopologyRequest;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Admin client whose sets converge as soon as they are initiated.
    #[derive(Default)]
    struct InstantAdmin {
        configs: Mutex<HashMap<String, ReplSetConfig>>,
        initiated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AdminClient for InstantAdmin {
        async fn replset_get_config(
            &self,
            seed: &HostPort,
        ) -> std::result::Result<Option<ReplSetConfig>, ClientError> {
            Ok(self.configs.lock().unwrap().get(&seed.to_string()).cloned())
        }

        async fn replset_initiate(
            &self,
            seed: &HostPort,
            config: &ReplSetConfig,
        ) -> std::result::Result<(), ClientError> {
            self.initiated.lock().unwrap().push(config.name.clone());
            self.configs
                .lock()
                .unwrap()
                .insert(seed.to_string(), config.clone());
            Ok(())
        }

        async fn add_shard(
            &self,
            _router: &HostPort,
            _connection: &str,
            _name: &str,
        ) -> std::result::Result<(), ClientError> {
            Ok(())
        }
    }

    fn plan(request: TopologyRequest) -> crate::plan::ClusterPlan {
        build_plan(&request.normalize().unwrap(), &LocalFiles).unwrap()
    }

    #[test]
    fn test_desired_config_marks_arbiter() {
        let plan = plan(TopologyRequest {
            replicaset: true,
            nodes: Some(2),
            arbiter: true,
            ..Default::default()
        });
        let groups = plan.replica_groups();
        let config = desired_config(&groups[0]);

        assert_eq!(config.name, "replset");
        assert_eq!(config.member_count(), 3);
        assert_eq!(config.arbiter_count(), 1);
        assert!(config.members[2].arbiter_only);
        assert_eq!(config.members[0].host, "localhost:27017");
        assert!(!config.configsvr);
    }

    #[test]
    fn test_desired_config_for_csrs() {
        let plan = plan(TopologyRequest {
            single: true,
            sharded: Some(1),
            config_servers: Some(3),
            csrs: true,
            ..Default::default()
        });
        let groups = plan.replica_groups();

        assert_eq!(groups.len(), 1);
        let config = desired_config(&groups[0]);
        assert_eq!(config.name, "configRepl");
        assert!(config.configsvr);
        assert_eq!(config.member_count(), 3);
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let plan = plan(TopologyRequest {
            replicaset: true,
            ..Default::default()
        });
        let admin = InstantAdmin::default();
        let configurator = ReplicaSetConfigurator::new(&admin, RetryPolicy::immediate(3));
        let group = plan.replica_groups()[0];

        assert_eq!(
            configurator.configure(group).await.unwrap(),
            ConfigureOutcome::Initiated
        );
        assert_eq!(
            configurator.configure(group).await.unwrap(),
            ConfigureOutcome::AlreadyConverged
        );
        assert_eq!(*admin.initiated.lock().unwrap(), vec!["replset".to_string()]);
    }

    #[tokio::test]
    async fn test_configure_all_covers_every_group() {
        let plan = plan(TopologyRequest {
            replicaset: true,
            sharded: Some(2),
            config_servers: Some(3),
            csrs: true,
            ..Default::default()
        });
        let admin = InstantAdmin::default();
        let configurator = ReplicaSetConfigurator::new(&admin, RetryPolicy::immediate(3));

        let outcomes = configurator
            .configure_all(plan.replica_groups())
            .await
            .unwrap();

        let names: Vec<&str> = outcomes.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["configRepl", "shard01", "shard02"]);
        assert_eq!(admin.initiated.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_mismatched_membership_times_out() {
        let plan = plan(TopologyRequest {
            replicaset: true,
            ..Default::default()
        });
        let admin = InstantAdmin::default();
        admin.configs.lock().unwrap().insert(
            "localhost:27017".to_string(),
            ReplSetConfig {
                name: "replset".to_string(),
                members: vec![ReplSetMember {
                    id: 0,
                    host: "localhost:27017".to_string(),
                    arbiter_only: false,
                }],
                configsvr: false,
            },
        );
        let configurator = ReplicaSetConfigurator::new(&admin, RetryPolicy::immediate(2));

        let err = configurator
            .configure(plan.replica_groups()[0])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ReplicaSetConvergenceTimeout { ref set, attempts: 2, .. } if set == "replset"
        ));
        assert!(admin.initiated.lock().unwrap().is_empty());
    }
}
