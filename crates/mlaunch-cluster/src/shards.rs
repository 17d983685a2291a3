//! Shard registration with the router.

use crate::ClientError;
use crate::client::{AdminClient, HostPort};
use crate::plan::ShardSpec;
use crate::retry::{Attempt, RetryPolicy};
use crate::{Error, Result};
use tracing::info;

/// Issues `addShard` for every shard through one router.
#[derive(Clone, Copy)]
pub struct ShardRegistrator<'a> {
    admin: &'a dyn AdminClient,
    policy: RetryPolicy,
}

impl<'a> ShardRegistrator<'a> {
    pub fn new(admin: &'a dyn AdminClient, policy: RetryPolicy) -> Self {
        Self { admin, policy }
    }

    /// Registers shards in creation order and returns their names.
    ///
    /// The router may still be finding the config servers, so unreachable
    /// errors are retried. A rejected `addShard` stops the registration of
    /// every later shard.
    pub async fn register_all(&self, router: &HostPort, shards: &[ShardSpec]) -> Result<Vec<String>> {
        let mut registered = Vec::with_capacity(shards.len());
        for shard in shards {
            self.register(router, shard).await?;
            registered.push(shard.name.clone());
        }
        Ok(registered)
    }

    async fn register(&self, router: &HostPort, shard: &ShardSpec) -> Result<()> {
        let connection = shard.connection_string();
        let admin = self.admin;
        let name = shard.name.as_str();
        let conn = connection.as_str();

        let outcome = self
            .policy
            .poll(move |_| async move {
                match admin.add_shard(router, conn, name).await {
                    Ok(()) => Attempt::Done(Ok(())),
                    Err(e @ ClientError::Unreachable { .. }) => Attempt::Retry(e.to_string()),
                    Err(e) => Attempt::Done(Err(e)),
                }
            })
            .await
            .map_err(|exhausted| Error::ShardRegistration {
                shard: shard.name.clone(),
                reason: format!("gave up after {} attempts: {}", exhausted.attempts, exhausted.last),
            })?;

        outcome.map_err(|e| Error::ShardRegistration {
            shard: shard.name.clone(),
            reason: e.to_string(),
        })?;

        info!(shard = %shard.name, connection = %connection, router = %router, "shard registered");
        Ok(())
    }
}
