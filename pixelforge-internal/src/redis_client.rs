use std::sync::Arc;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::blocking_rules::BlockingRulesManager;
use crate::error::{Error, ErrorDetails};

pub const BLOCKING_RULES_KEY: &str = "pixelforge:blocking_rules";
pub const BLOCKING_RULES_UPDATES_CHANNEL: &str = "pixelforge:blocking_rules_updates";
const RULE_STATS_KEY_PREFIX: &str = "pixelforge:rule_stats:";
const RULE_STATS_TTL_SECS: i64 = 7 * 86_400;

pub struct RedisClient {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Redis {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        Ok(Self { client, conn })
    }

    /// Multiplexed connections are cheap to clone and share one socket
    pub fn get_connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Fetch the JSON-encoded blocking rules, if any have been published
    pub async fn get_blocking_rules_json(&self) -> Result<Option<String>, Error> {
        let mut conn = self.get_connection();
        conn.get(BLOCKING_RULES_KEY).await.map_err(|e| {
            Error::new(ErrorDetails::Redis {
                message: format!("Failed to get blocking rules from Redis: {e}"),
            })
        })
    }

    /// Bump the match counter for a rule. Stats expire after a week without matches.
    pub async fn record_rule_match(&self, rule_id: &str) -> Result<(), Error> {
        let mut conn = self.get_connection();
        let stats_key = format!("{RULE_STATS_KEY_PREFIX}{rule_id}");
        let now = chrono::Utc::now().timestamp();

        let _: () = conn
            .hincr(&stats_key, "match_count", 1)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Redis {
                    message: format!("Failed to update rule stats: {e}"),
                })
            })?;
        let _: () = conn
            .hset(&stats_key, "last_matched", now)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Redis {
                    message: format!("Failed to update rule stats: {e}"),
                })
            })?;
        let _: () = conn
            .expire(&stats_key, RULE_STATS_TTL_SECS)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Redis {
                    message: format!("Failed to set expiry on rule stats: {e}"),
                })
            })?;
        Ok(())
    }

    /// Reload blocking rules whenever a message arrives on the updates channel,
    /// so operators don't have to wait for the periodic sync.
    pub async fn start_blocking_rules_listener(
        &self,
        manager: Arc<BlockingRulesManager>,
    ) -> Result<(), Error> {
        let mut pubsub_conn = self.client.get_async_pubsub().await.map_err(|e| {
            Error::new(ErrorDetails::Redis {
                message: format!("Failed to connect to redis: {e}"),
            })
        })?;

        pubsub_conn
            .subscribe(BLOCKING_RULES_UPDATES_CHANNEL)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Redis {
                    message: format!("Failed to subscribe to blocking rule updates: {e}"),
                })
            })?;

        tokio::spawn(async move {
            let mut stream = pubsub_conn.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                if channel != BLOCKING_RULES_UPDATES_CHANNEL {
                    tracing::warn!("Received message from unknown channel: {channel}");
                    continue;
                }
                // Errors are logged on construction
                if manager.load_rules().await.is_ok() {
                    tracing::info!("Reloaded blocking rules after update notification");
                }
            }
            tracing::warn!("Blocking rule update stream closed");
        });

        Ok(())
    }
}
