use std::{sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use tracing::{event, Level};

use crate::{client::CoinApi, registry::Registry, UserResult, CRATE_NAME};

/// A simulated user. Every [`call`](User::call) runs one iteration of its script.
#[async_trait::async_trait]
pub trait User: Send + 'static {
    async fn call(&mut self) -> UserResult;
}

/// Creates the user that occupies a scheduler slot.
///
/// Slots are handed out once per run and never reused.
pub trait UserBuilder: Send + Sync + 'static {
    type Output: User;

    fn build(&self, slot: u64) -> Self::Output;
}

impl<F, U> UserBuilder for F
where
    F: Fn(u64) -> U + Send + Sync + 'static,
    U: User,
{
    type Output = U;

    fn build(&self, slot: u64) -> Self::Output {
        self(slot)
    }
}

/// Username used by `slot` on its `iteration`-th pass through the script.
///
/// Both numbers are decimal and separated by `_`, so distinct pairs can never
/// produce the same name.
pub fn username(prefix: &str, slot: u64, iteration: u64) -> String {
    format!("{prefix}_{slot}_{iteration}")
}

/// Fixed parameters of the coin script, shared by every user of a run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Script {
    pub username_prefix: String,
    pub password: String,
    /// Item bought on every iteration.
    pub item: String,
    /// Coins sent per transfer.
    pub amount: u64,
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
    /// Random draws before falling back to a scan for a transfer recipient.
    pub recipient_attempts: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            username_prefix: "user".to_string(),
            password: "password".to_string(),
            item: "1".to_string(),
            amount: 1,
            pause: Duration::from_secs(1),
            recipient_attempts: 16,
        }
    }
}

/// User that logs in under a fresh name, buys an item, sends a coin to
/// another registered user when there is one and pauses.
///
/// Requests keep going after a failed login, they are then sent without a
/// token and show up as missing credentials.
pub struct CoinUser {
    slot: u64,
    iteration: u64,
    api: Arc<dyn CoinApi>,
    registry: Arc<Registry>,
    script: Arc<Script>,
    rng: StdRng,
}

impl CoinUser {
    pub fn new(
        slot: u64,
        api: Arc<dyn CoinApi>,
        registry: Arc<Registry>,
        script: Arc<Script>,
    ) -> Self {
        Self {
            slot,
            iteration: 0,
            api,
            registry,
            script,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }
}

#[async_trait::async_trait]
impl User for CoinUser {
    async fn call(&mut self) -> UserResult {
        let script = self.script.clone();
        let username = username(&script.username_prefix, self.slot, self.iteration);

        let token = match self.api.authenticate(&username, &script.password).await {
            Ok(Some(token)) => {
                self.registry.append(username.as_str());
                Some(token)
            }
            Ok(None) => {
                event!(target: CRATE_NAME, Level::DEBUG, %username, "login returned no token");
                None
            }
            Err(err) => {
                event!(target: CRATE_NAME, Level::DEBUG, %username, %err, "login failed");
                None
            }
        };

        if let Err(err) = self.api.purchase(token.as_deref(), &script.item).await {
            event!(target: CRATE_NAME, Level::DEBUG, %username, %err, "purchase failed");
        }

        let mut skipped = None;
        if self.registry.len() > 1 {
            match self
                .registry
                .pick_recipient(&username, &mut self.rng, script.recipient_attempts)
            {
                Ok(recipient) => {
                    if let Err(err) = self
                        .api
                        .transfer(token.as_deref(), &recipient, script.amount)
                        .await
                    {
                        event!(target: CRATE_NAME, Level::DEBUG, %username, %recipient, %err, "transfer failed");
                    }
                }
                Err(err) => skipped = Some(err),
            }
        }

        tokio::time::sleep(script.pause).await;
        self.iteration += 1;

        match skipped {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Builds [`CoinUser`]s that all share one client, one registry and one script.
#[derive(Clone)]
pub struct CoinUserBuilder {
    api: Arc<dyn CoinApi>,
    registry: Arc<Registry>,
    script: Arc<Script>,
}

impl CoinUserBuilder {
    pub fn new(api: Arc<dyn CoinApi>, registry: Arc<Registry>, script: Script) -> Self {
        Self {
            api,
            registry,
            script: Arc::new(script),
        }
    }
}

impl UserBuilder for CoinUserBuilder {
    type Output = CoinUser;

    fn build(&self, slot: u64) -> Self::Output {
        CoinUser::new(
            slot,
            self.api.clone(),
            self.registry.clone(),
            self.script.clone(),
        )
    }
}
