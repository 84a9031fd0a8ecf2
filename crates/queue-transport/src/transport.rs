//! Transport assembly and lifecycle.
//!
//! [`TransportInfrastructure`] wires validated [`TransportSettings`] and the
//! storage collaborators into a dispatcher, a message pump and, when delayed
//! delivery is enabled, a delayed delivery poller. It is the surface a host
//! drives: initialize, start receiving, dispatch, stop.

use crate::addressing::AccountRouter;
use crate::client::{DelayedStore, LeaseClient, QueueClient, QueueService};
use crate::config::TransportSettings;
use crate::delayed::DelayedDeliveryPoller;
use crate::dispatch::{Dispatcher, TransportOperation};
use crate::error::{ConfigurationError, TransportError};
use crate::lease::LeaseContext;
use crate::pipeline::{CriticalError, MessageProcessor};
use crate::pump::MessagePump;
use crate::serialization::{
    EnvelopeSerializer, JsonEnvelopeSerializer, MessageUnwrapper, NativeMessageUnwrapper,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Storage collaborators the transport runs against
pub struct TransportDependencies {
    /// The endpoint's own account, known under the default alias
    pub default_account: Arc<dyn QueueService>,
    /// Other accounts by account name, referenced from the alias map
    pub accounts: HashMap<String, Arc<dyn QueueService>>,
    pub lease_client: Option<Arc<dyn LeaseClient>>,
    pub delayed_store: Option<Arc<dyn DelayedStore>>,
    pub serializer: Arc<dyn EnvelopeSerializer>,
    pub unwrapper: Arc<dyn MessageUnwrapper>,
}

impl TransportDependencies {
    /// Single account, JSON envelopes, no delayed delivery collaborators
    pub fn new(default_account: Arc<dyn QueueService>) -> Self {
        let serializer: Arc<dyn EnvelopeSerializer> = Arc::new(JsonEnvelopeSerializer);
        Self {
            default_account,
            accounts: HashMap::new(),
            lease_client: None,
            delayed_store: None,
            unwrapper: Arc::new(NativeMessageUnwrapper::new(Arc::clone(&serializer))),
            serializer,
        }
    }

    pub fn with_account(mut self, name: impl Into<String>, account: Arc<dyn QueueService>) -> Self {
        self.accounts.insert(name.into(), account);
        self
    }

    pub fn with_delayed_delivery(
        mut self,
        lease_client: Arc<dyn LeaseClient>,
        store: Arc<dyn DelayedStore>,
    ) -> Self {
        self.lease_client = Some(lease_client);
        self.delayed_store = Some(store);
        self
    }
}

struct DelayedParts {
    lease_client: Arc<dyn LeaseClient>,
    store: Arc<dyn DelayedStore>,
}

struct RunningPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Assembled transport
pub struct TransportInfrastructure {
    settings: TransportSettings,
    dispatcher: Arc<Dispatcher>,
    pump: MessagePump,
    queues_to_create: Vec<Arc<dyn QueueClient>>,
    delayed: Option<DelayedParts>,
    poller: Option<Arc<DelayedDeliveryPoller>>,
    running_poller: Option<RunningPoller>,
}

impl TransportInfrastructure {
    /// Validate `settings` and assemble the transport
    pub fn build(
        settings: TransportSettings,
        dependencies: TransportDependencies,
    ) -> Result<Self, TransportError> {
        settings.validate()?;

        let router = build_router(&settings, &dependencies)?;

        let input = settings.input_queue_name()?;
        let input_client = dependencies.default_account.queue_client(&input);
        let error_client = router.resolve(&settings.error_queue_address()?)?.client;

        let mut queues_to_create = vec![Arc::clone(&input_client), Arc::clone(&error_client)];
        if let Some(poison) = settings.delayed_delivery.poison_queue_address()? {
            queues_to_create.push(router.resolve(&poison)?.client);
        }

        let delayed = if settings.delayed_delivery.enabled {
            let lease_client = dependencies.lease_client.clone().ok_or_else(|| {
                ConfigurationError::Missing {
                    key: "delayed delivery lease client".to_string(),
                }
            })?;
            let store = dependencies.delayed_store.clone().ok_or_else(|| {
                ConfigurationError::Missing {
                    key: "delayed delivery store".to_string(),
                }
            })?;
            Some(DelayedParts {
                lease_client,
                store,
            })
        } else {
            None
        };

        let mut dispatcher = Dispatcher::new(router, Arc::clone(&dependencies.serializer));
        if let Some(parts) = &delayed {
            dispatcher = dispatcher.with_delayed_store(
                Arc::clone(&parts.store),
                settings.delayed_delivery.table_name.clone(),
            );
        }

        let lease_context = LeaseContext {
            source: input_client,
            error_queue: error_client,
            unwrapper: dependencies.unwrapper,
            serializer: dependencies.serializer,
            visibility_timeout: settings.message_invisible_time(),
        };
        let pump = MessagePump::new(lease_context, settings.clone());

        Ok(Self {
            settings,
            dispatcher: Arc::new(dispatcher),
            pump,
            queues_to_create,
            delayed,
            poller: None,
            running_poller: None,
        })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Create the input, error and poison queues if they are missing, along
    /// with the delayed delivery table when delayed delivery is enabled
    pub async fn create_queues(&self) -> Result<(), TransportError> {
        for client in &self.queues_to_create {
            client
                .create_if_not_exists()
                .await
                .map_err(|e| TransportError::provider("create_queue", client.name().as_str(), e))?;
            info!(queue = %client.name(), "Queue ready");
        }

        if let Some(parts) = &self.delayed {
            let table = &self.settings.delayed_delivery.table_name;
            parts
                .store
                .ensure_exists()
                .await
                .map_err(|e| TransportError::provider("ensure_table", table, e))?;
            info!(table = %table, "Delayed delivery table ready");
        }
        Ok(())
    }

    /// Register the pipeline and prepare the delayed delivery poller
    pub fn initialize(
        &mut self,
        processor: Arc<dyn MessageProcessor>,
        critical_error: CriticalError,
    ) -> Result<(), TransportError> {
        if let Some(parts) = &self.delayed {
            let poller = DelayedDeliveryPoller::new(
                Arc::clone(&parts.store),
                Arc::clone(&parts.lease_client),
                Arc::clone(&self.dispatcher),
                &self.settings,
                critical_error.clone(),
            )?;
            self.poller = Some(Arc::new(poller));
        }

        self.pump.initialize(processor, critical_error);
        Ok(())
    }

    pub fn start_receive(&mut self, max_concurrency: u32) -> Result<(), TransportError> {
        self.pump.start_receive(max_concurrency)?;

        if let Some(poller) = &self.poller {
            if self.running_poller.is_none() {
                let cancel = CancellationToken::new();
                let handle = Arc::clone(poller).start(cancel.clone());
                self.running_poller = Some(RunningPoller { cancel, handle });
            }
        }
        Ok(())
    }

    /// Stop receiving and delayed delivery; in-flight messages get the
    /// shutdown timeout to finish
    pub async fn stop_receive(&mut self) {
        self.pump.stop_receive().await;

        if let Some(running) = self.running_poller.take() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                error!(error = %e, "Delayed delivery poller terminated abnormally");
            }
        }
    }

    pub async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<(), TransportError> {
        self.dispatcher.dispatch(operations).await
    }
}

fn build_router(
    settings: &TransportSettings,
    dependencies: &TransportDependencies,
) -> Result<AccountRouter, ConfigurationError> {
    let mut router = AccountRouter::new(
        settings.default_account_alias.clone(),
        Arc::clone(&dependencies.default_account),
    );

    for (alias, account_name) in &settings.account_aliases {
        let account = dependencies
            .accounts
            .get(account_name)
            .ok_or_else(|| ConfigurationError::Missing {
                key: format!("account '{}' for alias '{}'", account_name, alias),
            })?;
        router.add_account(alias.clone(), Arc::clone(account))?;
    }

    Ok(router)
}
