//! Channel factory: builds channel instances from configuration.
//!
//! Implementations are registered at compile time in a catalog keyed by
//! implementation name. The registry maps each enabled channel name to its
//! implementation's constructor and is built lazily on first use; entries
//! that cannot be resolved are logged and left out.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::channels::channel::Channel;
use crate::channels::discord::DiscordChannel;
use crate::channels::email::EmailChannel;
use crate::channels::telegram::TelegramChannel;
use crate::config::{AppConfig, ChannelConfig};
use crate::error::ChannelError;

/// Builds one channel from its configuration.
pub type ChannelConstructor =
    Arc<dyn Fn(&ChannelConfig) -> Result<Arc<dyn Channel>, ChannelError> + Send + Sync>;

/// Constructors for the built-in channel implementations.
pub fn builtin_catalog() -> HashMap<String, ChannelConstructor> {
    let mut catalog: HashMap<String, ChannelConstructor> = HashMap::new();
    catalog.insert("email".into(), Arc::new(build_email));
    catalog.insert("telegram".into(), Arc::new(build_telegram));
    catalog.insert("discord".into(), Arc::new(build_discord));
    catalog
}

fn build_email(config: &ChannelConfig) -> Result<Arc<dyn Channel>, ChannelError> {
    Ok(Arc::new(EmailChannel::from_config(config)?))
}

fn build_telegram(config: &ChannelConfig) -> Result<Arc<dyn Channel>, ChannelError> {
    Ok(Arc::new(TelegramChannel::from_config(config)?))
}

fn build_discord(config: &ChannelConfig) -> Result<Arc<dyn Channel>, ChannelError> {
    Ok(Arc::new(DiscordChannel::from_config(config)?))
}

/// Creates channels by name.
pub struct ChannelFactory {
    catalog: HashMap<String, ChannelConstructor>,
    enabled: Vec<String>,
    implementations: HashMap<String, String>,
    registry: OnceLock<HashMap<String, ChannelConstructor>>,
}

impl ChannelFactory {
    /// Factory over the built-in catalog.
    ///
    /// `enabled` lists channel names; `implementations` maps a channel name to
    /// an implementation name (a missing entry means the names are equal).
    pub fn new(enabled: Vec<String>, implementations: HashMap<String, String>) -> Self {
        Self::with_catalog(builtin_catalog(), enabled, implementations)
    }

    pub fn with_catalog(
        catalog: HashMap<String, ChannelConstructor>,
        enabled: Vec<String>,
        implementations: HashMap<String, String>,
    ) -> Self {
        Self {
            catalog,
            enabled,
            implementations,
            registry: OnceLock::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.enabled_channels(), config.implementations())
    }

    /// Add or replace an implementation in the catalog.
    pub fn with_constructor(
        mut self,
        implementation: impl Into<String>,
        constructor: ChannelConstructor,
    ) -> Self {
        self.catalog.insert(implementation.into(), constructor);
        self
    }

    /// Resolve every enabled channel to a constructor. Idempotent.
    ///
    /// Returns the number of registered channels.
    pub fn initialize_registry(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> &HashMap<String, ChannelConstructor> {
        self.registry.get_or_init(|| {
            let mut registry = HashMap::new();
            for name in &self.enabled {
                let implementation = self
                    .implementations
                    .get(name)
                    .map(String::as_str)
                    .unwrap_or(name);

                match self.catalog.get(implementation) {
                    Some(constructor) => {
                        tracing::debug!(channel = %name, implementation, "Registered channel");
                        registry.insert(name.clone(), Arc::clone(constructor));
                    }
                    None => {
                        tracing::warn!(
                            channel = %name,
                            implementation,
                            "Unknown channel implementation; skipping"
                        );
                    }
                }
            }
            tracing::info!(count = registry.len(), "Channel registry initialized");
            registry
        })
    }

    /// Build the channel registered under `name`.
    ///
    /// Returns `None` (and logs) if the name is unregistered or construction
    /// fails.
    pub fn create_channel(&self, name: &str, config: &ChannelConfig) -> Option<Arc<dyn Channel>> {
        let Some(constructor) = self.registry().get(name) else {
            tracing::warn!(channel = name, "Cannot create unregistered channel");
            return None;
        };

        match constructor(config) {
            Ok(channel) => {
                tracing::debug!(channel = name, kind = ?channel.kind(), "Channel created");
                Some(channel)
            }
            Err(e) => {
                tracing::error!(channel = name, error = %e, "Failed to construct channel");
                None
            }
        }
    }

    /// Names of all registered channels, sorted.
    pub fn registered_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }
}
