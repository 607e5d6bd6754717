// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Registry of background watchers that request an immediate reconcile.
//!
//! Long-running waits (for example a node finishing its install) happen outside
//! the reconcile pass. When the wait is over the watcher triggers its entry, which
//! pushes a signal into a controller trigger stream instead of waiting for the
//! next requeue.
//!
//! The map of entries is owned by a single task. [`WatcherRegistry`] is a cheap
//! cloneable handle that talks to it over a channel, so callers never lock.

use anyhow::{anyhow, Result};
use futures::channel::mpsc::Sender as TriggerSender;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const COMMAND_BUFFER: usize = 64;

enum Command {
    Add {
        name: String,
        trigger: TriggerSender<()>,
        reply: oneshot::Sender<()>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Has {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Trigger {
        name: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the watcher registry task.
#[derive(Clone, Debug)]
pub struct WatcherRegistry {
    commands: mpsc::Sender<Command>,
}

impl WatcherRegistry {
    /// Starts the registry task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(receiver));
        Self { commands }
    }

    /// Registers `name`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn add(&self, name: &str, trigger: TriggerSender<()>) -> Result<()> {
        self.request(|reply| Command::Add {
            name: name.to_string(),
            trigger,
            reply,
        })
        .await
    }

    /// Removes `name`. Returns whether it was registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        self.request(|reply| Command::Remove {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Returns whether `name` is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn has(&self, name: &str) -> Result<bool> {
        self.request(|reply| Command::Has {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Signals the trigger stream of `name`. Returns false if `name` is not registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn trigger(&self, name: &str) -> Result<bool> {
        self.request(|reply| Command::Trigger {
            name: name.to_string(),
            reply,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("watcher registry has stopped"))?;
        response
            .await
            .map_err(|_| anyhow!("watcher registry dropped the request"))
    }
}

async fn run(mut commands: mpsc::Receiver<Command>) {
    let mut watchers: HashMap<String, TriggerSender<()>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Add {
                name,
                trigger,
                reply,
            } => {
                debug!(watcher = %name, "Registering watcher");
                watchers.insert(name, trigger);
                let _ = reply.send(());
            }
            Command::Remove { name, reply } => {
                let removed = watchers.remove(&name).is_some();
                if removed {
                    debug!(watcher = %name, "Removed watcher");
                }
                let _ = reply.send(removed);
            }
            Command::Has { name, reply } => {
                let _ = reply.send(watchers.contains_key(&name));
            }
            Command::Trigger { name, reply } => {
                let delivered = match watchers.get_mut(&name) {
                    Some(trigger) => match trigger.try_send(()) {
                        Ok(()) => true,
                        // A pending signal already schedules the reconcile.
                        Err(e) if e.is_full() => true,
                        Err(_) => {
                            watchers.remove(&name);
                            false
                        }
                    },
                    None => false,
                };
                debug!(watcher = %name, delivered, "Triggered watcher");
                let _ = reply.send(delivered);
            }
        }
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod watcher_tests;
