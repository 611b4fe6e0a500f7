use std::sync::Arc;

use serde_json::Value;

use crate::core::config::ServerConfig;
use crate::core::container::Container;
use crate::core::launcher::Launcher;
use crate::core::master::Server;
use crate::core::plugin::PluginRef;
use crate::core::pool::Pool;
use crate::core::status::StatusCell;
use crate::ipc::{EventKind, MessageBus};
use crate::subscribers::Subscribe;
use crate::workers::WorkerDefinition;

/// Builder for constructing a [`Server`].
pub struct ServerBuilder {
    cfg: ServerConfig,
    workers: Vec<WorkerDefinition>,
    plugins: Vec<PluginRef>,
    subscribers: Vec<(EventKind, Arc<dyn Subscribe>)>,
    entries: Vec<(String, Value)>,
    launcher: Option<Arc<dyn Launcher>>,
}

impl ServerBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            cfg,
            workers: Vec::new(),
            plugins: Vec::new(),
            subscribers: Vec::new(),
            entries: Vec::new(),
            launcher: None,
        }
    }

    /// Adds a worker definition; ids follow the order of these calls.
    pub fn worker(mut self, def: WorkerDefinition) -> Self {
        self.workers.push(def);
        self
    }

    /// Adds a plugin, started before workers and stopped after them.
    pub fn plugin(mut self, plugin: PluginRef) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Subscribes `sub` to master-side events of `kind`.
    pub fn subscriber(mut self, kind: EventKind, sub: Arc<dyn Subscribe>) -> Self {
        self.subscribers.push((kind, sub));
        self
    }

    /// Subscribes `sub` to every event kind.
    pub fn subscriber_all(mut self, sub: Arc<dyn Subscribe>) -> Self {
        for kind in EventKind::ALL {
            self.subscribers.push((kind, Arc::clone(&sub)));
        }
        self
    }

    /// Seeds the container with `value` under `id`.
    pub fn entry(mut self, id: impl Into<String>, value: Value) -> Self {
        self.entries.push((id.into(), value));
        self
    }

    /// Replaces the default re-exec launcher.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Builds the server.
    ///
    /// Registration is deterministic, so the master and every re-executed
    /// child assign the same ids to the same definitions.
    pub fn build(self) -> Server {
        let pool = Arc::new(Pool::new());
        for def in self.workers {
            pool.register_worker(def);
        }

        let bus = Arc::new(MessageBus::new());
        for (kind, sub) in self.subscribers {
            bus.subscribe(kind, sub);
        }

        let container = Arc::new(Container::new());
        for (id, value) in self.entries {
            container.set(id, value);
        }

        Server {
            cfg: self.cfg,
            pool,
            bus,
            status: StatusCell::new(),
            container,
            plugins: self.plugins,
            launcher: self.launcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::ipc::Event;
    use crate::runtime::WorkerContext;
    use crate::subscribers::SubscribeFn;
    use crate::workers::WorkerFn;

    #[test]
    fn build_registers_everything_in_order() {
        let noop = || WorkerFn::arc(|_ctx: WorkerContext| async { Ok::<_, WorkerError>(()) });
        let server = Server::builder(ServerConfig::default())
            .worker(WorkerDefinition::builder("http", noop()).count(3).build())
            .worker(WorkerDefinition::builder("cron", noop()).build())
            .subscriber_all(SubscribeFn::arc("noop", |_ev: &Event| {}))
            .entry("limits", serde_json::json!(10))
            .build();

        let names: Vec<_> = server
            .workers()
            .iter()
            .map(|w| (w.id(), w.name().to_string()))
            .collect();
        assert_eq!(names, [(1, "http".to_string()), (2, "cron".to_string())]);
        assert_eq!(server.container().get("limits").unwrap(), serde_json::json!(10));
        assert_eq!(server.status().get(), crate::core::ServerStatus::Shutdown);
    }
}
